mod bitfield;
mod hash;
mod peer_id;
mod transfer_rate;

pub use bitfield::Bitfield;
pub use hash::Sha1;
pub use peer_id::PeerId;
pub use transfer_rate::{RateMeter, TransferRate};
