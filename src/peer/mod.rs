mod choke;
mod session;

pub use choke::{ChokeDecision, Choker};
pub use session::{DownloadState, Inbound, PeerSession, UploadState};
