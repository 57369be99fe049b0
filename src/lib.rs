//! BitTorrent piece exchange: rarest-first piece selection with endgame, tit-for-tat choking,
//! per-connection protocol state and out-of-order piece storage, driven through a reactor
//! that owns all I/O.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod message;
pub mod net;
pub mod peer;
pub mod scheduler;
pub mod storage;
pub mod torrent;

pub use config::Config;
pub use engine::{Engine, Reactor};
pub use error::{EngineError, ProtocolError, StorageError};
