mod connection;
mod driver;
mod peers;
mod reactor;

use tokio_util::bytes::Bytes;

use crate::engine::{ConnId, Stats};

pub use driver::Driver;
pub use peers::{PeerSource, StaticPeers};

/// What connection tasks report to the driver.
#[derive(Debug)]
enum Event {
    Connected(ConnId),
    Data(ConnId, Bytes),
    /// A write was handed to the OS
    Flushed(ConnId),
    /// The socket is gone. Not reported for connections the engine closed
    Closed(ConnId),
}

#[derive(Debug)]
pub enum Notification {
    DownloadComplete,
    Stats(Stats),
}
