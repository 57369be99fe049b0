use std::net::SocketAddr;

/// Supplies candidate peers to connect to. A tracker client is the usual implementation.
pub trait PeerSource: Send {
    /// Addresses discovered since the last call.
    fn peers(&mut self) -> Vec<SocketAddr>;
}

/// A fixed list of peers, handed out once.
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    peers: Vec<SocketAddr>,
}

impl StaticPeers {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

impl PeerSource for StaticPeers {
    fn peers(&mut self) -> Vec<SocketAddr> {
        std::mem::take(&mut self.peers)
    }
}
