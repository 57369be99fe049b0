use std::time::Duration;

use size::Size;

use crate::core::PeerId;

/// Configuration settings for the engine and its driver
#[derive(Clone, Debug)]
pub struct Config {
    // Identity and Network Settings
    /// Unique identifier for this peer in the swarm
    pub client_id: PeerId,
    /// Port number to listen for incoming connections
    pub port: u16,
    /// Timeout for establishing new connections
    pub connect_timeout: Duration,
    /// Size of the queue carrying connection events to the driver
    pub events_buffer: usize,
    /// Interval between statistics notifications
    pub update_stats_interval: Duration,

    // Scheduler Settings
    /// Maximum number of concurrent block requests per peer
    pub max_requests_per_peer: usize,
    /// Size of data blocks for piece transfers
    pub block_size: Size,
    /// Endgame starts once this many pieces (or fewer) are missing
    pub endgame_threshold: usize,

    // Choker Settings
    /// Interval between choking algorithm runs
    pub choking_interval: Duration,
    /// Interval between optimistic unchoke rotations
    pub optimistic_unchoke_interval: Duration,
    /// Number of peers unchoked by rank, not counting the optimistic one
    pub unchoke_slots: usize,
    /// Seed for the optimistic unchoke draw, random when unset
    pub rng_seed: Option<u64>,

    // Liveness Settings
    /// Interval between keep-alive messages
    pub keep_alive_interval: Duration,
    /// Time after which a silent peer is disconnected
    pub idle_peer_timeout: Duration,

    /// Window over which transfer rates are averaged
    pub rate_window: Duration,
    /// Largest block length a peer may request from us
    pub max_block_length: Size,
    /// Disconnect the peers that contributed to a piece that failed its hash check
    pub disconnect_on_hash_failure: bool,
}

impl Config {
    pub fn with_client_id(mut self, client_id: PeerId) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_peer_timeout(mut self, timeout: Duration) -> Self {
        self.idle_peer_timeout = timeout;
        self
    }

    pub fn with_choking_interval(mut self, interval: Duration) -> Self {
        self.choking_interval = interval;
        self
    }

    pub fn with_optimistic_unchoke_interval(mut self, interval: Duration) -> Self {
        self.optimistic_unchoke_interval = interval;
        self
    }

    pub fn with_unchoke_slots(mut self, n: usize) -> Self {
        self.unchoke_slots = n;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn with_block_size(mut self, size: Size) -> Self {
        self.block_size = size;
        self
    }

    pub fn with_max_requests_per_peer(mut self, n: usize) -> Self {
        self.max_requests_per_peer = n;
        self
    }

    pub fn with_endgame_threshold(mut self, pieces: usize) -> Self {
        self.endgame_threshold = pieces;
        self
    }

    pub fn with_max_block_length(mut self, size: Size) -> Self {
        self.max_block_length = size;
        self
    }

    pub fn with_disconnect_on_hash_failure(mut self, disconnect: bool) -> Self {
        self.disconnect_on_hash_failure = disconnect;
        self
    }

    /// Largest frame the codec accepts: a piece message carrying a maximal block.
    pub fn max_frame_length(&self) -> usize {
        let block_length = self.max_block_length.bytes() as usize;
        9 + block_length.max(self.block_size.bytes() as usize)
    }
}

impl Default for Config {
    fn default() -> Self {
        let keep_alive_interval = Duration::from_secs(120);
        Self {
            client_id: PeerId::random(),
            port: 6881,
            connect_timeout: Duration::from_secs(10),
            events_buffer: 128,
            update_stats_interval: Duration::from_secs(1),
            max_requests_per_peer: 10,
            block_size: Size::from_kibibytes(16),
            endgame_threshold: 4,
            choking_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            unchoke_slots: 4,
            rng_seed: None,
            keep_alive_interval,
            idle_peer_timeout: keep_alive_interval * 2,
            rate_window: Duration::from_secs(20),
            max_block_length: Size::from_kibibytes(128),
            disconnect_on_hash_failure: false,
        }
    }
}
