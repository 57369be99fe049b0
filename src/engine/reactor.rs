use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use tokio_util::bytes::Bytes;

/// Opaque identity of a connection, handed out by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[conn {}]", self.0)
    }
}

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelToken(pub u64);

/// What a timer is for. Delivered back to the engine when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Re-rank peers and update choke states
    Rechoke,
    /// Draw a new optimistic unchoke
    OptimisticUnchoke,
    /// Broadcast keep-alive messages
    KeepAlive,
    /// The connection has been silent for too long
    Liveness(ConnId),
}

/// The I/O surface the engine drives. Implementations own sockets and timers and feed events
/// back through the engine's callbacks; the engine never blocks and never touches a socket.
pub trait Reactor {
    fn now(&self) -> Instant;

    /// Queues bytes for sending. Once they are handed to the OS, `on_flushed` follows.
    fn write(&mut self, conn: ConnId, data: Bytes);

    /// Closes the connection. No callbacks follow for it.
    fn close(&mut self, conn: ConnId);

    /// Arms a one-shot timer that delivers `key` to `on_timer` after `delay`.
    fn schedule(&mut self, delay: Duration, key: TimerKey) -> CancelToken;

    /// Disarms a timer. Cancelling a fired or unknown timer does nothing.
    fn cancel(&mut self, token: CancelToken);
}
