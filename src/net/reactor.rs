use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::Duration;

use log::debug;
use priority_queue::PriorityQueue;
use tokio::time::Instant;
use tokio_util::bytes::Bytes;

use crate::engine::{CancelToken, ConnId, Reactor, TimerKey};
use crate::net::connection::Connection;

/// Reactor over tokio sockets. Timers live in a priority queue keyed by `TimerKey`, so
/// scheduling a key that is already pending replaces its deadline.
#[derive(Default)]
pub struct TokioReactor {
    connections: HashMap<ConnId, Connection>,
    timers: PriorityQueue<TimerKey, Reverse<Instant>>,
    tokens: HashMap<TimerKey, CancelToken>,
    next_token: u64,
}

impl TokioReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, conn: ConnId, connection: Connection) {
        self.connections.insert(conn, connection);
    }

    pub fn is_open(&self, conn: ConnId) -> bool {
        self.connections.contains_key(&conn)
    }

    /// Forgets a connection whose socket already went away. Returns `false` if the engine had
    /// closed it before.
    pub fn remove(&mut self, conn: ConnId) -> bool {
        self.connections.remove(&conn).is_some()
    }

    pub fn close_all(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.close();
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|(_, Reverse(at))| *at)
    }

    /// Pops the earliest timer if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKey> {
        let (_, Reverse(at)) = self.timers.peek()?;
        if *at > now {
            return None;
        }
        let (key, _) = self.timers.pop()?;
        self.tokens.remove(&key);
        Some(key)
    }
}

impl Reactor for TokioReactor {
    fn now(&self) -> std::time::Instant {
        Instant::now().into_std()
    }

    fn write(&mut self, conn: ConnId, data: Bytes) {
        match self.connections.get(&conn) {
            Some(connection) => connection.send(data),
            None => debug!("{} write after close", conn),
        }
    }

    fn close(&mut self, conn: ConnId) {
        if let Some(connection) = self.connections.remove(&conn) {
            connection.close();
        }
    }

    fn schedule(&mut self, delay: Duration, key: TimerKey) -> CancelToken {
        let token = CancelToken(self.next_token);
        self.next_token += 1;
        self.timers.push(key, Reverse(Instant::now() + delay));
        self.tokens.insert(key, token);
        token
    }

    fn cancel(&mut self, token: CancelToken) {
        let key = self
            .tokens
            .iter()
            .find(|(_, pending)| **pending == token)
            .map(|(key, _)| *key);
        if let Some(key) = key {
            self.tokens.remove(&key);
            self.timers.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;

    const PEER: ConnId = ConnId(1);

    #[tokio::test(start_paused = true)]
    async fn timers_fire_in_deadline_order() {
        let mut reactor = TokioReactor::new();
        reactor.schedule(Duration::from_secs(10), TimerKey::Rechoke);
        reactor.schedule(Duration::from_secs(5), TimerKey::KeepAlive);
        let liveness = reactor.schedule(Duration::from_secs(1), TimerKey::Liveness(PEER));
        reactor.cancel(liveness);

        advance(Duration::from_secs(6)).await;
        let now = Instant::now();
        assert_eq!(reactor.pop_due(now), Some(TimerKey::KeepAlive));
        assert_eq!(reactor.pop_due(now), None);

        advance(Duration::from_secs(4)).await;
        assert_eq!(reactor.pop_due(Instant::now()), Some(TimerKey::Rechoke));
        assert_eq!(reactor.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_a_key_replaces_it() {
        let mut reactor = TokioReactor::new();
        let stale = reactor.schedule(Duration::from_secs(1), TimerKey::Liveness(PEER));
        reactor.schedule(Duration::from_secs(10), TimerKey::Liveness(PEER));

        // The replaced timer's token no longer refers to anything
        reactor.cancel(stale);
        advance(Duration::from_secs(5)).await;
        assert_eq!(reactor.pop_due(Instant::now()), None);

        advance(Duration::from_secs(5)).await;
        assert_eq!(
            reactor.pop_due(Instant::now()),
            Some(TimerKey::Liveness(PEER))
        );
    }
}
