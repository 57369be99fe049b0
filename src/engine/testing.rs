use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::engine::{CancelToken, ConnId, Reactor, TimerKey};
use crate::message::{HANDSHAKE_LENGTH, Handshake, HandshakeCodec, Message, MessageCodec};

/// Reactor with a manual clock that records everything the engine asks of it.
#[derive(Debug)]
pub struct FakeReactor {
    now: Instant,
    next_token: u64,
    written: HashMap<ConnId, Vec<u8>>,
    /// Writes not yet reported back through `on_flushed`
    unflushed: BTreeSet<ConnId>,
    pub closed: BTreeSet<ConnId>,
    timers: HashMap<CancelToken, (Instant, TimerKey)>,
}

impl FakeReactor {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            next_token: 0,
            written: HashMap::new(),
            unflushed: BTreeSet::new(),
            closed: BTreeSet::new(),
            timers: HashMap::new(),
        }
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Removes and returns the timers due at the current time, earliest first.
    pub fn due_timers(&mut self) -> Vec<TimerKey> {
        let mut due: Vec<_> = self
            .timers
            .iter()
            .filter(|(_, (at, _))| *at <= self.now)
            .map(|(token, (at, key))| (*at, token.0, *token, *key))
            .collect();
        due.sort_by_key(|(at, order, _, _)| (*at, *order));
        for (_, _, token, _) in &due {
            self.timers.remove(token);
        }
        due.into_iter().map(|(_, _, _, key)| key).collect()
    }

    pub fn is_scheduled(&self, key: TimerKey) -> bool {
        self.timers.values().any(|(_, scheduled)| *scheduled == key)
    }

    /// Connections with writes that were not reported as flushed yet.
    pub fn take_unflushed(&mut self) -> Vec<ConnId> {
        std::mem::take(&mut self.unflushed).into_iter().collect()
    }

    /// Raw bytes written to `conn` since the last call.
    pub fn take_bytes(&mut self, conn: ConnId) -> Vec<u8> {
        self.written.remove(&conn).unwrap_or_default()
    }

    /// Messages written to `conn` since the last call. A leading handshake is skipped.
    pub fn take_messages(&mut self, conn: ConnId) -> Vec<Message> {
        decode_messages(self.take_bytes(conn)).1
    }

    /// The handshake and messages written to `conn` since the last call.
    pub fn take_handshake(&mut self, conn: ConnId) -> (Option<Handshake>, Vec<Message>) {
        decode_messages(self.take_bytes(conn))
    }
}

impl Default for FakeReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for FakeReactor {
    fn now(&self) -> Instant {
        self.now
    }

    fn write(&mut self, conn: ConnId, data: Bytes) {
        self.written.entry(conn).or_default().extend_from_slice(&data);
        self.unflushed.insert(conn);
    }

    fn close(&mut self, conn: ConnId) {
        self.closed.insert(conn);
    }

    fn schedule(&mut self, delay: Duration, key: TimerKey) -> CancelToken {
        let token = CancelToken(self.next_token);
        self.next_token += 1;
        self.timers.insert(token, (self.now + delay, key));
        token
    }

    fn cancel(&mut self, token: CancelToken) {
        self.timers.remove(&token);
    }
}

fn decode_messages(bytes: Vec<u8>) -> (Option<Handshake>, Vec<Message>) {
    let mut buf = BytesMut::from(&bytes[..]);
    let mut handshake = None;
    // Message frames never start with 19 since no frame is that long
    if buf.first() == Some(&19) && buf.len() >= HANDSHAKE_LENGTH {
        handshake = HandshakeCodec.decode(&mut buf).unwrap();
    }
    let mut codec = MessageCodec::new(1 << 20);
    let mut messages = Vec::new();
    while let Some(message) = codec.decode(&mut buf).unwrap() {
        messages.push(message);
    }
    assert!(!buf.has_remaining(), "partial frame written");
    (handshake, messages)
}
