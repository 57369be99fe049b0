use std::collections::BTreeSet;

use log::trace;

use crate::core::Bitfield;
use crate::engine::ConnId;

/// Tracks, per piece, how many connected peers announced it, and orders the pieces the client
/// still misses by rarity.
///
/// Callers credit each (peer, piece) pair at most once; the peer's remote bitfield is the
/// ledger of what has been credited.
#[derive(Debug)]
pub struct AvailabilityTable {
    /// Number of connected peers with each piece
    counts: Vec<usize>,
    /// (availability, piece) for every piece the client is missing, rarest first
    priorities: BTreeSet<(usize, usize)>,
}

impl AvailabilityTable {
    pub fn new(local: &Bitfield) -> Self {
        let priorities = (0..local.len())
            .filter(|piece| !local.has(*piece))
            .map(|piece| (0, piece))
            .collect();
        Self {
            counts: vec![0; local.len()],
            priorities,
        }
    }

    pub fn record_have(&mut self, conn: ConnId, piece: usize) {
        let count = self.counts[piece];
        trace!("{} has piece {} (availability {})", conn, piece, count + 1);
        self.reprioritize(piece, count, count + 1);
    }

    pub fn forget_have(&mut self, conn: ConnId, piece: usize) {
        let count = self.counts[piece];
        debug_assert!(count > 0, "availability of piece {} would go negative", piece);
        trace!("{} no longer counted for piece {}", conn, piece);
        self.reprioritize(piece, count, count.saturating_sub(1));
    }

    /// Rarest available piece the client misses and `predicate` accepts. Ties go to the lowest
    /// piece index.
    pub fn select_piece(&self, predicate: impl Fn(usize) -> bool) -> Option<usize> {
        self.priorities
            .range((1, 0)..)
            .map(|&(_, piece)| piece)
            .find(|&piece| predicate(piece))
    }

    /// The client verified `piece`; it is never selected again.
    pub fn mark_have(&mut self, piece: usize) {
        self.priorities.remove(&(self.counts[piece], piece));
    }

    pub fn availability(&self, piece: usize) -> usize {
        self.counts.get(piece).copied().unwrap_or(0)
    }

    /// Number of pieces the client still misses.
    pub fn missing(&self) -> usize {
        self.priorities.len()
    }

    fn reprioritize(&mut self, piece: usize, old: usize, new: usize) {
        self.counts[piece] = new;
        if self.priorities.remove(&(old, piece)) {
            self.priorities.insert((new, piece));
        }
    }
}
