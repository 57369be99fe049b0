use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::engine::ConnId;
use crate::message::Block;
use crate::scheduler::blocks::Blocks;

/// A piece that has at least one block requested. Every block of the piece is in exactly one
/// of: never assigned, released (assigned once, then given back), in flight, or received.
#[derive(Debug)]
pub struct ActivePiece {
    pub index: usize,
    total_blocks: usize,
    unassigned_blocks: Blocks,
    released_blocks: Vec<Block>,
    /// In-flight blocks and the connections they were requested from. More than one
    /// connection only happens in endgame.
    in_flight: BTreeMap<Block, BTreeSet<ConnId>>,
    received: HashSet<Block>,
}

impl ActivePiece {
    pub fn new(index: usize, piece_length: usize, block_size: usize) -> Self {
        Self {
            index,
            total_blocks: Blocks::count(piece_length, block_size),
            unassigned_blocks: Blocks::new(index, piece_length, block_size),
            released_blocks: Vec::new(),
            in_flight: BTreeMap::new(),
            received: HashSet::new(),
        }
    }

    /// Assigns up to `n` blocks nobody is fetching to `conn`.
    pub fn try_assign_n(&mut self, conn: ConnId, n: usize, dest: &mut Vec<Block>) -> usize {
        let mut assigned = 0;

        // Use released blocks first
        while assigned < n {
            let Some(block) = self.released_blocks.pop() else {
                break;
            };
            self.in_flight.entry(block).or_default().insert(conn);
            dest.push(block);
            assigned += 1;
        }

        // Assign remaining from unassigned blocks
        while assigned < n {
            if let Some(block) = self.unassigned_blocks.next() {
                self.in_flight.entry(block).or_default().insert(conn);
                dest.push(block);
                assigned += 1;
            } else {
                break;
            }
        }

        assigned
    }

    /// Endgame: assigns up to `n` blocks already in flight elsewhere to `conn` as well.
    pub fn assign_duplicates(&mut self, conn: ConnId, n: usize, dest: &mut Vec<Block>) -> usize {
        let mut assigned = 0;
        for (block, conns) in self.in_flight.iter_mut() {
            if assigned == n {
                break;
            }
            if conns.insert(conn) {
                dest.push(*block);
                assigned += 1;
            }
        }
        assigned
    }

    /// Whether any block is still waiting for a first assignment.
    #[cfg(test)]
    pub fn has_unassigned(&self) -> bool {
        self.received.len() + self.in_flight.len() < self.total_blocks
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Records `block` as received from `conn`. Returns the other connections that still have
    /// the same block in flight, or `None` if the block is not part of this piece's pending
    /// work (already received, or never requested).
    pub fn block_received(&mut self, conn: ConnId, block: Block) -> Option<Vec<ConnId>> {
        if self.received.contains(&block) {
            return None;
        }
        let others = match self.in_flight.remove(&block) {
            Some(conns) => conns.into_iter().filter(|other| *other != conn).collect(),
            None => {
                // Late arrival after the block was released
                let position = self.released_blocks.iter().position(|b| *b == block)?;
                self.released_blocks.swap_remove(position);
                Vec::new()
            }
        };
        self.received.insert(block);
        Some(others)
    }

    /// `conn` will not deliver `block`. Once no connection is fetching it, the block becomes
    /// available for assignment again.
    pub fn unassign(&mut self, conn: ConnId, block: Block) {
        let Some(conns) = self.in_flight.get_mut(&block) else {
            return;
        };
        conns.remove(&conn);
        if conns.is_empty() {
            self.in_flight.remove(&block);
            self.released_blocks.push(block);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_A: ConnId = ConnId(1);
    const PEER_B: ConnId = ConnId(2);

    #[test]
    fn assign_blocks_in_order() {
        let mut piece = ActivePiece::new(3, 40, 16);
        let mut blocks = Vec::new();

        assert_eq!(piece.try_assign_n(PEER_A, 2, &mut blocks), 2);
        assert_eq!(piece.try_assign_n(PEER_A, 2, &mut blocks), 1);
        assert_eq!(piece.try_assign_n(PEER_A, 2, &mut blocks), 0);
        assert_eq!(
            blocks,
            vec![
                Block::new(3, 0, 16),
                Block::new(3, 16, 16),
                Block::new(3, 32, 8)
            ]
        );
        assert!(!piece.has_unassigned());
    }

    #[test]
    fn released_blocks_are_reassigned_first() {
        let mut piece = ActivePiece::new(0, 48, 16);
        let mut blocks = Vec::new();
        piece.try_assign_n(PEER_A, 2, &mut blocks);

        piece.unassign(PEER_A, Block::new(0, 16, 16));
        assert!(piece.has_unassigned());

        let mut reassigned = Vec::new();
        piece.try_assign_n(PEER_B, 2, &mut reassigned);
        assert_eq!(
            reassigned,
            vec![Block::new(0, 16, 16), Block::new(0, 32, 16)]
        );
    }

    #[test]
    fn complete_after_every_block_received() {
        let mut piece = ActivePiece::new(0, 32, 16);
        let mut blocks = Vec::new();
        piece.try_assign_n(PEER_A, 2, &mut blocks);

        assert_eq!(piece.block_received(PEER_A, blocks[0]), Some(vec![]));
        assert!(!piece.is_complete());
        assert_eq!(piece.block_received(PEER_A, blocks[0]), None);
        assert_eq!(piece.block_received(PEER_A, blocks[1]), Some(vec![]));
        assert!(piece.is_complete());
    }

    #[test]
    fn unrequested_block_is_ignored() {
        let mut piece = ActivePiece::new(0, 32, 16);

        assert_eq!(piece.block_received(PEER_A, Block::new(0, 0, 16)), None);
        assert!(!piece.is_complete());
    }

    #[test]
    fn duplicates_report_other_holders() {
        let mut piece = ActivePiece::new(0, 16, 16);
        let mut blocks = Vec::new();
        piece.try_assign_n(PEER_A, 1, &mut blocks);

        let mut duplicates = Vec::new();
        assert_eq!(piece.assign_duplicates(PEER_B, 5, &mut duplicates), 1);
        assert_eq!(piece.assign_duplicates(PEER_B, 5, &mut duplicates), 0);
        assert_eq!(duplicates, blocks);

        assert_eq!(
            piece.block_received(PEER_B, blocks[0]),
            Some(vec![PEER_A])
        );
    }

    #[test]
    fn unassign_keeps_block_in_flight_at_other_peer() {
        let mut piece = ActivePiece::new(0, 16, 16);
        let mut blocks = Vec::new();
        piece.try_assign_n(PEER_A, 1, &mut blocks);
        piece.assign_duplicates(PEER_B, 1, &mut blocks);

        piece.unassign(PEER_A, blocks[0]);
        assert!(!piece.has_unassigned());

        piece.unassign(PEER_B, blocks[0]);
        assert!(piece.has_unassigned());
    }

    #[test]
    fn nothing_in_flight_once_every_request_is_released() {
        let mut piece = ActivePiece::new(0, 32, 16);
        let mut blocks = Vec::new();
        piece.try_assign_n(PEER_A, 2, &mut blocks);
        assert!(piece.has_in_flight());

        piece.block_received(PEER_A, blocks[0]);
        assert!(piece.has_in_flight());
        piece.unassign(PEER_A, blocks[1]);

        assert!(!piece.has_in_flight());
        assert!(!piece.is_complete());
    }
}
