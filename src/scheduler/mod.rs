mod active_pieces;
mod availability;
mod blocks;

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace};

use crate::config::Config;
use crate::core::Bitfield;
use crate::engine::ConnId;
use crate::message::Block;
use crate::torrent::Descriptor;

use active_pieces::ActivePiece;
pub use availability::AvailabilityTable;
pub use blocks::Blocks;

/// Outcome of a block arriving for a piece the picker is fetching.
#[derive(Debug, PartialEq, Eq)]
pub struct Accepted {
    /// Other connections that still have the same block in flight (endgame)
    pub duplicates: Vec<ConnId>,
    /// Every block of the piece has now arrived
    pub piece_complete: bool,
}

/// Decides which blocks each connection requests next.
///
/// Pieces that are already being fetched are preferred over opening new ones, new pieces are
/// picked rarest first, and once few enough pieces are missing the remaining in-flight blocks
/// are requested from every peer that has them.
#[derive(Debug)]
pub struct Picker {
    descriptor: Arc<Descriptor>,
    availability: AvailabilityTable,
    active_pieces: BTreeMap<usize, ActivePiece>,
    block_size: usize,
    max_requests: usize,
    endgame_threshold: usize,
}

impl Picker {
    pub fn new(descriptor: Arc<Descriptor>, local: &Bitfield, config: &Config) -> Self {
        Self {
            availability: AvailabilityTable::new(local),
            descriptor,
            active_pieces: BTreeMap::new(),
            block_size: config.block_size.bytes() as usize,
            max_requests: config.max_requests_per_peer,
            endgame_threshold: config.endgame_threshold,
        }
    }

    pub fn peer_has_piece(&mut self, conn: ConnId, piece: usize) {
        self.availability.record_have(conn, piece);
    }

    pub fn peer_lost_piece(&mut self, conn: ConnId, piece: usize) {
        self.availability.forget_have(conn, piece);
    }

    pub fn availability(&self, piece: usize) -> usize {
        self.availability.availability(piece)
    }

    pub fn in_endgame(&self) -> bool {
        self.availability.missing() <= self.endgame_threshold
    }

    /// Blocks `conn` should request now, given the pieces it has and how many requests it
    /// already has in flight.
    pub fn next_requests(
        &mut self,
        conn: ConnId,
        remote: &Bitfield,
        in_flight: usize,
    ) -> Vec<Block> {
        let wanted = self.max_requests.saturating_sub(in_flight);
        let mut blocks = Vec::with_capacity(wanted);
        if wanted == 0 {
            return blocks;
        }

        // Strict priority: finish pieces that are already started
        for piece in self.active_pieces.values_mut() {
            if blocks.len() == wanted {
                break;
            }
            if remote.has(piece.index) {
                piece.try_assign_n(conn, wanted - blocks.len(), &mut blocks);
            }
        }

        // Open new pieces, rarest first
        while blocks.len() < wanted {
            let active_pieces = &self.active_pieces;
            let next = self
                .availability
                .select_piece(|piece| remote.has(piece) && !active_pieces.contains_key(&piece));
            let Some(index) = next else {
                break;
            };
            debug!(
                "{} starting piece {} (availability {})",
                conn,
                index,
                self.availability.availability(index)
            );
            let piece_length = self.descriptor.piece_length(index);
            let piece = ActivePiece::new(index, piece_length, self.block_size);
            let piece = self.active_pieces.entry(index).or_insert(piece);
            piece.try_assign_n(conn, wanted - blocks.len(), &mut blocks);
        }

        if blocks.len() < wanted && self.in_endgame() {
            for piece in self.active_pieces.values_mut() {
                if blocks.len() == wanted {
                    break;
                }
                if remote.has(piece.index) {
                    let before = blocks.len();
                    piece.assign_duplicates(conn, wanted - blocks.len(), &mut blocks);
                    if blocks.len() > before {
                        trace!("{} endgame duplicates for piece {}", conn, piece.index);
                    }
                }
            }
        }

        blocks
    }

    /// `block` arrived from `conn`. Returns `None` when the block was not wanted (never
    /// requested, already received, or for a piece nobody is fetching).
    pub fn block_received(&mut self, conn: ConnId, block: Block) -> Option<Accepted> {
        let piece = self.active_pieces.get_mut(&block.piece)?;
        let duplicates = piece.block_received(conn, block)?;
        Some(Accepted {
            duplicates,
            piece_complete: piece.is_complete(),
        })
    }

    /// `conn` will not deliver `block` (choked, cancelled or disconnected).
    pub fn release(&mut self, conn: ConnId, block: Block) {
        if let Some(piece) = self.active_pieces.get_mut(&block.piece) {
            piece.unassign(conn, block);
        }
    }

    /// Whether some block of `piece` is requested from a peer right now.
    pub fn is_requesting(&self, piece: usize) -> bool {
        self.active_pieces
            .get(&piece)
            .is_some_and(|piece| piece.has_in_flight())
    }

    /// The piece was verified and stored; it is never picked again.
    pub fn piece_completed(&mut self, piece: usize) {
        self.active_pieces.remove(&piece);
        self.availability.mark_have(piece);
    }

    /// The piece failed verification; all of its blocks are fetched again from scratch.
    pub fn piece_failed(&mut self, piece: usize) {
        self.active_pieces.remove(&piece);
    }

    /// Number of pieces the client still misses.
    pub fn missing(&self) -> usize {
        self.availability.missing()
    }
}
