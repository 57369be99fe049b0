use std::collections::{BTreeSet, HashMap};

use crate::core::Sha1;
use crate::engine::ConnId;
use crate::message::BlockData;

#[derive(Debug, PartialEq, Eq)]
pub enum Status {
    /// The piece data does not match its expected hash
    Invalid { contributors: BTreeSet<ConnId> },
    /// The piece data is verified
    Complete {
        data: Vec<u8>,
        contributors: BTreeSet<ConnId>,
    },
}

/// Buffers the blocks of pieces being downloaded until they can be verified.
#[derive(Debug, Default)]
pub struct PieceAssembler {
    pieces: HashMap<usize, PartialPiece>,
}

#[derive(Debug)]
struct PartialPiece {
    data: Vec<u8>,
    contributors: BTreeSet<ConnId>,
}

impl PieceAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies a block into its piece buffer. The block must lie within the piece.
    pub fn add(&mut self, conn: ConnId, piece_length: usize, block: BlockData) {
        let piece = self
            .pieces
            .entry(block.piece)
            .or_insert_with(|| PartialPiece {
                data: vec![0; piece_length],
                contributors: BTreeSet::new(),
            });
        let end = block.offset + block.data.len();
        piece.data[block.offset..end].copy_from_slice(&block.data);
        piece.contributors.insert(conn);
    }

    /// Takes the buffered piece out and checks it against `expected`.
    pub fn finish(&mut self, piece: usize, expected: &Sha1) -> Option<Status> {
        let PartialPiece { data, contributors } = self.pieces.remove(&piece)?;
        if Sha1::digest(&data) == *expected {
            Some(Status::Complete { data, contributors })
        } else {
            Some(Status::Invalid { contributors })
        }
    }

    /// Number of pieces with buffered blocks.
    pub fn buffered_pieces(&self) -> usize {
        self.pieces.len()
    }
}
