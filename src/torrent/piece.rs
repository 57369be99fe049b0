use crate::core::Sha1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Not requested from anyone, or reverted after a failed hash check
    Missing,
    /// Blocks are being fetched
    Requesting,
    /// Every block arrived, hash check in progress
    Verifying,
    /// Verified and stored
    Have,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    pub index: usize,
    pub length: usize,
    pub expected_hash: Sha1,
    pub state: PieceState,
}

impl Piece {
    pub fn new(index: usize, length: usize, expected_hash: Sha1) -> Self {
        Self {
            index,
            length,
            expected_hash,
            state: PieceState::Missing,
        }
    }
}
