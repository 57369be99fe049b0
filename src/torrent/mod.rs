mod piece;

use std::path::PathBuf;

use anyhow::{Result, anyhow};

use crate::core::Sha1;

pub use piece::{Piece, PieceState};

/// Torrent metadata the engine consumes. Parsing it from a metainfo file happens elsewhere.
#[derive(Debug, PartialEq, Clone)]
pub struct Descriptor {
    pub info_hash: Sha1,
    pub piece_size: usize,
    pub pieces: Vec<Sha1>,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, length: u64) -> Self {
        Self {
            path: path.into(),
            length,
        }
    }
}

impl Descriptor {
    pub fn new(
        info_hash: Sha1,
        piece_size: usize,
        pieces: Vec<Sha1>,
        files: Vec<FileEntry>,
    ) -> Result<Self> {
        if piece_size == 0 {
            return Err(anyhow!("piece size must be positive"));
        }
        let total_size: u64 = files.iter().map(|file| file.length).sum();
        let expected = total_size.div_ceil(piece_size as u64) as usize;
        if pieces.len() != expected {
            return Err(anyhow!(
                "{} piece hashes for {} bytes, expected {}",
                pieces.len(),
                total_size,
                expected
            ));
        }
        Ok(Self {
            info_hash,
            piece_size,
            pieces,
            files,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_hash(&self, piece: usize) -> &Sha1 {
        &self.pieces[piece]
    }

    /// Length of `piece`; only the last piece may be shorter than `piece_size`.
    pub fn piece_length(&self, piece: usize) -> usize {
        let piece_start = self.piece_offset(piece);
        let piece_end = (piece_start + self.piece_size as u64).min(self.total_size());
        (piece_end - piece_start) as usize
    }

    pub fn piece_offset(&self, piece: usize) -> u64 {
        (self.piece_size as u64) * (piece as u64)
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }

    /// The initial model of every piece, all `Missing`.
    pub fn build_pieces(&self) -> Vec<Piece> {
        (0..self.piece_count())
            .map(|index| Piece::new(index, self.piece_length(index), self.pieces[index].clone()))
            .collect()
    }
}
