/// One outstanding transfer: a byte range within a piece.
#[derive(Debug, PartialEq, Clone, Copy, Eq, Hash, PartialOrd, Ord)]
pub struct Block {
    pub piece: usize,
    pub offset: usize,
    pub length: usize,
}

impl Block {
    pub fn new(piece: usize, offset: usize, length: usize) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    /// Whether the block lies within a piece of `piece_length` bytes.
    pub fn fits(&self, piece_length: usize) -> bool {
        self.length > 0 && self.offset < piece_length && self.end() <= piece_length
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BlockData {
    pub piece: usize,
    pub offset: usize,
    pub data: Vec<u8>,
}

impl From<&BlockData> for Block {
    fn from(value: &BlockData) -> Self {
        Self::new(value.piece, value.offset, value.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_fits_within_piece() {
        assert!(Block::new(0, 0, 16).fits(16));
        assert!(Block::new(0, 8, 8).fits(16));
        assert!(!Block::new(0, 8, 9).fits(16));
        assert!(!Block::new(0, 16, 1).fits(16));
        assert!(!Block::new(0, 0, 0).fits(16));
    }

    #[test]
    fn block_from_data() {
        let data = BlockData {
            piece: 2,
            offset: 4,
            data: vec![0; 3],
        };

        assert_eq!(Block::from(&data), Block::new(2, 4, 3));
    }
}
