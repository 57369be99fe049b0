use crate::message::Block;

/// Splits one piece into consecutive blocks of at most `block_size` bytes. Only the final block
/// of a piece may be shorter.
#[derive(Debug, Clone)]
pub struct Blocks {
    block_size: usize,
    piece: usize,
    offset: usize,
    end: usize,
}

impl Blocks {
    pub fn new(piece: usize, piece_length: usize, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self {
            block_size,
            piece,
            offset: 0,
            end: piece_length,
        }
    }

    /// Number of blocks the piece is made of.
    pub fn count(piece_length: usize, block_size: usize) -> usize {
        piece_length.div_ceil(block_size)
    }
}

impl Iterator for Blocks {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset < self.end {
            let length = self.block_size.min(self.end - self.offset);
            let block = Block::new(self.piece, self.offset, length);
            self.offset += length;
            Some(block)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZE: usize = 1024;

    #[test]
    fn one_piece_one_block() {
        let mut blocks = Blocks::new(0, 1024, BLOCK_SIZE);

        assert_eq!(Some(Block::new(0, 0, BLOCK_SIZE)), blocks.next());
        assert_eq!(None, blocks.next());
    }

    #[test]
    fn one_piece_multiple_blocks() {
        let mut blocks = Blocks::new(0, 2048, BLOCK_SIZE);

        assert_eq!(Some(Block::new(0, 0, BLOCK_SIZE)), blocks.next());
        assert_eq!(Some(Block::new(0, 1024, BLOCK_SIZE)), blocks.next());
        assert_eq!(None, blocks.next());
    }

    #[test]
    fn uneven_block_sizes() {
        let mut blocks = Blocks::new(1, BLOCK_SIZE + 42, BLOCK_SIZE);

        assert_eq!(Some(Block::new(1, 0, BLOCK_SIZE)), blocks.next());
        assert_eq!(Some(Block::new(1, 1024, 42)), blocks.next());
        assert_eq!(None, blocks.next());
    }

    #[test]
    fn short_last_piece() {
        let blocks: Vec<_> = Blocks::new(2, 100, BLOCK_SIZE).collect();

        assert_eq!(blocks, vec![Block::new(2, 0, 100)]);
        assert_eq!(Blocks::count(100, BLOCK_SIZE), 1);
        assert_eq!(Blocks::count(3 * BLOCK_SIZE, BLOCK_SIZE), 3);
    }
}
