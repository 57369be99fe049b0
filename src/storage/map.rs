use std::collections::BTreeSet;

use log::{debug, trace};

use crate::core::Bitfield;
use crate::error::StorageError;
use crate::storage::backend::Backend;
use crate::storage::layout::{FileLayout, Span};
use crate::torrent::Descriptor;

/// Places verified pieces into the torrent's files without preallocating them.
///
/// The global byte space is divided into slots of `piece_size` bytes, slot `i` being piece
/// `i`'s final home. Slots are handed out contiguously from the start, so files only ever grow
/// at their end. A piece that arrives before its home slot is reached is parked in a temporary
/// slot, and moved home once the allocated region covers it. Once every piece is stored, every
/// piece is at its home slot.
pub struct StorageMap {
    layout: FileLayout,
    backend: Box<dyn Backend>,
    piece_size: u64,
    piece_count: usize,
    slot_of_piece: Vec<Option<usize>>,
    piece_of_slot: Vec<Option<usize>>,
    /// Slots `[0, allocated)` have been handed out
    allocated: usize,
    /// Allocated slots that hold no piece
    free: BTreeSet<usize>,
    /// Stored pieces that are not at their home slot
    displaced: BTreeSet<usize>,
}

impl StorageMap {
    pub fn new(descriptor: &Descriptor, backend: impl Backend + 'static) -> Self {
        let piece_count = descriptor.piece_count();
        Self {
            layout: FileLayout::new(&descriptor.files),
            backend: Box::new(backend),
            piece_size: descriptor.piece_size as u64,
            piece_count,
            slot_of_piece: vec![None; piece_count],
            piece_of_slot: vec![None; piece_count],
            allocated: 0,
            free: BTreeSet::new(),
            displaced: BTreeSet::new(),
        }
    }

    /// Storage whose files already hold the pieces in `have` at their home slots.
    pub fn with_pieces(
        descriptor: &Descriptor,
        backend: impl Backend + 'static,
        have: &Bitfield,
    ) -> Self {
        let mut map = Self::new(descriptor, backend);
        for piece in have.iter() {
            map.place(piece, piece);
        }
        map.allocated = have.iter().max().map_or(0, |piece| piece + 1);
        map.free = (0..map.allocated).filter(|slot| !have.has(*slot)).collect();
        map
    }

    pub fn resolve(&self, offset: u64, length: u64) -> Result<Vec<Span>, StorageError> {
        self.layout.resolve(offset, length)
    }

    pub fn slot_of_piece(&self, piece: usize) -> Option<usize> {
        self.slot_of_piece.get(piece).copied().flatten()
    }

    pub fn piece_of_slot(&self, slot: usize) -> Option<usize> {
        self.piece_of_slot.get(slot).copied().flatten()
    }

    pub fn write_piece(&mut self, piece: usize, data: &[u8]) -> Result<(), StorageError> {
        self.check_piece(piece)?;
        let expected = self.piece_length(piece);
        if data.len() != expected {
            return Err(StorageError::PieceLength {
                piece,
                expected,
                actual: data.len(),
            });
        }

        if self.slot_of_piece[piece] == Some(piece) {
            return self.write_slot(piece, data);
        }

        // Any previous copy is superseded
        let previous = self.slot_of_piece[piece].take();
        if let Some(slot) = previous {
            self.piece_of_slot[slot] = None;
            self.displaced.remove(&piece);
            self.free.insert(slot);
        }

        let target = if piece < self.allocated {
            if let Some(other) = self.piece_of_slot[piece] {
                let dest = match previous.filter(|slot| self.fits(*slot, other)) {
                    Some(slot) => {
                        self.free.remove(&slot);
                        slot
                    }
                    None => self.free_slot_for(other)?,
                };
                self.move_piece(other, piece, dest)?;
            }
            self.free.remove(&piece);
            piece
        } else if piece == self.allocated {
            self.allocated += 1;
            piece
        } else {
            self.free_slot_for(piece)?
        };

        self.write_slot(target, data)?;
        self.place(piece, target);
        if target != piece {
            debug!("piece {} stored at temporary slot {}", piece, target);
        }
        self.settle()
    }

    pub fn read_piece(&mut self, piece: usize) -> Result<Vec<u8>, StorageError> {
        self.check_piece(piece)?;
        self.read(piece, 0, self.piece_length(piece))
    }

    /// Reads `length` bytes at `offset` within a stored piece, wherever it currently lives.
    pub fn read(
        &mut self,
        piece: usize,
        offset: usize,
        length: usize,
    ) -> Result<Vec<u8>, StorageError> {
        self.check_piece(piece)?;
        let slot = self.slot_of_piece[piece].ok_or(StorageError::PieceNotStored(piece))?;
        if offset + length > self.piece_length(piece) {
            return Err(StorageError::OutOfRange {
                offset: offset as u64,
                length: length as u64,
                total: self.piece_length(piece) as u64,
            });
        }
        let mut buf = vec![0; length];
        self.read_range(self.slot_offset(slot) + offset as u64, &mut buf)?;
        Ok(buf)
    }

    /// Moves displaced pieces whose home slot is allocated back home.
    fn settle(&mut self) -> Result<(), StorageError> {
        while let Some(piece) = self.displaced.range(..self.allocated).next().copied() {
            let from = self.slot_of_piece[piece].ok_or(StorageError::PieceNotStored(piece))?;
            match self.piece_of_slot[piece] {
                None => {
                    self.free.remove(&piece);
                    self.move_piece(piece, from, piece)?;
                    self.free.insert(from);
                }
                Some(other) if self.fits(from, other) => {
                    trace!("swapping pieces {} and {}", piece, other);
                    let piece_data = self.read_slot(from, self.piece_length(piece))?;
                    let other_data = self.read_slot(piece, self.piece_length(other))?;
                    self.write_slot(piece, &piece_data)?;
                    self.write_slot(from, &other_data)?;
                    self.place(piece, piece);
                    self.place(other, from);
                }
                Some(other) => {
                    let dest = self.free_slot_for(other)?;
                    self.move_piece(other, piece, dest)?;
                    self.move_piece(piece, from, piece)?;
                    self.free.insert(from);
                }
            }
        }
        Ok(())
    }

    /// A slot that can hold `piece`: the lowest free one, else a newly allocated one.
    fn free_slot_for(&mut self, piece: usize) -> Result<usize, StorageError> {
        let length = self.piece_length(piece);
        let reusable = self
            .free
            .iter()
            .copied()
            .find(|slot| self.slot_length(*slot) >= length);
        if let Some(slot) = reusable {
            self.free.remove(&slot);
            return Ok(slot);
        }
        if self.allocated < self.piece_count && self.slot_length(self.allocated) >= length {
            let slot = self.allocated;
            self.allocated += 1;
            return Ok(slot);
        }

        // Only the short last slot is open: send the last piece home to make room
        let last = self.piece_count - 1;
        if let Some(from) = self.slot_of_piece[last] {
            if from != last && (self.allocated == last || self.free.contains(&last)) {
                if self.allocated == last {
                    self.allocated += 1;
                } else {
                    self.free.remove(&last);
                }
                self.move_piece(last, from, last)?;
                return Ok(from);
            }
        }
        Err(StorageError::NoFreeSlot(piece))
    }

    fn move_piece(&mut self, piece: usize, from: usize, to: usize) -> Result<(), StorageError> {
        trace!("moving piece {} from slot {} to slot {}", piece, from, to);
        let data = self.read_slot(from, self.piece_length(piece))?;
        self.write_slot(to, &data)?;
        self.piece_of_slot[from] = None;
        self.place(piece, to);
        Ok(())
    }

    fn place(&mut self, piece: usize, slot: usize) {
        self.slot_of_piece[piece] = Some(slot);
        self.piece_of_slot[slot] = Some(piece);
        if slot == piece {
            self.displaced.remove(&piece);
        } else {
            self.displaced.insert(piece);
        }
    }

    fn fits(&self, slot: usize, piece: usize) -> bool {
        self.slot_length(slot) >= self.piece_length(piece)
    }

    fn check_piece(&self, piece: usize) -> Result<(), StorageError> {
        if piece < self.piece_count {
            Ok(())
        } else {
            Err(StorageError::InvalidPiece(piece))
        }
    }

    fn piece_length(&self, piece: usize) -> usize {
        self.slot_length(piece)
    }

    /// Slots have the length of the piece that belongs there; only the last may be short.
    fn slot_length(&self, slot: usize) -> usize {
        let start = self.slot_offset(slot);
        let end = (start + self.piece_size).min(self.layout.total_size());
        (end - start) as usize
    }

    fn slot_offset(&self, slot: usize) -> u64 {
        self.piece_size * slot as u64
    }

    fn read_slot(&mut self, slot: usize, length: usize) -> Result<Vec<u8>, StorageError> {
        let mut buf = vec![0; length];
        self.read_range(self.slot_offset(slot), &mut buf)?;
        Ok(buf)
    }

    fn write_slot(&mut self, slot: usize, data: &[u8]) -> Result<(), StorageError> {
        let mut offset = 0;
        for span in self.layout.resolve(self.slot_offset(slot), data.len() as u64)? {
            let end = offset + span.length as usize;
            self.backend
                .write_at(span.file, span.file_offset, &data[offset..end])?;
            offset = end;
        }
        Ok(())
    }

    fn read_range(&mut self, start: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let mut offset = 0;
        for span in self.layout.resolve(start, buf.len() as u64)? {
            let end = offset + span.length as usize;
            self.backend
                .read_at(span.file, span.file_offset, &mut buf[offset..end])?;
            offset = end;
        }
        Ok(())
    }
}

impl std::fmt::Debug for StorageMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageMap")
            .field("piece_count", &self.piece_count)
            .field("allocated", &self.allocated)
            .field("displaced", &self.displaced)
            .finish()
    }
}
