use bit_set::BitSet;

use crate::error::ProtocolError;

/// Fixed-size piece possession vector. Bit `i` is set iff the owner has verified piece `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitSet,
    len: usize,
}

impl Bitfield {
    pub fn new(len: usize) -> Self {
        Self {
            bits: BitSet::with_capacity(len),
            len,
        }
    }

    pub fn full(len: usize) -> Self {
        Self {
            bits: (0..len).collect(),
            len,
        }
    }

    /// Number of pieces the bitfield covers.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    pub fn has(&self, piece: usize) -> bool {
        self.bits.contains(piece)
    }

    /// Sets bit `piece`, returning `true` if it was not already set.
    pub fn set(&mut self, piece: usize) -> bool {
        assert!(piece < self.len, "piece {} out of range", piece);
        self.bits.insert(piece)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter()
    }

    /// Whether `self` has at least one piece that `other` lacks.
    pub fn has_any_missing_from(&self, other: &Bitfield) -> bool {
        self.bits.difference(&other.bits).next().is_some()
    }

    /// Wire form: ceil(len / 8) bytes, high bit of the first byte is piece 0.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0; self.len.div_ceil(8)];
        for piece in self.bits.iter() {
            bytes[piece / 8] |= 0x80 >> (piece % 8);
        }
        bytes
    }

    pub fn to_wire(&self) -> BitSet {
        BitSet::from_bytes(&self.to_bytes())
    }

    /// Validates a decoded bitfield against the torrent's piece count.
    pub fn from_wire(bits: BitSet, len: usize) -> Result<Self, ProtocolError> {
        let expected = len.div_ceil(8);
        let actual = bits.get_ref().len() / 8;
        if actual != expected {
            return Err(ProtocolError::BitfieldSize { expected, actual });
        }
        if bits.iter().any(|piece| piece >= len) {
            return Err(ProtocolError::BitfieldSpareBits);
        }
        Ok(Self { bits, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_new_bits_only() {
        let mut bitfield = Bitfield::new(10);

        assert!(bitfield.set(3));
        assert!(!bitfield.set(3));
        assert_eq!(bitfield.count(), 1);
    }

    #[test]
    fn wire_bytes_are_msb_first() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0);
        bitfield.set(9);

        assert_eq!(bitfield.to_bytes(), vec![0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn from_wire_accepts_exact_size() {
        let bits = BitSet::from_bytes(&[0b1010_0000, 0b0100_0000]);
        let bitfield = Bitfield::from_wire(bits, 10).unwrap();

        assert_eq!(bitfield.iter().collect::<Vec<_>>(), vec![0, 2, 9]);
        assert_eq!(bitfield.len(), 10);
    }

    #[test]
    fn from_wire_rejects_wrong_size() {
        let bits = BitSet::from_bytes(&[0xff]);

        assert!(matches!(
            Bitfield::from_wire(bits, 10),
            Err(ProtocolError::BitfieldSize {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn from_wire_rejects_spare_bits() {
        let bits = BitSet::from_bytes(&[0x00, 0b0010_0000]);

        assert!(matches!(
            Bitfield::from_wire(bits, 10),
            Err(ProtocolError::BitfieldSpareBits)
        ));
    }

    #[test]
    fn missing_pieces_relative_to_other() {
        let mut remote = Bitfield::new(4);
        let mut local = Bitfield::new(4);
        remote.set(1);
        local.set(1);

        assert!(!remote.has_any_missing_from(&local));

        remote.set(2);
        assert!(remote.has_any_missing_from(&local));
    }
}
