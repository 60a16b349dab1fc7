//! Piece availability bitmap
//!
//! MSB-first, padded to a byte boundary. Pad bits must stay zero; a wire
//! bitfield with non-zero padding is a protocol violation.

use anyhow::Result;

use crate::error::TorrentError;

/// Fixed-width piece bitmap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: u32,
}

impl Bitfield {
    /// All-zero bitmap for `num_pieces` pieces
    pub fn new(num_pieces: u32) -> Self {
        Self {
            bits: vec![0u8; num_pieces.div_ceil(8) as usize],
            num_pieces,
        }
    }

    /// Validate and adopt wire bytes
    ///
    /// Length must be exactly `ceil(num_pieces / 8)` and every padding bit
    /// past `num_pieces` must be zero.
    pub fn from_bytes(bytes: Vec<u8>, num_pieces: u32) -> Result<Self> {
        let expected_len = num_pieces.div_ceil(8) as usize;
        if bytes.len() != expected_len {
            return Err(TorrentError::protocol_violation(format!(
                "bitfield length {} does not match {} pieces",
                bytes.len(),
                num_pieces
            ))
            .into());
        }

        let pad_bits = expected_len as u32 * 8 - num_pieces;
        if pad_bits > 0 {
            let last = bytes[expected_len - 1];
            let pad_mask = (1u16 << pad_bits) as u8 - 1;
            if last & pad_mask != 0 {
                return Err(TorrentError::protocol_violation(
                    "bitfield has non-zero padding bits",
                )
                .into());
            }
        }

        Ok(Self {
            bits: bytes,
            num_pieces,
        })
    }

    pub fn has(&self, index: u32) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let byte = self.bits[(index / 8) as usize];
        byte >> (7 - index % 8) & 1 == 1
    }

    pub fn set(&mut self, index: u32) {
        if index < self.num_pieces {
            self.bits[(index / 8) as usize] |= 1 << (7 - index % 8);
        }
    }

    pub fn clear(&mut self, index: u32) {
        if index < self.num_pieces {
            self.bits[(index / 8) as usize] &= !(1 << (7 - index % 8));
        }
    }

    /// Number of pieces marked present
    pub fn count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.num_pieces
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bits
    }

    /// Whether this bitmap advertises any piece missing from `ours`
    pub fn offers_piece_missing_from(&self, ours: &Bitfield) -> bool {
        (0..self.num_pieces).any(|i| self.has(i) && !ours.has(i))
    }

    /// Indices of pieces marked present
    pub fn present(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.num_pieces).filter(|&i| self.has(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_empty() {
        let bf = Bitfield::new(10);
        assert_eq!(bf.count(), 0);
        assert_eq!(bf.as_bytes().len(), 2);
        assert!(!bf.is_full());
    }

    #[test]
    fn test_set_and_has_msb_first() {
        let mut bf = Bitfield::new(10);
        bf.set(0);
        bf.set(9);
        assert!(bf.has(0));
        assert!(bf.has(9));
        assert!(!bf.has(1));
        // piece 0 is the MSB of byte 0, piece 9 is bit 6 of byte 1
        assert_eq!(bf.as_bytes(), &[0b1000_0000, 0b0100_0000]);
    }

    #[test]
    fn test_clear() {
        let mut bf = Bitfield::new(8);
        bf.set(3);
        assert!(bf.has(3));
        bf.clear(3);
        assert!(!bf.has(3));
    }

    #[test]
    fn test_out_of_range_reads_false() {
        let mut bf = Bitfield::new(10);
        bf.set(15); // ignored
        assert!(!bf.has(15));
        assert_eq!(bf.count(), 0);
    }

    #[test]
    fn test_is_full() {
        let mut bf = Bitfield::new(9);
        for i in 0..9 {
            bf.set(i);
        }
        assert!(bf.is_full());
        assert_eq!(bf.count(), 9);
    }

    #[test]
    fn test_from_bytes_valid() {
        let bf = Bitfield::from_bytes(vec![0b1010_0000], 4).unwrap();
        assert!(bf.has(0));
        assert!(!bf.has(1));
        assert!(bf.has(2));
        assert!(!bf.has(3));
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(Bitfield::from_bytes(vec![0u8; 2], 4).is_err());
        assert!(Bitfield::from_bytes(vec![], 4).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_nonzero_padding() {
        // 4 pieces in one byte leaves 4 pad bits; 0b0000_0001 sets one
        let err = Bitfield::from_bytes(vec![0b0000_0001], 4).unwrap_err();
        let err = err.downcast::<TorrentError>().unwrap();
        assert!(matches!(err, TorrentError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_from_bytes_exact_multiple_has_no_padding() {
        let bf = Bitfield::from_bytes(vec![0xff], 8).unwrap();
        assert!(bf.is_full());
    }

    #[test]
    fn test_offers_piece_missing_from() {
        let mut theirs = Bitfield::new(4);
        let mut ours = Bitfield::new(4);
        theirs.set(2);
        assert!(theirs.offers_piece_missing_from(&ours));
        ours.set(2);
        assert!(!theirs.offers_piece_missing_from(&ours));
    }

    #[test]
    fn test_present_iterator() {
        let mut bf = Bitfield::new(12);
        bf.set(1);
        bf.set(8);
        bf.set(11);
        let present: Vec<u32> = bf.present().collect();
        assert_eq!(present, vec![1, 8, 11]);
    }
}
