//! Fixed-length piece bitmap, packed big-endian as on the wire
//! (bit 0 = piece 0 = most significant bit of byte 0).
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfieldError {
    #[error("bitfield is {got} bytes, expected {expected} for {len} pieces")]
    LengthMismatch { got: usize, expected: usize, len: usize },

    #[error("bitfield has nonzero padding bits past piece {len}")]
    DirtyPadding { len: usize },
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Bitfield {
    bytes: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// An all-zero bitfield for `len` pieces.
    pub fn new(len: usize) -> Bitfield {
        Bitfield {
            bytes: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Parses a wire bitfield for a torrent of `len` pieces.
    ///
    /// The byte count must be exactly `ceil(len / 8)` and every padding bit
    /// beyond `len` must be zero; anything else is a peer speaking for
    /// pieces that do not exist.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Bitfield, BitfieldError> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(BitfieldError::LengthMismatch {
                got: bytes.len(),
                expected,
                len,
            });
        }
        if len % 8 != 0 {
            let padding_mask = 0xffu8 >> (len % 8);
            if bytes[expected - 1] & padding_mask != 0 {
                return Err(BitfieldError::DirtyPadding { len });
            }
        }
        Ok(Bitfield {
            bytes: bytes.to_vec(),
            len,
        })
    }

    /// The packed byte representation, padding bits zero.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let mask = 1 << (7 - index % 8);
        self.bytes[index / 8] & mask != 0
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        let mask = 1 << (7 - index % 8);
        self.bytes[index / 8] |= mask;
    }

    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len);
        let mask = 1 << (7 - index % 8);
        self.bytes[index / 8] &= !mask;
    }

    pub fn count(&self) -> usize {
        self.iter().filter(|&b| b).count()
    }

    pub fn any(&self) -> bool {
        self.iter().any(|b| b)
    }

    pub fn all(&self) -> bool {
        self.iter().all(|b| b)
    }

    /// Bits set in `self` but not in `other`: the pieces a peer advertising
    /// `self` could give a host holding `other`.
    pub fn and_not(&self, other: &Bitfield) -> Bitfield {
        debug_assert_eq!(self.len, other.len);
        let bytes = self
            .bytes
            .iter()
            .zip(&other.bytes)
            .map(|(a, b)| a & !b)
            .collect();
        Bitfield {
            bytes,
            len: self.len,
        }
    }

    pub fn iter(&self) -> BitfieldIter<'_> {
        BitfieldIter {
            bitfield: self,
            index: 0,
        }
    }
}

pub struct BitfieldIter<'a> {
    bitfield: &'a Bitfield,
    index: usize,
}

impl<'a> Iterator for BitfieldIter<'a> {
    type Item = bool;

    fn next(&mut self) -> Option<bool> {
        if self.index >= self.bitfield.len {
            return None;
        }
        let bit = self.bitfield.has(self.index);
        self.index += 1;
        Some(bit)
    }
}
