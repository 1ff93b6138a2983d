//! Shard-offset bitmaps and the day/year entries that carry them.

mod entry;

pub use entry::BitSetIndexEntry;

use std::fmt;

use bitvec::prelude::*;

/// Set of shard offsets (or day-of-year ordinals) as a growable bit vector.
///
/// The byte form is little-endian by bit: offset `i` lives in byte `i / 8`,
/// bit `i % 8`, and no byte is emitted past the highest set bit.
#[derive(Clone, Default)]
pub struct ShardBitmap {
    bits: BitVec<u8, Lsb0>,
}

impl ShardBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bits: BitVec::from_slice(bytes),
        }
    }

    pub fn set(&mut self, offset: usize) {
        if offset >= self.bits.len() {
            self.bits.resize(offset + 1, false);
        }
        self.bits.set(offset, true);
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.bits.get(offset).map(|bit| *bit).unwrap_or(false)
    }

    /// Set offsets in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn min(&self) -> Option<usize> {
        self.bits.first_one()
    }

    pub fn max(&self) -> Option<usize> {
        self.bits.last_one()
    }

    pub fn union_with(&mut self, other: &ShardBitmap) {
        for offset in other.iter() {
            self.set(offset);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let Some(max) = self.max() else {
            return Vec::new();
        };
        let mut bytes = vec![0u8; max / 8 + 1];
        for offset in self.iter() {
            bytes[offset / 8] |= 1 << (offset % 8);
        }
        bytes
    }
}

impl FromIterator<usize> for ShardBitmap {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut bitmap = ShardBitmap::new();
        for offset in iter {
            bitmap.set(offset);
        }
        bitmap
    }
}

impl PartialEq for ShardBitmap {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for ShardBitmap {}

impl fmt::Debug for ShardBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
