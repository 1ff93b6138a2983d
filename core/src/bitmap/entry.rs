use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::ShardBitmap;
use crate::codec::{
    CodecError, CodecResult, Serializable, decode_varint, encode_varint, read_length_prefixed,
    varint_size,
};

/// Result of one day (or year) scan: term string -> bitmap of offsets.
///
/// Wire format: `[key string][varint term count]{[term string][varint len][bitmap bytes]}*`.
/// Each term appears at most once; decoding rejects repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSetIndexEntry {
    key: String,
    terms: BTreeMap<String, ShardBitmap>,
}

impl BitSetIndexEntry {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            terms: BTreeMap::new(),
        }
    }

    /// The `yyyyMMdd` day or `yyyy` year this entry describes.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn terms(&self) -> &BTreeMap<String, ShardBitmap> {
        &self.terms
    }

    pub fn get(&self, term: &str) -> Option<&ShardBitmap> {
        self.terms.get(term)
    }

    /// Adds a bitmap for `term`, OR-ing it into any bitmap already present.
    pub fn insert(&mut self, term: impl Into<String>, bitmap: ShardBitmap) {
        self.terms
            .entry(term.into())
            .and_modify(|existing| existing.union_with(&bitmap))
            .or_insert(bitmap);
    }

    /// Folds another entry for the same key into this one.
    pub fn merge(&mut self, other: BitSetIndexEntry) {
        for (term, bitmap) in other.terms {
            self.insert(term, bitmap);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.values().all(ShardBitmap::is_empty)
    }

    /// Lowest and highest set offset over every term, `(0, 0)` when empty.
    pub fn offset_bounds(&self) -> (usize, usize) {
        let min = self.terms.values().filter_map(ShardBitmap::min).min();
        let max = self.terms.values().filter_map(ShardBitmap::max).max();
        (min.unwrap_or(0), max.unwrap_or(0))
    }
}

// Entries are grouped by key, not totally ordered: equal keys with different
// term maps do not compare.
impl PartialOrd for BitSetIndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.key.cmp(&other.key) {
            Ordering::Equal if self.terms != other.terms => None,
            ordering => Some(ordering),
        }
    }
}

impl Serializable for BitSetIndexEntry {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.key.serialize(buf);
        encode_varint(self.terms.len() as u64, buf);
        for (term, bitmap) in &self.terms {
            term.serialize(buf);
            bitmap.to_bytes().serialize(buf);
        }
    }

    fn deserialize(buf: &[u8]) -> CodecResult<(Self, usize)> {
        let (key, mut offset) = String::deserialize(buf)?;
        let (count, header) = decode_varint(&buf[offset..])?;
        offset += header;

        // Every term costs at least two length bytes.
        let remaining = (buf.len() - offset) as u64;
        if count > remaining / 2 {
            return Err(CodecError::Truncated {
                what: "term map",
                expected: (count * 2) as usize,
                found: remaining as usize,
            });
        }

        let mut entry = BitSetIndexEntry::new(key);
        for _ in 0..count {
            let (term, used) = String::deserialize(&buf[offset..])?;
            offset += used;
            let (bytes, used) = read_length_prefixed(&buf[offset..], "bitmap")?;
            offset += used;
            if entry.get(&term).is_some() {
                return Err(CodecError::DuplicateTerm(term));
            }
            entry.insert(term, ShardBitmap::from_bytes(bytes));
        }
        Ok((entry, offset))
    }

    fn serialized_size(&self) -> usize {
        let terms: usize = self
            .terms
            .iter()
            .map(|(term, bitmap)| term.serialized_size() + bitmap.to_bytes().serialized_size())
            .sum();
        self.key.serialized_size() + varint_size(self.terms.len() as u64) + terms
    }
}
