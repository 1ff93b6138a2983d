//! On-disk layout of the index tables.
//!
//! | table        | row                 | family | qualifier          | value            |
//! |--------------|---------------------|--------|--------------------|------------------|
//! | shard index  | term value          | field  | `shard\0datatype`  | [`UidList`]      |
//! | day index    | `yyyyMMdd\0value`   | field  | datatype           | bitmap of shards |
//! | year index   | `yyyy\0value`       | field  | datatype           | bitmap of days   |
//! | metadata     | `num_shards`        | `ns`   | `yyyyMMdd_N`       | empty            |

use crate::codec::{CodecError, CodecResult, Serializable, decode_varint, encode_varint, varint_size};

use super::{Key, Range, prefix_end};

pub const NUM_SHARDS_ROW: &str = "num_shards";
pub const NUM_SHARDS_FAMILY: &str = "ns";

/// Key of one shard index entry.
pub fn shard_index_key(value: &str, field: &str, shard: &str, datatype: &str) -> Key {
    Key::new(value, field, format!("{shard}\0{datatype}"))
}

/// Shard id portion of a shard index qualifier.
pub fn shard_of(key: &Key) -> &str {
    key.qualifier
        .split_once('\0')
        .map(|(shard, _)| shard)
        .unwrap_or(&key.qualifier)
}

/// Range over every shard of `[begin_day, end_day]` for one term.
pub fn term_range(value: &str, field: &str, begin_day: &str, end_day: &str) -> Range {
    let start = Key::new(value, field, format!("{begin_day}_"));
    match prefix_end(&format!("{end_day}_")) {
        Some(qualifier) => Range::half_open(start, Key::new(value, field, qualifier)),
        None => Range::half_open(start, Key::new(value, format!("{field}\0"), "")),
    }
}

/// Row of a day or year bitmap index entry.
pub fn bitmap_index_row(period: &str, value: &str) -> String {
    format!("{period}\0{value}")
}

/// Splits a bitmap index row into `(period, value)`.
pub fn parse_bitmap_index_row(row: &str) -> Option<(&str, &str)> {
    row.split_once('\0')
}

pub fn num_shards_key(day: &str, shards: usize) -> Key {
    Key::new(NUM_SHARDS_ROW, NUM_SHARDS_FAMILY, format!("{day}_{shards}"))
}

/// `(day, count)` from a num-shards qualifier.
pub fn parse_num_shards(qualifier: &str) -> Option<(&str, usize)> {
    let (day, count) = qualifier.rsplit_once('_')?;
    Some((day, count.parse().ok()?))
}

/// Value of a shard index entry: how many records hold the term in that
/// shard and, unless there were too many to keep, their identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UidList {
    pub count: u64,
    pub ignore: bool,
    pub uids: Vec<String>,
}

impl UidList {
    pub fn exact<I, S>(uids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let uids: Vec<String> = uids.into_iter().map(Into::into).collect();
        Self {
            count: uids.len() as u64,
            ignore: false,
            uids,
        }
    }

    /// A count too large to keep identifiers for.
    pub fn counted(count: u64) -> Self {
        Self {
            count,
            ignore: true,
            uids: Vec::new(),
        }
    }
}

impl Serializable for UidList {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.count.serialize(buf);
        self.ignore.serialize(buf);
        encode_varint(self.uids.len() as u64, buf);
        for uid in &self.uids {
            uid.serialize(buf);
        }
    }

    fn deserialize(buf: &[u8]) -> CodecResult<(Self, usize)> {
        let (count, mut offset) = u64::deserialize(buf)?;
        let (ignore, used) = bool::deserialize(&buf[offset..])?;
        offset += used;
        let (len, used) = decode_varint(&buf[offset..])?;
        offset += used;
        if len > (buf.len() - offset) as u64 {
            return Err(CodecError::Truncated {
                what: "uid list",
                expected: len as usize,
                found: buf.len() - offset,
            });
        }
        let mut uids = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let (uid, used) = String::deserialize(&buf[offset..])?;
            offset += used;
            uids.push(uid);
        }
        Ok((
            Self {
                count,
                ignore,
                uids,
            },
            offset,
        ))
    }

    fn serialized_size(&self) -> usize {
        self.count.serialized_size()
            + 1
            + varint_size(self.uids.len() as u64)
            + self.uids.iter().map(Serializable::serialized_size).sum::<usize>()
    }
}
