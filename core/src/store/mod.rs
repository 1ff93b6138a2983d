//! Sorted key-value store abstraction the planner scans.
//!
//! Keys are `(row, family, qualifier)` triples compared bytewise in that
//! order. Ranges are half-open by default. The store may apply named
//! server-side filters before entries reach the client.

pub mod layout;
mod memory;

pub use memory::MemoryStore;

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server-side filter keeping only entries whose qualifier ends in one of the
/// listed datatypes. Option `types` holds a comma-separated list.
pub const DATATYPE_FILTER: &str = "datatype";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown server-side filter: {0}")]
    UnknownFilter(String),

    #[error("Filter '{filter}' is missing option '{option}'")]
    MissingFilterOption { filter: String, option: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub row: String,
    pub family: String,
    pub qualifier: String,
}

impl Key {
    pub fn new(row: impl Into<String>, family: impl Into<String>, qualifier: impl Into<String>) -> Self {
        Self {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
        }
    }

    /// The smallest key in `row`.
    pub fn row(row: impl Into<String>) -> Self {
        Self::new(row, "", "")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{}",
            self.row.escape_debug(),
            self.family.escape_debug(),
            self.qualifier.escape_debug()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    start: Key,
    start_inclusive: bool,
    /// `None` runs to the end of the table.
    end: Option<Key>,
    end_inclusive: bool,
}

impl Range {
    pub fn new(start: Key, start_inclusive: bool, end: Key, end_inclusive: bool) -> Self {
        Self {
            start,
            start_inclusive,
            end: Some(end),
            end_inclusive,
        }
    }

    /// Every key from `start` on.
    pub fn from_start(start: Key) -> Self {
        Self {
            start,
            start_inclusive: true,
            end: None,
            end_inclusive: false,
        }
    }

    /// `[start, end)`
    pub fn half_open(start: Key, end: Key) -> Self {
        Self::new(start, true, end, false)
    }

    /// Every key in a single row.
    pub fn exact_row(row: &str) -> Self {
        Self::half_open(Key::row(row), Key::row(format!("{row}\0")))
    }

    /// Every key in rows starting with `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        Self::prefix_from(Key::row(prefix), prefix)
    }

    /// Keys from `start` up to the last row starting with `prefix`.
    pub fn prefix_from(start: Key, prefix: &str) -> Self {
        match prefix_end(prefix) {
            Some(end) => Self::half_open(start, Key::row(end)),
            None => Self::from_start(start),
        }
    }

    pub fn start(&self) -> &Key {
        &self.start
    }

    pub fn end(&self) -> Option<&Key> {
        self.end.as_ref()
    }

    pub fn start_inclusive(&self) -> bool {
        self.start_inclusive
    }

    pub fn before_start(&self, key: &Key) -> bool {
        if self.start_inclusive {
            key < &self.start
        } else {
            key <= &self.start
        }
    }

    pub fn after_end(&self, key: &Key) -> bool {
        match &self.end {
            Some(end) if self.end_inclusive => key > end,
            Some(end) => key >= end,
            None => false,
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        !self.before_start(key) && !self.after_end(key)
    }

    pub fn is_empty(&self) -> bool {
        let Some(end) = &self.end else {
            return false;
        };
        match self.start.cmp(end) {
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => !(self.start_inclusive && self.end_inclusive),
            std::cmp::Ordering::Greater => true,
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.start_inclusive { '[' } else { '(' };
        match &self.end {
            Some(end) => {
                let close = if self.end_inclusive { ']' } else { ')' };
                write!(f, "{open}{}, {end}{close}", self.start)
            }
            None => write!(f, "{open}{}, +inf)", self.start),
        }
    }
}

/// Exclusive upper bound for strings starting with `prefix`: the prefix
/// with its last incrementable char bumped. `None` when every char is
/// `char::MAX`, or the prefix is empty.
pub fn prefix_end(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last {
            '\u{d7ff}' => Some('\u{e000}'),
            c => char::from_u32(c as u32 + 1),
        };
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// Visibility labels the scan runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Authorizations(Vec<String>);

impl Authorizations {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        labels.sort();
        labels.dedup();
        Self(labels)
    }

    pub fn labels(&self) -> &[String] {
        &self.0
    }
}

/// Handle to the sorted store. Shared by every worker of a planning run.
pub trait Store: Send + Sync {
    fn open_scanner(&self, table: &str, auths: &Authorizations) -> StoreResult<Box<dyn Scanner>>;

    /// Batch variant: every entry of every range, in key order, optionally
    /// restricted to a set of column families.
    fn scan_ranges(
        &self,
        table: &str,
        auths: &Authorizations,
        ranges: &[Range],
        families: &[String],
    ) -> StoreResult<Vec<(Key, Bytes)>> {
        let mut entries = Vec::new();
        for range in ranges {
            let mut scanner = self.open_scanner(table, auths)?;
            scanner.set_range(range.clone());
            for family in families {
                scanner.fetch_column(family);
            }
            while let Some(entry) = scanner.next_entry()? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

/// A single forward pass over one range of a table.
pub trait Scanner: Send {
    fn set_range(&mut self, range: Range);

    /// Restrict results to a column family. May be called repeatedly.
    fn fetch_column(&mut self, family: &str);

    fn add_server_side_filter(&mut self, name: &str, options: BTreeMap<String, String>) -> StoreResult<()>;

    /// Reposition at the first entry at or after `key`, staying inside the range.
    fn seek(&mut self, key: &Key) -> StoreResult<()>;

    fn next_entry(&mut self) -> StoreResult<Option<(Key, Bytes)>>;
}
