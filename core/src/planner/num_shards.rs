use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::store::layout::{NUM_SHARDS_FAMILY, NUM_SHARDS_ROW, parse_num_shards};
use crate::store::{Authorizations, Range, Store, StoreResult};

/// Shards per day, read once from the metadata table. A day without its
/// own entry inherits the count of the latest day before it.
#[derive(Debug, Default)]
pub struct NumShardCache {
    counts: RwLock<BTreeMap<String, usize>>,
    loaded: Mutex<bool>,
}

impl NumShardCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache with fixed counts that never reads the store.
    pub fn from_counts<I, S>(counts: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        Self {
            counts: RwLock::new(counts.into_iter().map(|(d, n)| (d.into(), n)).collect()),
            loaded: Mutex::new(true),
        }
    }

    /// Populate from the metadata table on first call. A failed scan is
    /// logged and leaves the cache empty; it is not retried.
    pub fn ensure_loaded(&self, store: &dyn Store, table: &str, auths: &Authorizations) {
        let mut loaded = self.loaded.lock();
        if *loaded {
            return;
        }
        *loaded = true;

        match Self::scan(store, table, auths) {
            Ok(counts) => {
                debug!(days = counts.len(), table, "loaded shard counts");
                *self.counts.write() = counts;
            }
            Err(e) => warn!(table, error = %e, "could not load shard counts"),
        }
    }

    fn scan(store: &dyn Store, table: &str, auths: &Authorizations) -> StoreResult<BTreeMap<String, usize>> {
        let mut scanner = store.open_scanner(table, auths)?;
        scanner.set_range(Range::exact_row(NUM_SHARDS_ROW));
        scanner.fetch_column(NUM_SHARDS_FAMILY);
        let mut counts = BTreeMap::new();
        while let Some((key, _)) = scanner.next_entry()? {
            match parse_num_shards(&key.qualifier) {
                Some((day, count)) => {
                    counts.insert(day.to_string(), count);
                }
                None => debug!(qualifier = %key.qualifier, "skipping malformed shard count"),
            }
        }
        Ok(counts)
    }

    /// Shard count for `day`, 0 when nothing is known at or before it.
    pub fn num_shards(&self, day: &str) -> usize {
        self.counts
            .read()
            .range(..=day.to_string())
            .next_back()
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// Shard ids of `day` in lexicographic order; empty when the count is 0.
    pub fn shards_for_day(&self, day: &str) -> Vec<String> {
        let mut shards: Vec<String> = (0..self.num_shards(day)).map(|n| format!("{day}_{n}")).collect();
        shards.sort();
        shards
    }

    pub fn is_empty(&self) -> bool {
        self.counts.read().is_empty()
    }
}
