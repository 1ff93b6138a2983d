//! Shared fixture: ingests terms into an in-memory store, keeping the shard
//! index, both bitmap indexes and the shard counts consistent.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Datelike;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use shardplan_core::codec::Serializable;
use shardplan_core::config::{PlannerSettings, PlanningConfig};
use shardplan_core::shard::{day_of, parse_day};
use shardplan_core::store::layout::{UidList, bitmap_index_row, num_shards_key, shard_index_key};
use shardplan_core::store::Key;
use shardplan_core::{MemoryStore, Node, NumShardCache, QueryPlan, QueryPlanner, ShardBitmap};

pub const DATATYPE: &str = "csv";

/// Field/value pairs of one document.
type Doc = BTreeSet<(String, String)>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub settings: PlannerSettings,
    shard_counts: Mutex<BTreeMap<String, usize>>,
    docs: Mutex<BTreeMap<(String, String), Doc>>,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        let settings = PlannerSettings::default();
        let store = Arc::new(MemoryStore::new());
        store.create_table(&settings.tables.shard_index);
        store.create_table(&settings.tables.metadata);
        if let Some(day_index) = &settings.tables.day_index {
            store.create_table(day_index);
        }
        if let Some(year_index) = &settings.tables.year_index {
            store.create_table(year_index);
        }
        Self {
            store,
            settings,
            shard_counts: Mutex::new(BTreeMap::new()),
            docs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Records that `uids` in `shard` hold `field == value`.
    pub fn ingest(&self, shard: &str, field: &str, value: &str, uids: &[&str]) {
        let tables = &self.settings.tables;
        let day = day_of(shard);
        let offset: usize = shard
            .rsplit_once('_')
            .and_then(|(_, n)| n.parse().ok())
            .expect("shard ids in fixtures carry an offset");

        let key = shard_index_key(value, field, shard, DATATYPE);
        let mut list = self
            .store
            .get(&tables.shard_index, &key)
            .map(|bytes| UidList::from_bytes(&bytes).unwrap())
            .unwrap_or_default();
        for uid in uids {
            if !list.uids.iter().any(|u| u == uid) {
                list.uids.push(uid.to_string());
            }
        }
        list.count = list.uids.len() as u64;
        self.store.put(&tables.shard_index, key, list.to_bytes());

        if let Some(day_index) = &tables.day_index {
            self.set_bit(day_index, Key::new(bitmap_index_row(day, value), field, DATATYPE), offset);
        }
        if let Some(year_index) = &tables.year_index {
            let date = parse_day(day).unwrap();
            let year = date.year().to_string();
            self.set_bit(
                year_index,
                Key::new(bitmap_index_row(&year, value), field, DATATYPE),
                date.ordinal() as usize,
            );
        }

        let mut docs = self.docs.lock();
        for uid in uids {
            docs.entry((shard.to_string(), uid.to_string()))
                .or_default()
                .insert((field.to_string(), value.to_string()));
        }

        let mut counts = self.shard_counts.lock();
        let count = counts.entry(day.to_string()).or_insert(0);
        *count = (*count).max(offset + 1);
    }

    fn set_bit(&self, table: &str, key: Key, bit: usize) {
        let mut bits = self
            .store
            .get(table, &key)
            .map(|bytes| ShardBitmap::from_bytes(&bytes))
            .unwrap_or_default();
        bits.set(bit);
        self.store.put(table, key, bits.to_bytes());
    }

    /// Writes the shard counts seen so far to the metadata table.
    pub fn publish_shard_counts(&self) {
        for (day, count) in self.shard_counts.lock().iter() {
            self.store
                .put(&self.settings.tables.metadata, num_shards_key(day, *count), Vec::<u8>::new());
        }
    }

    pub fn config(&self, settings: PlannerSettings, begin: &str, end: &str, indexed: &[&str]) -> PlanningConfig {
        PlanningConfig::builder(self.store.clone())
            .settings(settings)
            .authorizations(["PUBLIC"])
            .date_range(begin, end)
            .indexed_fields(indexed.iter().copied())
            .build()
            .unwrap()
    }

    /// Planner over the fixture with the shard counts published.
    pub fn planner(&self, settings: PlannerSettings, begin: &str, end: &str, indexed: &[&str]) -> QueryPlanner {
        self.publish_shard_counts();
        QueryPlanner::new(self.config(settings, begin, end, indexed))
    }

    /// `(shard, uid)` of every ingested document that satisfies `query`
    /// and lives in a shard (or day) one of `plans` covers.
    pub fn matching_docs(&self, plans: &[QueryPlan], query: &Node) -> BTreeSet<(String, String)> {
        let docs = self.docs.lock();
        docs.iter()
            .filter(|((shard, _), _)| {
                plans
                    .iter()
                    .any(|plan| plan.shard == *shard || plan.shard == day_of(shard))
            })
            .filter(|(_, doc)| evaluate(query, doc))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn shard_cache(&self) -> Arc<NumShardCache> {
        Arc::new(NumShardCache::from_counts(
            self.shard_counts.lock().iter().map(|(d, n)| (d.clone(), *n)),
        ))
    }
}

fn evaluate(node: &Node, doc: &Doc) -> bool {
    match node {
        Node::Equality {
            field,
            literal: Some(value),
        } => doc.contains(&(field.clone(), value.clone())),
        Node::And { children, .. } => children.iter().all(|child| evaluate(child, doc)),
        Node::Or { children } => children.iter().any(|child| evaluate(child, doc)),
        other => panic!("Expected an equality tree, got {other}"),
    }
}

/// Settings that never take the pruning path.
pub fn range_only() -> PlannerSettings {
    let mut settings = PlannerSettings::default();
    settings.pruning.day_index_threshold = usize::MAX;
    settings
}

/// Settings that prune every range, without the year index.
pub fn always_prune() -> PlannerSettings {
    let mut settings = PlannerSettings::default();
    settings.pruning.day_index_threshold = 0;
    settings.pruning.year_index_threshold = -1;
    settings
}

pub fn collect(stream: impl Iterator<Item = shardplan_core::PlanResult<QueryPlan>>) -> Vec<QueryPlan> {
    stream.map(|plan| plan.unwrap()).collect()
}

pub fn shards(plans: &[QueryPlan]) -> Vec<String> {
    plans.iter().map(|plan| plan.shard.clone()).collect()
}
