//! Turning a query into per-shard plans.
//!
//! [`QueryPlanner`] picks the strategy for each query: bitmap pruning for
//! long date ranges over indexed equalities, shard index lookups otherwise.

mod num_shards;
mod plan;
mod range_stream;

pub use num_shards::NumShardCache;
pub use plan::{QueryPlan, shard_ranges};
pub use range_stream::{RangePlans, RangeStream};

use std::sync::Arc;

use tracing::debug;

use crate::config::PlanningConfig;
use crate::error::PlanResult;
use crate::pruning::{DayIndexStream, StatsSnapshot};
use crate::query::{Node, all_indexed_equalities};
use crate::stream::StreamContext;

use range_stream::prepare;

/// Plans queries for one planning configuration. The shards-per-day cache
/// is loaded when the planner is created.
pub struct QueryPlanner {
    config: Arc<PlanningConfig>,
    shards: Arc<NumShardCache>,
}

impl QueryPlanner {
    pub fn new(config: PlanningConfig) -> Self {
        let shards = NumShardCache::new();
        shards.ensure_loaded(
            config.store().as_ref(),
            &config.settings().tables.metadata,
            config.auths(),
        );
        Self::with_shard_cache(config, Arc::new(shards))
    }

    /// Planner sharing an already populated cache.
    pub fn with_shard_cache(config: PlanningConfig, shards: Arc<NumShardCache>) -> Self {
        Self {
            config: Arc::new(config),
            shards,
        }
    }

    pub fn config(&self) -> &PlanningConfig {
        &self.config
    }

    pub fn shard_cache(&self) -> &Arc<NumShardCache> {
        &self.shards
    }

    /// Whether `node` would be planned with the bitmap indexes.
    pub fn uses_pruning(&self, node: &Node) -> bool {
        let settings = self.config.settings();
        settings.tables.day_index.is_some()
            && self.config.days_in_range() > settings.pruning.day_index_threshold
            && all_indexed_equalities(node, self.config.indexed_fields())
    }

    /// Plans for `node`. Fatal planning errors are returned here, before any
    /// plan is produced.
    pub fn plan(&self, node: &Node) -> PlanResult<PlanStream> {
        let tree = prepare(node, self.config.settings().lookup.max_depth_threshold)?;
        if self.uses_pruning(&tree) {
            debug!(node = %tree, days = self.config.days_in_range(), "planning with the day index");
            let stream = DayIndexStream::start(tree, Arc::clone(&self.config), Arc::clone(&self.shards))?;
            return Ok(PlanStream::Pruned(stream));
        }
        let range = RangeStream::new(Arc::clone(&self.config), Arc::clone(&self.shards));
        Ok(PlanStream::Range(range.stream_plans(&tree)?))
    }
}

/// Closeable iterator over the plans of one query.
pub enum PlanStream {
    Range(RangePlans),
    Pruned(DayIndexStream),
}

impl PlanStream {
    pub fn is_pruned(&self) -> bool {
        matches!(self, PlanStream::Pruned(_))
    }

    /// Context of the top-level index stream. Pruned streams are always
    /// `Present`.
    pub fn context(&self) -> StreamContext {
        match self {
            PlanStream::Range(plans) => plans.context(),
            PlanStream::Pruned(_) => StreamContext::Present,
        }
    }

    pub fn pruning_stats(&self) -> Option<StatsSnapshot> {
        match self {
            PlanStream::Pruned(stream) => Some(stream.stats()),
            PlanStream::Range(_) => None,
        }
    }

    pub fn close(&mut self) {
        match self {
            PlanStream::Range(plans) => plans.close(),
            PlanStream::Pruned(stream) => stream.close(),
        }
    }
}

impl Iterator for PlanStream {
    type Item = PlanResult<QueryPlan>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            PlanStream::Range(plans) => plans.next(),
            PlanStream::Pruned(stream) => stream.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerSettings;
    use crate::error::PlanError;
    use crate::store::MemoryStore;

    fn planner(begin: &str, end: &str) -> QueryPlanner {
        let config = PlanningConfig::builder(Arc::new(MemoryStore::new()))
            .settings(PlannerSettings::default())
            .date_range(begin, end)
            .indexed_fields(["A", "B"])
            .build()
            .unwrap();
        QueryPlanner::with_shard_cache(config, Arc::new(NumShardCache::new()))
    }

    #[test]
    fn test_routing() {
        let long = planner("20240101", "20240301");
        let short = planner("20240101", "20240105");
        let equalities = Node::and(vec![Node::equals("A", "1"), Node::equals("B", "2")]);
        let mixed = Node::and(vec![Node::equals("A", "1"), Node::range("B", "1", "5")]);

        assert!(long.uses_pruning(&equalities));
        assert!(!short.uses_pruning(&equalities));
        assert!(!long.uses_pruning(&mixed));
        assert!(!long.uses_pruning(&Node::equals("C", "1")));
    }

    #[test]
    fn test_depth_checked_before_routing() {
        let mut settings = PlannerSettings::default();
        settings.lookup.max_depth_threshold = 3;
        let config = PlanningConfig::builder(Arc::new(MemoryStore::new()))
            .settings(settings)
            .date_range("20240101", "20240301")
            .indexed_fields(["A"])
            .build()
            .unwrap();
        let planner = QueryPlanner::with_shard_cache(config, Arc::new(NumShardCache::new()));
        let mut node = Node::equals("A", "1");
        for _ in 0..5 {
            node = Node::not(node);
        }
        match planner.plan(&node) {
            Err(PlanError::DepthExceeded { max, .. }) => assert_eq!(max, 3),
            Err(e) => panic!("Expected DepthExceeded, got {e}"),
            Ok(_) => panic!("Expected DepthExceeded"),
        }
    }
}
