use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;

use crate::config::PlanningConfig;
use crate::query::{CostKey, Node, order_by_cost};
use crate::shard::is_day;
use crate::store::Range;
use crate::stream::{Counts, ShardCandidate};

/// One shard's worth of work for record evaluation: where to scan and what
/// to evaluate there.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub shard: String,
    pub ranges: Vec<Range>,
    pub query_tree: Node,
    pub query_string: Option<String>,
    pub term_counts: BTreeMap<String, u64>,
    pub field_counts: BTreeMap<String, u64>,
}

impl QueryPlan {
    /// Plan for a candidate, or `None` when its shard id yields no range.
    pub fn from_candidate(candidate: ShardCandidate, config: &PlanningConfig) -> Option<Self> {
        let node = candidate.info.node().clone();
        Self::build(candidate.shard, node, candidate.info.counts(), config)
    }

    /// Plan for an explicit shard and node, without index counts.
    pub fn for_shard(shard: impl Into<String>, node: Node, config: &PlanningConfig) -> Option<Self> {
        Self::build(shard.into(), node, &Counts::default(), config)
    }

    fn build(shard: String, node: Node, counts: &Counts, config: &PlanningConfig) -> Option<Self> {
        let ranges = shard_ranges(&shard, config.shard_id_pattern());
        if ranges.is_empty() {
            return None;
        }

        let settings = &config.settings().plans;
        let term_counts = if settings.collect_term_counts {
            counts.terms.clone()
        } else {
            BTreeMap::new()
        };
        let field_counts = if settings.collect_field_counts {
            counts.fields.clone()
        } else {
            BTreeMap::new()
        };

        let query_tree = if !settings.sort_by_counts {
            node
        } else if !term_counts.is_empty() {
            order_by_cost(&node, &term_counts, CostKey::Term)
        } else if !field_counts.is_empty() {
            order_by_cost(&node, &field_counts, CostKey::Field)
        } else {
            node
        };

        Some(Self {
            shard,
            ranges,
            query_string: Some(query_tree.to_string()),
            query_tree,
            term_counts,
            field_counts,
        })
    }

    pub fn is_day(&self) -> bool {
        is_day(&self.shard)
    }
}

/// Store ranges covering a shard id: the shard's own row, or every shard
/// row of a day. Ids that are not valid shard ids get none.
pub fn shard_ranges(shard: &str, pattern: &Regex) -> Vec<Range> {
    if !pattern.is_match(shard) {
        return Vec::new();
    }
    if is_day(shard) {
        vec![Range::prefix(&format!("{shard}_"))]
    } else {
        vec![Range::exact_row(shard)]
    }
}
