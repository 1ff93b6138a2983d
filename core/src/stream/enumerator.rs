use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use super::{IndexInfo, ShardCandidate};
use crate::planner::NumShardCache;
use crate::query::Node;
use crate::shard::is_day;

/// What a full-range enumerator yields for each day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Every `day_N` shard, or the day itself when its shard count is unknown.
    Shard,
    Day,
}

/// Every shard (or day) of a date range, each with unknown matches and the
/// enumerated node attached.
pub struct ShardEnumerator {
    node: Node,
    days: std::vec::IntoIter<String>,
    pending: VecDeque<String>,
    granularity: Granularity,
    shards: Arc<NumShardCache>,
}

impl ShardEnumerator {
    pub fn new(node: Node, days: Vec<String>, granularity: Granularity, shards: Arc<NumShardCache>) -> Self {
        Self {
            node,
            days: days.into_iter(),
            pending: VecDeque::new(),
            granularity,
            shards,
        }
    }
}

impl Iterator for ShardEnumerator {
    type Item = ShardCandidate;

    fn next(&mut self) -> Option<ShardCandidate> {
        loop {
            if let Some(id) = self.pending.pop_front() {
                return Some(ShardCandidate::new(id, IndexInfo::unknown(self.node.clone())));
            }
            let day = self.days.next()?;
            match self.granularity {
                Granularity::Day => self.pending.push_back(day),
                Granularity::Shard => {
                    let shards = self.shards.shards_for_day(&day);
                    if shards.is_empty() {
                        self.pending.push_back(day);
                    } else {
                        self.pending.extend(shards);
                    }
                }
            }
        }
    }
}

/// Candidates pinned by a `SHARDS_AND_DAYS` hint: a comma separated list of
/// shard ids and days. Days expand to their shards when the count is known.
pub struct HintEnumerator {
    node: Node,
    ids: std::collections::btree_set::IntoIter<String>,
}

impl HintEnumerator {
    pub fn new(node: Node, hint: &str, shards: &NumShardCache) -> Self {
        let mut ids = BTreeSet::new();
        for id in hint.split(',').map(str::trim).filter(|id| !id.is_empty()) {
            if is_day(id) {
                let expanded = shards.shards_for_day(id);
                if expanded.is_empty() {
                    ids.insert(id.to_string());
                } else {
                    ids.extend(expanded);
                }
            } else {
                ids.insert(id.to_string());
            }
        }
        Self {
            node,
            ids: ids.into_iter(),
        }
    }
}

impl Iterator for HintEnumerator {
    type Item = ShardCandidate;

    fn next(&mut self) -> Option<ShardCandidate> {
        let id = self.ids.next()?;
        Some(ShardCandidate::new(id, IndexInfo::unknown(self.node.clone())))
    }
}
