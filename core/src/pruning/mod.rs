//! Shard pruning with the day and year bitmap indexes.
//!
//! For long date ranges the shard index is skipped entirely. Each day's
//! bitmap entry tells which shard offsets hold which terms, and the query is
//! rewritten per offset so only shards that can match get a plan.

mod pipeline;
mod rewrite;
mod scan;
mod stats;

pub use rewrite::{plans_for_entry, prune_for_offset};
pub use scan::{Terms, days_in_year_entry, scan_day, scan_year, wanted_terms};
pub use stats::{PruningStats, StatsSnapshot, ratio};

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, warn};

use crate::bitmap::BitSetIndexEntry;
use crate::codec::Serializable;
use crate::config::PlanningConfig;
use crate::error::{PlanError, PlanResult};
use crate::planner::{NumShardCache, QueryPlan};
use crate::query::{Node, indexed_terms};
use crate::stream::{Granularity, ShardEnumerator};

use pipeline::{Pipeline, ScanOutcome};

enum Source {
    Pipeline(Pipeline),
    /// No indexed equality to prune with; one unpruned plan per day.
    Days(ShardEnumerator),
}

/// Plans for a query over a long date range, pruned with the bitmap
/// indexes. Plans come out in day order, then offset order.
pub struct DayIndexStream {
    node: Node,
    config: Arc<PlanningConfig>,
    wanted: HashSet<String>,
    source: Source,
    reorder: BTreeMap<u64, ScanOutcome>,
    next_seq: u64,
    pending: VecDeque<QueryPlan>,
    stats: Arc<PruningStats>,
    done: bool,
}

impl DayIndexStream {
    /// Starts the pruning workers for `node`. The day index table must be
    /// configured.
    pub fn start(node: Node, config: Arc<PlanningConfig>, shards: Arc<NumShardCache>) -> PlanResult<Self> {
        let terms = indexed_terms(&node, config.indexed_fields());
        let stats = Arc::new(PruningStats::default());

        let source = match &config.settings().tables.day_index {
            Some(table) if !terms.is_empty() => {
                let pipeline = Pipeline::start(Arc::clone(&config), table.clone(), terms.clone(), Arc::clone(&stats))?;
                Source::Pipeline(pipeline)
            }
            Some(_) => {
                debug!(node = %node, "no indexed equalities, enumerating days");
                Source::Days(ShardEnumerator::new(
                    node.clone(),
                    config.days().collect(),
                    Granularity::Day,
                    shards,
                ))
            }
            None => {
                return Err(PlanError::Config(
                    "day index pruning requires a day index table".to_string(),
                ));
            }
        };

        Ok(Self {
            wanted: wanted_terms(&terms),
            node,
            config,
            source,
            reorder: BTreeMap::new(),
            next_seq: 0,
            pending: VecDeque::new(),
            stats,
            done: false,
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops iteration and interrupts every worker. Logs the pruning
    /// statistics once.
    pub fn close(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.pending.clear();
        self.reorder.clear();
        if let Source::Pipeline(pipeline) = &mut self.source {
            pipeline.close();
            self.stats.log();
        }
    }

    fn fail(&mut self, error: PlanError) -> Option<PlanResult<QueryPlan>> {
        self.close();
        Some(Err(error))
    }

    /// Next scan outcome in day order. Sequence gaps left by discarded scans
    /// are skipped once the workers are done.
    fn next_outcome(pipeline: &Pipeline, reorder: &mut BTreeMap<u64, ScanOutcome>, next_seq: &mut u64) -> Option<ScanOutcome> {
        loop {
            if let Some(outcome) = reorder.remove(next_seq) {
                *next_seq += 1;
                return Some(outcome);
            }
            match pipeline.recv() {
                Ok(outcome) => {
                    reorder.insert(outcome.seq, outcome);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    let (_, outcome) = reorder.pop_first()?;
                    *next_seq = outcome.seq + 1;
                    return Some(outcome);
                }
            }
        }
    }

    fn plans_for(&self, outcome: ScanOutcome) -> PlanResult<Vec<QueryPlan>> {
        match outcome.result {
            Ok(Some(bytes)) => {
                let entry = BitSetIndexEntry::from_bytes(&bytes)?;
                Ok(plans_for_entry(&self.node, &entry, &self.wanted, &self.config))
            }
            Ok(None) => Ok(Vec::new()),
            Err(PlanError::Store(e)) => {
                warn!(day = %outcome.day, error = %e, "day index scan failed, planning the whole day");
                Ok(QueryPlan::for_shard(outcome.day, self.node.clone(), &self.config)
                    .into_iter()
                    .collect())
            }
            Err(e) => Err(e),
        }
    }
}

impl Iterator for DayIndexStream {
    type Item = PlanResult<QueryPlan>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(plan) = self.pending.pop_front() {
                self.stats.shard_emitted();
                return Some(Ok(plan));
            }
            if self.done {
                return None;
            }
            let outcome = match &mut self.source {
                Source::Days(days) => {
                    let Some(candidate) = days.next() else {
                        self.close();
                        return None;
                    };
                    if let Some(plan) = QueryPlan::from_candidate(candidate, &self.config) {
                        self.pending.push_back(plan);
                    }
                    continue;
                }
                Source::Pipeline(pipeline) => {
                    Self::next_outcome(pipeline, &mut self.reorder, &mut self.next_seq)
                }
            };
            let Some(outcome) = outcome else {
                self.close();
                return None;
            };
            match self.plans_for(outcome) {
                Ok(plans) => self.pending.extend(plans),
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl Drop for DayIndexStream {
    fn drop(&mut self) {
        self.close();
    }
}
