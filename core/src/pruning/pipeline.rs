//! Worker stages of the day index pruning run.
//!
//! ```text
//! producer ──days──▶ bridge ──scan jobs──▶ scan pool ──outcomes──▶ consumer
//!    │
//!    └─ year pool (optional, expands year bitmaps into days)
//! ```
//!
//! Stages talk over bounded crossbeam channels and stop when the shared
//! cancel flag is raised or their input disconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use tracing::{debug, trace, warn};

use super::scan::{Terms, days_in_year_entry, scan_day, scan_year};
use super::stats::PruningStats;
use crate::codec::Serializable;
use crate::config::PlanningConfig;
use crate::error::PlanResult;
use crate::pool::WorkerPool;
use crate::shard::days_between;

const POLL: Duration = Duration::from_millis(25);
const QUEUE_DEPTH: usize = 10;

/// Result of one day scan. The entry travels encoded.
pub(crate) struct ScanOutcome {
    pub seq: u64,
    pub day: String,
    pub result: PlanResult<Option<Vec<u8>>>,
}

/// Sends `item`, retrying until it is accepted, the receiver is gone or the
/// run is cancelled. Returns false when the item was not delivered.
fn send_until_cancelled<T>(sender: &Sender<T>, mut item: T, cancel: &AtomicBool) -> bool {
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        match sender.send_timeout(item, POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => item = back,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Running stages of one pruning run.
pub(crate) struct Pipeline {
    outcomes: Option<Receiver<ScanOutcome>>,
    cancel: Arc<AtomicBool>,
    scan_pool: WorkerPool,
    bridge: WorkerPool,
    producer: WorkerPool,
    year_pool: Option<WorkerPool>,
}

#[derive(Clone)]
struct Shared {
    config: Arc<PlanningConfig>,
    terms: Arc<Terms>,
    stats: Arc<PruningStats>,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn start(config: Arc<PlanningConfig>, day_table: String, terms: Terms, stats: Arc<PruningStats>) -> PlanResult<Self> {
        let days = config.days_in_range();
        let pruning = &config.settings().pruning;
        let year_table = config
            .settings()
            .tables
            .year_index
            .clone()
            .filter(|_| pruning.year_index_threshold >= 0 && days > pruning.year_index_threshold as usize);

        let scan_threads = days.min(pruning.num_index_threads).max(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let shared = Shared {
            config: Arc::clone(&config),
            terms: Arc::new(terms),
            stats,
            cancel: Arc::clone(&cancel),
        };

        let scan_pool = WorkerPool::new("day-scan", scan_threads, scan_threads * 2)?;
        let bridge = WorkerPool::new("day-bridge", 1, 1)?;
        let producer = WorkerPool::new("day-producer", 1, 1)?;
        let year_pool = match &year_table {
            Some(_) => {
                let threads = config.years_in_range().max(3);
                Some(WorkerPool::new("year-scan", threads, threads * 4)?)
            }
            None => None,
        };

        let (day_tx, day_rx) = bounded::<PlanResult<String>>(QUEUE_DEPTH);
        let (outcome_tx, outcome_rx) = bounded::<ScanOutcome>(QUEUE_DEPTH);

        let pipeline = Self {
            outcomes: Some(outcome_rx),
            cancel,
            scan_pool,
            bridge,
            producer,
            year_pool,
        };

        debug!(
            days,
            scan_threads,
            year_index = year_table.is_some(),
            "starting day index pruning"
        );

        let bridge_shared = shared.clone();
        let scan_pool = pipeline.scan_pool.clone();
        pipeline
            .bridge
            .submit(move || run_bridge(day_rx, outcome_tx, scan_pool, day_table, bridge_shared))?;

        match (year_table, &pipeline.year_pool) {
            (Some(table), Some(year_pool)) => {
                let year_pool = year_pool.clone();
                pipeline
                    .producer
                    .submit(move || produce_from_years(day_tx, year_pool, table, shared))?;
            }
            _ => {
                pipeline.producer.submit(move || produce_calendar(day_tx, shared))?;
            }
        }
        Ok(pipeline)
    }

    /// Next scan outcome in completion order, waiting up to one poll
    /// interval. `Err(Disconnected)` once every stage has finished.
    pub fn recv(&self) -> Result<ScanOutcome, RecvTimeoutError> {
        match &self.outcomes {
            Some(outcomes) => outcomes.recv_timeout(POLL),
            None => Err(RecvTimeoutError::Disconnected),
        }
    }

    /// Interrupts every stage without waiting for running scans. Scans that
    /// already started are discarded.
    pub fn close(&mut self) {
        if self.cancel.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = self.scan_pool.shutdown_now();
        self.bridge.shutdown_now();
        self.producer.shutdown_now();
        if let Some(year_pool) = &self.year_pool {
            year_pool.shutdown_now();
        }
        self.outcomes = None;
        trace!(dropped, "closed day index pipeline");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}

fn produce_calendar(days: Sender<PlanResult<String>>, shared: Shared) {
    for day in shared.config.days() {
        if !send_until_cancelled(&days, Ok(day), &shared.cancel) {
            return;
        }
    }
}

/// Every day of `year` inside the query range.
fn days_of_year(year: i32, begin: NaiveDate, end: NaiveDate) -> Vec<String> {
    let first = NaiveDate::from_ymd_opt(year, 1, 1).map_or(begin, |d| d.max(begin));
    let last = NaiveDate::from_ymd_opt(year, 12, 31).map_or(end, |d| d.min(end));
    days_between(first, last).collect()
}

fn produce_from_years(days: Sender<PlanResult<String>>, year_pool: WorkerPool, table: String, shared: Shared) {
    let begin = shared.config.begin();
    let end = shared.config.end();

    let mut pending = Vec::new();
    for year in begin.year()..=end.year() {
        let (tx, rx) = bounded::<Vec<String>>(1);
        let job_shared = shared.clone();
        let table = table.clone();
        let submitted = year_pool.submit(move || {
            let config = &job_shared.config;
            let found = match scan_year(config.store().as_ref(), &table, config.auths(), year, &job_shared.terms) {
                Ok(Some(entry)) => {
                    job_shared.stats.year_scanned(true);
                    days_in_year_entry(year, &entry, begin, end)
                }
                Ok(None) => {
                    job_shared.stats.year_scanned(false);
                    Vec::new()
                }
                Err(e) => {
                    warn!(year, error = %e, "year index scan failed, scanning every day of the year");
                    days_of_year(year, begin, end)
                }
            };
            let _ = tx.send(found);
        });
        if let Err(e) = submitted {
            send_until_cancelled(&days, Err(e), &shared.cancel);
            return;
        }
        pending.push((year, rx));
    }

    for (year, found) in pending {
        let year_days = loop {
            if shared.cancel.load(Ordering::SeqCst) {
                return;
            }
            match found.recv_timeout(POLL) {
                Ok(year_days) => break year_days,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        };
        trace!(year, days = year_days.len(), "expanded year bitmap");
        for day in year_days {
            if !send_until_cancelled(&days, Ok(day), &shared.cancel) {
                return;
            }
        }
    }
}

fn run_bridge(
    days: Receiver<PlanResult<String>>,
    outcomes: Sender<ScanOutcome>,
    scan_pool: WorkerPool,
    table: String,
    shared: Shared,
) {
    let mut seq = 0u64;
    loop {
        if shared.cancel.load(Ordering::SeqCst) {
            return;
        }
        let day = match days.recv_timeout(POLL) {
            Ok(Ok(day)) => day,
            Ok(Err(e)) => {
                let outcome = ScanOutcome {
                    seq,
                    day: String::new(),
                    result: Err(e),
                };
                send_until_cancelled(&outcomes, outcome, &shared.cancel);
                return;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let this_seq = seq;
        seq += 1;
        shared.stats.scan_started();
        let job_outcomes = outcomes.clone();
        let job_shared = shared.clone();
        let job_table = table.clone();
        let job_day = day.clone();
        let submitted = scan_pool.submit(move || {
            let result = scan_one_day(&job_table, &job_day, &job_shared);
            job_shared.stats.scan_finished();
            let outcome = ScanOutcome {
                seq: this_seq,
                day: job_day,
                result,
            };
            send_until_cancelled(&job_outcomes, outcome, &job_shared.cancel);
        });
        if let Err(e) = submitted {
            shared.stats.scan_finished();
            if !shared.cancel.load(Ordering::SeqCst) {
                let outcome = ScanOutcome {
                    seq: this_seq,
                    day,
                    result: Err(e),
                };
                send_until_cancelled(&outcomes, outcome, &shared.cancel);
            }
            return;
        }
    }
}

fn scan_one_day(table: &str, day: &str, shared: &Shared) -> PlanResult<Option<Vec<u8>>> {
    if shared.cancel.load(Ordering::SeqCst) {
        return Ok(None);
    }
    let config = &shared.config;
    let entry = scan_day(config.store().as_ref(), table, config.auths(), day, &shared.terms)?;
    shared.stats.day_scanned(entry.is_some());
    Ok(entry.map(|entry| entry.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::parse_day;

    #[test]
    fn test_days_of_year_clamps_to_range() {
        let begin = parse_day("20231230").unwrap();
        let end = parse_day("20240102").unwrap();
        assert_eq!(days_of_year(2023, begin, end), vec!["20231230", "20231231"]);
        assert_eq!(days_of_year(2024, begin, end), vec!["20240101", "20240102"]);
    }

    #[test]
    fn test_send_gives_up_when_cancelled() {
        let (tx, rx) = bounded::<u32>(1);
        let cancel = AtomicBool::new(false);
        assert!(send_until_cancelled(&tx, 1, &cancel));
        cancel.store(true, Ordering::SeqCst);
        assert!(!send_until_cancelled(&tx, 2, &cancel));
        assert_eq!(rx.try_recv().unwrap(), 1);
        drop(rx);
        cancel.store(false, Ordering::SeqCst);
        assert!(!send_until_cancelled(&tx, 3, &cancel));
    }
}
