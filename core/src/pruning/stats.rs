use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::info;

/// Hit counters of one pruning run. Purely informational.
#[derive(Debug, Default)]
pub struct PruningStats {
    years_scanned: AtomicU64,
    years_hit: AtomicU64,
    days_scanned: AtomicU64,
    days_hit: AtomicU64,
    shards_emitted: AtomicU64,
    running_scans: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub years_scanned: u64,
    pub years_hit: u64,
    pub days_scanned: u64,
    pub days_hit: u64,
    pub shards_emitted: u64,
}

impl PruningStats {
    pub fn year_scanned(&self, hit: bool) {
        self.years_scanned.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.years_hit.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn day_scanned(&self, hit: bool) {
        self.days_scanned.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.days_hit.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn shard_emitted(&self) {
        self.shards_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scan_started(&self) {
        self.running_scans.fetch_add(1, Ordering::SeqCst);
    }

    pub fn scan_finished(&self) {
        self.running_scans.fetch_sub(1, Ordering::SeqCst);
    }

    /// Day scans currently in flight.
    pub fn running_scans(&self) -> usize {
        self.running_scans.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            years_scanned: self.years_scanned.load(Ordering::Relaxed),
            years_hit: self.years_hit.load(Ordering::Relaxed),
            days_scanned: self.days_scanned.load(Ordering::Relaxed),
            days_hit: self.days_hit.load(Ordering::Relaxed),
            shards_emitted: self.shards_emitted.load(Ordering::Relaxed),
        }
    }

    pub fn log(&self) {
        let s = self.snapshot();
        info!(
            years_scanned = s.years_scanned,
            years_hit = s.years_hit,
            year_hit_ratio = %ratio(s.years_hit, s.years_scanned),
            days_scanned = s.days_scanned,
            days_hit = s.days_hit,
            day_hit_ratio = %ratio(s.days_hit, s.days_scanned),
            shards_emitted = s.shards_emitted,
            shards_per_day = %ratio(s.shards_emitted, s.days_hit),
            "day index pruning finished"
        );
    }
}

/// `numerator / denominator` to two decimals without trailing zeros, or
/// `"0"` when the denominator is zero.
pub fn ratio(numerator: u64, denominator: u64) -> String {
    if denominator == 0 {
        return "0".to_string();
    }
    let formatted = format!("{:.2}", numerator as f64 / denominator as f64);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio() {
        assert_eq!(ratio(0, 0), "0");
        assert_eq!(ratio(5, 0), "0");
        assert_eq!(ratio(0, 4), "0");
        assert_eq!(ratio(1, 2), "0.5");
        assert_eq!(ratio(1, 3), "0.33");
        assert_eq!(ratio(4, 2), "2");
        assert_eq!(ratio(10, 4), "2.5");
    }

    #[test]
    fn test_counters() {
        let stats = PruningStats::default();
        stats.year_scanned(true);
        stats.year_scanned(false);
        stats.day_scanned(true);
        stats.shard_emitted();
        stats.shard_emitted();
        stats.scan_started();
        assert_eq!(stats.running_scans(), 1);
        stats.scan_finished();
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                years_scanned: 2,
                years_hit: 1,
                days_scanned: 1,
                days_hit: 1,
                shards_emitted: 2,
            }
        );
    }
}
