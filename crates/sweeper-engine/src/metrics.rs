//! Named rate counters for engine operations
//!
//! Each counter keeps a monotonic total plus per-second buckets covering a
//! sliding window, so average and peak rates can be reported without a
//! separate metrics backend.

use crate::clock::{TimeProvider, Timestamp};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counter names maintained by the engine
pub mod names {
    /// Objects examined by cleanup visitors
    pub const OBJECTS_PROCESSED: &str = "objects_processed";
    /// Objects removed from the world
    pub const OBJECTS_REMOVED: &str = "objects_removed";
    /// Partitions completed by the batch processor
    pub const PARTITIONS_PROCESSED: &str = "partitions_processed";
    /// Tasks that reached a terminal state
    pub const TASKS_EXECUTED: &str = "tasks_executed";
    /// Tasks that failed or timed out
    pub const TASKS_FAILED: &str = "tasks_failed";
    /// Undo attempts
    pub const UNDO_OPERATIONS: &str = "undo_operations";
    /// Undo attempts that restored every snapshot
    pub const UNDO_SUCCESSES: &str = "undo_successes";
    /// Undo attempts that failed or restored only part of a record
    pub const UNDO_FAILURES: &str = "undo_failures";

    /// All predefined names
    pub const ALL: [&str; 8] = [
        OBJECTS_PROCESSED,
        OBJECTS_REMOVED,
        PARTITIONS_PROCESSED,
        TASKS_EXECUTED,
        TASKS_FAILED,
        UNDO_OPERATIONS,
        UNDO_SUCCESSES,
        UNDO_FAILURES,
    ];
}

struct RateCounter {
    total: AtomicU64,
    buckets: Mutex<BTreeMap<i64, u64>>,
    created_at: Timestamp,
    last_update: Mutex<Timestamp>,
}

impl RateCounter {
    fn new(now: Timestamp) -> Self {
        Self {
            total: AtomicU64::new(0),
            buckets: Mutex::new(BTreeMap::new()),
            created_at: now,
            last_update: Mutex::new(now),
        }
    }
}

/// Point-in-time view of one counter
#[derive(Debug, Clone, Serialize)]
pub struct CounterStatistics {
    /// Counter name
    pub name: String,
    /// Monotonic total since creation or last reset
    pub total: u64,
    /// Events per second averaged over the window
    pub average_rate: f64,
    /// Highest single-second count inside the window
    pub peak_rate: u64,
    /// When the counter was registered
    pub created_at: Timestamp,
    /// When the counter last changed
    pub last_update: Timestamp,
}

/// Registry of named counters
///
/// Created once per engine and shared through the engine context.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use sweeper_engine::clock::SystemTimeProvider;
/// use sweeper_engine::metrics::{names, MetricCounters};
///
/// let metrics = MetricCounters::new(Duration::from_secs(60), Arc::new(SystemTimeProvider));
/// metrics.add(names::OBJECTS_REMOVED, 12);
/// assert_eq!(metrics.get(names::OBJECTS_REMOVED), 12);
/// ```
pub struct MetricCounters {
    counters: DashMap<String, Arc<RateCounter>>,
    window_secs: i64,
    clock: Arc<dyn TimeProvider>,
}

impl MetricCounters {
    /// Create a registry with every predefined counter registered
    pub fn new(window: Duration, clock: Arc<dyn TimeProvider>) -> Self {
        let metrics = Self {
            counters: DashMap::new(),
            window_secs: window.as_secs().max(1) as i64,
            clock,
        };
        for name in names::ALL {
            metrics.counter(name);
        }
        metrics
    }

    fn counter(&self, name: &str) -> Arc<RateCounter> {
        if let Some(existing) = self.counters.get(name) {
            return Arc::clone(existing.value());
        }
        let now = self.clock.now();
        Arc::clone(
            self.counters
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RateCounter::new(now)))
                .value(),
        )
    }

    /// Add one; returns the new total
    pub fn increment(&self, name: &str) -> u64 {
        self.add(name, 1)
    }

    /// Add `delta`; returns the new total
    pub fn add(&self, name: &str, delta: u64) -> u64 {
        let counter = self.counter(name);
        let now = self.clock.now();
        let second = now.timestamp();
        let total = counter.total.fetch_add(delta, Ordering::Relaxed) + delta;

        {
            let mut buckets = counter.buckets.lock();
            *buckets.entry(second).or_insert(0) += delta;
            let oldest_kept = second - self.window_secs + 1;
            let kept = buckets.split_off(&oldest_kept);
            *buckets = kept;
        }
        *counter.last_update.lock() = now;
        total
    }

    /// Current total, zero for unknown names
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.total.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Rate statistics for one counter
    pub fn statistics(&self, name: &str) -> Option<CounterStatistics> {
        let counter = Arc::clone(self.counters.get(name)?.value());
        Some(self.compute_statistics(name, &counter))
    }

    fn compute_statistics(&self, name: &str, counter: &RateCounter) -> CounterStatistics {
        let now_second = self.clock.now().timestamp();
        let oldest_kept = now_second - self.window_secs + 1;

        let (sum, peak) = {
            let buckets = counter.buckets.lock();
            buckets
                .range(oldest_kept..)
                .fold((0u64, 0u64), |(sum, peak), (_, count)| {
                    (sum + count, peak.max(*count))
                })
        };

        CounterStatistics {
            name: name.to_string(),
            total: counter.total.load(Ordering::Relaxed),
            average_rate: sum as f64 / self.window_secs as f64,
            peak_rate: peak,
            created_at: counter.created_at,
            last_update: *counter.last_update.lock(),
        }
    }

    /// Statistics for every counter, sorted by name
    pub fn all_statistics(&self) -> Vec<CounterStatistics> {
        let snapshot: Vec<(String, Arc<RateCounter>)> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut stats: Vec<CounterStatistics> = snapshot
            .iter()
            .map(|(name, counter)| self.compute_statistics(name, counter))
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Registered counter names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.counters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Zero one counter
    pub fn reset(&self, name: &str) {
        if let Some(counter) = self.counters.get(name) {
            counter.total.store(0, Ordering::Relaxed);
            counter.buckets.lock().clear();
        }
    }

    /// Zero every counter
    pub fn reset_all(&self) {
        for entry in self.counters.iter() {
            entry.total.store(0, Ordering::Relaxed);
            entry.buckets.lock().clear();
        }
    }

    /// Unregister a counter
    pub fn remove(&self, name: &str) -> bool {
        self.counters.remove(name).is_some()
    }

    /// Drop buckets that fell out of the window; returns buckets dropped
    pub fn purge_expired(&self) -> usize {
        let oldest_kept = self.clock.now().timestamp() - self.window_secs + 1;
        let mut dropped = 0;
        for entry in self.counters.iter() {
            let mut buckets = entry.buckets.lock();
            let before = buckets.len();
            let kept = buckets.split_off(&oldest_kept);
            *buckets = kept;
            dropped += before - buckets.len();
        }
        if dropped > 0 {
            tracing::debug!("Purged {} expired metric buckets", dropped);
        }
        dropped
    }

    /// Generate a summary report of all counters
    pub fn performance_summary(&self) -> String {
        let mut lines = vec![
            "Performance Summary".to_string(),
            "===================".to_string(),
        ];
        for stat in self.all_statistics() {
            lines.push(format!(
                "  {:<22} total={:<8} avg={:.2}/s peak={}/s",
                stat.name, stat.total, stat.average_rate, stat.peak_rate
            ));
        }
        lines.join("\n")
    }
}

impl std::fmt::Debug for MetricCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricCounters")
            .field("counters", &self.counters.len())
            .field("window_secs", &self.window_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeProvider;
    use chrono::{TimeZone, Utc};

    fn setup() -> (MetricCounters, Arc<ManualTimeProvider>) {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualTimeProvider::new(start));
        let metrics = MetricCounters::new(Duration::from_secs(60), clock.clone());
        (metrics, clock)
    }

    #[test]
    fn test_predefined_counters_registered() {
        let (metrics, _) = setup();
        for name in names::ALL {
            assert!(metrics.statistics(name).is_some(), "{} missing", name);
            assert_eq!(metrics.get(name), 0);
        }
    }

    #[test]
    fn test_increment_and_add() {
        let (metrics, _) = setup();
        assert_eq!(metrics.increment("custom"), 1);
        assert_eq!(metrics.add("custom", 4), 5);
        assert_eq!(metrics.get("custom"), 5);
        assert_eq!(metrics.get("unknown"), 0);
    }

    #[test]
    fn test_average_and_peak_over_window() {
        let (metrics, clock) = setup();
        metrics.add(names::OBJECTS_REMOVED, 30);
        clock.advance(chrono::Duration::seconds(1));
        metrics.add(names::OBJECTS_REMOVED, 90);

        let stats = metrics.statistics(names::OBJECTS_REMOVED).unwrap();
        assert_eq!(stats.total, 120);
        assert_eq!(stats.peak_rate, 90);
        assert!((stats.average_rate - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_expiry_keeps_total() {
        let (metrics, clock) = setup();
        metrics.add(names::TASKS_EXECUTED, 10);
        clock.advance(chrono::Duration::seconds(120));

        let stats = metrics.statistics(names::TASKS_EXECUTED).unwrap();
        assert_eq!(stats.total, 10);
        assert_eq!(stats.peak_rate, 0);
        assert_eq!(stats.average_rate, 0.0);
        assert_eq!(metrics.purge_expired(), 1);
    }

    #[test]
    fn test_reset_and_remove() {
        let (metrics, _) = setup();
        metrics.add(names::UNDO_OPERATIONS, 3);
        metrics.reset(names::UNDO_OPERATIONS);
        assert_eq!(metrics.get(names::UNDO_OPERATIONS), 0);

        metrics.add("a", 1);
        metrics.add("b", 1);
        metrics.reset_all();
        assert_eq!(metrics.get("a") + metrics.get("b"), 0);

        assert!(metrics.remove("a"));
        assert!(!metrics.remove("a"));
    }

    #[test]
    fn test_concurrent_increments() {
        let (metrics, _) = setup();
        let metrics = Arc::new(metrics);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.increment(names::OBJECTS_PROCESSED);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.get(names::OBJECTS_PROCESSED), 8000);
    }

    #[test]
    fn test_summary() {
        let (metrics, _) = setup();
        metrics.add(names::OBJECTS_REMOVED, 5);
        let summary = metrics.performance_summary();
        assert!(summary.contains("Performance Summary"));
        assert!(summary.contains("objects_removed"));
        assert!(summary.contains("total=5"));
    }
}
