//! Task history and aggregate statistics
//!
//! Keeps the most recent `capacity` finished tasks plus running aggregates.
//! Aggregates survive capacity eviction and retention sweeps; they are only
//! reset by [`HistoryRecorder::clear_all`].

use crate::clock::{to_chrono, TimeProvider, Timestamp};
use crate::config::HistoryConfig;
use crate::execution::{ExecutionView, TaskResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use sweeper_domain::{TaskId, TaskPriority};

/// One finished task
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    /// Task id
    pub task_id: TaskId,
    /// Task category
    pub task_type: String,
    /// Priority band
    pub priority: TaskPriority,
    /// Submission time
    pub created_at: Timestamp,
    /// First start
    pub started_at: Option<Timestamp>,
    /// Terminal state time
    pub ended_at: Option<Timestamp>,
    /// Whether the task succeeded
    pub successful: bool,
    /// Running time
    pub duration_ms: u64,
    /// Units handled
    pub processed_items: u64,
    /// Units that failed
    pub failed_items: u64,
    /// Failure reason
    pub error_message: Option<String>,
    /// Result statistics
    pub statistics: BTreeMap<String, serde_json::Value>,
    /// When the record was stored
    pub recorded_at: Timestamp,
}

/// Aggregates over every recorded task
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverallStatistics {
    /// Tasks recorded
    pub total_tasks: u64,
    /// Tasks that succeeded
    pub successful_tasks: u64,
    /// Tasks that did not
    pub failed_tasks: u64,
    /// Sum of running times
    pub total_duration_ms: u64,
    /// Records currently retained
    pub retained_records: usize,
}

impl OverallStatistics {
    /// Percentage of tasks that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.successful_tasks as f64 / self.total_tasks as f64 * 100.0
    }

    /// Mean running time
    pub fn average_duration_ms(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.total_tasks as f64
    }
}

/// Aggregates for one task type
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskTypeStatistics {
    /// Task category
    pub task_type: String,
    /// Tasks recorded
    pub count: u64,
    /// Tasks that succeeded
    pub successes: u64,
    /// Tasks that did not
    pub failures: u64,
    /// Sum of running times
    pub total_duration_ms: u64,
    /// Sum of processed units
    pub total_processed: u64,
}

impl TaskTypeStatistics {
    fn new(task_type: &str) -> Self {
        Self {
            task_type: task_type.to_string(),
            ..Default::default()
        }
    }

    /// Percentage of tasks that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.successes as f64 / self.count as f64 * 100.0
    }

    /// Mean running time
    pub fn average_duration_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.count as f64
    }
}

struct HistoryState {
    records: VecDeque<HistoryRecord>,
    overall: OverallStatistics,
    by_type: HashMap<String, TaskTypeStatistics>,
}

/// Bounded store of finished tasks
pub struct HistoryRecorder {
    state: Mutex<HistoryState>,
    capacity: usize,
    retention: chrono::Duration,
    clock: Arc<dyn TimeProvider>,
}

impl HistoryRecorder {
    /// Create an empty recorder
    pub fn new(config: &HistoryConfig, clock: Arc<dyn TimeProvider>) -> Self {
        let retention = Duration::from_secs(config.retention_days * 24 * 3600);
        Self {
            state: Mutex::new(HistoryState {
                records: VecDeque::with_capacity(config.capacity),
                overall: OverallStatistics::default(),
                by_type: HashMap::new(),
            }),
            capacity: config.capacity.max(1),
            retention: to_chrono(retention),
            clock,
        }
    }

    /// Store a finished task and fold it into the aggregates
    pub fn record_task(&self, view: &ExecutionView, result: &TaskResult) {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let recorded_at = state
            .records
            .back()
            .map(|last| last.recorded_at.max(now))
            .unwrap_or(now);
        let duration_ms = if result.duration_ms > 0 {
            result.duration_ms
        } else {
            view.duration_ms()
        };

        state.overall.total_tasks += 1;
        state.overall.total_duration_ms += duration_ms;
        if result.success {
            state.overall.successful_tasks += 1;
        } else {
            state.overall.failed_tasks += 1;
        }

        let stats = state
            .by_type
            .entry(view.task_type.clone())
            .or_insert_with(|| TaskTypeStatistics::new(&view.task_type));
        stats.count += 1;
        stats.total_duration_ms += duration_ms;
        stats.total_processed += result.processed_items;
        if result.success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }

        while state.records.len() >= self.capacity {
            state.records.pop_front();
        }
        state.records.push_back(HistoryRecord {
            task_id: view.task_id,
            task_type: view.task_type.clone(),
            priority: view.priority,
            created_at: view.created_at,
            started_at: view.started_at,
            ended_at: view.ended_at,
            successful: result.success,
            duration_ms,
            processed_items: result.processed_items,
            failed_items: result.failed_items,
            error_message: result.error.clone(),
            statistics: result.statistics.clone(),
            recorded_at,
        });
        tracing::debug!(
            "Recorded history for task {} ({}, success: {})",
            view.task_id,
            view.task_type,
            result.success
        );
    }

    /// Up to `n` records, newest first
    pub fn recent_history(&self, n: usize) -> Vec<HistoryRecord> {
        self.state.lock().records.iter().rev().take(n).cloned().collect()
    }

    /// Records with `start <= recorded_at < end`, oldest first
    pub fn history_by_time_range(&self, start: Timestamp, end: Timestamp) -> Vec<HistoryRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| r.recorded_at >= start && r.recorded_at < end)
            .cloned()
            .collect()
    }

    /// Records of one task type, oldest first
    pub fn history_by_task_type(&self, task_type: &str) -> Vec<HistoryRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| r.task_type == task_type)
            .cloned()
            .collect()
    }

    /// Most recent record for a task
    pub fn task_history(&self, task_id: TaskId) -> Option<HistoryRecord> {
        self.state
            .lock()
            .records
            .iter()
            .rev()
            .find(|r| r.task_id == task_id)
            .cloned()
    }

    /// Aggregates over every recorded task
    pub fn overall_statistics(&self) -> OverallStatistics {
        let state = self.state.lock();
        OverallStatistics {
            retained_records: state.records.len(),
            ..state.overall.clone()
        }
    }

    /// Aggregates for one task type
    pub fn task_type_statistics(&self, task_type: &str) -> Option<TaskTypeStatistics> {
        self.state.lock().by_type.get(task_type).cloned()
    }

    /// Aggregates for every task type, sorted by type
    pub fn all_task_type_statistics(&self) -> Vec<TaskTypeStatistics> {
        let mut all: Vec<_> = self.state.lock().by_type.values().cloned().collect();
        all.sort_by(|a, b| a.task_type.cmp(&b.task_type));
        all
    }

    /// Drop records older than the retention window; returns how many
    pub fn purge_expired(&self) -> usize {
        let cutoff = self.clock.now() - self.retention;
        let mut state = self.state.lock();
        let before = state.records.len();
        state.records.retain(|r| r.recorded_at >= cutoff);
        let purged = before - state.records.len();
        if purged > 0 {
            tracing::info!("Purged {} expired history records", purged);
        }
        purged
    }

    /// Records currently retained
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// True when nothing is retained
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Drop records and aggregates
    pub fn clear_all(&self) {
        let mut state = self.state.lock();
        state.records.clear();
        state.overall = OverallStatistics::default();
        state.by_type.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeProvider;
    use chrono::Utc;
    use sweeper_domain::TaskStatus;

    fn view(task_type: &str) -> ExecutionView {
        let now = Utc::now();
        ExecutionView {
            task_id: TaskId::new(),
            sequence: 0,
            task_type: task_type.to_string(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Completed,
            created_at: now,
            started_at: Some(now),
            ended_at: Some(now + chrono::Duration::milliseconds(40)),
            processed: 0,
            total: 0,
            progress_percent: 100.0,
            error_message: None,
            snapshot_count: 0,
        }
    }

    fn recorder(capacity: usize) -> (HistoryRecorder, Arc<ManualTimeProvider>) {
        let clock = Arc::new(ManualTimeProvider::new(Utc::now()));
        let config = HistoryConfig {
            capacity,
            ..HistoryConfig::default()
        };
        (HistoryRecorder::new(&config, clock.clone()), clock)
    }

    #[test]
    fn test_aggregates_and_type_statistics() {
        let (history, _) = recorder(100);
        let ok = view("SCHEDULED_CLEAN");
        history.record_task(&ok, &TaskResult::success(ok.task_id, "ok").with_counts(10, 0));
        let bad = view("SCHEDULED_CLEAN");
        history.record_task(&bad, &TaskResult::failure(bad.task_id, "world gone"));
        let manual = view("MANUAL_CLEAN");
        history.record_task(&manual, &TaskResult::success(manual.task_id, "ok").with_duration(100));

        let overall = history.overall_statistics();
        assert_eq!(overall.total_tasks, 3);
        assert_eq!(overall.failed_tasks, 1);
        assert!((overall.success_rate() - 66.666).abs() < 0.01);
        assert_eq!(overall.total_duration_ms, 40 + 40 + 100);

        let scheduled = history.task_type_statistics("SCHEDULED_CLEAN").unwrap();
        assert_eq!(scheduled.count, 2);
        assert_eq!(scheduled.total_processed, 10);
        assert_eq!(scheduled.success_rate(), 50.0);
        assert!(history.task_type_statistics("UNKNOWN").is_none());
        assert_eq!(history.all_task_type_statistics().len(), 2);

        let record = history.task_history(bad.task_id).unwrap();
        assert_eq!(record.error_message.as_deref(), Some("world gone"));
    }

    #[test]
    fn test_capacity_keeps_newest() {
        let (history, _) = recorder(3);
        let views: Vec<_> = (0..5).map(|_| view("T")).collect();
        for v in &views {
            history.record_task(v, &TaskResult::success(v.task_id, "ok"));
        }
        assert_eq!(history.len(), 3);
        let recent = history.recent_history(10);
        assert_eq!(recent[0].task_id, views[4].task_id);
        assert_eq!(recent[2].task_id, views[2].task_id);
        assert_eq!(history.overall_statistics().total_tasks, 5);
    }

    #[test]
    fn test_time_range_is_half_open() {
        let (history, clock) = recorder(10);
        let start = clock.now();
        let first = view("T");
        history.record_task(&first, &TaskResult::success(first.task_id, "ok"));
        clock.advance(chrono::Duration::seconds(10));
        let second = view("T");
        history.record_task(&second, &TaskResult::success(second.task_id, "ok"));

        let range = history.history_by_time_range(start, start + chrono::Duration::seconds(10));
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].task_id, first.task_id);
        assert_eq!(history.history_by_task_type("T").len(), 2);
    }

    #[test]
    fn test_retention_sweep_keeps_aggregates() {
        let (history, clock) = recorder(10);
        let old = view("T");
        history.record_task(&old, &TaskResult::success(old.task_id, "ok"));
        clock.advance(chrono::Duration::days(8));
        let fresh = view("T");
        history.record_task(&fresh, &TaskResult::success(fresh.task_id, "ok"));

        assert_eq!(history.purge_expired(), 1);
        assert_eq!(history.len(), 1);
        assert_eq!(history.overall_statistics().total_tasks, 2);

        history.clear_all();
        assert!(history.is_empty());
        assert_eq!(history.overall_statistics(), OverallStatistics::default());
    }

    #[test]
    fn test_backwards_clock_is_clamped() {
        let (history, clock) = recorder(10);
        let a = view("T");
        history.record_task(&a, &TaskResult::success(a.task_id, "ok"));
        clock.advance(chrono::Duration::minutes(-5));
        let b = view("T");
        history.record_task(&b, &TaskResult::success(b.task_id, "ok"));
        let recent = history.recent_history(2);
        assert!(recent[0].recorded_at >= recent[1].recorded_at);
    }
}
