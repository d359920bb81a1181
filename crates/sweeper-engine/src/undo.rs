//! Undo log - restores what a cleanup removed
//!
//! Bounded two ways: at most `capacity` records (oldest evicted first) and
//! each record is only restorable for `timeout` after it was recorded.
//! Records are single-use: an undo attempt consumes the record whatever the
//! outcome.

use crate::authority::WorldGateway;
use crate::clock::{to_chrono, TimeProvider, Timestamp};
use crate::config::UndoConfig;
use crate::error::SweepError;
use crate::metrics::{names, MetricCounters};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use sweeper_domain::{ObjectSnapshot, TaskId, WorldAdapter};

/// Snapshots captured by one task
#[derive(Debug, Clone)]
pub struct UndoRecord {
    /// Task that removed the objects
    pub task_id: TaskId,
    /// When the record was stored
    pub recorded_at: Timestamp,
    /// Removed objects, in removal order
    pub snapshots: Vec<ObjectSnapshot>,
    /// What the task did
    pub description: String,
}

/// Listing entry for an undo record
#[derive(Debug, Clone, Serialize)]
pub struct UndoSummary {
    /// Task that removed the objects
    pub task_id: TaskId,
    /// When the record was stored
    pub recorded_at: Timestamp,
    /// When the record stops being restorable
    pub expires_at: Timestamp,
    /// Number of snapshots
    pub object_count: usize,
    /// What the task did
    pub description: String,
}

/// Outcome of an undo attempt that found a live record
#[derive(Debug, Clone, Serialize)]
pub struct UndoResult {
    /// Task whose removals were reverted
    pub task_id: TaskId,
    /// Every snapshot was restored
    pub successful: bool,
    /// Snapshots restored
    pub restored_count: usize,
    /// Snapshots that could not be restored
    pub failed_count: usize,
    /// Last restore error, if any
    pub error_message: Option<String>,
}

/// Capacity and time bounded log of undo records
pub struct UndoLog<W: WorldAdapter> {
    records: Mutex<VecDeque<UndoRecord>>,
    capacity: usize,
    timeout: chrono::Duration,
    gateway: WorldGateway<W>,
    clock: Arc<dyn TimeProvider>,
    metrics: Arc<MetricCounters>,
}

impl<W: WorldAdapter> UndoLog<W> {
    /// Create an empty log
    pub fn new(
        config: &UndoConfig,
        gateway: WorldGateway<W>,
        clock: Arc<dyn TimeProvider>,
        metrics: Arc<MetricCounters>,
    ) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(config.capacity)),
            capacity: config.capacity.max(1),
            timeout: to_chrono(Duration::from_secs(config.timeout_minutes * 60)),
            gateway,
            clock,
            metrics,
        }
    }

    fn is_expired(&self, record: &UndoRecord, now: Timestamp) -> bool {
        now - record.recorded_at >= self.timeout
    }

    /// Store the snapshots a task captured, evicting the oldest record when full
    pub fn record(&self, task_id: TaskId, snapshots: Vec<ObjectSnapshot>, description: impl Into<String>) {
        let now = self.clock.now();
        let mut records = self.records.lock();

        records.retain(|r| r.task_id != task_id);
        // Creation times never go backwards even if the wall clock does
        let recorded_at = records
            .back()
            .map(|last| last.recorded_at.max(now))
            .unwrap_or(now);

        while records.len() >= self.capacity {
            if let Some(evicted) = records.pop_front() {
                tracing::debug!("Evicted undo record for task {}", evicted.task_id);
            }
        }

        tracing::debug!(
            "Recorded undo data for task {} ({} objects)",
            task_id,
            snapshots.len()
        );
        records.push_back(UndoRecord {
            task_id,
            recorded_at,
            snapshots,
            description: description.into(),
        });
    }

    /// Whether a live record exists for `task_id`
    pub fn can_undo(&self, task_id: TaskId) -> bool {
        let now = self.clock.now();
        self.records
            .lock()
            .iter()
            .any(|r| r.task_id == task_id && !self.is_expired(r, now))
    }

    /// Most recent task that can still be undone
    pub fn latest_undoable(&self) -> Option<TaskId> {
        let now = self.clock.now();
        self.records
            .lock()
            .iter()
            .rev()
            .find(|r| !self.is_expired(r, now))
            .map(|r| r.task_id)
    }

    /// Restore every snapshot recorded for `task_id`
    ///
    /// Fails immediately with `UndoNotFound` or `UndoExpired`. Otherwise each
    /// snapshot is respawned through the world authority and the counts are
    /// reported in the returned [`UndoResult`].
    pub async fn undo(&self, task_id: TaskId) -> Result<UndoResult, SweepError> {
        self.metrics.increment(names::UNDO_OPERATIONS);

        let record = {
            let now = self.clock.now();
            let mut records = self.records.lock();
            let Some(index) = records.iter().position(|r| r.task_id == task_id) else {
                self.metrics.increment(names::UNDO_FAILURES);
                return Err(SweepError::UndoNotFound(task_id));
            };
            let record = records.remove(index);
            match record {
                Some(record) if !self.is_expired(&record, now) => record,
                _ => {
                    self.metrics.increment(names::UNDO_FAILURES);
                    tracing::info!("Undo record for task {} expired", task_id);
                    return Err(SweepError::UndoExpired(task_id));
                }
            }
        };

        let total = record.snapshots.len();
        let mut restored_count = 0;
        let mut error_message = None;
        for snapshot in record.snapshots {
            let object_id = snapshot.object_id;
            match self.gateway.restore(snapshot).await {
                Ok(_) => restored_count += 1,
                Err(e) => {
                    tracing::warn!("Failed to restore object {}: {}", object_id, e);
                    error_message = Some(e.to_string());
                }
            }
        }

        let failed_count = total - restored_count;
        let successful = failed_count == 0;
        if successful {
            self.metrics.increment(names::UNDO_SUCCESSES);
        } else {
            self.metrics.increment(names::UNDO_FAILURES);
        }
        tracing::info!(
            "Undo of task {}: restored {}/{} objects",
            task_id,
            restored_count,
            total
        );

        Ok(UndoResult {
            task_id,
            successful,
            restored_count,
            failed_count,
            error_message,
        })
    }

    /// Drop records past their timeout; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| !self.is_expired(r, now));
        before - records.len()
    }

    /// Live and expired records, oldest first
    pub fn records(&self) -> Vec<UndoSummary> {
        self.records
            .lock()
            .iter()
            .map(|r| UndoSummary {
                task_id: r.task_id,
                recorded_at: r.recorded_at,
                expires_at: r.recorded_at + self.timeout,
                object_count: r.snapshots.len(),
                description: r.description.clone(),
            })
            .collect()
    }

    /// Stored records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when no records are stored
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Drop every record
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
