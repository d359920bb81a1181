//! Task executions, results, and the ticket handed back to submitters

use crate::clock::Timestamp;
use crate::error::SweepError;
use crate::request::TaskPayload;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use sweeper_domain::{ObjectSnapshot, TaskId, TaskPriority, TaskStatus};
use tokio::sync::oneshot;

/// Immutable description of a submitted task
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique id
    pub id: TaskId,
    /// Submission order, unique and increasing
    pub sequence: u64,
    /// Free-form category used for statistics, e.g. `"SCHEDULED_CLEAN"`
    pub task_type: String,
    /// Priority band
    pub priority: TaskPriority,
    /// Work to perform
    pub payload: TaskPayload,
    /// Submission time
    pub created_at: Timestamp,
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task this result belongs to
    pub task_id: TaskId,
    /// Whether the task achieved its goal
    pub success: bool,
    /// Human readable summary
    pub message: String,
    /// Wall time spent running
    pub duration_ms: u64,
    /// Units handled successfully
    pub processed_items: u64,
    /// Units that failed
    pub failed_items: u64,
    /// Free-form counters
    pub statistics: BTreeMap<String, serde_json::Value>,
    /// Error description for failed results
    pub error: Option<String>,
    /// When the result was produced
    pub completed_at: Timestamp,
}

impl TaskResult {
    fn base(task_id: TaskId, success: bool, message: impl Into<String>) -> Self {
        Self {
            task_id,
            success,
            message: message.into(),
            duration_ms: 0,
            processed_items: 0,
            failed_items: 0,
            statistics: BTreeMap::new(),
            error: None,
            completed_at: chrono::Utc::now(),
        }
    }

    /// Successful result
    pub fn success(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::base(task_id, true, message)
    }

    /// Successful result with a prepared statistics map
    pub fn success_with_statistics(
        task_id: TaskId,
        message: impl Into<String>,
        statistics: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut result = Self::base(task_id, true, message);
        result.statistics = statistics;
        result
    }

    /// Failed result carrying `error`
    pub fn failure(task_id: TaskId, error: impl Into<String>) -> Self {
        let error = error.into();
        let mut result = Self::base(task_id, false, format!("Task failed: {}", error));
        result.error = Some(error);
        result
    }

    /// Result delivered when a task is cancelled
    pub fn cancelled(task_id: TaskId) -> Self {
        let mut result = Self::base(task_id, false, "Task was cancelled");
        result.error = Some(SweepError::Cancelled(task_id).to_string());
        result
    }

    /// Result delivered when a task exceeds its time budget
    pub fn timeout(task_id: TaskId) -> Self {
        let mut result = Self::base(task_id, false, "Task timed out");
        result.error = Some(SweepError::Timeout(task_id).to_string());
        result
    }

    /// Result delivered when a submission is refused
    pub fn rejected(task_id: TaskId, reason: &SweepError) -> Self {
        let mut result = Self::base(task_id, false, "Task was not accepted");
        result.error = Some(reason.to_string());
        result
    }

    /// Set processed and failed unit counts
    pub fn with_counts(mut self, processed: u64, failed: u64) -> Self {
        self.processed_items = processed;
        self.failed_items = failed;
        self
    }

    /// Set the running time
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Add a named statistic
    pub fn with_statistic(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.statistics.insert(key.to_string(), value.into());
        self
    }

    /// Stamp the completion time
    pub fn completed_at(mut self, at: Timestamp) -> Self {
        self.completed_at = at;
        self
    }

    /// Percentage of units that succeeded
    pub fn success_rate(&self) -> f64 {
        let total = self.processed_items + self.failed_items;
        if total == 0 {
            return if self.success { 100.0 } else { 0.0 };
        }
        self.processed_items as f64 / total as f64 * 100.0
    }
}

/// Read-only snapshot of an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionView {
    /// Task id
    pub task_id: TaskId,
    /// Submission order
    pub sequence: u64,
    /// Task category
    pub task_type: String,
    /// Priority band
    pub priority: TaskPriority,
    /// Current lifecycle state
    pub status: TaskStatus,
    /// Submission time
    pub created_at: Timestamp,
    /// First time the task started running
    pub started_at: Option<Timestamp>,
    /// When the task reached a terminal state
    pub ended_at: Option<Timestamp>,
    /// Units handled so far
    pub processed: u64,
    /// Units expected in total, when known
    pub total: u64,
    /// Completion percentage
    pub progress_percent: f64,
    /// Last error recorded on the execution
    pub error_message: Option<String>,
    /// Snapshots captured so far
    pub snapshot_count: usize,
}

impl ExecutionView {
    /// Running time in milliseconds; zero until the task has started
    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}

struct ExecutionState {
    status: TaskStatus,
    started_at: Option<Timestamp>,
    ended_at: Option<Timestamp>,
    processed: u64,
    total: u64,
    error_message: Option<String>,
    snapshots: Vec<ObjectSnapshot>,
    body_running: bool,
    requeue_on_return: bool,
    carried_processed: u64,
    carried_failed: u64,
}

/// Mutable runtime record of a task
///
/// Owned by the orchestrator while the task is active. Status changes go
/// through [`transition`](Self::transition), which enforces the lifecycle
/// state machine.
pub struct TaskExecution {
    task: Task,
    state: Mutex<ExecutionState>,
    kill_switch: Arc<AtomicBool>,
    attempts: AtomicU32,
    finished: AtomicBool,
    result_tx: Mutex<Option<oneshot::Sender<TaskResult>>>,
}

impl TaskExecution {
    /// Wrap `task` in a PENDING execution and return the submitter's ticket
    pub fn new(task: Task) -> (Self, TaskTicket) {
        let (tx, rx) = oneshot::channel();
        let ticket = TaskTicket {
            task_id: task.id,
            receiver: rx,
        };
        let execution = Self {
            task,
            state: Mutex::new(ExecutionState {
                status: TaskStatus::Pending,
                started_at: None,
                ended_at: None,
                processed: 0,
                total: 0,
                error_message: None,
                snapshots: Vec::new(),
                body_running: false,
                requeue_on_return: false,
                carried_processed: 0,
                carried_failed: 0,
            }),
            kill_switch: Arc::new(AtomicBool::new(false)),
            attempts: AtomicU32::new(0),
            finished: AtomicBool::new(false),
            result_tx: Mutex::new(Some(tx)),
        };
        (execution, ticket)
    }

    /// The immutable task
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Task id
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    /// Priority band
    pub fn priority(&self) -> TaskPriority {
        self.task.priority
    }

    /// Submission order
    pub fn sequence(&self) -> u64 {
        self.task.sequence
    }

    /// Current lifecycle state
    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Move to `to` if the state machine allows it; returns the previous state
    pub fn transition(&self, to: TaskStatus, now: Timestamp) -> Result<TaskStatus, SweepError> {
        let mut state = self.state.lock();
        let from = state.status;
        if !from.can_transition_to(to) {
            return Err(SweepError::InvalidTransition {
                task_id: self.task.id,
                from,
                to,
            });
        }
        state.status = to;
        if to == TaskStatus::Running && state.started_at.is_none() {
            state.started_at = Some(now);
        }
        if to.is_finished() {
            state.ended_at = Some(now);
        }
        Ok(from)
    }

    /// Shared cooperative stop flag, set on cancel, pause and timeout
    pub fn kill_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.kill_switch)
    }

    /// Ask the running body to stop at its next check
    pub fn signal_stop(&self) {
        self.kill_switch.store(true, Ordering::Release);
    }

    /// Re-arm the body after a resume
    pub fn clear_stop(&self) {
        self.kill_switch.store(false, Ordering::Release);
    }

    /// Whether the body has been asked to stop
    pub fn should_stop(&self) -> bool {
        self.kill_switch.load(Ordering::Acquire)
    }

    /// Start a new run of the body; returns its attempt number
    pub fn begin_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Attempt number of the most recent run
    pub fn current_attempt(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Mark the body as dispatched
    pub fn body_started(&self) {
        self.state.lock().body_running = true;
    }

    /// Mark the body as returned; true when a resume is waiting on it
    pub fn body_returned(&self) -> bool {
        let mut state = self.state.lock();
        state.body_running = false;
        std::mem::take(&mut state.requeue_on_return)
    }

    /// Whether a dispatched body has not returned yet
    pub fn body_in_flight(&self) -> bool {
        self.state.lock().body_running
    }

    /// Leave the requeue to the body still in flight
    ///
    /// Returns false when no body is running, in which case the caller
    /// requeues the task itself.
    pub fn defer_requeue(&self) -> bool {
        let mut state = self.state.lock();
        if state.body_running {
            state.requeue_on_return = true;
        }
        state.body_running
    }

    /// Keep the counts of an interrupted run for the final result
    pub fn carry_counts(&self, processed: u64, failed: u64) {
        let mut state = self.state.lock();
        state.carried_processed += processed;
        state.carried_failed += failed;
    }

    /// Counts carried over from interrupted runs
    pub fn take_carried(&self) -> (u64, u64) {
        let mut state = self.state.lock();
        (
            std::mem::take(&mut state.carried_processed),
            std::mem::take(&mut state.carried_failed),
        )
    }

    /// Claim the right to settle the task; true only for the first caller
    pub fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    /// Record progress counters
    pub fn update_progress(&self, processed: u64, total: u64) {
        let mut state = self.state.lock();
        state.processed = processed;
        state.total = total;
    }

    /// Record an error message
    pub fn set_error(&self, message: impl Into<String>) {
        self.state.lock().error_message = Some(message.into());
    }

    /// Keep snapshots captured by a (possibly partial) run
    pub fn append_snapshots(&self, snapshots: Vec<ObjectSnapshot>) {
        if !snapshots.is_empty() {
            self.state.lock().snapshots.extend(snapshots);
        }
    }

    /// Take every snapshot captured so far
    pub fn take_snapshots(&self) -> Vec<ObjectSnapshot> {
        std::mem::take(&mut self.state.lock().snapshots)
    }

    /// Deliver the result to the ticket; only the first call has any effect
    pub fn resolve(&self, result: TaskResult) -> bool {
        match self.result_tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Whether the ticket has already been resolved
    pub fn is_resolved(&self) -> bool {
        self.result_tx.lock().is_none()
    }

    /// Read-only snapshot
    pub fn view(&self) -> ExecutionView {
        let state = self.state.lock();
        let progress_percent = if state.total > 0 {
            (state.processed as f64 / state.total as f64 * 100.0).min(100.0)
        } else if state.status == TaskStatus::Completed {
            100.0
        } else {
            0.0
        };
        ExecutionView {
            task_id: self.task.id,
            sequence: self.task.sequence,
            task_type: self.task.task_type.clone(),
            priority: self.task.priority,
            status: state.status,
            created_at: self.task.created_at,
            started_at: state.started_at,
            ended_at: state.ended_at,
            processed: state.processed,
            total: state.total,
            progress_percent,
            error_message: state.error_message.clone(),
            snapshot_count: state.snapshots.len(),
        }
    }
}

impl std::fmt::Debug for TaskExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecution")
            .field("id", &self.task.id)
            .field("type", &self.task.task_type)
            .field("priority", &self.task.priority)
            .field("status", &self.status())
            .finish()
    }
}

/// Future resolving to a task's terminal result
///
/// Every submission yields a ticket, including rejected ones, whose ticket
/// resolves immediately with a failed result.
#[must_use = "a TaskTicket does nothing unless awaited"]
pub struct TaskTicket {
    task_id: TaskId,
    receiver: oneshot::Receiver<TaskResult>,
}

impl TaskTicket {
    /// Id of the submitted task
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Future for TaskTicket {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task_id = self.task_id;
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(TaskResult::failure(
                task_id,
                "engine stopped before the task finished",
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}
