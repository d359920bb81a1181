//! Task orchestrator - submission, dispatch, lifecycle control and queries
//!
//! Submitted tasks wait in the priority queue until the dispatch loop, a
//! fixed-rate job on the timer pool, moves them to RUNNING one per tick and
//! runs their body on the compute pool. Control operations (cancel, pause,
//! timeout) flip the execution's kill switch; bodies notice it between units
//! of work and the completion handler settles the task according to its
//! status at that point.

use crate::authority::{WorldGateway, WorldMailbox};
use crate::batch::SpatialBatchProcessor;
use crate::cleaner::Cleaner;
use crate::context::EngineContext;
use crate::error::SweepError;
use crate::execution::{ExecutionView, Task, TaskExecution, TaskResult, TaskTicket};
use crate::history::{HistoryRecord, HistoryRecorder, OverallStatistics, TaskTypeStatistics};
use crate::metrics::names;
use crate::pool::{PoolStatus, ScheduledHandle};
use crate::queue::{PriorityTaskQueue, QueueStatus};
use crate::request::{CleaningRequest, TaskPayload};
use crate::undo::{UndoLog, UndoSummary};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use sweeper_domain::{TaskId, TaskPriority, TaskStatus, WorldAdapter};

/// Task type used for undo tasks
pub const UNDO_TASK_TYPE: &str = "UNDO_TASK";

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

struct Inner<W: WorldAdapter> {
    context: EngineContext,
    queue: PriorityTaskQueue,
    active: DashMap<TaskId, Arc<TaskExecution>>,
    history: HistoryRecorder,
    undo: UndoLog<W>,
    cleaner: Cleaner<W>,
    schedules: Mutex<Vec<ScheduledHandle>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Front door of the engine
///
/// Cheap to clone; clones share the same engine.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use sweeper_domain::{Position, TaskPriority};
/// use sweeper_engine::{CleaningRequest, EngineConfig, EngineContext, TaskOrchestrator};
/// # use sweeper_domain::WorldAdapter;
///
/// # async fn run<W: WorldAdapter>(world: Arc<W>) -> Result<(), sweeper_engine::SweepError> {
/// let context = EngineContext::new(EngineConfig::default())?;
/// let (engine, mailbox) = TaskOrchestrator::new(context, world);
/// let _authority = mailbox.spawn_dedicated("world-authority");
/// engine.start()?;
///
/// let ticket = engine.submit_cleaning_task(
///     "MANUAL_CLEAN",
///     TaskPriority::High,
///     CleaningRequest::around(Position::new(0.0, 64.0, 0.0), 64.0),
/// );
/// let result = ticket.await;
/// println!("{}", result.message);
///
/// tokio::task::spawn_blocking(move || engine.stop()).await.ok();
/// # Ok(())
/// # }
/// ```
pub struct TaskOrchestrator<W: WorldAdapter> {
    inner: Arc<Inner<W>>,
}

impl<W: WorldAdapter> Clone for TaskOrchestrator<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: WorldAdapter> TaskOrchestrator<W> {
    /// Build an engine over `world`
    ///
    /// The returned mailbox must be drained on the world's authoritative
    /// context, otherwise removals and restores never run.
    pub fn new(context: EngineContext, world: Arc<W>) -> (Self, WorldMailbox<W>) {
        let (gateway, mailbox) = WorldGateway::channel(Arc::clone(&world));
        let config = Arc::clone(&context.config);

        let processor = Arc::new(SpatialBatchProcessor::new(world, &context));
        let cleaner = Cleaner::new(processor, gateway.clone(), context.clone());
        let undo = UndoLog::new(
            &config.undo,
            gateway,
            Arc::clone(&context.clock),
            Arc::clone(&context.metrics),
        );
        let history = HistoryRecorder::new(&config.history, Arc::clone(&context.clock));

        let inner = Inner {
            queue: PriorityTaskQueue::new(config.queue.capacity),
            active: DashMap::new(),
            history,
            undo,
            cleaner,
            schedules: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            context,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            mailbox,
        )
    }

    /// Shared services this engine runs on
    pub fn context(&self) -> &EngineContext {
        &self.inner.context
    }

    /// Start the dispatch loop and the periodic sweeps
    ///
    /// Calling it again is a no-op; calling it after [`stop`](Self::stop)
    /// fails with `Shutdown`.
    pub fn start(&self) -> Result<(), SweepError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(SweepError::Shutdown("orchestrator has been stopped".into()));
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let config = Arc::clone(&self.inner.context.config);
        let pools = &self.inner.context.pools;
        let mut handles = Vec::new();

        let dispatch = config.dispatch_interval();
        handles.push(pools.schedule_at_fixed_rate(
            self.periodic(|inner| {
                inner.dispatch_once();
            }),
            dispatch,
            dispatch,
        )?);

        let purge = config.metrics_purge_interval();
        handles.push(pools.schedule_at_fixed_rate(
            self.periodic(|inner| {
                inner.context.metrics.purge_expired();
                let expired = inner.undo.purge_expired();
                if expired > 0 {
                    tracing::debug!("Dropped {} expired undo records", expired);
                }
            }),
            purge,
            purge,
        )?);

        handles.push(pools.schedule_at_fixed_rate(
            self.periodic(|inner| {
                inner.history.purge_expired();
            }),
            config.history_initial_delay(),
            config.history_sweep_interval(),
        )?);

        if let Some(limit) = config.task_timeout() {
            let check = Duration::from_secs(config.watchdog.check_interval_secs);
            handles.push(pools.schedule_at_fixed_rate(
                self.periodic(move |inner| inner.watchdog_sweep(limit)),
                check,
                check,
            )?);
            tracing::info!("Watchdog enabled: tasks time out after {:?}", limit);
        }

        self.inner.schedules.lock().extend(handles);
        tracing::info!(
            "Orchestrator started (dispatch every {:?}, queue capacity {})",
            dispatch,
            self.inner.queue.capacity()
        );
        Ok(())
    }

    /// Wrap a periodic job so it does not keep the engine alive
    fn periodic<F>(&self, job: F) -> impl Fn() + Send + Sync + 'static
    where
        F: Fn(&Arc<Inner<W>>) + Send + Sync + 'static,
    {
        let weak: Weak<Inner<W>> = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                job(&inner);
            }
        }
    }

    /// Cancel active work and shut everything down
    ///
    /// Blocks for at most the pools' grace periods; async hosts should call
    /// it through `spawn_blocking`. Idempotent.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Stopping orchestrator");

        for handle in inner.schedules.lock().drain(..) {
            handle.cancel();
        }

        let ids: Vec<TaskId> = inner.active.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if inner.cancel(id) {
                cancelled += 1;
            }
        }
        let dropped = inner.queue.shutdown();
        let graceful = inner.context.pools.shutdown();

        // Bodies that never reported back still owe their submitters a result
        let leftovers: Vec<Arc<TaskExecution>> = inner
            .active
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for execution in leftovers {
            inner.active.remove(&execution.id());
            execution.resolve(TaskResult::failure(
                execution.id(),
                "engine stopped before the task finished",
            ));
        }

        tracing::info!(
            "Orchestrator stopped ({} tasks cancelled, {} dropped from the queue, graceful: {})",
            cancelled,
            dropped,
            graceful
        );
    }

    /// Whether [`stop`](Self::stop) has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Submit a task with an arbitrary payload
    ///
    /// Never fails synchronously: a refused submission gets a ticket that
    /// resolves at once with a failed result, and the task is marked SKIPPED.
    pub fn submit_task(
        &self,
        task_type: impl Into<String>,
        priority: TaskPriority,
        payload: TaskPayload,
    ) -> TaskTicket {
        let inner = &self.inner;
        let task = Task {
            id: TaskId::new(),
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            task_type: task_type.into(),
            priority,
            payload,
            created_at: inner.context.clock.now(),
        };
        let (execution, ticket) = TaskExecution::new(task);
        let execution = Arc::new(execution);
        let id = execution.id();

        let refusal = if inner.stopped.load(Ordering::Acquire) {
            Some(SweepError::Shutdown("orchestrator has been stopped".into()))
        } else {
            inner.active.insert(id, Arc::clone(&execution));
            if inner.queue.enqueue(Arc::clone(&execution)) {
                None
            } else if inner.queue.is_shutdown() {
                Some(SweepError::Shutdown("task queue is shut down".into()))
            } else {
                Some(SweepError::Rejected(format!(
                    "task queue is full ({} tasks)",
                    inner.queue.capacity()
                )))
            }
        };

        match refusal {
            None => tracing::debug!(
                "Submitted task {} ({}, {}, {})",
                id,
                execution.task().task_type,
                priority,
                execution.task().payload.label()
            ),
            Some(reason) => {
                inner.active.remove(&id);
                let _ = execution.transition(TaskStatus::Skipped, inner.context.clock.now());
                tracing::warn!("Task {} not accepted: {}", id, reason);
                execution.resolve(TaskResult::rejected(id, &reason));
            }
        }
        ticket
    }

    /// Submit a cleanup
    pub fn submit_cleaning_task(
        &self,
        task_type: impl Into<String>,
        priority: TaskPriority,
        request: CleaningRequest,
    ) -> TaskTicket {
        self.submit_task(task_type, priority, TaskPayload::Clean(request))
    }

    /// Submit an undo of `target` at CRITICAL priority
    pub fn submit_undo_task(&self, target: TaskId) -> TaskTicket {
        self.submit_task(
            UNDO_TASK_TYPE,
            TaskPriority::Critical,
            TaskPayload::Undo { target },
        )
    }

    /// Cancel a pending, running or paused task
    ///
    /// Returns false when the task is unknown or already finished. A running
    /// body stops at its next unit of work.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        self.inner.cancel(task_id)
    }

    /// Pause a running task; its partial work is kept
    pub fn pause_task(&self, task_id: TaskId) -> bool {
        let Some(execution) = self.inner.execution(task_id) else {
            return false;
        };
        if execution
            .transition(TaskStatus::Paused, self.inner.context.clock.now())
            .is_err()
        {
            return false;
        }
        execution.signal_stop();
        tracing::info!("Task {} paused", task_id);
        true
    }

    /// Put a paused task back in the queue with its original position
    ///
    /// When the paused run has not returned yet, the task goes back in the
    /// queue as soon as it does.
    pub fn resume_task(&self, task_id: TaskId) -> bool {
        let inner = &self.inner;
        let Some(execution) = inner.execution(task_id) else {
            return false;
        };
        if execution
            .transition(TaskStatus::Pending, inner.context.clock.now())
            .is_err()
        {
            return false;
        }
        if execution.defer_requeue() {
            tracing::info!("Task {} resumed, waiting for its paused run to return", task_id);
            return true;
        }
        execution.clear_stop();
        let queued = inner.requeue(&execution);
        if queued {
            tracing::info!("Task {} resumed", task_id);
        }
        queued
    }

    /// Time out a running task
    pub fn timeout_task(&self, task_id: TaskId) -> bool {
        self.inner.timeout(task_id)
    }

    /// Gate the dispatch loop
    pub fn pause_queue(&self) {
        self.inner.queue.pause();
    }

    /// Reopen the dispatch loop
    pub fn resume_queue(&self) {
        self.inner.queue.resume();
    }

    /// Whether the undo record for `task_id` is still restorable
    pub fn can_undo(&self, task_id: TaskId) -> bool {
        self.inner.undo.can_undo(task_id)
    }

    /// Undo the most recent restorable cleanup
    ///
    /// Runs as a CRITICAL undo task and waits at most `undo.wait_secs` for it.
    /// Returns true only when every object was restored.
    pub async fn undo_last_operation(&self) -> bool {
        let Some(target) = self.inner.undo.latest_undoable() else {
            tracing::info!("Nothing to undo");
            return false;
        };
        let wait = self.inner.context.config.undo_wait();
        match tokio::time::timeout(wait, self.submit_undo_task(target)).await {
            Ok(result) => result.success,
            Err(_) => {
                tracing::warn!("Undo of task {} did not finish within {:?}", target, wait);
                false
            }
        }
    }

    /// Undo records, oldest first
    pub fn undo_records(&self) -> Vec<UndoSummary> {
        self.inner.undo.records()
    }

    /// Queue state
    pub fn queue_status(&self) -> QueueStatus {
        self.inner.queue.status()
    }

    /// Pool counters
    pub fn pool_status(&self) -> PoolStatus {
        self.inner.context.pools.status()
    }

    /// Counter table followed by queue and pool state
    pub fn performance_summary(&self) -> String {
        format!(
            "{}\nQueue: {}\nPools: {}\nActive tasks: {}",
            self.inner.context.metrics.performance_summary(),
            self.queue_status(),
            self.pool_status(),
            self.inner.active.len()
        )
    }

    /// Aggregates over every finished task
    pub fn overall_statistics(&self) -> OverallStatistics {
        self.inner.history.overall_statistics()
    }

    /// Aggregates for one task type
    pub fn task_type_statistics(&self, task_type: &str) -> Option<TaskTypeStatistics> {
        self.inner.history.task_type_statistics(task_type)
    }

    /// Aggregates for every task type
    pub fn all_task_type_statistics(&self) -> Vec<TaskTypeStatistics> {
        self.inner.history.all_task_type_statistics()
    }

    /// Up to `n` finished tasks, newest first
    pub fn recent_history(&self, n: usize) -> Vec<HistoryRecord> {
        self.inner.history.recent_history(n)
    }

    /// History record of a finished task
    pub fn task_history(&self, task_id: TaskId) -> Option<HistoryRecord> {
        self.inner.history.task_history(task_id)
    }

    /// Live view of an active task
    pub fn task_view(&self, task_id: TaskId) -> Option<ExecutionView> {
        self.inner.execution(task_id).map(|e| e.view())
    }

    /// Every active task, in submission order
    pub fn active_tasks(&self) -> Vec<ExecutionView> {
        let mut views: Vec<ExecutionView> = self
            .inner
            .active
            .iter()
            .map(|entry| entry.value().view())
            .collect();
        views.sort_by_key(|v| v.sequence);
        views
    }

    /// Running batch operations, one line each
    pub fn processing_summary(&self) -> String {
        self.inner.cleaner.processor().processing_summary()
    }
}

impl<W: WorldAdapter> Inner<W> {
    fn execution(&self, task_id: TaskId) -> Option<Arc<TaskExecution>> {
        self.active.get(&task_id).map(|entry| Arc::clone(entry.value()))
    }

    fn cancel(&self, task_id: TaskId) -> bool {
        let Some(execution) = self.execution(task_id) else {
            return false;
        };
        let Ok(previous) = execution.transition(TaskStatus::Cancelled, self.context.clock.now())
        else {
            return false;
        };
        execution.signal_stop();
        tracing::info!("Task {} cancelled (was {})", task_id, previous);

        // A running body settles the task itself once it notices the switch
        if previous != TaskStatus::Running && !execution.body_in_flight() {
            self.queue.remove_task(task_id);
            self.finish(&execution, TaskResult::cancelled(task_id));
        }
        true
    }

    /// Queue a resumed task again; a refused task ends as SKIPPED
    fn requeue(&self, execution: &Arc<TaskExecution>) -> bool {
        if self.queue.enqueue(Arc::clone(execution)) {
            return true;
        }
        let reason = SweepError::Rejected("task queue refused the resumed task".into());
        if execution
            .transition(TaskStatus::Skipped, self.context.clock.now())
            .is_ok()
        {
            self.finish(execution, TaskResult::rejected(execution.id(), &reason));
        }
        false
    }

    fn timeout(&self, task_id: TaskId) -> bool {
        let Some(execution) = self.execution(task_id) else {
            return false;
        };
        if execution
            .transition(TaskStatus::Timeout, self.context.clock.now())
            .is_err()
        {
            return false;
        }
        execution.signal_stop();
        tracing::warn!("Task {} timed out", task_id);
        true
    }

    fn watchdog_sweep(&self, limit: Duration) {
        let now = self.context.clock.now();
        let limit = crate::clock::to_chrono(limit);
        let overdue: Vec<TaskId> = self
            .active
            .iter()
            .filter_map(|entry| {
                let view = entry.value().view();
                let started = view.started_at?;
                (view.status == TaskStatus::Running && now - started >= limit)
                    .then_some(view.task_id)
            })
            .collect();
        for task_id in overdue {
            self.timeout(task_id);
        }
    }

    /// Move at most one queued task onto the compute pool
    fn dispatch_once(self: &Arc<Self>) -> bool {
        let Some(execution) = self.queue.dequeue() else {
            return false;
        };
        if execution
            .transition(TaskStatus::Running, self.context.clock.now())
            .is_err()
        {
            // Cancelled between dequeue and dispatch
            return false;
        }
        let attempt = execution.begin_attempt();
        tracing::debug!(
            "Dispatching task {} (attempt {}, {})",
            execution.id(),
            attempt,
            execution.task().task_type
        );

        execution.body_started();
        let inner = Arc::clone(self);
        let running = Arc::clone(&execution);
        let handle = self.context.pools.spawn_compute(async move {
            let outcome = AssertUnwindSafe(inner.run_body(&running))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(SweepError::Worker("task body panicked".into())));
            inner.complete(&running, attempt, outcome);
        });
        if let Some(reason) = handle.refusal() {
            // The body never ran; settle the task here
            self.complete(&execution, attempt, Err(reason.clone()));
            return false;
        }
        true
    }

    async fn run_body(&self, execution: &TaskExecution) -> Result<TaskResult, SweepError> {
        let task_id = execution.id();
        match &execution.task().payload {
            TaskPayload::Clean(request) => {
                let mut outcome = self
                    .cleaner
                    .clean(request, execution.kill_switch())
                    .await?;
                execution.append_snapshots(std::mem::take(&mut outcome.snapshots));
                let partitions = outcome.batch.results.len() as u64;
                execution.update_progress(partitions, partitions);
                Ok(outcome.to_result(task_id))
            }
            TaskPayload::Undo { target } => {
                let undone = self.undo.undo(*target).await?;
                let result = if undone.successful {
                    TaskResult::success(
                        task_id,
                        format!("Restored {} objects of task {}", undone.restored_count, target),
                    )
                } else {
                    TaskResult::failure(
                        task_id,
                        undone
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "some objects could not be restored".into()),
                    )
                };
                Ok(result
                    .with_counts(undone.restored_count as u64, undone.failed_count as u64)
                    .with_statistic("undone_task", target.to_string()))
            }
        }
    }

    /// Settle an execution whose body returned
    fn complete(
        &self,
        execution: &Arc<TaskExecution>,
        attempt: u32,
        outcome: Result<TaskResult, SweepError>,
    ) {
        let task_id = execution.id();
        if execution.current_attempt() != attempt {
            // A newer run owns the task now
            return;
        }

        let (to, result) = match outcome {
            Ok(result) if result.success => (TaskStatus::Completed, result),
            Ok(result) => (TaskStatus::Failed, result),
            Err(e) => (TaskStatus::Failed, TaskResult::failure(task_id, e.to_string())),
        };

        if execution.transition(to, self.context.clock.now()).is_ok() {
            execution.body_returned();
            if to == TaskStatus::Failed {
                let reason = result.error.clone().unwrap_or_else(|| result.message.clone());
                tracing::error!("Task {} failed: {}", task_id, reason);
                execution.set_error(reason);
            }
            self.finish(execution, result);
            return;
        }

        // Interrupted: the partial work counts toward whatever comes next
        execution.carry_counts(result.processed_items, result.failed_items);
        let requeue = execution.body_returned();

        match execution.status() {
            TaskStatus::Paused => tracing::debug!(
                "Task {} paused with {} snapshots kept",
                task_id,
                execution.view().snapshot_count
            ),
            TaskStatus::Pending if requeue => {
                execution.clear_stop();
                if self.requeue(execution) {
                    tracing::debug!("Task {} requeued after its paused run returned", task_id);
                }
            }
            // Resumed after the run returned; the resumer requeues
            TaskStatus::Pending => {}
            TaskStatus::Cancelled => self.finish(execution, TaskResult::cancelled(task_id)),
            TaskStatus::Timeout => self.finish(execution, TaskResult::timeout(task_id)),
            other => tracing::warn!("Task {} returned in unexpected state {}", task_id, other),
        }
    }

    /// Record, account and deliver a terminal result
    ///
    /// Only the first call for an execution has any effect.
    fn finish(&self, execution: &Arc<TaskExecution>, result: TaskResult) {
        let task_id = execution.id();
        if !execution.mark_finished() {
            tracing::debug!("Task {} already settled", task_id);
            return;
        }
        let view = execution.view();
        let duration_ms = if result.duration_ms > 0 {
            result.duration_ms
        } else {
            view.duration_ms()
        };
        let (carried_processed, carried_failed) = execution.take_carried();
        let processed = result.processed_items + carried_processed;
        let failed = result.failed_items + carried_failed;
        let result = result
            .with_counts(processed, failed)
            .with_duration(duration_ms)
            .completed_at(view.ended_at.unwrap_or_else(|| self.context.clock.now()));

        let snapshots = execution.take_snapshots();
        if result.success && !snapshots.is_empty() {
            let description = format!("{} removed {} objects", view.task_type, snapshots.len());
            self.undo.record(task_id, snapshots, description);
        } else if !snapshots.is_empty() {
            tracing::warn!(
                "Task {} ended as {}; {} removed objects cannot be undone",
                task_id,
                view.status,
                snapshots.len()
            );
        }
        self.history.record_task(&view, &result);

        self.context.metrics.increment(names::TASKS_EXECUTED);
        if !result.success {
            self.context.metrics.increment(names::TASKS_FAILED);
        }

        self.active.remove(&task_id);
        tracing::info!(
            "Task {} finished as {} in {} ms: {}",
            task_id,
            view.status,
            duration_ms,
            result.message
        );
        execution.resolve(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::MemoryWorld;
    use sweeper_domain::{ObjectKind, PartitionId};

    fn engine(world: Arc<MemoryWorld>) -> (TaskOrchestrator<MemoryWorld>, std::thread::JoinHandle<()>) {
        let mut config = EngineConfig::default();
        config.queue.dispatch_interval_ms = 10;
        config.pool.compute_threads = 2;
        config.pool.shutdown_grace_secs = 2;
        config.pool.timer_shutdown_grace_secs = 1;
        let context = EngineContext::new(config).unwrap();
        let (engine, mailbox) = TaskOrchestrator::new(context, world);
        let authority = mailbox.spawn_dedicated("test-authority").unwrap();
        (engine, authority)
    }

    fn request() -> CleaningRequest {
        CleaningRequest::in_partitions(vec![PartitionId::new(0, 0)])
    }

    #[tokio::test]
    async fn test_cleanup_records_history_and_undo() {
        let world = Arc::new(MemoryWorld::new());
        world.add(PartitionId::new(0, 0), ObjectKind::Item, 5, 7000);
        let (engine, _authority) = engine(Arc::clone(&world));
        engine.start().unwrap();

        let ticket = engine.submit_cleaning_task("MANUAL_CLEAN", TaskPriority::Normal, request());
        let id = ticket.task_id();
        let result = ticket.await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.processed_items, 5);
        assert_eq!(world.total(), 0);
        assert!(engine.can_undo(id));
        assert!(engine.task_view(id).is_none());
        assert_eq!(engine.task_history(id).unwrap().processed_items, 5);
        assert_eq!(engine.overall_statistics().successful_tasks, 1);
        assert_eq!(engine.context().metrics.get(names::TASKS_EXECUTED), 1);

        assert!(engine.undo_last_operation().await);
        assert_eq!(world.total(), 5);
        assert!(!engine.can_undo(id));
        assert_eq!(
            engine.task_type_statistics(UNDO_TASK_TYPE).unwrap().successes,
            1
        );

        tokio::task::spawn_blocking(move || engine.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_submission_resolves_immediately() {
        let world = Arc::new(MemoryWorld::new());
        let (engine, _authority) = engine(world);
        let engine_for_stop = engine.clone();
        tokio::task::spawn_blocking(move || engine_for_stop.stop())
            .await
            .unwrap();
        assert!(engine.is_stopped());
        assert!(engine.start().is_err());

        let result = engine
            .submit_cleaning_task("LATE", TaskPriority::High, request())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("stopped"));
        assert!(engine.active_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_undo_of_unknown_task_fails() {
        let world = Arc::new(MemoryWorld::new());
        let (engine, _authority) = engine(world);
        engine.start().unwrap();

        let missing = TaskId::new();
        let result = engine.submit_undo_task(missing).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("No undo record"));
        assert!(!engine.undo_last_operation().await);

        tokio::task::spawn_blocking(move || engine.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_dispatch_fails_the_task() {
        let world = Arc::new(MemoryWorld::new());
        world.add(PartitionId::new(0, 0), ObjectKind::Item, 3, 7000);
        let (engine, _authority) = engine(Arc::clone(&world));

        let ticket = engine.submit_cleaning_task("REFUSED", TaskPriority::Normal, request());
        let id = ticket.task_id();
        engine.context().pools.shutdown_now();

        assert!(!engine.inner.dispatch_once());
        let result = ticket.await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("shut down"));
        let record = engine.task_history(id).unwrap();
        assert!(!record.successful);
        assert_eq!(world.total(), 3);
        // Failed tasks still count as executed
        assert_eq!(engine.context().metrics.get(names::TASKS_EXECUTED), 1);
        assert_eq!(engine.context().metrics.get(names::TASKS_FAILED), 1);
        assert!(engine.active_tasks().is_empty());

        tokio::task::spawn_blocking(move || engine.stop()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_tasks() {
        let world = Arc::new(MemoryWorld::new());
        let (engine, _authority) = engine(world);

        let ticket = engine.submit_cleaning_task("QUEUED", TaskPriority::Low, request());
        assert_eq!(engine.active_tasks().len(), 1);
        let stopper = engine.clone();
        tokio::task::spawn_blocking(move || stopper.stop()).await.unwrap();

        let result = ticket.await;
        assert!(!result.success);
        assert!(result.message.contains("cancelled"));
        assert!(engine.active_tasks().is_empty());
        assert_eq!(engine.queue_status().size, 0);
    }
}
