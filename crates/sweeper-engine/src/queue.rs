//! Bounded priority queue of pending executions
//!
//! Ordering is priority descending, then submission sequence ascending.
//! Capacity is reserved with a compare-and-swap on an atomic size counter, so
//! the capacity check never takes the heap lock; the lock is held only for the
//! push or pop itself.

use crate::execution::TaskExecution;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use sweeper_domain::{TaskId, TaskPriority, TaskStatus};

struct QueuedTask(Arc<TaskExecution>);

impl QueuedTask {
    fn key(&self) -> (TaskPriority, u64) {
        (self.0.priority(), self.0.sequence())
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority first, then lower sequence first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        let (priority, sequence) = self.key();
        let (other_priority, other_sequence) = other.key();
        priority
            .cmp(&other_priority)
            .then_with(|| other_sequence.cmp(&sequence))
    }
}

/// Point-in-time view of the queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Queued tasks
    pub size: usize,
    /// Maximum queued tasks
    pub capacity: usize,
    /// Whether dequeue is gated
    pub paused: bool,
    /// Whether the queue has been shut down
    pub shutdown: bool,
    /// Queued tasks per priority band
    pub by_priority: BTreeMap<TaskPriority, usize>,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Queue: {}/{} tasks, paused: {}, shutdown: {}",
            self.size, self.capacity, self.paused, self.shutdown
        )?;
        for (priority, count) in self.by_priority.iter().rev() {
            write!(f, ", {}: {}", priority, count)?;
        }
        Ok(())
    }
}

/// Bounded, pausable priority queue
pub struct PriorityTaskQueue {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    size: AtomicUsize,
    capacity: usize,
    paused: AtomicBool,
    shutdown: AtomicBool,
}

impl PriorityTaskQueue {
    /// Create an empty queue holding at most `capacity` tasks
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            size: AtomicUsize::new(0),
            capacity,
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Add a PENDING execution; false when full, shut down, or not PENDING
    pub fn enqueue(&self, execution: Arc<TaskExecution>) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::warn!("Queue is shut down, rejecting task {}", execution.id());
            return false;
        }
        let status = execution.status();
        if status != TaskStatus::Pending {
            tracing::warn!(
                "Rejecting task {} with status {}, only PENDING tasks are queued",
                execution.id(),
                status
            );
            return false;
        }

        let reserved = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                (size < self.capacity).then_some(size + 1)
            });
        if reserved.is_err() {
            tracing::warn!(
                "Queue full ({} tasks), rejecting task {}",
                self.capacity,
                execution.id()
            );
            return false;
        }

        tracing::debug!(
            "Queued task {} ({}, sequence {})",
            execution.id(),
            execution.priority(),
            execution.sequence()
        );
        self.heap.lock().push(QueuedTask(execution));
        true
    }

    /// Pop the highest priority PENDING execution
    ///
    /// Returns `None` while paused or shut down. Entries whose status changed
    /// since they were queued (cancelled, for example) are discarded.
    pub fn dequeue(&self) -> Option<Arc<TaskExecution>> {
        if self.paused.load(Ordering::Acquire) || self.shutdown.load(Ordering::Acquire) {
            return None;
        }

        let mut heap = self.heap.lock();
        while let Some(QueuedTask(execution)) = heap.pop() {
            self.size.fetch_sub(1, Ordering::AcqRel);
            let status = execution.status();
            if status == TaskStatus::Pending {
                return Some(execution);
            }
            tracing::debug!("Skipping task {} with status {}", execution.id(), status);
        }
        None
    }

    /// Id of the next task without removing it
    pub fn peek(&self) -> Option<TaskId> {
        self.heap.lock().peek().map(|queued| queued.0.id())
    }

    /// Drop a queued task; true if it was present
    pub fn remove_task(&self, task_id: TaskId) -> bool {
        let mut heap = self.heap.lock();
        let before = heap.len();
        heap.retain(|queued| queued.0.id() != task_id);
        let removed = before - heap.len();
        if removed > 0 {
            self.size.fetch_sub(removed, Ordering::AcqRel);
        }
        removed > 0
    }

    /// Drop every queued task; returns how many were dropped
    pub fn clear(&self) -> usize {
        let mut heap = self.heap.lock();
        let dropped = heap.len();
        heap.clear();
        self.size.fetch_sub(dropped, Ordering::AcqRel);
        dropped
    }

    /// Gate dequeue; enqueue keeps working
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            tracing::info!("Task queue paused");
        }
    }

    /// Lift the dequeue gate
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            tracing::info!("Task queue resumed");
        }
    }

    /// Whether dequeue is gated
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Reject all further work and drop what is queued
    pub fn shutdown(&self) -> usize {
        self.shutdown.store(true, Ordering::Release);
        let dropped = self.clear();
        tracing::info!("Task queue shut down ({} queued tasks dropped)", dropped);
        dropped
    }

    /// Whether the queue has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Queued tasks
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Maximum queued tasks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued tasks per priority band
    pub fn priority_stats(&self) -> BTreeMap<TaskPriority, usize> {
        let mut stats: BTreeMap<TaskPriority, usize> =
            TaskPriority::ALL.iter().map(|p| (*p, 0)).collect();
        for queued in self.heap.lock().iter() {
            *stats.entry(queued.0.priority()).or_insert(0) += 1;
        }
        stats
    }

    /// Point-in-time view
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            size: self.size(),
            capacity: self.capacity,
            paused: self.is_paused(),
            shutdown: self.is_shutdown(),
            by_priority: self.priority_stats(),
        }
    }
}

impl fmt::Debug for PriorityTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PriorityTaskQueue({})", self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Task, TaskTicket};
    use crate::request::{CleaningRequest, TaskPayload};
    use chrono::Utc;
    use proptest::prelude::*;
    use sweeper_domain::Position;

    fn make(priority: TaskPriority, sequence: u64) -> (Arc<TaskExecution>, TaskTicket) {
        let (execution, ticket) = TaskExecution::new(Task {
            id: TaskId::new(),
            sequence,
            task_type: "TEST".to_string(),
            priority,
            payload: TaskPayload::Clean(CleaningRequest::around(Position::default(), 8.0)),
            created_at: Utc::now(),
        });
        (Arc::new(execution), ticket)
    }

    #[test]
    fn test_priority_then_fifo() {
        let queue = PriorityTaskQueue::new(10);
        let (low, _t1) = make(TaskPriority::Low, 1);
        let (critical, _t2) = make(TaskPriority::Critical, 2);
        let (normal_a, _t3) = make(TaskPriority::Normal, 3);
        let (normal_b, _t4) = make(TaskPriority::Normal, 4);

        for e in [&low, &critical, &normal_b, &normal_a] {
            assert!(queue.enqueue(Arc::clone(e)));
        }
        assert_eq!(queue.peek(), Some(critical.id()));

        let order: Vec<TaskId> = std::iter::from_fn(|| queue.dequeue()).map(|e| e.id()).collect();
        assert_eq!(order, vec![critical.id(), normal_a.id(), normal_b.id(), low.id()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_bound() {
        let queue = PriorityTaskQueue::new(2);
        let tasks: Vec<_> = (0..3).map(|i| make(TaskPriority::Normal, i)).collect();
        assert!(queue.enqueue(Arc::clone(&tasks[0].0)));
        assert!(queue.enqueue(Arc::clone(&tasks[1].0)));
        assert!(!queue.enqueue(Arc::clone(&tasks[2].0)));
        assert_eq!(queue.size(), 2);

        queue.dequeue();
        assert!(queue.enqueue(Arc::clone(&tasks[2].0)));
    }

    #[test]
    fn test_rejects_non_pending() {
        let queue = PriorityTaskQueue::new(4);
        let (exec, _ticket) = make(TaskPriority::High, 1);
        exec.transition(TaskStatus::Running, Utc::now()).unwrap();
        assert!(!queue.enqueue(exec));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_skips_cancelled() {
        let queue = PriorityTaskQueue::new(4);
        let (cancelled, _t1) = make(TaskPriority::Critical, 1);
        let (normal, _t2) = make(TaskPriority::Normal, 2);
        queue.enqueue(Arc::clone(&cancelled));
        queue.enqueue(Arc::clone(&normal));

        cancelled.transition(TaskStatus::Cancelled, Utc::now()).unwrap();
        assert_eq!(queue.dequeue().map(|e| e.id()), Some(normal.id()));
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_pause_gates_dequeue_only() {
        let queue = PriorityTaskQueue::new(4);
        queue.pause();
        let (exec, _ticket) = make(TaskPriority::Low, 1);
        assert!(queue.enqueue(Arc::clone(&exec)));
        assert!(queue.dequeue().is_none());
        queue.resume();
        assert_eq!(queue.dequeue().map(|e| e.id()), Some(exec.id()));
    }

    #[test]
    fn test_remove_clear_shutdown() {
        let queue = PriorityTaskQueue::new(8);
        let (a, _t1) = make(TaskPriority::Low, 1);
        let (b, _t2) = make(TaskPriority::High, 2);
        let (c, _t3) = make(TaskPriority::High, 3);
        queue.enqueue(Arc::clone(&a));
        queue.enqueue(Arc::clone(&b));
        queue.enqueue(Arc::clone(&c));

        assert!(queue.remove_task(b.id()));
        assert!(!queue.remove_task(b.id()));
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.priority_stats()[&TaskPriority::High], 1);

        assert_eq!(queue.shutdown(), 2);
        assert!(queue.is_empty());
        let (d, _t4) = make(TaskPriority::Critical, 4);
        assert!(!queue.enqueue(d));
        assert!(queue.dequeue().is_none());
        assert!(queue.status().to_string().contains("shutdown: true"));
    }

    #[test]
    fn test_concurrent_enqueue_respects_capacity() {
        let queue = Arc::new(PriorityTaskQueue::new(50));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut accepted = 0;
                    for i in 0..40 {
                        let (exec, _ticket) = make(TaskPriority::Normal, worker * 100 + i);
                        if queue.enqueue(exec) {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 50);
        assert_eq!(queue.size(), 50);
    }

    fn priority_strategy() -> impl Strategy<Value = TaskPriority> {
        prop::sample::select(TaskPriority::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_dequeue_order_is_priority_then_sequence(
            priorities in prop::collection::vec(priority_strategy(), 1..40)
        ) {
            let queue = PriorityTaskQueue::new(100);
            let mut tickets = Vec::new();
            for (sequence, priority) in priorities.iter().enumerate() {
                let (exec, ticket) = make(*priority, sequence as u64);
                tickets.push(ticket);
                prop_assert!(queue.enqueue(exec));
            }

            let drained: Vec<(TaskPriority, u64)> = std::iter::from_fn(|| queue.dequeue())
                .map(|e| (e.priority(), e.sequence()))
                .collect();
            prop_assert_eq!(drained.len(), priorities.len());
            for pair in drained.windows(2) {
                let (p1, s1) = pair[0];
                let (p2, s2) = pair[1];
                prop_assert!(p1 > p2 || (p1 == p2 && s1 < s2));
            }
        }
    }
}
