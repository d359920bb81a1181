//! Error types for engine operations

use sweeper_domain::{TaskId, TaskStatus};
use thiserror::Error;

/// Errors that can occur while scheduling or executing cleanup work
///
/// Partial failures (some partitions or objects failing inside an otherwise
/// successful batch) are not errors; they are reported through result
/// statistics.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SweepError {
    /// Submission refused because a queue or pool is full
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Submission after shutdown
    #[error("Shut down: {0}")]
    Shutdown(String),

    /// The task was cancelled before it finished
    #[error("Task {0} was cancelled")]
    Cancelled(TaskId),

    /// The task exceeded its time budget
    #[error("Task {0} timed out")]
    Timeout(TaskId),

    /// No undo record exists for the task
    #[error("No undo record for task {0}")]
    UndoNotFound(TaskId),

    /// The undo record is past its restore window
    #[error("Undo record for task {0} has expired")]
    UndoExpired(TaskId),

    /// Capturing or restoring object state failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The world adapter reported an error
    #[error("World error: {0}")]
    World(String),

    /// Illegal lifecycle transition
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// Task whose transition was refused
        task_id: TaskId,
        /// Current state
        from: TaskStatus,
        /// Requested state
        to: TaskStatus,
    },

    /// A worker panicked or was torn down mid-task
    #[error("Worker error: {0}")]
    Worker(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SweepError {
    /// Whether retrying later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SweepError::Rejected(_) | SweepError::World(_))
    }
}
