//! Task identity, priority bands, and the lifecycle state machine

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Unique identifier for a task based on UUIDv7
///
/// UUIDv7 ids sort chronologically, so two ids generated by the same process
/// compare in creation order (down to the millisecond).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u128);

impl TaskId {
    /// Generate a new UUIDv7-based TaskId
    ///
    /// # Examples
    ///
    /// ```
    /// use sweeper_domain::TaskId;
    ///
    /// let id = TaskId::new();
    /// assert!(id.value() > 0);
    /// ```
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().as_u128())
    }

    /// Create a TaskId from a raw u128 value
    pub fn from_value(value: u128) -> Self {
        Self(value)
    }

    /// Parse a TaskId from its hyphenated string form
    ///
    /// # Examples
    ///
    /// ```
    /// use sweeper_domain::TaskId;
    ///
    /// let id = TaskId::new();
    /// let parsed = TaskId::from_string(&id.to_string()).unwrap();
    /// assert_eq!(id, parsed);
    /// ```
    pub fn from_string(s: &str) -> Result<Self, String> {
        uuid::Uuid::parse_str(s)
            .map(|u| Self(u.as_u128()))
            .map_err(|e| format!("Invalid task id: {}", e))
    }

    /// Get the raw u128 value
    pub fn value(&self) -> u128 {
        self.0
    }

    /// Milliseconds since the Unix epoch encoded in the id
    pub fn timestamp(&self) -> u64 {
        (self.0 >> 80) as u64
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_u128(self.0))
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_string(&raw).map_err(serde::de::Error::custom)
    }
}

/// Priority band of a task
///
/// Higher bands are always dispatched before lower ones; within a band tasks
/// run in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    /// Housekeeping that can wait
    Low,

    /// Regular scheduled cleanups
    Normal,

    /// Operator-requested cleanups
    High,

    /// Emergency work such as undo
    Critical,
}

impl TaskPriority {
    /// All bands from lowest to highest
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Low,
        TaskPriority::Normal,
        TaskPriority::High,
        TaskPriority::Critical,
    ];

    /// Numeric level (1 = low, 4 = critical)
    pub fn level(&self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Normal => 2,
            TaskPriority::High => 3,
            TaskPriority::Critical => 4,
        }
    }

    /// Get the priority name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    /// Parse a priority from its name or numeric level
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" | "1" => Some(TaskPriority::Low),
            "normal" | "2" => Some(TaskPriority::Normal),
            "high" | "3" => Some(TaskPriority::High),
            "critical" | "4" => Some(TaskPriority::Critical),
            _ => None,
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Invalid priority: {}", s))
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task execution
///
/// ```text
/// PENDING -> RUNNING -> COMPLETED | FAILED | TIMEOUT
/// RUNNING -> PAUSED -> PENDING
/// PENDING | RUNNING | PAUSED -> CANCELLED
/// PENDING -> SKIPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting in the queue
    Pending,

    /// Executing on a worker
    Running,

    /// Interrupted by an operator, resumable
    Paused,

    /// Finished successfully
    Completed,

    /// Finished with an error
    Failed,

    /// Cancelled before finishing
    Cancelled,

    /// Exceeded its time budget
    Timeout,

    /// Never admitted to the queue
    Skipped,
}

impl TaskStatus {
    /// Get the status name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::Skipped => "SKIPPED",
        }
    }

    /// Terminal states never change again
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Timeout
                | TaskStatus::Skipped
        )
    }

    /// Pending, running or paused
    pub fn is_active(&self) -> bool {
        !self.is_finished()
    }

    /// Whether `cancel` is allowed from this state
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Paused
        )
    }

    /// Whether `resume` is allowed from this state
    pub fn is_resumable(&self) -> bool {
        matches!(self, TaskStatus::Paused)
    }

    /// Failed or timed out
    pub fn has_failed(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Timeout)
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Paused, Pending)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATUSES: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Timeout,
        TaskStatus::Skipped,
    ];

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::Low.level(), 1);
        assert_eq!(TaskPriority::Critical.level(), 4);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<TaskPriority>(), Ok(TaskPriority::High));
        assert_eq!(TaskPriority::parse("2"), Some(TaskPriority::Normal));
        assert!("urgent".parse::<TaskPriority>().is_err());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL_STATUSES.iter().filter(|s| s.is_finished()) {
            for to in ALL_STATUSES {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_pause_resume_cycle() {
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Paused.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Paused));
    }

    #[test]
    fn test_cancellable_matches_transitions() {
        for status in ALL_STATUSES {
            assert_eq!(
                status.is_cancellable(),
                status.can_transition_to(TaskStatus::Cancelled)
            );
        }
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&TaskStatus::Timeout).unwrap();
        assert_eq!(json, "\"TIMEOUT\"");
        let back: TaskPriority = serde_json::from_str("\"CRITICAL\"").unwrap();
        assert_eq!(back, TaskPriority::Critical);
    }

    #[test]
    fn test_task_id_serializes_as_string() {
        let id = TaskId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    proptest! {
        #[test]
        fn prop_task_id_string_roundtrip(raw in any::<u128>()) {
            let id = TaskId::from_value(raw);
            prop_assert_eq!(TaskId::from_string(&id.to_string()).unwrap(), id);
        }
    }

    #[test]
    fn test_task_ids_are_chronological() {
        let first = TaskId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = TaskId::new();
        assert!(second > first);
        assert!(second.timestamp() >= first.timestamp());
    }
}
