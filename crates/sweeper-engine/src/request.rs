//! What a task is asked to do

use serde::{Deserialize, Serialize};
use sweeper_domain::{CleaningStrategy, ObjectKind, ObjectQuery, PartitionId, Position, TaskId};

/// Region a cleanup covers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CleaningScope {
    /// Every loaded partition intersecting `center ± radius`
    Radius {
        /// Center of the sweep
        center: Position,
        /// Half-width of the swept square
        radius: f64,
    },
    /// An explicit list of partitions
    Partitions {
        /// Partitions to process
        partitions: Vec<PartitionId>,
    },
}

/// Parameters of a cleanup task
///
/// # Examples
///
/// ```
/// use sweeper_domain::Position;
/// use sweeper_engine::CleaningRequest;
///
/// let request = CleaningRequest::around(Position::new(0.0, 64.0, 0.0), 48.0).with_actors(true);
/// assert!(request.clean_items && request.clean_actors);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleaningRequest {
    /// Remove dropped items
    pub clean_items: bool,

    /// Cull overcrowded actors
    pub clean_actors: bool,

    /// Region to process
    pub scope: CleaningScope,

    /// Overrides the configured per-kind strategies for this request
    #[serde(default)]
    pub strategy: Option<CleaningStrategy>,
}

impl CleaningRequest {
    /// Item cleanup around a point
    pub fn around(center: Position, radius: f64) -> Self {
        Self {
            clean_items: true,
            clean_actors: false,
            scope: CleaningScope::Radius { center, radius },
            strategy: None,
        }
    }

    /// Item cleanup of explicit partitions
    pub fn in_partitions(partitions: Vec<PartitionId>) -> Self {
        Self {
            clean_items: true,
            clean_actors: false,
            scope: CleaningScope::Partitions { partitions },
            strategy: None,
        }
    }

    /// Toggle item cleanup
    pub fn with_items(mut self, enabled: bool) -> Self {
        self.clean_items = enabled;
        self
    }

    /// Toggle actor cleanup
    pub fn with_actors(mut self, enabled: bool) -> Self {
        self.clean_actors = enabled;
        self
    }

    /// Use `strategy` instead of the configured ones
    pub fn with_strategy(mut self, strategy: CleaningStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Object kinds this request lists from the world
    pub fn query(&self) -> ObjectQuery {
        let mut kinds = Vec::new();
        if self.clean_items {
            kinds.push(ObjectKind::Item);
        }
        if self.clean_actors {
            kinds.push(ObjectKind::Actor);
        }
        ObjectQuery { kinds }
    }
}

/// Work carried by a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Remove objects from the world
    Clean(CleaningRequest),
    /// Restore the objects a previous task removed
    Undo {
        /// Task whose removals are reverted
        target: TaskId,
    },
}

impl TaskPayload {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            TaskPayload::Clean(_) => "clean",
            TaskPayload::Undo { .. } => "undo",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_follows_flags() {
        let request = CleaningRequest::around(Position::default(), 16.0);
        assert_eq!(request.query(), ObjectQuery::only(ObjectKind::Item));

        let request = request.with_items(false).with_actors(true);
        assert_eq!(request.query(), ObjectQuery::only(ObjectKind::Actor));

        assert!(request.with_actors(false).query().is_empty());
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = TaskPayload::Clean(CleaningRequest::in_partitions(vec![PartitionId::new(1, 2)]));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "clean");
        assert_eq!(json["scope"]["kind"], "partitions");

        let back: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
