//! Trait definitions for the host world
//!
//! The engine never touches world internals directly. Reads may be issued
//! from any worker thread; `remove_object` and `deserialize_and_spawn` are
//! only ever called from the world's authoritative context.

use crate::{ObjectQuery, ObjectRef, ObjectSnapshot, PartitionId, Position};

/// Boundary between the cleanup engine and a concrete world
///
/// Implemented by the host (a game server, a simulation, a test double).
pub trait WorldAdapter: Send + Sync + 'static {
    /// Error type for world operations
    type Error: std::fmt::Display + Send + 'static;

    /// Loaded partitions intersecting `center ± radius`
    ///
    /// Unloaded partitions must not be returned.
    fn enumerate_partitions(
        &self,
        center: Position,
        radius: f64,
    ) -> Result<Vec<PartitionId>, Self::Error>;

    /// Number of removable objects currently in a partition
    fn count_objects_in(&self, partition: PartitionId) -> Result<usize, Self::Error>;

    /// Objects in a partition matching `query`
    fn list_objects_in(
        &self,
        partition: PartitionId,
        query: &ObjectQuery,
    ) -> Result<Vec<ObjectRef>, Self::Error>;

    /// Remove an object; `Ok(false)` when it no longer exists
    fn remove_object(&self, object: &ObjectRef) -> Result<bool, Self::Error>;

    /// Capture the state needed to respawn an object later
    fn serialize(&self, object: &ObjectRef) -> Result<ObjectSnapshot, Self::Error>;

    /// Respawn an object from a snapshot
    fn deserialize_and_spawn(&self, snapshot: &ObjectSnapshot) -> Result<ObjectRef, Self::Error>;
}
