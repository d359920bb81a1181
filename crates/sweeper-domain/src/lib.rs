//! Sweeper Domain Layer
//!
//! Core vocabulary for the background cleanup engine. This crate carries no
//! async runtime and no I/O: it defines the values and trait seams that the
//! engine and any host world implementation agree on.
//!
//! ## Key Concepts
//!
//! - **Task**: A unit of cleanup work identified by a [`TaskId`], ordered by
//!   [`TaskPriority`] and tracked through the [`TaskStatus`] state machine
//! - **Partition**: A fixed-size spatial cell of the world ([`PartitionId`])
//! - **Object**: Anything the world can remove and later respawn ([`ObjectRef`])
//! - **Snapshot**: The serialized state captured before removal ([`ObjectSnapshot`])
//! - **Strategy / Filter**: Pure selection rules deciding which objects go
//!
//! ## Architecture
//!
//! - Pure domain logic only, no runtime dependencies
//! - The host world is reached exclusively through [`traits::WorldAdapter`]
//! - Mutation is never performed here; the engine marshals it to the world's
//!   authoritative context

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod filter;
pub mod strategy;
pub mod task;
pub mod traits;
pub mod world;

// Re-exports for convenience
pub use filter::{ActorDensityFilter, ItemFilter};
pub use strategy::CleaningStrategy;
pub use task::{TaskId, TaskPriority, TaskStatus};
pub use traits::WorldAdapter;
pub use world::{
    ObjectId, ObjectKind, ObjectQuery, ObjectRef, ObjectSnapshot, PartitionId, Position,
};
