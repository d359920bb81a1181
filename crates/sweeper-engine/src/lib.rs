//! Sweeper Engine
//!
//! Background cleanup scheduler for a live, tick-driven world.
//!
//! # Overview
//!
//! The engine removes excess world objects without blocking the world's own
//! update loop:
//! - **Scheduling**: A bounded priority queue feeds a dispatch loop that runs
//!   task bodies on dedicated worker pools
//! - **Batching**: Range cleanups are split into spatial partitions, densest
//!   first, with bounded parallelism and per-partition failure isolation
//! - **Single writer**: Every removal and respawn is marshaled to the world's
//!   authoritative context through a [`WorldGateway`]
//! - **Undo**: Removed objects are snapshotted and can be restored for a
//!   limited time
//! - **Accounting**: Task history, per-type statistics and rate counters
//!
//! # Task Lifecycle
//!
//! | From | To |
//! |------|----|
//! | PENDING | RUNNING, CANCELLED, SKIPPED |
//! | RUNNING | COMPLETED, FAILED, TIMEOUT, PAUSED, CANCELLED |
//! | PAUSED | PENDING (resume), CANCELLED |
//!
//! Cancellation is cooperative: a running body stops at its next partition
//! or object.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use sweeper_domain::{Position, TaskPriority, WorldAdapter};
//! use sweeper_engine::{CleaningRequest, EngineConfig, EngineContext, TaskOrchestrator};
//!
//! # async fn run<W: WorldAdapter>(world: Arc<W>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_file("sweeper.toml")?;
//! let (engine, mut mailbox) = TaskOrchestrator::new(EngineContext::new(config)?, world);
//! engine.start()?;
//!
//! let ticket = engine.submit_cleaning_task(
//!     "SCHEDULED_CLEAN",
//!     TaskPriority::Normal,
//!     CleaningRequest::around(Position::new(0.0, 64.0, 0.0), 96.0).with_actors(true),
//! );
//!
//! // Inside the world's tick loop:
//! mailbox.drain_pending();
//!
//! let result = ticket.await;
//! println!("{} ({} objects)", result.message, result.processed_items);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```toml
//! [queue]
//! capacity = 1000
//! dispatch_interval_ms = 100
//!
//! [undo]
//! capacity = 10
//! timeout_minutes = 5
//!
//! [cleaning.items]
//! min_age_ticks = 6000
//! keep_types = ["diamond", "netherite_ingot"]
//!
//! [cleaning.actors]
//! enabled = true
//! density_threshold = 10
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod authority;
pub mod batch;
pub mod cleaner;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod queue;
pub mod request;
pub mod undo;

#[cfg(test)]
mod testing;

pub use authority::{WorldGateway, WorldMailbox};
pub use batch::{BatchOutcome, PartitionResult, PartitionVisitor, SpatialBatchProcessor};
pub use cleaner::{Cleaner, CleaningOutcome};
pub use config::{ConfigError, EngineConfig};
pub use context::EngineContext;
pub use error::SweepError;
pub use execution::{ExecutionView, TaskResult, TaskTicket};
pub use history::{HistoryRecord, OverallStatistics, TaskTypeStatistics};
pub use metrics::MetricCounters;
pub use orchestrator::TaskOrchestrator;
pub use pool::WorkerPoolManager;
pub use queue::PriorityTaskQueue;
pub use request::{CleaningRequest, CleaningScope, TaskPayload};
pub use undo::{UndoLog, UndoResult};
