//! Shared engine services, built once and handed to every component

use crate::clock::{SystemTimeProvider, TimeProvider};
use crate::config::EngineConfig;
use crate::error::SweepError;
use crate::metrics::MetricCounters;
use crate::pool::WorkerPoolManager;
use std::sync::Arc;
use std::time::Duration;

/// Configuration, clock, counters and pools for one engine instance
#[derive(Clone)]
pub struct EngineContext {
    /// Validated configuration
    pub config: Arc<EngineConfig>,
    /// Time source for expiry and retention
    pub clock: Arc<dyn TimeProvider>,
    /// Named rate counters
    pub metrics: Arc<MetricCounters>,
    /// Compute, I/O and timer pools
    pub pools: Arc<WorkerPoolManager>,
}

impl EngineContext {
    /// Validate `config` and start the pools on the system clock
    pub fn new(config: EngineConfig) -> Result<Self, SweepError> {
        Self::with_clock(config, Arc::new(SystemTimeProvider))
    }

    /// Same as [`new`](Self::new) with an explicit clock
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn TimeProvider>) -> Result<Self, SweepError> {
        config
            .validate()
            .map_err(|e| SweepError::Config(e.to_string()))?;
        let pools = WorkerPoolManager::new(&config.pool)?;
        let metrics = MetricCounters::new(
            Duration::from_secs(config.metrics.window_secs),
            Arc::clone(&clock),
        );
        Ok(Self {
            config: Arc::new(config),
            clock,
            metrics: Arc::new(metrics),
            pools: Arc::new(pools),
        })
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}
