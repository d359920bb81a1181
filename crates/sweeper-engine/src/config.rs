//! Configuration for the cleanup engine
//!
//! Every field has a default, so a TOML file only needs to name what it
//! changes. Sections mirror the engine components.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use sweeper_domain::CleaningStrategy;
use thiserror::Error;

/// Configuration loading error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to render TOML
    #[error("Failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level engine configuration
///
/// # Examples
///
/// ```
/// use sweeper_engine::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.queue.capacity, 1000);
/// assert_eq!(config.undo.capacity, 10);
///
/// let config = EngineConfig::aggressive();
/// assert!(config.cleaning.actors.enabled);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker pool sizing and shutdown
    #[serde(default)]
    pub pool: PoolConfig,

    /// Task queue and dispatch loop
    #[serde(default)]
    pub queue: QueueConfig,

    /// Undo log bounds
    #[serde(default)]
    pub undo: UndoConfig,

    /// History retention
    #[serde(default)]
    pub history: HistoryConfig,

    /// Rate counters
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Spatial batch processing
    #[serde(default)]
    pub batch: BatchConfig,

    /// What gets cleaned and how
    #[serde(default)]
    pub cleaning: CleaningConfig,

    /// Optional per-task time budget
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Compute pool worker threads
    /// Default: max(4, available cores)
    pub compute_threads: usize,

    /// I/O pool threads for adapter reads
    /// Default: 2
    pub io_threads: usize,

    /// Submissions admitted per pool beyond its thread count before the
    /// caller has to run the work itself
    /// Default: 1000
    pub queue_capacity: usize,

    /// Idle I/O threads retire after this many seconds
    /// Default: 60
    pub keep_alive_secs: u64,

    /// Grace period for in-flight work on shutdown
    /// Default: 30
    pub shutdown_grace_secs: u64,

    /// Grace period for the timer pool on shutdown
    /// Default: 10
    pub timer_shutdown_grace_secs: u64,
}

fn default_compute_threads() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.max(4)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            compute_threads: default_compute_threads(),
            io_threads: 2,
            queue_capacity: 1000,
            keep_alive_secs: 60,
            shutdown_grace_secs: 30,
            timer_shutdown_grace_secs: 10,
        }
    }
}

/// Task queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum queued tasks
    /// Default: 1000
    pub capacity: usize,

    /// Dispatch loop period in milliseconds
    /// Default: 100
    pub dispatch_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            dispatch_interval_ms: 100,
        }
    }
}

/// Undo log bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UndoConfig {
    /// Records kept before the oldest is evicted
    /// Default: 10
    pub capacity: usize,

    /// Minutes a record stays restorable
    /// Default: 5
    pub timeout_minutes: u64,

    /// Seconds `undo_last_operation` waits for the restore to finish
    /// Default: 10
    pub wait_secs: u64,
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            timeout_minutes: 5,
            wait_secs: 10,
        }
    }
}

/// History retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Records kept before the oldest is evicted
    /// Default: 100
    pub capacity: usize,

    /// Records older than this many days are purged
    /// Default: 7
    pub retention_days: u64,

    /// Hours between retention sweeps
    /// Default: 6
    pub sweep_interval_hours: u64,

    /// Hours before the first retention sweep
    /// Default: 1
    pub initial_sweep_delay_hours: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            retention_days: 7,
            sweep_interval_hours: 6,
            initial_sweep_delay_hours: 1,
        }
    }
}

/// Rate counter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Width of the rate window in seconds
    /// Default: 60
    pub window_secs: u64,

    /// Seconds between bucket purges
    /// Default: 60
    pub purge_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            purge_interval_secs: 60,
        }
    }
}

/// Spatial batch processing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Partitions processed at once; `None` means the compute pool size
    pub max_parallel_partitions: Option<usize>,

    /// Object count at which a partition's priority score saturates
    /// Default: 100
    pub priority_cap: usize,

    /// Edge length of a partition in world units
    /// Default: 16
    pub partition_size: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_parallel_partitions: None,
            priority_cap: 100,
            partition_size: sweeper_domain::world::DEFAULT_PARTITION_SIZE,
        }
    }
}

/// What gets cleaned
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    /// Log what would be removed without touching the world
    /// Default: false
    pub dry_run: bool,

    /// Radius used when a request does not name one
    /// Default: 64.0
    pub default_radius: f64,

    /// Largest radius a cleanup may cover; larger requests are clamped
    /// Default: 128.0
    pub max_radius: f64,

    /// Dimension key recorded in snapshots
    /// Default: "overworld"
    pub domain_key: String,

    /// Dropped item rules
    pub items: ItemCleaningConfig,

    /// Actor density rules
    pub actors: ActorCleaningConfig,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            default_radius: 64.0,
            max_radius: 128.0,
            domain_key: "overworld".to_string(),
            items: ItemCleaningConfig::default(),
            actors: ActorCleaningConfig::default(),
        }
    }
}

/// Dropped item rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemCleaningConfig {
    /// Whether items are cleaned at all
    /// Default: true
    pub enabled: bool,

    /// Items younger than this are kept
    /// Default: 6000 (five minutes at 20 ticks per second)
    pub min_age_ticks: u64,

    /// Item type keys never removed
    pub keep_types: Vec<String>,

    /// Extra selection rule applied after the filter
    pub strategy: Option<CleaningStrategy>,
}

impl Default for ItemCleaningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_age_ticks: 6000,
            keep_types: Vec::new(),
            strategy: None,
        }
    }
}

/// Actor density rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorCleaningConfig {
    /// Whether actors are cleaned at all
    /// Default: false
    pub enabled: bool,

    /// Actors allowed per partition
    /// Default: 10
    pub density_threshold: usize,

    /// Never remove protected actors
    /// Default: true
    pub protect_flagged: bool,

    /// Extra selection rule applied after the filter
    pub strategy: Option<CleaningStrategy>,
}

impl Default for ActorCleaningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            density_threshold: 10,
            protect_flagged: true,
            strategy: None,
        }
    }
}

/// Optional per-task time budget
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Running tasks older than this are timed out; `None` disables the watchdog
    pub task_timeout_secs: Option<u64>,

    /// Seconds between watchdog checks
    /// Default: 5
    pub check_interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: None,
            check_interval_secs: 5,
        }
    }
}

impl EngineConfig {
    /// Aggressive cleanup: younger items go, actors are culled, history is shorter
    pub fn aggressive() -> Self {
        let mut config = Self::default();
        config.cleaning.items.min_age_ticks = 1200;
        config.cleaning.actors.enabled = true;
        config.cleaning.actors.density_threshold = 6;
        config.history.retention_days = 3;
        config
    }

    /// Lenient cleanup: items live longer, more undo headroom
    pub fn lenient() -> Self {
        let mut config = Self::default();
        config.cleaning.items.min_age_ticks = 12_000;
        config.cleaning.actors.density_threshold = 20;
        config.undo.capacity = 20;
        config.undo.timeout_minutes = 15;
        config.history.retention_days = 14;
        config
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(value: u64, name: &str) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
            Ok(())
        }

        positive(self.pool.compute_threads as u64, "pool.compute_threads")?;
        positive(self.pool.io_threads as u64, "pool.io_threads")?;
        positive(self.queue.capacity as u64, "queue.capacity")?;
        positive(self.queue.dispatch_interval_ms, "queue.dispatch_interval_ms")?;
        positive(self.undo.capacity as u64, "undo.capacity")?;
        positive(self.undo.timeout_minutes, "undo.timeout_minutes")?;
        positive(self.history.capacity as u64, "history.capacity")?;
        positive(self.history.sweep_interval_hours, "history.sweep_interval_hours")?;
        positive(self.metrics.window_secs, "metrics.window_secs")?;
        positive(self.metrics.purge_interval_secs, "metrics.purge_interval_secs")?;
        positive(self.batch.priority_cap as u64, "batch.priority_cap")?;
        positive(u64::from(self.batch.partition_size), "batch.partition_size")?;
        positive(self.watchdog.check_interval_secs, "watchdog.check_interval_secs")?;
        if let Some(limit) = self.watchdog.task_timeout_secs {
            positive(limit, "watchdog.task_timeout_secs")?;
        }
        if self.batch.max_parallel_partitions == Some(0) {
            return Err(ConfigError::Invalid(
                "batch.max_parallel_partitions must be greater than 0".to_string(),
            ));
        }
        if self.cleaning.default_radius.is_nan() || self.cleaning.default_radius <= 0.0 {
            return Err(ConfigError::Invalid(
                "cleaning.default_radius must be positive".to_string(),
            ));
        }
        if !self.cleaning.max_radius.is_finite() || self.cleaning.max_radius <= 0.0 {
            return Err(ConfigError::Invalid(
                "cleaning.max_radius must be a positive number".to_string(),
            ));
        }
        if self.cleaning.default_radius > self.cleaning.max_radius {
            return Err(ConfigError::Invalid(format!(
                "cleaning.default_radius ({}) exceeds cleaning.max_radius ({})",
                self.cleaning.default_radius, self.cleaning.max_radius
            )));
        }
        Ok(())
    }

    /// Dispatch loop period
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.queue.dispatch_interval_ms)
    }

    /// How long an undo record stays restorable
    pub fn undo_timeout(&self) -> Duration {
        Duration::from_secs(self.undo.timeout_minutes * 60)
    }

    /// Bounded wait of `undo_last_operation`
    pub fn undo_wait(&self) -> Duration {
        Duration::from_secs(self.undo.wait_secs)
    }

    /// History retention window
    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history.retention_days * 24 * 3600)
    }

    /// Period of the history retention sweep
    pub fn history_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.history.sweep_interval_hours * 3600)
    }

    /// Delay before the first history retention sweep
    pub fn history_initial_delay(&self) -> Duration {
        Duration::from_secs(self.history.initial_sweep_delay_hours * 3600)
    }

    /// Period of the metric bucket purge
    pub fn metrics_purge_interval(&self) -> Duration {
        Duration::from_secs(self.metrics.purge_interval_secs)
    }

    /// Per-task time budget when the watchdog is enabled
    pub fn task_timeout(&self) -> Option<Duration> {
        self.watchdog.task_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.pool.compute_threads >= 4);
        assert_eq!(config.pool.io_threads, 2);
        assert_eq!(config.dispatch_interval(), Duration::from_millis(100));
        assert_eq!(config.undo_timeout(), Duration::from_secs(300));
        assert_eq!(config.history_retention(), Duration::from_secs(7 * 24 * 3600));
        assert!(config.task_timeout().is_none());
    }

    #[test]
    fn test_presets() {
        let aggressive = EngineConfig::aggressive();
        let default_age = EngineConfig::default().cleaning.items.min_age_ticks;
        assert!(aggressive.cleaning.items.min_age_ticks < default_age);
        assert!(aggressive.validate().is_ok());

        let lenient = EngineConfig::lenient();
        assert_eq!(lenient.undo.capacity, 20);
        assert!(lenient.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml = r#"
            [queue]
            capacity = 50

            [cleaning]
            dry_run = true

            [cleaning.items]
            keep_types = ["diamond", "elytra"]
            strategy = { type = "time_based", min_age_ticks = 9000 }
        "#;

        let config = EngineConfig::from_toml(toml).unwrap();
        assert_eq!(config.queue.capacity, 50);
        assert_eq!(config.queue.dispatch_interval_ms, 100);
        assert!(config.cleaning.dry_run);
        assert_eq!(config.cleaning.items.keep_types.len(), 2);
        assert_eq!(
            config.cleaning.items.strategy,
            Some(CleaningStrategy::TimeBased { min_age_ticks: 9000 })
        );
        assert_eq!(config.undo.capacity, 10);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_toml("[queue]\ndispatch_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mut config = EngineConfig::default();
        config.batch.max_parallel_partitions = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_radius_limits() {
        assert_eq!(EngineConfig::default().cleaning.max_radius, 128.0);

        let mut config = EngineConfig::default();
        config.cleaning.max_radius = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.cleaning.max_radius = 32.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_radius"));

        let err = EngineConfig::from_toml("[cleaning]\nmax_radius = 0.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = EngineConfig::lenient();
        let rendered = config.to_toml().unwrap();
        let parsed = EngineConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.undo.timeout_minutes, 15);
        assert_eq!(parsed.pool.compute_threads, config.pool.compute_threads);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[undo]\ncapacity = 3").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.undo.capacity, 3);

        let missing = EngineConfig::from_file("/nonexistent/sweeper.toml");
        assert!(matches!(missing, Err(ConfigError::FileRead(_))));
    }
}
