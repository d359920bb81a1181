//! Wall-clock seam so retention and expiry logic can be tested without sleeping

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Timestamp type used throughout the engine
pub type Timestamp = DateTime<Utc>;

/// Source of the current time
pub trait TimeProvider: Send + Sync {
    /// Current time
    fn now(&self) -> Timestamp;
}

/// Real clock
#[derive(Debug, Clone, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Clock that only moves when told to
///
/// # Examples
///
/// ```
/// use sweeper_engine::clock::{ManualTimeProvider, TimeProvider};
///
/// let clock = ManualTimeProvider::new(chrono::Utc::now());
/// let before = clock.now();
/// clock.advance(chrono::Duration::minutes(6));
/// assert_eq!(clock.now() - before, chrono::Duration::minutes(6));
/// ```
#[derive(Debug)]
pub struct ManualTimeProvider {
    current: Mutex<Timestamp>,
}

impl ManualTimeProvider {
    /// Start at `start`
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Move forward (or backward, with a negative duration)
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current += by;
    }

    /// Jump to an absolute time
    pub fn set(&self, to: Timestamp) {
        *self.current.lock() = to;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now(&self) -> Timestamp {
        *self.current.lock()
    }
}

/// Convert a std duration to a chrono one, saturating on overflow
pub(crate) fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}
