//! Wall-clock abstraction
//!
//! The clock and the pairing ceremony both need millisecond wall time; tests
//! need to pin it. Injecting a `TimeSource` keeps both honest.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond-resolution wall clock
pub trait TimeSource: Send + Sync {
    /// Current time as milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests and simulations
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now_ms: parking_lot::Mutex<i64>,
}

impl ManualTimeSource {
    /// Create a manual clock pinned at the given time
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: parking_lot::Mutex::new(now_ms),
        }
    }

    /// Pin the clock to an absolute time
    pub fn set(&self, now_ms: i64) {
        *self.now_ms.lock() = now_ms;
    }

    /// Advance the clock by a number of milliseconds
    pub fn advance(&self, delta_ms: i64) {
        *self.now_ms.lock() += delta_ms;
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> i64 {
        *self.now_ms.lock()
    }
}

/// Shared handle to the default system clock
pub fn system_time_source() -> Arc<dyn TimeSource> {
    Arc::new(SystemTimeSource)
}
