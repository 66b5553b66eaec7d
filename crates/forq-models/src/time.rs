//! Unix-epoch time utilities and an injectable clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in seconds, with sub-second precision.
pub fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Current Unix time in milliseconds.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Time source for components whose behavior depends on "now".
///
/// Retry scheduling and the deschedule tick read time through this trait so
/// tests can drive them deterministically.
pub trait Clock: Send + Sync {
    /// Unix seconds, fractional.
    fn unix_time(&self) -> f64;

    /// Unix milliseconds.
    fn unix_time_ms(&self) -> u64 {
        (self.unix_time() * 1000.0) as u64
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_time(&self) -> f64 {
        unix_time()
    }

    fn unix_time_ms(&self) -> u64 {
        unix_time_ms()
    }
}

/// Manually driven clock. Time only moves when `advance` or `set` is called.
#[derive(Debug, Default)]
pub struct FrozenClock {
    millis: AtomicU64,
}

impl FrozenClock {
    /// Create a clock frozen at the given Unix time in seconds.
    pub fn at(unix_seconds: f64) -> Self {
        Self {
            millis: AtomicU64::new((unix_seconds * 1000.0) as u64),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute Unix time in seconds.
    pub fn set(&self, unix_seconds: f64) {
        self.millis
            .store((unix_seconds * 1000.0) as u64, Ordering::SeqCst);
    }
}

impl Clock for FrozenClock {
    fn unix_time(&self) -> f64 {
        self.millis.load(Ordering::SeqCst) as f64 / 1000.0
    }

    fn unix_time_ms(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
