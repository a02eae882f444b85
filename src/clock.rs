//! Time source abstraction.
//!
//! Lock deadlines and the post-write release loop are bounded by wall-clock
//! budgets; routing every `now`/`sleep` through a trait keeps those budgets
//! deterministic under test.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait TimeSource: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Block the current operation for `duration`.
    fn sleep(&self, duration: Duration);

    fn epoch_secs(&self) -> u64 {
        self.now_ms() / 1_000
    }
}

/// Wall clock backed by `SystemTime` and `thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
