//! Synchronization timing knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wall-clock budgets for lock waits and the post-write release loop.
///
/// Defaults are the cluster-wide contract; tests shrink them to keep
/// deterministic runs fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTimeouts {
    /// How long a reader waits for its per-device read lock.
    pub read_lock_wait_secs: u64,
    /// How long a writer waits for the repository-wide write lock.
    pub write_lock_wait_secs: u64,
    /// Total wall-clock budget for clearing the durable write marker after
    /// a write, across reconnect attempts.
    pub release_budget_secs: u64,
    /// Pause between release attempts.
    pub release_retry_delay_ms: u64,
}

impl Default for SyncTimeouts {
    fn default() -> Self {
        Self {
            read_lock_wait_secs: 120,
            write_lock_wait_secs: 120,
            release_budget_secs: 300,
            release_retry_delay_ms: 1_000,
        }
    }
}

impl SyncTimeouts {
    pub fn read_lock_wait(&self) -> Duration {
        Duration::from_secs(self.read_lock_wait_secs)
    }

    pub fn write_lock_wait(&self) -> Duration {
        Duration::from_secs(self.write_lock_wait_secs)
    }

    pub fn release_budget(&self) -> Duration {
        Duration::from_secs(self.release_budget_secs)
    }

    pub fn release_retry_delay(&self) -> Duration {
        Duration::from_millis(self.release_retry_delay_ms)
    }
}
