//! Controller tuning knobs, loadable from the `[controller]` table of
//! `fleetd.toml`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers.
    pub workers: usize,
    /// Interval between full resyncs of every machine set.
    pub resync_interval_secs: u64,
    /// First retry delay after a failed reconcile.
    pub backoff_base_ms: u64,
    /// Upper bound for the per-key retry delay.
    pub backoff_max_secs: u64,
    /// Attempts for a single version-checked write before giving up.
    pub conflict_retries: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval_secs: 300,
            backoff_base_ms: 5,
            backoff_max_secs: 300,
            conflict_retries: 5,
        }
    }
}

impl ControllerConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }
}
