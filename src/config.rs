//! Coordinator configuration.
//!
//! Durations are serialized as milliseconds so options can be loaded from a
//! plain JSON settings blob.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How `save_multiple_items` treats a batch that contains invalid items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Write the valid items, report the invalid ones.
    #[default]
    SkipInvalid,
    /// Abort the whole batch before any write if one item is invalid.
    RejectAll,
}

/// Configuration for `PersistenceCoordinator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorOptions {
    /// Per-call remote timeout (default: 10 000 ms)
    pub remote_timeout_ms: u64,
    /// Retries after a transient remote failure (default: 1)
    pub remote_retries: u32,
    /// Backoff before the first retry, doubled for each further retry (default: 200 ms)
    pub retry_backoff_ms: u64,
    /// Workers draining the local mirror queue (default: 2)
    pub mirror_workers: usize,
    /// Pending mirror writes before new ones are dropped and counted (default: 256)
    pub mirror_queue_capacity: usize,
    /// Recent mirror failures kept for stats (default: 32)
    pub mirror_failure_log: usize,
    pub batch_policy: BatchPolicy,
    /// Background sync check interval (default: 60 000 ms)
    pub sync_interval_ms: u64,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            remote_timeout_ms: 10_000,
            remote_retries: 1,
            retry_backoff_ms: 200,
            mirror_workers: 2,
            mirror_queue_capacity: 256,
            mirror_failure_log: 32,
            batch_policy: BatchPolicy::SkipInvalid,
            sync_interval_ms: 60_000,
        }
    }
}

impl CoordinatorOptions {
    pub fn remote(&self) -> RemoteOptions {
        RemoteOptions {
            timeout: Duration::from_millis(self.remote_timeout_ms),
            retries: self.remote_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }
}

/// Timeout and retry policy applied by `RemoteStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        CoordinatorOptions::default().remote()
    }
}
