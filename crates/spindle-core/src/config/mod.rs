//! Dispatcher configuration
//!
//! Settings are read from a YAML file; every field has a default so a missing
//! or partial file still yields a usable config.
//!
//! ```yaml
//! # ~/.config/spindle/dispatcher.yaml
//! worker_name_prefix: collection-worker
//! idle_timeout_ms: 300000
//! prune_interval_ms: 30000
//! abort_running_on_shutdown: false
//! ```

mod io;
mod paths;

pub use io::{load_config, save_config};
pub use paths::{default_config_dir, default_config_path};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker pool and shutdown policy for a [`Dispatcher`](crate::dispatcher::Dispatcher)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Worker threads are named `{prefix}-{id}`
    pub worker_name_prefix: String,

    /// Stack size for worker threads in bytes (platform default if unset)
    pub worker_stack_size: Option<usize>,

    /// Evict workers idle at least this long. Unset keeps them forever.
    pub idle_timeout_ms: Option<u64>,

    /// Minimum time between automatic pruning passes in `pump`
    pub prune_interval_ms: u64,

    /// Raise the abort flag of running jobs (not only queued ones) on shutdown
    pub abort_running_on_shutdown: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_name_prefix: "spindle-worker".to_string(),
            worker_stack_size: None,
            idle_timeout_ms: None,
            prune_interval_ms: 30_000,
            abort_running_on_shutdown: false,
        }
    }
}

impl DispatcherConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    /// Thread name for worker `id`
    pub fn worker_thread_name(&self, id: u64) -> String {
        format!("{}-{}", self.worker_name_prefix, id)
    }
}
