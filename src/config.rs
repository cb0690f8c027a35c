//! # Host configuration.
//!
//! Provides [`HostConfig`], the centralized settings of the module host.
//!
//! The debounce windows apply to both batching points (the connection check
//! and the entity reconciliation pass): bursts of invalidations coalesce
//! within `debounce_wait`, but a pass is guaranteed to run within
//! `debounce_max_wait` of the first trigger even under continuous
//! invalidation.

use std::time::Duration;

use semver::VersionReq;

use crate::policies::BackoffPolicy;

/// Global configuration of the module host.
///
/// ## Field semantics
/// - `debounce_wait` / `debounce_max_wait`: batching windows for the
///   connection check and the reconciliation pass
/// - `stop_poll_interval`: polling cadence of
///   [`ModuleHost::queue_stop_all_connections`](crate::host::ModuleHost::queue_stop_all_connections)
/// - `kill_timeout`: grace a stop request grants a worker before killing it
/// - `module_api_range`: module API versions this host accepts at handshake
/// - `backoff`: restart delay schedule
/// - `log_capacity`: ring-buffer size of the debug-log bus
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Trailing-edge quiet window of the batching debouncers.
    pub debounce_wait: Duration,

    /// Upper bound on batching latency under continuous triggering.
    pub debounce_max_wait: Duration,

    /// How often `queue_stop_all_connections` re-checks for emptiness.
    pub stop_poll_interval: Duration,

    /// How long a stopped worker may linger before it is killed.
    pub kill_timeout: Duration,

    /// Module API versions accepted during the registration handshake.
    pub module_api_range: VersionReq,

    /// Restart delay schedule applied by forced restarts.
    pub backoff: BackoffPolicy,

    /// Capacity of the debug-log broadcast ring buffer.
    pub log_capacity: usize,
}

impl Default for HostConfig {
    /// Returns the production defaults: 10ms/50ms batching windows, 1s stop
    /// polling, 5s kill timeout, `^1` API range, default backoff, and a
    /// 256-line debug-log buffer.
    fn default() -> Self {
        Self {
            debounce_wait: Duration::from_millis(10),
            debounce_max_wait: Duration::from_millis(50),
            stop_poll_interval: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(5),
            module_api_range: default_api_range(),
            backoff: BackoffPolicy::default(),
            log_capacity: 256,
        }
    }
}

fn default_api_range() -> VersionReq {
    // Static literal; cannot fail to parse.
    "^1".parse().expect("valid version requirement literal")
}
