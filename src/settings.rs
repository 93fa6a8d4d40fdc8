use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BACKOFF_BASE_SECONDS, DEFAULT_BACKOFF_CEILING_SECONDS, DEFAULT_CONCURRENCY,
    DEFAULT_DEAD_POOL_THRESHOLD_SECONDS, DEFAULT_DRAIN_DEADLINE_SECONDS,
    DEFAULT_HEARTBEAT_INTERVAL_SECONDS, DEFAULT_MAX_FAILS, DEFAULT_NAMESPACE,
    DEFAULT_PERIODIC_HORIZON_SECONDS, DEFAULT_PERIODIC_TICK_SECONDS,
    DEFAULT_POLL_BACKOFF_JITTER, DEFAULT_POLL_BACKOFF_SECONDS, DEFAULT_REAP_INTERVAL_SECONDS,
    DEFAULT_REAP_LOCK_TTL_MS, DEFAULT_REDIS_DSN, DEFAULT_REQUEUE_INTERVAL_SECONDS,
};

/// Per-pool configuration. Everything here has a sensible default; the only
/// fields most embedders touch are `redis_dsn`, `namespace`, and
/// `concurrency`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Settings {
    pub redis_dsn: String,
    pub namespace: String,
    pub concurrency: usize,
    pub default_max_fails: u32,
    pub poll_backoff_seconds: f64,
    pub poll_backoff_jitter: f64,
    pub requeue_interval_seconds: f64,
    pub heartbeat_interval_seconds: f64,
    pub dead_pool_threshold_seconds: i64,
    pub reap_interval_seconds: f64,
    pub reap_lock_ttl_ms: i64,
    pub periodic_tick_seconds: f64,
    pub periodic_horizon_seconds: i64,
    pub backoff_base_seconds: f64,
    pub backoff_ceiling_seconds: f64,
    pub drain_deadline_seconds: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_dsn: DEFAULT_REDIS_DSN.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            default_max_fails: DEFAULT_MAX_FAILS,
            poll_backoff_seconds: DEFAULT_POLL_BACKOFF_SECONDS,
            poll_backoff_jitter: DEFAULT_POLL_BACKOFF_JITTER,
            requeue_interval_seconds: DEFAULT_REQUEUE_INTERVAL_SECONDS,
            heartbeat_interval_seconds: DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
            dead_pool_threshold_seconds: DEFAULT_DEAD_POOL_THRESHOLD_SECONDS,
            reap_interval_seconds: DEFAULT_REAP_INTERVAL_SECONDS,
            reap_lock_ttl_ms: DEFAULT_REAP_LOCK_TTL_MS,
            periodic_tick_seconds: DEFAULT_PERIODIC_TICK_SECONDS,
            periodic_horizon_seconds: DEFAULT_PERIODIC_HORIZON_SECONDS,
            backoff_base_seconds: DEFAULT_BACKOFF_BASE_SECONDS,
            backoff_ceiling_seconds: DEFAULT_BACKOFF_CEILING_SECONDS,
            drain_deadline_seconds: DEFAULT_DRAIN_DEADLINE_SECONDS,
        }
    }
}
