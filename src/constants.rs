pub const DEFAULT_REDIS_DSN: &str = "redis://localhost:6379/0";
pub const DEFAULT_NAMESPACE: &str = "taskmill";

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_MAX_FAILS: u32 = 4;
pub const DEFAULT_PRIORITY: u32 = 1;

pub const DEFAULT_POLL_BACKOFF_SECONDS: f64 = 0.2;
pub const DEFAULT_POLL_BACKOFF_JITTER: f64 = 0.5;
pub const DEFAULT_REQUEUE_INTERVAL_SECONDS: f64 = 1.0;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: f64 = 5.0;
pub const DEFAULT_DEAD_POOL_THRESHOLD_SECONDS: i64 = 25;
pub const DEFAULT_REAP_INTERVAL_SECONDS: f64 = 600.0;
pub const DEFAULT_REAP_LOCK_TTL_MS: i64 = 30_000;
pub const DEFAULT_PERIODIC_TICK_SECONDS: f64 = 120.0;
pub const DEFAULT_PERIODIC_HORIZON_SECONDS: i64 = 300;

pub const DEFAULT_BACKOFF_BASE_SECONDS: f64 = 2.0;
pub const DEFAULT_BACKOFF_CEILING_SECONDS: f64 = 3600.0;
pub const DEFAULT_DRAIN_DEADLINE_SECONDS: f64 = 5.0;

pub const IDENTIFIER_LENGTH: usize = 20;
pub const REQUEUE_BATCH_SIZE: usize = 50;
