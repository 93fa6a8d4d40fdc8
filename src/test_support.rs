use std::sync::OnceLock;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::settings::Settings;
use crate::store::JobStore;

static REDIS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn redis_lock() -> &'static Mutex<()> {
    REDIS_LOCK.get_or_init(|| Mutex::new(()))
}

/// Serializes Redis-backed tests onto one database and hands each test a
/// fresh namespace. Point `TASKMILL_TEST_REDIS_DSN` at a disposable
/// database; it is flushed per test.
pub struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub settings: Settings,
    pub store: JobStore,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisTestContext {
    pub async fn new() -> Result<Self> {
        let guard = redis_lock().lock().await;
        let mut settings = Settings::default();
        settings.redis_dsn = std::env::var("TASKMILL_TEST_REDIS_DSN")
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
        settings.namespace = format!("tm-test-{}", Uuid::new_v4());

        let client = redis::Client::open(settings.redis_dsn.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        let mut store = JobStore::with_connection(&settings.namespace, conn.clone())?;
        store.flushdb().await?;
        Ok(Self {
            _guard: guard,
            settings,
            store,
            conn,
        })
    }

    /// A connection clone for constructing pools, enqueuers, and clients
    /// against the test namespace.
    pub fn connection(&self) -> redis::aio::MultiplexedConnection {
        self.conn.clone()
    }
}
