use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::store::JobStore;
use crate::timing::{jittered_delay, now_unix, sleep_with_shutdown};

/// A pool's liveness record, as read back from its heartbeat hash.
#[derive(Debug, Clone)]
pub struct PoolHeartbeat {
    pub pool_id: String,
    pub started_at: i64,
    pub heartbeat_at: i64,
    pub job_names: Vec<String>,
    pub concurrency: usize,
    pub host: String,
    pub pid: u32,
    pub worker_ids: Vec<String>,
}

impl PoolHeartbeat {
    pub(crate) fn parse(pool_id: &str, raw: &HashMap<String, String>) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        Some(Self {
            pool_id: pool_id.to_string(),
            started_at: parse_number(raw, "started_at"),
            heartbeat_at: parse_number(raw, "heartbeat_at"),
            job_names: parse_list(raw, "job_names"),
            concurrency: parse_number(raw, "concurrency") as usize,
            host: raw.get("host").cloned().unwrap_or_default(),
            pid: parse_number(raw, "pid") as u32,
            worker_ids: parse_list(raw, "worker_ids"),
        })
    }
}

fn parse_number(raw: &HashMap<String, String>, field: &str) -> i64 {
    raw.get(field)
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

fn parse_list(raw: &HashMap<String, String>, field: &str) -> Vec<String> {
    raw.get(field)
        .map(|value| {
            value
                .split(',')
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn resolve_host() -> String {
    hostname::get()
        .map(|host| host.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

pub(crate) struct HeartbeatContext {
    pub shutdown: Arc<AtomicBool>,
    pub store: JobStore,
    pub pool_id: String,
    pub started_at: i64,
    pub job_names: Vec<String>,
    pub concurrency: usize,
    pub worker_ids: Vec<String>,
    pub interval_seconds: f64,
}

pub(crate) fn heartbeat_fields(
    ctx: &HeartbeatContext,
    host: &str,
    pid: u32,
) -> Vec<(&'static str, String)> {
    vec![
        ("started_at", ctx.started_at.to_string()),
        ("heartbeat_at", now_unix().to_string()),
        ("job_names", ctx.job_names.join(",")),
        ("concurrency", ctx.concurrency.to_string()),
        ("host", host.to_string()),
        ("pid", pid.to_string()),
        ("worker_ids", ctx.worker_ids.join(",")),
    ]
}

/// Publishes the pool's liveness every interval. Deletion on clean shutdown
/// is the pool's responsibility once every loop has stopped.
pub(crate) async fn heartbeat_loop(mut ctx: HeartbeatContext) {
    let host = resolve_host();
    let pid = std::process::id();
    loop {
        let fields = heartbeat_fields(&ctx, &host, pid);
        if let Err(err) = ctx.store.write_heartbeat(&ctx.pool_id, &fields).await {
            tracing::error!(pool_id = %ctx.pool_id, error = %err, "failed to write heartbeat");
        }
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        sleep_with_shutdown(&ctx.shutdown, jittered_delay(ctx.interval_seconds, 0.1)).await;
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;

    fn context(store: JobStore) -> HeartbeatContext {
        HeartbeatContext {
            shutdown: Arc::new(AtomicBool::new(false)),
            store,
            pool_id: "pool-1".to_string(),
            started_at: 100,
            job_names: vec!["a".to_string(), "b".to_string()],
            concurrency: 3,
            worker_ids: vec!["w1".to_string(), "w2".to_string(), "w3".to_string()],
            interval_seconds: 5.0,
        }
    }

    #[tokio::test]
    async fn heartbeat_fields_round_trip_through_the_store() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let heartbeat_ctx = context(ctx.store.clone());
        let fields = heartbeat_fields(&heartbeat_ctx, "host-1", 42);
        ctx.store.write_heartbeat("pool-1", &fields).await.unwrap();

        let raw = ctx.store.read_heartbeat("pool-1").await.unwrap();
        let parsed = PoolHeartbeat::parse("pool-1", &raw).unwrap();
        assert_eq!(parsed.started_at, 100);
        assert!(parsed.heartbeat_at > 0);
        assert_eq!(parsed.job_names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(parsed.concurrency, 3);
        assert_eq!(parsed.host, "host-1");
        assert_eq!(parsed.pid, 42);
        assert_eq!(parsed.worker_ids.len(), 3);
        assert_eq!(
            ctx.store.pool_ids().await.unwrap(),
            vec!["pool-1".to_string()]
        );
    }

    #[test]
    fn parse_rejects_missing_heartbeats() {
        assert!(PoolHeartbeat::parse("pool-1", &HashMap::new()).is_none());
    }

    #[test]
    fn parse_tolerates_partial_hashes() {
        let mut raw = HashMap::new();
        raw.insert("heartbeat_at".to_string(), "17".to_string());
        let parsed = PoolHeartbeat::parse("pool-1", &raw).unwrap();
        assert_eq!(parsed.heartbeat_at, 17);
        assert_eq!(parsed.started_at, 0);
        assert!(parsed.worker_ids.is_empty());
    }
}
