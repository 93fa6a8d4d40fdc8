use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::store::JobStore;
use crate::timing::{jittered_delay, now_unix, sleep_with_shutdown};

pub(crate) struct ReaperContext {
    pub shutdown: Arc<AtomicBool>,
    pub store: JobStore,
    pub own_pool_id: String,
    pub dead_threshold_seconds: i64,
    pub lock_ttl_ms: i64,
    pub interval_seconds: f64,
}

/// Recovers jobs stranded by dead pools. Sleeps first so a burst of pool
/// starts does not stampede the store.
pub(crate) async fn reap_loop(mut ctx: ReaperContext) {
    loop {
        sleep_with_shutdown(&ctx.shutdown, jittered_delay(ctx.interval_seconds, 0.3)).await;
        if ctx.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match reap_once(
            &mut ctx.store,
            &ctx.own_pool_id,
            ctx.dead_threshold_seconds,
            ctx.lock_ttl_ms,
        )
        .await
        {
            Ok(recovered) if recovered > 0 => {
                tracing::warn!(recovered, "recovered jobs from dead pools");
            }
            Ok(_) => {}
            Err(err) => {
                // Retryable: another reaper instance, or the next pass here,
                // completes the work.
                tracing::warn!(error = %err, "reap pass failed");
            }
        }
    }
}

pub(crate) async fn reap_once(
    store: &mut JobStore,
    own_pool_id: &str,
    dead_threshold_seconds: i64,
    lock_ttl_ms: i64,
) -> Result<u64> {
    let now = now_unix();
    let mut recovered = 0u64;
    for pool_id in store.pool_ids().await? {
        if pool_id == own_pool_id {
            continue;
        }
        let heartbeat = store.read_heartbeat(&pool_id).await?;
        let heartbeat_at = heartbeat
            .get("heartbeat_at")
            .and_then(|value| value.parse::<i64>().ok());
        let dead = match heartbeat_at {
            None => true,
            Some(at) => at < now - dead_threshold_seconds,
        };
        if !dead {
            continue;
        }
        // Advisory lock so two reapers do not double-requeue; losing the
        // race yields silently.
        if !store.try_reap_lock(&pool_id, lock_ttl_ms).await? {
            continue;
        }
        let worker_ids: Vec<String> = heartbeat
            .get("worker_ids")
            .map(|value| {
                value
                    .split(',')
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let mut reclaimed = 0u64;
        for worker_id in &worker_ids {
            reclaimed += store.reap_in_progress(worker_id).await?;
        }
        store.remove_pool(&pool_id, &worker_ids).await?;
        store.release_reap_lock(&pool_id).await?;
        tracing::warn!(
            dead_pool_id = %pool_id,
            requeued = reclaimed,
            "reaped dead pool"
        );
        recovered += reclaimed;
    }
    Ok(recovered)
}
