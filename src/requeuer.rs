use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::constants::REQUEUE_BATCH_SIZE;
use crate::store::JobStore;
use crate::timing::{jittered_delay, sleep_with_shutdown};

pub(crate) struct RequeuerContext {
    pub shutdown: Arc<AtomicBool>,
    pub store: JobStore,
    pub job_names: Vec<String>,
    pub interval_seconds: f64,
}

/// Promotes due scheduled and retry entries onto live lists. Several pools
/// run this concurrently; the promotion script's ZREM settles races.
pub(crate) async fn requeue_loop(mut ctx: RequeuerContext) {
    while !ctx.shutdown.load(Ordering::SeqCst) {
        match requeue_once(&mut ctx.store, &ctx.job_names).await {
            Ok(moved) if moved > 0 => {
                tracing::debug!(moved, "promoted due jobs");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "requeue pass failed");
            }
        }
        sleep_with_shutdown(&ctx.shutdown, jittered_delay(ctx.interval_seconds, 0.3)).await;
    }
}

pub(crate) async fn requeue_once(store: &mut JobStore, job_names: &[String]) -> Result<i64> {
    if job_names.is_empty() {
        return Ok(0);
    }
    let sources = [store.keys().scheduled(), store.keys().retry()];
    let mut total = 0;
    for source in sources {
        // Due entries this pool cannot promote stay in the set; the offset
        // walks past them so they never fill the scan window.
        let mut offset = 0usize;
        loop {
            let (scanned, moved) = store
                .promote_due(&source, job_names, offset, REQUEUE_BATCH_SIZE)
                .await?;
            total += moved;
            offset += (scanned - moved).max(0) as usize;
            if (scanned as usize) < REQUEUE_BATCH_SIZE {
                break;
            }
        }
    }
    Ok(total)
}
