use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use cron::Schedule;

use crate::job::Job;
use crate::store::JobStore;
use crate::timing::{jittered_delay, now_unix, sleep_with_shutdown};

/// A cron spec attached to a pool: six-field seconds-first syntax, UTC.
#[derive(Debug, Clone)]
pub(crate) struct PeriodicSpec {
    schedule: Schedule,
    expression: String,
    pub job_name: String,
}

impl PeriodicSpec {
    pub fn new(expression: &str, job_name: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expression)
            .with_context(|| format!("invalid cron expression: {expression}"))?;
        Ok(Self {
            schedule,
            expression: expression.to_string(),
            job_name: job_name.to_string(),
        })
    }

    /// Field in the `periodic:last_enqueued` hash tracking the horizon this
    /// spec has been scheduled through.
    fn tracking_key(&self) -> String {
        format!("{}|{}", self.job_name, self.expression)
    }

    /// Matching instants in `(after, until]`, unix seconds.
    fn instants_between(&self, after: i64, until: i64) -> Vec<i64> {
        let start = match Utc.timestamp_opt(after, 0).single() {
            Some(start) => start,
            None => return Vec::new(),
        };
        let mut instants = Vec::new();
        for instant in self.schedule.after(&start) {
            let t = instant.timestamp();
            if t > until {
                break;
            }
            instants.push(t);
        }
        instants
    }
}

pub(crate) struct PeriodicContext {
    pub shutdown: Arc<AtomicBool>,
    pub store: JobStore,
    pub specs: Arc<Vec<PeriodicSpec>>,
    pub tick_seconds: f64,
    pub horizon_seconds: i64,
}

/// Horizon-based idempotent scheduling: every wake, each spec's matching
/// instants within the horizon are ZADDed into `scheduled` as deterministic
/// records, so every pool converges on the same set without coordination.
pub(crate) async fn periodic_loop(mut ctx: PeriodicContext) {
    while !ctx.shutdown.load(Ordering::SeqCst) {
        match enqueue_horizon(&mut ctx.store, &ctx.specs, ctx.horizon_seconds, now_unix()).await {
            Ok(scheduled) if scheduled > 0 => {
                tracing::debug!(scheduled, "scheduled periodic jobs");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "periodic enqueue pass failed");
            }
        }
        sleep_with_shutdown(&ctx.shutdown, jittered_delay(ctx.tick_seconds, 0.1)).await;
    }
}

pub(crate) async fn enqueue_horizon(
    store: &mut JobStore,
    specs: &[PeriodicSpec],
    horizon_seconds: i64,
    now: i64,
) -> Result<u64> {
    let until = now + horizon_seconds;
    let mut scheduled = 0u64;
    for spec in specs {
        let covered_through = store.periodic_last_enqueued(&spec.tracking_key()).await?;
        let after = match covered_through {
            Some(last) if last >= now => last,
            _ => now - 1,
        };
        if after >= until {
            continue;
        }
        for t in spec.instants_between(after, until) {
            let job = Job::periodic(&spec.job_name, t);
            let raw = job.serialize()?;
            if store.schedule_periodic(&spec.job_name, &raw, t).await? {
                scheduled += 1;
            }
        }
        store
            .set_periodic_last_enqueued(&spec.tracking_key(), until)
            .await?;
    }
    Ok(scheduled)
}
