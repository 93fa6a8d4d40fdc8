use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Result, anyhow};
use rand::Rng;

use crate::job::Job;
use crate::middleware::{JobContext, Middleware, Next};
use crate::registry::{JobOptions, RegisteredJob, Registry};
use crate::settings::Settings;
use crate::store::JobStore;
use crate::timing::{jittered_delay, now_unix, sleep_with_shutdown};

/// One fetch-execute-retire loop. A worker owns exactly one in-progress key
/// and holds at most one job at any instant.
pub(crate) struct Worker {
    pub worker_id: String,
    pub store: JobStore,
    pub registry: Arc<Registry>,
    pub middleware: Arc<[Arc<dyn Middleware>]>,
    pub candidates: Arc<Vec<(String, u32)>>,
    pub settings: Arc<Settings>,
    pub shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub async fn run(mut self) {
        tracing::debug!(worker_id = %self.worker_id, "worker started");
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.store.claim_job(&self.worker_id, &self.candidates).await {
                Ok(Some(raw)) => self.process(raw).await,
                Ok(None) => self.idle().await,
                Err(err) => {
                    // Store transient: retried in place, never a job failure.
                    tracing::warn!(worker_id = %self.worker_id, error = %err, "claim attempt failed");
                    self.idle().await;
                }
            }
        }
        tracing::debug!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn idle(&self) {
        let delay = jittered_delay(
            self.settings.poll_backoff_seconds,
            self.settings.poll_backoff_jitter,
        );
        sleep_with_shutdown(&self.shutdown, delay).await;
    }

    pub(crate) async fn process(&mut self, raw: String) {
        let job = match Job::deserialize(&raw) {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(
                    worker_id = %self.worker_id,
                    error = %err,
                    "claimed record is unparseable, dead-lettering as-is"
                );
                if let Err(err) = self.store.retire_malformed(&self.worker_id, &raw).await {
                    tracing::error!(worker_id = %self.worker_id, error = %err, "failed to dead-letter malformed record");
                }
                return;
            }
        };

        let registered = match self.registry.get(&job.name).cloned() {
            Some(registered) => registered,
            None => {
                self.bury_unhandled(job, &raw).await;
                return;
            }
        };

        self.record_claim(&job).await;
        let started = Instant::now();
        let span = tracing::info_span!(
            "taskmill.job",
            job_id = %job.id,
            job_name = %job.name,
            worker_id = %self.worker_id,
            attempt = job.fails + 1,
        );
        let _enter = span.enter();

        let outcome = self.execute(&registered, &job).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(()) => {
                if let Err(err) = self
                    .store
                    .retire_success(&self.worker_id, &raw, job.unique_key.as_deref())
                    .await
                {
                    tracing::error!(error = %err, "failed to retire completed job");
                } else {
                    tracing::info!(duration_ms, "job completed");
                }
            }
            Err(err) => {
                self.fail_job(job, &raw, &registered.options, err, duration_ms)
                    .await;
            }
        }

        if let Err(err) = self.store.clear_observation(&self.worker_id).await {
            tracing::debug!(error = %err, "failed to clear observation");
        }
    }

    /// Claimed jobs nobody registered a handler for are fatal: straight to
    /// the dead set, never retried.
    async fn bury_unhandled(&mut self, mut job: Job, claimed_raw: &str) {
        tracing::error!(
            worker_id = %self.worker_id,
            job_id = %job.id,
            job_name = %job.name,
            "no handler registered, dead-lettering"
        );
        job.last_err = Some(format!("no handler registered for job \"{}\"", job.name));
        job.failed_at = Some(now_unix());
        let unique_key = job.unique_key.clone();
        let updated = match job.serialize() {
            Ok(updated) => updated,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize dead record");
                return;
            }
        };
        if let Err(err) = self
            .store
            .retire_dead(
                &self.worker_id,
                claimed_raw,
                &updated,
                now_unix(),
                unique_key.as_deref(),
            )
            .await
        {
            tracing::error!(error = %err, "failed to dead-letter unhandled job");
        }
    }

    async fn record_claim(&mut self, job: &Job) {
        let args = serde_json::to_string(&job.args).unwrap_or_else(|_| "{}".to_string());
        let fields = vec![
            ("job_id", job.id.clone()),
            ("job_name", job.name.clone()),
            ("args", args),
            ("started_at", now_unix().to_string()),
        ];
        if let Err(err) = self.store.write_observation(&self.worker_id, &fields).await {
            tracing::debug!(worker_id = %self.worker_id, error = %err, "failed to write observation");
        }
    }

    /// Runs the middleware chain and handler in a spawned task so a panic is
    /// contained at this boundary and converted into a handler error.
    async fn execute(&self, registered: &RegisteredJob, job: &Job) -> Result<()> {
        let ctx = JobContext::new(
            Arc::new(job.clone()),
            &self.worker_id,
            self.store.clone(),
        );
        let next = Next::new(self.middleware.clone(), registered.handler.clone());
        match tokio::spawn(next.run(ctx)).await {
            Ok(result) => result,
            Err(join_err) => {
                if join_err.is_panic() {
                    Err(anyhow!(
                        "job handler panicked: {}",
                        panic_message(join_err.into_panic())
                    ))
                } else {
                    Err(anyhow!("job handler task was cancelled"))
                }
            }
        }
    }

    async fn fail_job(
        &mut self,
        mut job: Job,
        claimed_raw: &str,
        options: &JobOptions,
        err: anyhow::Error,
        duration_ms: f64,
    ) {
        job.fails += 1;
        job.last_err = Some(err.to_string());
        job.failed_at = Some(now_unix());
        let unique_key = job.unique_key.clone();

        if job.fails >= options.max_fails {
            if options.skip_dead_queue {
                tracing::warn!(
                    fails = job.fails,
                    duration_ms,
                    error = %err,
                    "job exhausted its attempts, dropped"
                );
                if let Err(err) = self
                    .store
                    .retire_drop(&self.worker_id, claimed_raw, unique_key.as_deref())
                    .await
                {
                    tracing::error!(error = %err, "failed to drop exhausted job");
                }
                return;
            }
            let updated = match job.serialize() {
                Ok(updated) => updated,
                Err(err) => {
                    tracing::error!(error = %err, "failed to serialize dead record");
                    return;
                }
            };
            tracing::error!(
                fails = job.fails,
                duration_ms,
                error = %err,
                "job exhausted its attempts, dead-lettering"
            );
            if let Err(err) = self
                .store
                .retire_dead(
                    &self.worker_id,
                    claimed_raw,
                    &updated,
                    now_unix(),
                    unique_key.as_deref(),
                )
                .await
            {
                tracing::error!(error = %err, "failed to dead-letter exhausted job");
            }
            return;
        }

        let delay = backoff_delay(options, &self.settings, job.fails);
        let retry_at = now_unix() + delay.ceil() as i64;
        let updated = match job.serialize() {
            Ok(updated) => updated,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize retry record");
                return;
            }
        };
        tracing::warn!(
            fails = job.fails,
            duration_ms,
            retry_in_seconds = delay,
            error = %err,
            "job failed, scheduling retry"
        );
        if let Err(err) = self
            .store
            .retire_retry(&self.worker_id, claimed_raw, &updated, retry_at)
            .await
        {
            tracing::error!(error = %err, "failed to schedule retry");
        }
    }
}

/// `min(base · 2^fails, ceiling)` seconds with small jitter, unless the job
/// carries its own backoff.
fn backoff_delay(options: &JobOptions, settings: &Settings, fails: u32) -> f64 {
    if let Some(backoff) = options.backoff.as_ref() {
        return backoff(fails).max(0.0);
    }
    let exponent = fails.min(30);
    let delay = settings.backoff_base_seconds * 2f64.powi(exponent as i32);
    let capped = delay.min(settings.backoff_ceiling_seconds);
    let mut rng = rand::rng();
    capped * rng.random_range(0.8..=1.2)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;

    fn worker_for(ctx: &RedisTestContext, registry: Registry) -> Worker {
        let candidates = Arc::new(registry.claim_candidates());
        Worker {
            worker_id: "w-test".to_string(),
            store: ctx.store.clone(),
            registry: Arc::new(registry),
            middleware: Arc::from(Vec::new()),
            candidates,
            settings: Arc::new(ctx.settings.clone()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn zero_backoff() -> Option<crate::registry::BackoffFn> {
        Some(Arc::new(|_fails| 0.0))
    }

    async fn claim(ctx: &mut RedisTestContext, worker: &Worker) -> String {
        ctx.store
            .claim_job(&worker.worker_id, &worker.candidates)
            .await
            .unwrap()
            .expect("expected a claimable job")
    }

    #[tokio::test]
    async fn successful_job_is_fully_retired() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut registry = Registry::new();
        registry.register("ok", |_ctx| async { Ok(()) });
        let mut worker = worker_for(&ctx, registry);

        let raw = Job::new("ok", serde_json::Map::new()).serialize().unwrap();
        ctx.store.push_live("ok", &raw).await.unwrap();
        let claimed = claim(&mut ctx, &worker).await;
        worker.process(claimed).await;

        assert!(ctx.store.in_progress_jobs("w-test").await.unwrap().is_empty());
        assert_eq!(ctx.store.queue_len("ok").await.unwrap(), 0);
        assert_eq!(ctx.store.retry_count().await.unwrap(), 0);
        assert_eq!(ctx.store.dead_count().await.unwrap(), 0);
        assert!(ctx.store.read_observation("w-test").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_job_lands_in_retry_with_failure_state() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut registry = Registry::new();
        registry.register_with_options(
            "boom",
            JobOptions {
                max_fails: 3,
                backoff: zero_backoff(),
                ..Default::default()
            },
            |_ctx| async { Err(anyhow!("boom")) },
        );
        let mut worker = worker_for(&ctx, registry);

        let raw = Job::new("boom", serde_json::Map::new())
            .serialize()
            .unwrap();
        ctx.store.push_live("boom", &raw).await.unwrap();
        let claimed = claim(&mut ctx, &worker).await;
        worker.process(claimed).await;

        assert!(ctx.store.in_progress_jobs("w-test").await.unwrap().is_empty());
        assert_eq!(ctx.store.retry_count().await.unwrap(), 1);

        let retry_key = ctx.store.keys().retry();
        let page = ctx.store.zset_page(&retry_key, 0, 10).await.unwrap();
        let stored = Job::deserialize(&page[0].0).unwrap();
        assert_eq!(stored.fails, 1);
        assert_eq!(stored.last_err.as_deref(), Some("boom"));
        assert!(stored.failed_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered_at_max_fails() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut registry = Registry::new();
        registry.register_with_options(
            "boom",
            JobOptions {
                max_fails: 2,
                backoff: zero_backoff(),
                ..Default::default()
            },
            |_ctx| async { Err(anyhow!("boom")) },
        );
        let mut worker = worker_for(&ctx, registry);

        let raw = Job::new("boom", serde_json::Map::new())
            .serialize()
            .unwrap();
        ctx.store.push_live("boom", &raw).await.unwrap();
        let claimed = claim(&mut ctx, &worker).await;
        worker.process(claimed).await;

        // Promote the retry and fail it again to exhaustion.
        let retry_key = ctx.store.keys().retry();
        let names = vec!["boom".to_string()];
        assert_eq!(
            ctx.store
                .promote_due(&retry_key, &names, 0, 50)
                .await
                .unwrap(),
            (1, 1)
        );
        let claimed = claim(&mut ctx, &worker).await;
        worker.process(claimed).await;

        assert_eq!(ctx.store.retry_count().await.unwrap(), 0);
        assert_eq!(ctx.store.dead_count().await.unwrap(), 1);
        let dead_key = ctx.store.keys().dead();
        let page = ctx.store.zset_page(&dead_key, 0, 10).await.unwrap();
        let stored = Job::deserialize(&page[0].0).unwrap();
        assert_eq!(stored.fails, 2);
        assert_eq!(stored.last_err.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn skip_dead_queue_drops_exhausted_jobs() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut registry = Registry::new();
        registry.register_with_options(
            "boom",
            JobOptions {
                max_fails: 1,
                skip_dead_queue: true,
                backoff: zero_backoff(),
                ..Default::default()
            },
            |_ctx| async { Err(anyhow!("boom")) },
        );
        let mut worker = worker_for(&ctx, registry);

        let raw = Job::new("boom", serde_json::Map::new())
            .serialize()
            .unwrap();
        ctx.store.push_live("boom", &raw).await.unwrap();
        let claimed = claim(&mut ctx, &worker).await;
        worker.process(claimed).await;

        assert!(ctx.store.in_progress_jobs("w-test").await.unwrap().is_empty());
        assert_eq!(ctx.store.dead_count().await.unwrap(), 0);
        assert_eq!(ctx.store.retry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unique_lock_survives_retry_and_releases_on_death() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut registry = Registry::new();
        registry.register_with_options(
            "boom",
            JobOptions {
                max_fails: 2,
                backoff: zero_backoff(),
                ..Default::default()
            },
            |_ctx| async { Err(anyhow!("boom")) },
        );
        let mut worker = worker_for(&ctx, registry);

        let mut job = Job::new("boom", serde_json::Map::new());
        let fingerprint = crate::job::fingerprint("boom", &job.args).unwrap();
        job.unique_key = Some(fingerprint.clone());
        let raw = job.serialize().unwrap();
        let admitted = ctx
            .store
            .enqueue_unique(&fingerprint, &job.id, "boom", &raw, None)
            .await
            .unwrap();
        assert!(admitted);

        // First failure lands in retry; a live copy still exists, so the
        // fingerprint lock must hold.
        let claimed = claim(&mut ctx, &worker).await;
        worker.process(claimed).await;
        assert_eq!(ctx.store.retry_count().await.unwrap(), 1);
        assert!(
            ctx.store
                .unique_lock_owner(&fingerprint)
                .await
                .unwrap()
                .is_some()
        );

        // Exhaustion moves the job to dead and releases the lock.
        let retry_key = ctx.store.keys().retry();
        let names = vec!["boom".to_string()];
        ctx.store
            .promote_due(&retry_key, &names, 0, 50)
            .await
            .unwrap();
        let claimed = claim(&mut ctx, &worker).await;
        worker.process(claimed).await;
        assert_eq!(ctx.store.dead_count().await.unwrap(), 1);
        assert!(
            ctx.store
                .unique_lock_owner(&fingerprint)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn panicking_handler_is_treated_as_failure() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut registry = Registry::new();
        registry.register_with_options(
            "explode",
            JobOptions {
                max_fails: 2,
                backoff: zero_backoff(),
                ..Default::default()
            },
            |_ctx| async { panic!("kaboom") },
        );
        let mut worker = worker_for(&ctx, registry);

        let raw = Job::new("explode", serde_json::Map::new())
            .serialize()
            .unwrap();
        ctx.store.push_live("explode", &raw).await.unwrap();
        let claimed = claim(&mut ctx, &worker).await;
        worker.process(claimed).await;

        assert!(ctx.store.in_progress_jobs("w-test").await.unwrap().is_empty());
        let retry_key = ctx.store.keys().retry();
        let page = ctx.store.zset_page(&retry_key, 0, 10).await.unwrap();
        let stored = Job::deserialize(&page[0].0).unwrap();
        assert_eq!(stored.fails, 1);
        assert!(stored.last_err.as_deref().unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn unhandled_job_goes_straight_to_dead() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let registry = Registry::new();
        let mut worker = worker_for(&ctx, registry);

        let raw = Job::new("mystery", serde_json::Map::new())
            .serialize()
            .unwrap();
        ctx.store.push_live("mystery", &raw).await.unwrap();
        // Claim manually since the registry offers no candidates.
        let candidates = vec![("mystery".to_string(), 1u32)];
        let claimed = ctx
            .store
            .claim_job("w-test", &candidates)
            .await
            .unwrap()
            .unwrap();
        worker.process(claimed).await;

        assert_eq!(ctx.store.dead_count().await.unwrap(), 1);
        assert_eq!(ctx.store.retry_count().await.unwrap(), 0);
        let dead_key = ctx.store.keys().dead();
        let page = ctx.store.zset_page(&dead_key, 0, 10).await.unwrap();
        let stored = Job::deserialize(&page[0].0).unwrap();
        assert!(
            stored
                .last_err
                .as_deref()
                .unwrap()
                .contains("no handler registered")
        );
    }

    #[tokio::test]
    async fn malformed_record_is_dead_lettered_as_is() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let registry = Registry::new();
        let mut worker = worker_for(&ctx, registry);

        worker.process("not a job".to_string()).await;
        assert_eq!(ctx.store.dead_count().await.unwrap(), 1);
        let dead_key = ctx.store.keys().dead();
        let page = ctx.store.zset_page(&dead_key, 0, 10).await.unwrap();
        assert_eq!(page[0].0, "not a job");
    }

    #[tokio::test]
    async fn observation_reflects_running_job() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut registry = Registry::new();
        // The handler reads its own observation mid-flight.
        registry.register("watchful", |job_ctx: JobContext| async move {
            job_ctx.checkin("step 1").await?;
            Ok(())
        });
        let mut worker = worker_for(&ctx, registry);

        let raw = Job::new("watchful", serde_json::Map::new())
            .serialize()
            .unwrap();
        ctx.store.push_live("watchful", &raw).await.unwrap();
        let claimed = claim(&mut ctx, &worker).await;
        worker.process(claimed).await;

        // Cleared after retirement.
        assert!(ctx.store.read_observation("w-test").await.unwrap().is_empty());
    }

    #[test]
    fn backoff_delay_grows_exponentially_and_caps() {
        let settings = Settings {
            backoff_base_seconds: 2.0,
            backoff_ceiling_seconds: 100.0,
            ..Default::default()
        };
        let options = JobOptions::default();
        let first = backoff_delay(&options, &settings, 1);
        assert!((3.2..=4.8).contains(&first), "got {first}");
        let capped = backoff_delay(&options, &settings, 20);
        assert!(capped <= 120.0, "got {capped}");
    }

    #[test]
    fn backoff_delay_honors_override() {
        let settings = Settings::default();
        let options = JobOptions {
            backoff: Some(Arc::new(|fails| fails as f64 * 10.0)),
            ..Default::default()
        };
        assert_eq!(backoff_delay(&options, &settings, 3), 30.0);
    }

    #[test]
    fn panic_message_extracts_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic payload");
    }
}
