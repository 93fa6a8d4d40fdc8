use anyhow::Result;
use serde_json::Value;

use crate::job::{Job, fingerprint};
use crate::store::JobStore;
use crate::timing::now_unix;

/// The producer surface: admits jobs into a namespace. Store errors
/// propagate to the caller; a unique collision does not.
pub struct Enqueuer {
    store: JobStore,
}

impl Enqueuer {
    pub fn new(namespace: &str, conn: redis::aio::MultiplexedConnection) -> Result<Self> {
        Ok(Self {
            store: JobStore::with_connection(namespace, conn)?,
        })
    }

    pub async fn connect(namespace: &str, redis_dsn: &str) -> Result<Self> {
        Ok(Self {
            store: JobStore::connect(redis_dsn, namespace).await?,
        })
    }

    /// Admits a job onto the live list for `name`.
    pub async fn enqueue(
        &mut self,
        name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<Job> {
        validate_name(name)?;
        let job = Job::new(name, args);
        let raw = job.serialize()?;
        self.store.push_live(name, &raw).await?;
        tracing::info!(job_id = %job.id, job_name = %name, "job enqueued");
        Ok(job)
    }

    /// Admits a job that becomes claimable `delay_seconds` from now.
    pub async fn enqueue_in(
        &mut self,
        name: &str,
        delay_seconds: i64,
        args: serde_json::Map<String, Value>,
    ) -> Result<Job> {
        validate_name(name)?;
        let job = Job::new(name, args);
        let raw = job.serialize()?;
        let run_at = now_unix() + delay_seconds.max(0);
        self.store.push_scheduled(name, &raw, run_at).await?;
        tracing::info!(job_id = %job.id, job_name = %name, run_at, "job scheduled");
        Ok(job)
    }

    /// Admits a job unless one with the same fingerprint is already queued,
    /// scheduled, retrying, or executing. Returns `None` on collision; the
    /// absence of the job is the signal, not an error.
    pub async fn enqueue_unique(
        &mut self,
        name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<Option<Job>> {
        self.enqueue_unique_at(name, args, None).await
    }

    /// `enqueue_unique` targeting the scheduled set.
    pub async fn enqueue_unique_in(
        &mut self,
        name: &str,
        delay_seconds: i64,
        args: serde_json::Map<String, Value>,
    ) -> Result<Option<Job>> {
        let run_at = now_unix() + delay_seconds.max(0);
        self.enqueue_unique_at(name, args, Some(run_at)).await
    }

    async fn enqueue_unique_at(
        &mut self,
        name: &str,
        args: serde_json::Map<String, Value>,
        run_at: Option<i64>,
    ) -> Result<Option<Job>> {
        validate_name(name)?;
        let key = fingerprint(name, &args)?;
        let mut job = Job::new(name, args);
        job.unique_key = Some(key.clone());
        let raw = job.serialize()?;
        let admitted = self
            .store
            .enqueue_unique(&key, &job.id, name, &raw, run_at)
            .await?;
        if !admitted {
            tracing::debug!(job_name = %name, "unique job already queued");
            return Ok(None);
        }
        tracing::info!(job_id = %job.id, job_name = %name, "unique job enqueued");
        Ok(Some(job))
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("job name must be non-empty");
    }
    Ok(())
}
