use anyhow::Result;

use crate::heartbeat::PoolHeartbeat;
use crate::job::Job;
use crate::observation::Observation;
use crate::store::JobStore;
use crate::timing::now_unix;

/// A live queue as the management UI sees it: depth plus the age of the job
/// a claim would take next.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub job_name: String,
    pub count: i64,
    pub latency_seconds: i64,
}

/// One entry of a time-ordered z-set. `at` is the run-at instant for
/// scheduled and retry entries, the failure instant for dead ones. `raw`
/// identifies the entry for the mutation operations.
#[derive(Debug, Clone)]
pub struct TimedJob {
    pub job: Job,
    pub at: i64,
    pub raw: String,
}

/// Read and management surface over the shared key-space: the operations the
/// web UI performs and the core must not break.
pub struct Client {
    store: JobStore,
}

impl Client {
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

    pub async fn pools(&mut self) -> Result<Vec<PoolHeartbeat>> {
        let mut heartbeats = Vec::new();
        for pool_id in self.store.pool_ids().await? {
            let raw = self.store.read_heartbeat(&pool_id).await?;
            if let Some(heartbeat) = PoolHeartbeat::parse(&pool_id, &raw) {
                heartbeats.push(heartbeat);
            }
        }
        Ok(heartbeats)
    }

    /// Current work across the fleet: one observation per busy worker.
    pub async fn observations(&mut self) -> Result<Vec<Observation>> {
        let mut observations = Vec::new();
        for pool in self.pools().await? {
            for worker_id in &pool.worker_ids {
                let raw = self.store.read_observation(worker_id).await?;
                if let Some(observation) = Observation::parse(worker_id, &raw) {
                    observations.push(observation);
                }
            }
        }
        Ok(observations)
    }

    pub async fn queues(&mut self) -> Result<Vec<QueueInfo>> {
        let now = now_unix();
        let mut queues = Vec::new();
        for job_name in self.store.known_job_names().await? {
            let count = self.store.queue_len(&job_name).await?;
            let latency_seconds = match self.store.queue_tail(&job_name).await? {
                Some(raw) => Job::deserialize(&raw)
                    .map(|job| (now - job.enqueued_at).max(0))
                    .unwrap_or(0),
                None => 0,
            };
            queues.push(QueueInfo {
                job_name,
                count,
                latency_seconds,
            });
        }
        Ok(queues)
    }

    pub async fn scheduled_count(&mut self) -> Result<i64> {
        self.store.scheduled_count().await
    }

    pub async fn retry_count(&mut self) -> Result<i64> {
        self.store.retry_count().await
    }

    pub async fn dead_count(&mut self) -> Result<i64> {
        self.store.dead_count().await
    }

    pub async fn scheduled_jobs(&mut self, offset: isize, count: isize) -> Result<Vec<TimedJob>> {
        let key = self.store.keys().scheduled();
        self.zset_jobs(&key, offset, count).await
    }

    pub async fn retry_jobs(&mut self, offset: isize, count: isize) -> Result<Vec<TimedJob>> {
        let key = self.store.keys().retry();
        self.zset_jobs(&key, offset, count).await
    }

    pub async fn dead_jobs(&mut self, offset: isize, count: isize) -> Result<Vec<TimedJob>> {
        let key = self.store.keys().dead();
        self.zset_jobs(&key, offset, count).await
    }

    async fn zset_jobs(&mut self, key: &str, offset: isize, count: isize) -> Result<Vec<TimedJob>> {
        let page = self.store.zset_page(key, offset, count).await?;
        let mut jobs = Vec::with_capacity(page.len());
        for (raw, score) in page {
            // Entries that do not parse stay visible through the counts but
            // cannot be listed.
            if let Ok(job) = Job::deserialize(&raw) {
                jobs.push(TimedJob {
                    job,
                    at: score as i64,
                    raw,
                });
            }
        }
        Ok(jobs)
    }

    /// Puts one dead job back on its live list with cleared failure state.
    /// Returns false when the entry is already gone.
    pub async fn requeue_dead_job(&mut self, raw: &str) -> Result<bool> {
        self.store.requeue_dead(raw).await
    }

    pub async fn delete_dead_job(&mut self, raw: &str) -> Result<bool> {
        self.store.delete_dead(raw).await
    }

    pub async fn requeue_all_dead_jobs(&mut self) -> Result<u64> {
        self.store.requeue_all_dead().await
    }

    pub async fn delete_all_dead_jobs(&mut self) -> Result<i64> {
        self.store.purge_dead().await
    }

    pub async fn queue_len(&mut self, job_name: &str) -> Result<i64> {
        self.store.queue_len(job_name).await
    }

    pub async fn purge_queue(&mut self, job_name: &str) -> Result<i64> {
        self.store.purge_queue(job_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enqueuer::Enqueuer;
    use crate::test_support::RedisTestContext;
    use crate::timing::now_unix;
    use serde_json::json;

    async fn client_for(ctx: &RedisTestContext) -> Client {
        Client::new(&ctx.settings.namespace, ctx.connection()).unwrap()
    }

    #[tokio::test]
    async fn queues_report_depth_and_latency() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut enqueuer = Enqueuer::new(&ctx.settings.namespace, ctx.connection()).unwrap();
        enqueuer
            .enqueue("send_email", json!({"to": "a@b"}).as_object().unwrap().clone())
            .await
            .unwrap();
        enqueuer
            .enqueue("send_email", serde_json::Map::new())
            .await
            .unwrap();

        let mut client = client_for(&ctx).await;
        let queues = client.queues().await.unwrap();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].job_name, "send_email");
        assert_eq!(queues[0].count, 2);
        assert!(queues[0].latency_seconds <= 2);
    }

    #[tokio::test]
    async fn listings_page_through_the_zsets() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut enqueuer = Enqueuer::new(&ctx.settings.namespace, ctx.connection()).unwrap();
        enqueuer
            .enqueue_in("ping", 60, serde_json::Map::new())
            .await
            .unwrap();
        enqueuer
            .enqueue_in("ping", 120, serde_json::Map::new())
            .await
            .unwrap();

        let mut failed = Job::new("boom", serde_json::Map::new());
        failed.fails = 1;
        failed.last_err = Some("boom".to_string());
        let retry_raw = failed.serialize().unwrap();
        ctx.store
            .retire_retry("w1", &retry_raw, &retry_raw, now_unix() + 30)
            .await
            .unwrap();

        let mut client = client_for(&ctx).await;
        assert_eq!(client.scheduled_count().await.unwrap(), 2);
        assert_eq!(client.retry_count().await.unwrap(), 1);
        assert_eq!(client.dead_count().await.unwrap(), 0);

        let scheduled = client.scheduled_jobs(0, 10).await.unwrap();
        assert_eq!(scheduled.len(), 2);
        assert!(scheduled[0].at <= scheduled[1].at);
        let first_page = client.scheduled_jobs(0, 1).await.unwrap();
        assert_eq!(first_page.len(), 1);
        assert_eq!(first_page[0].job.id, scheduled[0].job.id);

        let retries = client.retry_jobs(0, 10).await.unwrap();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].job.last_err.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn dead_job_operations_round_trip() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut dead = Job::new("flaky", serde_json::Map::new());
        dead.fails = 4;
        dead.last_err = Some("boom".to_string());
        dead.failed_at = Some(now_unix());
        let raw = dead.serialize().unwrap();
        ctx.store
            .retire_dead("w1", &raw, &raw, now_unix(), None)
            .await
            .unwrap();

        let mut client = client_for(&ctx).await;
        let listed = client.dead_jobs(0, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job.name, "flaky");

        assert!(client.requeue_dead_job(&listed[0].raw).await.unwrap());
        assert_eq!(client.dead_count().await.unwrap(), 0);
        assert_eq!(ctx.store.queue_len("flaky").await.unwrap(), 1);

        // Delete path.
        let mut other = Job::new("flaky", serde_json::Map::new());
        other.fails = 4;
        let other_raw = other.serialize().unwrap();
        ctx.store
            .retire_dead("w1", &other_raw, &other_raw, now_unix(), None)
            .await
            .unwrap();
        assert!(client.delete_dead_job(&other_raw).await.unwrap());
        assert!(!client.delete_dead_job(&other_raw).await.unwrap());
        assert_eq!(client.dead_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_all_dead_restores_every_queue() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        for name in ["alpha", "beta"] {
            let mut dead = Job::new(name, serde_json::Map::new());
            dead.fails = 4;
            let raw = dead.serialize().unwrap();
            ctx.store
                .retire_dead("w1", &raw, &raw, now_unix(), None)
                .await
                .unwrap();
        }

        let mut client = client_for(&ctx).await;
        assert_eq!(client.requeue_all_dead_jobs().await.unwrap(), 2);
        assert_eq!(client.dead_count().await.unwrap(), 0);
        assert_eq!(ctx.store.queue_len("alpha").await.unwrap(), 1);
        assert_eq!(ctx.store.queue_len("beta").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_all_dead_jobs_empties_the_set() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        for _ in 0..2 {
            let mut dead = Job::new("flaky", serde_json::Map::new());
            dead.fails = 4;
            let raw = dead.serialize().unwrap();
            ctx.store
                .retire_dead("w1", &raw, &raw, now_unix(), None)
                .await
                .unwrap();
        }
        let mut client = client_for(&ctx).await;
        assert_eq!(client.delete_all_dead_jobs().await.unwrap(), 2);
        assert_eq!(client.dead_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pools_and_observations_surface_fleet_state() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let fields = vec![
            ("started_at", "100".to_string()),
            ("heartbeat_at", now_unix().to_string()),
            ("job_names", "send_email".to_string()),
            ("concurrency", "2".to_string()),
            ("host", "host-1".to_string()),
            ("pid", "7".to_string()),
            ("worker_ids", "w1,w2".to_string()),
        ];
        ctx.store.write_heartbeat("pool-1", &fields).await.unwrap();
        let observation_fields = vec![
            ("job_id", "abc".to_string()),
            ("job_name", "send_email".to_string()),
            ("args", "{}".to_string()),
            ("started_at", now_unix().to_string()),
        ];
        ctx.store
            .write_observation("w2", &observation_fields)
            .await
            .unwrap();

        let mut client = client_for(&ctx).await;
        let pools = client.pools().await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].worker_ids, vec!["w1".to_string(), "w2".to_string()]);

        let observations = client.observations().await.unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].worker_id, "w2");
        assert_eq!(observations[0].job_name, "send_email");
    }
}
