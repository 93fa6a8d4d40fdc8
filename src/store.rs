use std::collections::HashMap;

use anyhow::{Context, Result};
use rand::Rng;
use redis::AsyncCommands;
use redis::Script;

use crate::keys::Keys;
use crate::timing::now_unix;

const CLAIM_JOB_LUA: &str = include_str!("lua/claim_job.lua");
const ENQUEUE_UNIQUE_LUA: &str = include_str!("lua/enqueue_unique.lua");
const REQUEUE_DUE_LUA: &str = include_str!("lua/requeue_due.lua");
const REAP_IN_PROGRESS_LUA: &str = include_str!("lua/reap_in_progress.lua");
const REQUEUE_DEAD_LUA: &str = include_str!("lua/requeue_dead.lua");
const REQUEUE_ALL_DEAD_LUA: &str = include_str!("lua/requeue_all_dead.lua");

const DEAD_REQUEUE_BATCH: usize = 100;

fn summarize_redis_dsn(dsn: &str) -> String {
    let (scheme, rest) = dsn.split_once("://").unwrap_or(("", dsn));
    let without_auth = rest.rsplit('@').next().unwrap_or(rest);
    let host = without_auth
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_auth);
    if scheme.is_empty() {
        host.to_string()
    } else {
        format!("{scheme}://{host}")
    }
}

/// Every store operation the library performs, over one multiplexed
/// connection. Multi-key mutations that must be atomic are either one of the
/// embedded scripts or an atomic pipeline; everything else is a single
/// command.
#[derive(Clone)]
pub struct JobStore {
    keys: Keys,
    conn: redis::aio::MultiplexedConnection,
    claim_job_script: Script,
    enqueue_unique_script: Script,
    requeue_due_script: Script,
    reap_in_progress_script: Script,
    requeue_dead_script: Script,
    requeue_all_dead_script: Script,
}

impl JobStore {
    pub async fn connect(redis_dsn: &str, namespace: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_dsn).with_context(|| "failed to create Redis client")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .with_context(|| {
                format!(
                    "failed to connect to Redis ({})",
                    summarize_redis_dsn(redis_dsn)
                )
            })?;
        Self::with_connection(namespace, conn)
    }

    pub fn with_connection(
        namespace: &str,
        conn: redis::aio::MultiplexedConnection,
    ) -> Result<Self> {
        Ok(Self {
            keys: Keys::new(namespace)?,
            conn,
            claim_job_script: Script::new(CLAIM_JOB_LUA),
            enqueue_unique_script: Script::new(ENQUEUE_UNIQUE_LUA),
            requeue_due_script: Script::new(REQUEUE_DUE_LUA),
            reap_in_progress_script: Script::new(REAP_IN_PROGRESS_LUA),
            requeue_dead_script: Script::new(REQUEUE_DEAD_LUA),
            requeue_all_dead_script: Script::new(REQUEUE_ALL_DEAD_LUA),
        })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    // ----- admission -----

    pub async fn push_live(&mut self, job_name: &str, raw: &str) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(self.keys.known_jobs(), job_name);
        pipe.lpush(self.keys.queue(job_name), raw);
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    pub async fn push_scheduled(&mut self, job_name: &str, raw: &str, run_at: i64) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(self.keys.known_jobs(), job_name);
        pipe.zadd(self.keys.scheduled(), raw, run_at);
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    /// Unique admission. `run_at` targets the scheduled z-set; `None` targets
    /// the live list. Returns false when the fingerprint lock is already
    /// held, which is not an error.
    pub async fn enqueue_unique(
        &mut self,
        fingerprint: &str,
        job_id: &str,
        job_name: &str,
        raw: &str,
        run_at: Option<i64>,
    ) -> Result<bool> {
        let target = match run_at {
            Some(_) => self.keys.scheduled(),
            None => self.keys.queue(job_name),
        };
        let score = run_at.map(|t| t.to_string()).unwrap_or_default();
        let admitted: i64 = self
            .enqueue_unique_script
            .key(self.keys.unique(fingerprint))
            .key(target)
            .key(self.keys.known_jobs())
            .arg(job_id)
            .arg(raw)
            .arg(job_name)
            .arg(score)
            .invoke_async(&mut self.conn)
            .await?;
        Ok(admitted == 1)
    }

    pub async fn unique_lock_owner(&mut self, fingerprint: &str) -> Result<Option<String>> {
        let owner: Option<String> = self.conn.get(self.keys.unique(fingerprint)).await?;
        Ok(owner)
    }

    // ----- claim -----

    /// One fetch attempt: weighted selection over the candidate names and an
    /// atomic move to the worker's in-progress list. `candidates` must be
    /// lexically sorted by name so ties break identically everywhere.
    pub async fn claim_job(
        &mut self,
        worker_id: &str,
        candidates: &[(String, u32)],
    ) -> Result<Option<String>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let seed: i64 = rand::rng().random_range(0..16_777_216);
        let script = self.claim_job_script.clone();
        let mut invocation = script.prepare_invoke();
        for (name, _) in candidates {
            invocation.key(self.keys.queue(name));
        }
        invocation.key(self.keys.in_progress(worker_id));
        invocation.arg(seed);
        for (_, priority) in candidates {
            invocation.arg(*priority);
        }
        let raw: Option<String> = invocation.invoke_async(&mut self.conn).await?;
        Ok(raw)
    }

    // ----- retirement -----

    pub async fn retire_success(
        &mut self,
        worker_id: &str,
        raw: &str,
        unique_key: Option<&str>,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(self.keys.in_progress(worker_id), 1, raw);
        if let Some(fingerprint) = unique_key {
            pipe.del(self.keys.unique(fingerprint));
        }
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    /// Failure with attempts remaining: the mutated record enters `retry`
    /// and the claimed bytes leave the in-progress list. The fingerprint
    /// lock stays held while a live copy exists.
    pub async fn retire_retry(
        &mut self,
        worker_id: &str,
        claimed_raw: &str,
        updated_raw: &str,
        retry_at: i64,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(self.keys.in_progress(worker_id), 1, claimed_raw);
        pipe.zadd(self.keys.retry(), updated_raw, retry_at);
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    pub async fn retire_dead(
        &mut self,
        worker_id: &str,
        claimed_raw: &str,
        updated_raw: &str,
        died_at: i64,
        unique_key: Option<&str>,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(self.keys.in_progress(worker_id), 1, claimed_raw);
        pipe.zadd(self.keys.dead(), updated_raw, died_at);
        if let Some(fingerprint) = unique_key {
            pipe.del(self.keys.unique(fingerprint));
        }
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    /// Terminal drop for jobs whose options skip the dead queue.
    pub async fn retire_drop(
        &mut self,
        worker_id: &str,
        claimed_raw: &str,
        unique_key: Option<&str>,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(self.keys.in_progress(worker_id), 1, claimed_raw);
        if let Some(fingerprint) = unique_key {
            pipe.del(self.keys.unique(fingerprint));
        }
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    /// Unparseable claimed bytes go to `dead` untouched; there is no record
    /// to annotate.
    pub async fn retire_malformed(&mut self, worker_id: &str, raw: &str) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(self.keys.in_progress(worker_id), 1, raw);
        pipe.zadd(self.keys.dead(), raw, now_unix());
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    pub async fn in_progress_jobs(&mut self, worker_id: &str) -> Result<Vec<String>> {
        let entries: Vec<String> = self
            .conn
            .lrange(self.keys.in_progress(worker_id), 0, -1)
            .await?;
        Ok(entries)
    }

    // ----- scheduled / retry promotion -----

    /// Promotes due entries from `source_key` (the scheduled or retry z-set)
    /// onto their live lists. Only `names` are promoted; due entries this
    /// pool cannot route stay in place and the caller skips over them with
    /// `offset` on the next call. Returns `(scanned, moved)`.
    pub async fn promote_due(
        &mut self,
        source_key: &str,
        names: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<(i64, i64)> {
        let script = self.requeue_due_script.clone();
        let mut invocation = script.prepare_invoke();
        invocation.key(source_key);
        invocation.arg(now_unix());
        invocation.arg(self.keys.queue_prefix());
        invocation.arg(offset);
        invocation.arg(limit);
        for name in names {
            invocation.arg(name.as_str());
        }
        let counts: (i64, i64) = invocation.invoke_async(&mut self.conn).await?;
        Ok(counts)
    }

    // ----- observations -----

    pub async fn write_observation(
        &mut self,
        worker_id: &str,
        fields: &[(&str, String)],
    ) -> Result<()> {
        let mapping: Vec<(&str, &str)> = fields
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
            .collect();
        self.conn
            .hset_multiple::<_, _, _, ()>(self.keys.observation(worker_id), &mapping)
            .await?;
        Ok(())
    }

    pub async fn clear_observation(&mut self, worker_id: &str) -> Result<()> {
        let _: i64 = self.conn.del(self.keys.observation(worker_id)).await?;
        Ok(())
    }

    pub async fn read_observation(&mut self, worker_id: &str) -> Result<HashMap<String, String>> {
        let raw: HashMap<String, String> =
            self.conn.hgetall(self.keys.observation(worker_id)).await?;
        Ok(raw)
    }

    // ----- heartbeats -----

    pub async fn write_heartbeat(&mut self, pool_id: &str, fields: &[(&str, String)]) -> Result<()> {
        let mapping: Vec<(&str, &str)> = fields
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
            .collect();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(self.keys.pools(), pool_id);
        pipe.hset_multiple(self.keys.heartbeat(pool_id), &mapping);
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    pub async fn read_heartbeat(&mut self, pool_id: &str) -> Result<HashMap<String, String>> {
        let raw: HashMap<String, String> = self.conn.hgetall(self.keys.heartbeat(pool_id)).await?;
        Ok(raw)
    }

    pub async fn pool_ids(&mut self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.conn.smembers(self.keys.pools()).await?;
        ids.sort();
        Ok(ids)
    }

    pub async fn remove_pool(&mut self, pool_id: &str, worker_ids: &[String]) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.srem(self.keys.pools(), pool_id);
        pipe.del(self.keys.heartbeat(pool_id));
        for worker_id in worker_ids {
            pipe.del(self.keys.observation(worker_id));
        }
        pipe.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    // ----- reaping -----

    pub async fn try_reap_lock(&mut self, pool_id: &str, ttl_ms: i64) -> Result<bool> {
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.keys.reap_lock(pool_id))
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut self.conn)
            .await?;
        Ok(acquired.is_some())
    }

    pub async fn release_reap_lock(&mut self, pool_id: &str) -> Result<()> {
        let _: i64 = self.conn.del(self.keys.reap_lock(pool_id)).await?;
        Ok(())
    }

    /// Drains a dead worker's in-progress list back onto live queues, one
    /// atomic move per record. Returns the number of records moved.
    pub async fn reap_in_progress(&mut self, worker_id: &str) -> Result<u64> {
        let in_progress = self.keys.in_progress(worker_id);
        let mut moved = 0u64;
        loop {
            let raw: Option<String> = self
                .reap_in_progress_script
                .key(&in_progress)
                .key(self.keys.dead())
                .arg(self.keys.queue_prefix())
                .arg(now_unix())
                .invoke_async(&mut self.conn)
                .await?;
            if raw.is_none() {
                return Ok(moved);
            }
            moved += 1;
        }
    }

    // ----- periodic -----

    /// ZADD of a deterministic record; the z-set deduplicates members, so
    /// returns false when another pool already scheduled this instant.
    pub async fn schedule_periodic(&mut self, job_name: &str, raw: &str, run_at: i64) -> Result<bool> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.sadd(self.keys.known_jobs(), job_name).ignore();
        pipe.zadd(self.keys.scheduled(), raw, run_at);
        let (added,): (i64,) = pipe.query_async(&mut self.conn).await?;
        Ok(added == 1)
    }

    pub async fn periodic_last_enqueued(&mut self, spec_key: &str) -> Result<Option<i64>> {
        let value: Option<String> = self
            .conn
            .hget(self.keys.periodic_last_enqueued(), spec_key)
            .await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub async fn set_periodic_last_enqueued(&mut self, spec_key: &str, until: i64) -> Result<()> {
        self.conn
            .hset::<_, _, _, ()>(self.keys.periodic_last_enqueued(), spec_key, until)
            .await?;
        Ok(())
    }

    // ----- introspection & management -----

    /// Marks names as observed. Pools call this at start so every name the
    /// claim script considers is in `known_jobs` before the first fetch.
    pub async fn add_known_job_names(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.conn
            .sadd::<_, _, ()>(self.keys.known_jobs(), names)
            .await?;
        Ok(())
    }

    pub async fn known_job_names(&mut self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.conn.smembers(self.keys.known_jobs()).await?;
        names.sort();
        Ok(names)
    }

    pub async fn queue_len(&mut self, job_name: &str) -> Result<i64> {
        let len: i64 = self.conn.llen(self.keys.queue(job_name)).await?;
        Ok(len)
    }

    /// The next record a claim would take (the list tail), for queue-latency
    /// estimates.
    pub async fn queue_tail(&mut self, job_name: &str) -> Result<Option<String>> {
        let raw: Option<String> = self.conn.lindex(self.keys.queue(job_name), -1).await?;
        Ok(raw)
    }

    pub async fn purge_queue(&mut self, job_name: &str) -> Result<i64> {
        let queue_key = self.keys.queue(job_name);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.llen(&queue_key);
        pipe.del(&queue_key).ignore();
        let (purged,): (i64,) = pipe.query_async(&mut self.conn).await?;
        Ok(purged)
    }

    pub async fn scheduled_count(&mut self) -> Result<i64> {
        let count: i64 = self.conn.zcard(self.keys.scheduled()).await?;
        Ok(count)
    }

    pub async fn retry_count(&mut self) -> Result<i64> {
        let count: i64 = self.conn.zcard(self.keys.retry()).await?;
        Ok(count)
    }

    pub async fn dead_count(&mut self) -> Result<i64> {
        let count: i64 = self.conn.zcard(self.keys.dead()).await?;
        Ok(count)
    }

    /// A page of `(member, score)` pairs from one of the time-ordered
    /// z-sets, ascending by score.
    pub async fn zset_page(
        &mut self,
        key: &str,
        offset: isize,
        count: isize,
    ) -> Result<Vec<(String, f64)>> {
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(offset)
            .arg(offset + count - 1)
            .arg("WITHSCORES")
            .query_async(&mut self.conn)
            .await?;
        Ok(entries)
    }

    pub async fn delete_dead(&mut self, raw: &str) -> Result<bool> {
        let removed: i64 = self.conn.zrem(self.keys.dead(), raw).await?;
        Ok(removed == 1)
    }

    pub async fn requeue_dead(&mut self, raw: &str) -> Result<bool> {
        let outcome: i64 = self
            .requeue_dead_script
            .key(self.keys.dead())
            .arg(raw)
            .arg(self.keys.queue_prefix())
            .invoke_async(&mut self.conn)
            .await?;
        if outcome < 0 {
            anyhow::bail!("dead entry is not a parseable job record");
        }
        Ok(outcome == 1)
    }

    /// Drains every routable record out of the dead z-set. Unroutable
    /// members stay behind; the offset walks past them so they cannot stop
    /// the scan short of the members ranked after them.
    pub async fn requeue_all_dead(&mut self) -> Result<u64> {
        let mut total = 0u64;
        let mut offset = 0usize;
        loop {
            let (scanned, moved): (i64, i64) = self
                .requeue_all_dead_script
                .key(self.keys.dead())
                .arg(offset)
                .arg(DEAD_REQUEUE_BATCH)
                .arg(self.keys.queue_prefix())
                .invoke_async(&mut self.conn)
                .await?;
            total += moved as u64;
            offset += (scanned - moved).max(0) as usize;
            if (scanned as usize) < DEAD_REQUEUE_BATCH {
                return Ok(total);
            }
        }
    }

    pub async fn purge_dead(&mut self) -> Result<i64> {
        let dead_key = self.keys.dead();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zcard(&dead_key);
        pipe.del(&dead_key).ignore();
        let (purged,): (i64,) = pipe.query_async(&mut self.conn).await?;
        Ok(purged)
    }

    #[cfg(test)]
    pub async fn flushdb(&mut self) -> Result<()> {
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut self.conn)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub fn connection(&mut self) -> &mut redis::aio::MultiplexedConnection {
        &mut self.conn
    }
}
