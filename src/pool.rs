use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::heartbeat::{HeartbeatContext, heartbeat_fields, heartbeat_loop, resolve_host};
use crate::job::new_identifier;
use crate::middleware::{FnMiddleware, JobContext, Middleware, Next};
use crate::periodic::{PeriodicContext, PeriodicSpec, periodic_loop};
use crate::reaper::{ReaperContext, reap_loop};
use crate::registry::{JobOptions, Registry};
use crate::requeuer::{RequeuerContext, requeue_loop};
use crate::settings::Settings;
use crate::store::JobStore;
use crate::timing::now_unix;
use crate::worker::Worker;

/// Owns `concurrency` workers plus the heartbeater, requeuer, reaper, and
/// periodic-enqueuer sidecars sharing one namespace.
pub struct WorkerPool {
    settings: Arc<Settings>,
    store: JobStore,
    pool_id: String,
    worker_ids: Vec<String>,
    registry: Registry,
    middleware: Vec<Arc<dyn Middleware>>,
    periodic_specs: Vec<PeriodicSpec>,
    shutdown: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
    sidecar_handles: Vec<JoinHandle<()>>,
    started_at: Option<i64>,
}

impl WorkerPool {
    pub fn new(
        concurrency: usize,
        namespace: &str,
        conn: redis::aio::MultiplexedConnection,
    ) -> Result<Self> {
        let settings = Settings {
            concurrency,
            namespace: namespace.to_string(),
            ..Default::default()
        };
        Self::with_settings(settings, conn)
    }

    pub fn with_settings(
        settings: Settings,
        conn: redis::aio::MultiplexedConnection,
    ) -> Result<Self> {
        if settings.concurrency == 0 {
            anyhow::bail!("concurrency must be positive");
        }
        let store = JobStore::with_connection(&settings.namespace, conn)?;
        let pool_id = new_identifier();
        let worker_ids = (0..settings.concurrency)
            .map(|_| new_identifier())
            .collect();
        Ok(Self {
            settings: Arc::new(settings),
            store,
            pool_id,
            worker_ids,
            registry: Registry::new(),
            middleware: Vec::new(),
            periodic_specs: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker_handles: Vec::new(),
            sidecar_handles: Vec::new(),
            started_at: None,
        })
    }

    pub async fn connect(settings: Settings) -> Result<Self> {
        let client = redis::Client::open(settings.redis_dsn.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Self::with_settings(settings, conn)
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    /// Appends an interceptor to the chain. Middleware runs in registration
    /// order around every job this pool executes.
    pub fn middleware<M: Middleware + 'static>(&mut self, middleware: M) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn middleware_fn<F, Fut>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(JobContext, Next) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.middleware.push(Arc::new(FnMiddleware(middleware)));
        self
    }

    /// Registers a handler for `name` with default options.
    pub fn job<F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.job_with_options(name, self.default_options(), handler)
    }

    pub fn job_with_options<F, Fut>(
        &mut self,
        name: &str,
        options: JobOptions,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.register_with_options(name, options, handler);
        self
    }

    fn default_options(&self) -> JobOptions {
        JobOptions {
            max_fails: self.settings.default_max_fails,
            ..Default::default()
        }
    }

    /// Attaches a cron spec (six fields, seconds first, UTC). Every pool
    /// with the same spec converges on the same scheduled instants.
    pub fn periodically_enqueue(&mut self, cron_expression: &str, name: &str) -> Result<&mut Self> {
        self.periodic_specs
            .push(PeriodicSpec::new(cron_expression, name)?);
        Ok(self)
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.started_at.is_some() {
            anyhow::bail!("worker pool already started");
        }
        let started_at = now_unix();
        self.shutdown = Arc::new(AtomicBool::new(false));

        self.store
            .add_known_job_names(&self.registry.names())
            .await?;

        // The pool must be visible before any claim happens, so the first
        // heartbeat is written synchronously.
        let heartbeat_ctx = self.heartbeat_context(started_at);
        let initial_fields = heartbeat_fields(&heartbeat_ctx, &resolve_host(), std::process::id());
        self.store
            .write_heartbeat(&self.pool_id, &initial_fields)
            .await?;

        self.sidecar_handles
            .push(tokio::spawn(heartbeat_loop(heartbeat_ctx)));
        self.sidecar_handles.push(tokio::spawn(requeue_loop(
            RequeuerContext {
                shutdown: self.shutdown.clone(),
                store: self.store.clone(),
                job_names: self.registry.names(),
                interval_seconds: self.settings.requeue_interval_seconds,
            },
        )));
        self.sidecar_handles.push(tokio::spawn(reap_loop(ReaperContext {
            shutdown: self.shutdown.clone(),
            store: self.store.clone(),
            own_pool_id: self.pool_id.clone(),
            dead_threshold_seconds: self.settings.dead_pool_threshold_seconds,
            lock_ttl_ms: self.settings.reap_lock_ttl_ms,
            interval_seconds: self.settings.reap_interval_seconds,
        })));
        if !self.periodic_specs.is_empty() {
            self.sidecar_handles
                .push(tokio::spawn(periodic_loop(PeriodicContext {
                    shutdown: self.shutdown.clone(),
                    store: self.store.clone(),
                    specs: Arc::new(self.periodic_specs.clone()),
                    tick_seconds: self.settings.periodic_tick_seconds,
                    horizon_seconds: self.settings.periodic_horizon_seconds,
                })));
        }

        let registry = Arc::new(self.registry.clone());
        let candidates = Arc::new(registry.claim_candidates());
        let middleware: Arc<[Arc<dyn Middleware>]> = Arc::from(self.middleware.clone());
        for worker_id in &self.worker_ids {
            let worker = Worker {
                worker_id: worker_id.clone(),
                store: self.store.clone(),
                registry: registry.clone(),
                middleware: middleware.clone(),
                candidates: candidates.clone(),
                settings: self.settings.clone(),
                shutdown: self.shutdown.clone(),
            };
            self.worker_handles.push(tokio::spawn(worker.run()));
        }
        self.started_at = Some(started_at);

        tracing::info!(
            pool_id = %self.pool_id,
            concurrency = self.settings.concurrency,
            job_names = %registry.names().join(","),
            "worker pool started"
        );
        Ok(())
    }

    /// Signals every loop to quit and waits for in-flight jobs up to the
    /// drain deadline. Workers still executing past the deadline continue in
    /// the background; their jobs stay in progress and are eligible for
    /// reaping once this pool's heartbeat ages out.
    pub async fn stop(&mut self) {
        if self.started_at.is_none() {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);

        let deadline = Duration::from_secs_f64(self.settings.drain_deadline_seconds);
        let drained = tokio::time::timeout(deadline, async {
            for handle in self.worker_handles.drain(..) {
                let _ = handle.await;
            }
        })
        .await;
        for handle in self.sidecar_handles.drain(..) {
            let _ = handle.await;
        }

        // Only a fully drained pool deregisters itself. Past the deadline
        // the pool stays in `pools` with a frozen heartbeat, so another
        // pool's reaper can recover whatever the lingering workers leave in
        // their in-progress lists.
        if drained.is_ok() {
            if let Err(err) = self.store.remove_pool(&self.pool_id, &self.worker_ids).await {
                tracing::error!(pool_id = %self.pool_id, error = %err, "failed to deregister pool");
            }
        } else {
            tracing::warn!(
                pool_id = %self.pool_id,
                "drain deadline exceeded; pool left registered so its in-progress jobs can be reaped"
            );
        }
        self.started_at = None;
        tracing::info!(pool_id = %self.pool_id, "worker pool stopped");
    }

    fn heartbeat_context(&self, started_at: i64) -> HeartbeatContext {
        HeartbeatContext {
            shutdown: self.shutdown.clone(),
            store: self.store.clone(),
            pool_id: self.pool_id.clone(),
            started_at,
            job_names: self.registry.names(),
            concurrency: self.settings.concurrency,
            worker_ids: self.worker_ids.clone(),
            interval_seconds: self.settings.heartbeat_interval_seconds,
        }
    }
}
