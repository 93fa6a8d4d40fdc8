use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::constants::{DEFAULT_MAX_FAILS, DEFAULT_PRIORITY};
use crate::middleware::JobContext;

/// Per-job retry delay override: maps the failure count so far to a delay in
/// seconds before the next attempt.
pub type BackoffFn = Arc<dyn Fn(u32) -> f64 + Send + Sync>;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn perform(&self, ctx: JobContext) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn perform(&self, ctx: JobContext) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// Execution options for one job name. Priorities are statistical weights,
/// not strict ordering; see the claim script.
#[derive(Clone)]
pub struct JobOptions {
    pub priority: u32,
    pub max_fails: u32,
    pub skip_dead_queue: bool,
    pub backoff: Option<BackoffFn>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            max_fails: DEFAULT_MAX_FAILS,
            skip_dead_queue: false,
            backoff: None,
        }
    }
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("priority", &self.priority)
            .field("max_fails", &self.max_fails)
            .field("skip_dead_queue", &self.skip_dead_queue)
            .field("backoff", &self.backoff.as_ref().map(|_| "custom"))
            .finish()
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredJob {
    pub options: JobOptions,
    pub handler: Arc<dyn Handler>,
}

/// Name → handler+options lookup shared by every worker in a pool.
#[derive(Clone, Default)]
pub struct Registry {
    jobs: HashMap<String, RegisteredJob>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_with_options(name, JobOptions::default(), handler);
    }

    pub fn register_with_options<F, Fut>(
        &mut self,
        name: impl Into<String>,
        options: JobOptions,
        handler: F,
    ) where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(FnHandler(handler)) as Arc<dyn Handler>;
        self.register_handler(name, options, handler);
    }

    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        mut options: JobOptions,
        handler: Arc<dyn Handler>,
    ) {
        options.priority = options.priority.max(1);
        options.max_fails = options.max_fails.max(1);
        self.jobs
            .insert(name.into(), RegisteredJob { options, handler });
    }

    pub(crate) fn get(&self, name: &str) -> Option<&RegisteredJob> {
        self.jobs.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// The `(name, weight)` table the claim script consumes, lexically
    /// ordered so every worker resolves weight ties identically.
    pub(crate) fn claim_candidates(&self) -> Vec<(String, u32)> {
        let mut candidates: Vec<(String, u32)> = self
            .jobs
            .iter()
            .map(|(name, registered)| (name.clone(), registered.options.priority))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        candidates
    }
}
