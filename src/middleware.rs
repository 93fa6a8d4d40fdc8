use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::job::Job;
use crate::registry::Handler;
use crate::store::JobStore;
use crate::timing::now_unix;

/// The capability handed to every interceptor and handler: the claimed job
/// plus the check-in channel back to the worker's observation hash.
#[derive(Clone)]
pub struct JobContext {
    job: Arc<Job>,
    worker_id: Arc<str>,
    store: JobStore,
}

impl JobContext {
    pub(crate) fn new(job: Arc<Job>, worker_id: &str, store: JobStore) -> Self {
        Self {
            job,
            worker_id: Arc::from(worker_id),
            store,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn args(&self) -> &serde_json::Map<String, Value> {
        &self.job.args
    }

    pub fn unmarshal_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        self.job.unmarshal_payload()
    }

    /// Advisory progress note, surfaced through the worker's observation
    /// hash. It does not extend any deadline.
    pub async fn checkin(&self, message: &str) -> Result<()> {
        let mut store = self.store.clone();
        store
            .write_observation(
                &self.worker_id,
                &[
                    ("checkin", message.to_string()),
                    ("checkin_at", now_unix().to_string()),
                ],
            )
            .await
    }
}

/// An interceptor in the execution chain. Invoking the continuation enters
/// the next interceptor, or the handler at the end of the chain; returning
/// without invoking it short-circuits the job, and the returned error
/// becomes the job's error.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, ctx: JobContext, next: Next) -> Result<()>;
}

pub(crate) struct FnMiddleware<F>(pub F);

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(JobContext, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn call(&self, ctx: JobContext, next: Next) -> Result<()> {
        (self.0)(ctx, next).await
    }
}

/// Continuation into the remainder of the chain. Owned so the whole chain
/// can run inside a spawned task.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    handler: Arc<dyn Handler>,
    index: usize,
}

impl Next {
    pub(crate) fn new(chain: Arc<[Arc<dyn Middleware>]>, handler: Arc<dyn Handler>) -> Self {
        Self {
            chain,
            handler,
            index: 0,
        }
    }

    pub async fn run(self, ctx: JobContext) -> Result<()> {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                let next = Next {
                    chain: self.chain,
                    handler: self.handler,
                    index: self.index + 1,
                };
                middleware.call(ctx, next).await
            }
            None => self.handler.perform(ctx).await,
        }
    }
}
