pub mod client;
pub mod constants;
pub mod enqueuer;
pub mod heartbeat;
pub mod job;
pub mod keys;
pub mod middleware;
pub mod observation;
pub mod pool;
pub mod registry;
pub mod settings;
pub mod store;

mod periodic;
mod reaper;
mod requeuer;
mod timing;
mod worker;

#[cfg(test)]
mod test_support;

pub use client::{Client, QueueInfo, TimedJob};
pub use enqueuer::Enqueuer;
pub use heartbeat::PoolHeartbeat;
pub use job::Job;
pub use keys::Keys;
pub use middleware::{JobContext, Middleware, Next};
pub use observation::Observation;
pub use pool::WorkerPool;
pub use registry::{BackoffFn, Handler, JobOptions, Registry};
pub use settings::Settings;
pub use store::JobStore;
