//! Bananas Jobs - distributed background job queue over Redis.
//!
//! A priority-aware job queue with:
//! - Opaque-payload job records with status tracking
//! - Priority queues (high, normal, low) partitioned by routing key
//! - Atomic blocking dequeue into a processing list
//! - Retry with exponential backoff and a dead-letter list
//! - Worker pools with configurable concurrency, timeouts, and panic recovery
//! - Cron schedules evaluated per-timezone under per-schedule distributed locks
//! - Result records retrievable by job id within a TTL
//!
//! # Example
//!
//! ```rust,ignore
//! use bananas_jobs::prelude::*;
//! use std::sync::Arc;
//!
//! let config = JobsConfig::from_env()?;
//! let pool = bananas_jobs::redis::create_pool(&config.redis).await?;
//!
//! let queue = Arc::new(RedisJobQueue::new(pool.clone(), &config));
//! let results = Arc::new(RedisResultBackend::new(
//!     pool.clone(),
//!     &config.redis.key_prefix,
//!     config.results.clone(),
//! ));
//!
//! let registry = Arc::new(JobRegistry::new());
//! registry.register("echo", |_ctx, job| {
//!     Box::pin(async move { Ok(job.payload) })
//! });
//!
//! queue.enqueue(&Job::builder("echo").payload(b"hi".to_vec()).build()).await?;
//!
//! let workers = WorkerPool::new(queue, results, registry, config.worker.clone());
//! workers.start().await?;
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod redis;
pub mod registry;
pub mod results;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use config::{
    JobsConfig, QueueConfig, RedisConfig, ResultsConfig, SchedulerConfig, WorkerConfig,
};
pub use error::{JobError, JobResult};
pub use job::{Job, JobBuilder, JobId, JobStatus, Priority, RoutingKey};
pub use metrics::{register_metrics, JobMetrics, SchedulerMetrics, WorkerMetrics};
pub use queue::{precedence, JobQueue, QueueSlot, QueueStats};
pub use redis::{create_pool, RedisJobQueue, RedisKeys};
pub use registry::{Handler, JobContext, JobRegistry};
pub use results::{JobOutcome, OutcomeStatus, RedisResultBackend, ResultBackend};
pub use scheduler::{CronSchedule, CronScheduler, ScheduleState, SchedulerStats};
pub use worker::{WorkerPool, WorkerPoolStats};

/// Re-export of commonly used types.
pub mod prelude {
    pub use crate::config::JobsConfig;
    pub use crate::error::{JobError, JobResult};
    pub use crate::job::{Job, JobId, JobStatus, Priority, RoutingKey};
    pub use crate::queue::JobQueue;
    pub use crate::redis::RedisJobQueue;
    pub use crate::registry::{JobContext, JobRegistry};
    pub use crate::results::{JobOutcome, RedisResultBackend, ResultBackend};
    pub use crate::scheduler::{CronSchedule, CronScheduler};
    pub use crate::worker::WorkerPool;
}
