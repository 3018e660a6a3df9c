//! Handler registry.
//!
//! Handlers are one shape: an async function from (context, job) to either a
//! result payload or an error. The registry maps handler names to boxed
//! functions; it is populated at startup and read-only afterwards.

use crate::error::JobError;
use crate::job::{Job, JobId};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

/// Boxed job handler.
pub type Handler =
    Box<dyn Fn(JobContext, Job) -> BoxFuture<'static, Result<Vec<u8>, JobError>> + Send + Sync>;

/// Execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Completed failures before this invocation.
    pub attempt: u32,

    /// Retry budget.
    pub max_retries: u32,

    /// Deadline after which the invocation is abandoned. The handler future
    /// is dropped at the deadline, so blocking past it only wastes the slot.
    pub deadline: DateTime<Utc>,

    /// Worker executing this job.
    pub worker_id: String,
}

impl JobContext {
    /// Returns true if this is the last attempt before dead-letter.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_retries
    }
}

/// Registry mapping job names to handlers.
#[derive(Default)]
pub struct JobRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl JobRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under a job name. Call before the worker pool
    /// starts; a later registration replaces the earlier one.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(JobContext, Job) -> BoxFuture<'static, Result<Vec<u8>, JobError>>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        self.handlers
            .write()
            .insert(name.clone(), Box::new(handler));
        info!(job_name = %name, "Registered job handler");
    }

    /// Returns true if a handler exists for the name.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Invokes the handler for the job name, if one is registered. The
    /// future is built under the read lock and awaited outside it.
    pub fn dispatch(
        &self,
        ctx: JobContext,
        job: Job,
    ) -> Option<BoxFuture<'static, Result<Vec<u8>, JobError>>> {
        let handlers = self.handlers.read();
        handlers.get(&job.name).map(|handler| handler(ctx, job))
    }

    /// Registered handler names.
    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns true if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
