//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job execution failed.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Job execution exceeded its deadline. The display form is the exact
    /// string persisted on the job record.
    #[error("timeout")]
    Timeout,

    /// Handler panicked during execution.
    #[error("handler panicked: {0}")]
    Panic(String),

    /// No handler is registered for the job name.
    #[error("no handler registered for job: {0}")]
    UnknownHandler(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Job is not in a state the operation accepts.
    #[error("Invalid job state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Cron expression did not parse as a 5-field expression.
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    /// Routing key violated the length or character constraints.
    #[error("Invalid routing key: {0}")]
    InvalidRoutingKey(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Worker error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Scheduler error.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl JobError {
    /// Returns true if the error came from the store rather than the job
    /// itself. Store errors surface to callers; job failures are recorded on
    /// the job record and never propagate.
    pub fn is_store_error(&self) -> bool {
        matches!(self, JobError::Redis(_) | JobError::Pool(_))
    }
}
