//! Terminal outcome records and the result backend.

use crate::config::ResultsConfig;
use crate::error::JobResult;
use crate::job::JobId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::redis::RedisKeys;

/// Terminal outcome of one job, written exactly once when the job reaches
/// completed or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Job ID.
    pub job_id: JobId,

    /// Success or failure.
    pub status: OutcomeStatus,

    /// Opaque payload returned by the handler (empty on failure).
    #[serde(default)]
    pub payload: Vec<u8>,

    /// Error message (empty on success).
    #[serde(default)]
    pub error: String,

    /// When the handler started.
    pub started_at: DateTime<Utc>,

    /// When the terminal outcome was reached.
    pub completed_at: DateTime<Utc>,

    /// Execution duration in milliseconds.
    pub duration_ms: u64,
}

impl JobOutcome {
    /// Builds a success outcome.
    pub fn success(job_id: JobId, payload: Vec<u8>, started_at: DateTime<Utc>) -> Self {
        let completed_at = Utc::now();
        Self {
            job_id,
            status: OutcomeStatus::Success,
            payload,
            error: String::new(),
            started_at,
            completed_at,
            duration_ms: duration_ms_between(started_at, completed_at),
        }
    }

    /// Builds a failure outcome.
    pub fn failure(job_id: JobId, error: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let completed_at = Utc::now();
        Self {
            job_id,
            status: OutcomeStatus::Failure,
            payload: Vec::new(),
            error: error.into(),
            started_at,
            completed_at,
            duration_ms: duration_ms_between(started_at, completed_at),
        }
    }

    /// Returns true on success.
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

fn duration_ms_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Handler returned a payload.
    Success,
    /// Handler errored, panicked, or timed out.
    Failure,
}

/// Storage for terminal outcomes, keyed by job id.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Stores an outcome with a TTL chosen per status.
    async fn write(&self, outcome: &JobOutcome) -> JobResult<()>;

    /// Reads an outcome, if it exists and has not expired.
    async fn get(&self, job_id: &JobId) -> JobResult<Option<JobOutcome>>;

    /// Polls for an outcome until it appears or the timeout elapses.
    async fn wait(&self, job_id: &JobId, timeout: Duration) -> JobResult<Option<JobOutcome>>;

    /// Releases backend resources.
    async fn close(&self) -> JobResult<()>;
}

/// Redis-backed result storage: `results:{id}` JSON with a TTL per outcome.
pub struct RedisResultBackend {
    pool: Pool,
    keys: RedisKeys,
    config: ResultsConfig,
}

impl RedisResultBackend {
    /// Create a new result backend on the shared pool.
    pub fn new(pool: Pool, key_prefix: impl Into<String>, config: ResultsConfig) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
            config,
        }
    }

    fn ttl_for(&self, status: OutcomeStatus) -> Duration {
        match status {
            OutcomeStatus::Success => self.config.success_ttl,
            OutcomeStatus::Failure => self.config.failure_ttl,
        }
    }
}

#[async_trait]
impl ResultBackend for RedisResultBackend {
    async fn write(&self, outcome: &JobOutcome) -> JobResult<()> {
        let key = self.keys.result(outcome.job_id.as_str());
        let json = serde_json::to_string(outcome)?;
        let ttl = self.ttl_for(outcome.status);

        let mut conn = self.pool.get().await?;
        let _: () = conn.set_ex(&key, json, ttl.as_secs()).await?;

        debug!(
            job_id = %outcome.job_id,
            status = ?outcome.status,
            duration_ms = outcome.duration_ms,
            "Stored job outcome"
        );

        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> JobResult<Option<JobOutcome>> {
        let key = self.keys.result(job_id.as_str());
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = conn.get(&key).await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn wait(&self, job_id: &JobId, timeout: Duration) -> JobResult<Option<JobOutcome>> {
        let started = tokio::time::Instant::now();

        loop {
            if let Some(outcome) = self.get(job_id).await? {
                return Ok(Some(outcome));
            }
            if started.elapsed() >= timeout {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn close(&self) -> JobResult<()> {
        // The pool is shared with the queue engine; connections return to it
        // on drop, so there is nothing to tear down here.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serde_round_trip() {
        let started = Utc::now();
        let outcome = JobOutcome::success(JobId::new(), b"ok".to_vec(), started);

        let json = serde_json::to_string(&outcome).unwrap();
        let restored: JobOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.job_id, outcome.job_id);
        assert_eq!(restored.payload, b"ok".to_vec());
        assert!(restored.is_success());
        assert!(restored.error.is_empty());
    }

    #[test]
    fn failure_outcome_carries_error() {
        let outcome = JobOutcome::failure(JobId::new(), "boom", Utc::now());
        assert!(!outcome.is_success());
        assert_eq!(outcome.error, "boom");
        assert!(outcome.payload.is_empty());
    }

    #[test]
    fn ttl_differs_per_outcome() {
        let config = ResultsConfig::default();
        assert_eq!(config.success_ttl, Duration::from_secs(3600));
        assert_eq!(config.failure_ttl, Duration::from_secs(86400));
        assert!(config.failure_ttl > config.success_ttl);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&OutcomeStatus::Success).unwrap(),
            "\"success\""
        );
        assert_eq!(
            serde_json::to_string(&OutcomeStatus::Failure).unwrap(),
            "\"failure\""
        );
    }
}
