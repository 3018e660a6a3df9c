//! Redis queue engine implementation.

use super::RedisKeys;
use crate::config::JobsConfig;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobStatus};
use crate::metrics::JobMetrics;
use crate::queue::{precedence, JobQueue, QueueSlot, QueueStats};
use crate::retry::retry_delay;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Blocking pop timeout for every queue except the last in precedence.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Blocking pop timeout for the last queue, so an idle worker parks longer
/// on its lowest-precedence source.
const LAST_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(3);

/// Redis-backed queue engine. Owns all key naming and every transition
/// between the pending queues, scheduled set, processing list, and
/// dead-letter list.
pub struct RedisJobQueue {
    pool: Pool,
    keys: RedisKeys,
    completed_ttl: Duration,
    dead_letter_ttl: Duration,
    /// Queue keys this deployment drains, for stats.
    queue_keys: Vec<String>,
}

impl RedisJobQueue {
    /// Create a new Redis queue engine.
    pub fn new(pool: Pool, config: &JobsConfig) -> Self {
        let keys = RedisKeys::new(&config.redis.key_prefix);
        let queue_keys = precedence(&config.worker.routing_keys, &config.worker.priorities)
            .iter()
            .map(|(route, priority)| keys.queue_for(route, *priority))
            .collect();

        Self {
            pool,
            keys,
            completed_ttl: config.queue.completed_ttl,
            dead_letter_ttl: config.queue.dead_letter_ttl,
            queue_keys,
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    fn enqueue_into(&self, pipe: &mut redis::Pipeline, job: &Job, record: &str) {
        let job_key = self.keys.job(job.id.as_str());
        pipe.cmd("SET").arg(&job_key).arg(record);

        if let Some(at) = job.scheduled_for {
            pipe.zadd(self.keys.scheduled(), job.id.as_str(), at.timestamp());
        } else {
            let queue_key = self.keys.queue_for(&job.routing_key, job.priority);
            pipe.lpush(&queue_key, job.id.as_str());
        }
    }

    /// Reads the record for a freshly popped id and marks it processing.
    /// A missing or unreadable record is quarantined: the id moves to the
    /// dead-letter list and a placeholder record takes the record's place.
    async fn claim_popped(
        &self,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
    ) -> JobResult<Option<Job>> {
        let job_key = self.keys.job(job_id);
        let raw: Option<String> = conn.get(&job_key).await?;

        let parsed = match raw {
            Some(json) => Job::from_json(&json).map_err(|e| e.to_string()),
            None => Err("job record missing".to_string()),
        };

        let mut job = match parsed {
            Ok(job) => job,
            Err(reason) => {
                self.quarantine(conn, job_id, &reason).await?;
                return Ok(None);
            }
        };

        job.status = JobStatus::Processing;
        job.updated_at = Utc::now();

        let _: () = conn.set(&job_key, job.to_json()?).await?;

        debug!(
            job_id = %job.id,
            job_name = %job.name,
            attempt = job.attempts,
            "Dequeued job"
        );
        JobMetrics::job_dequeued(&job.name, job.priority.as_str());

        Ok(Some(job))
    }

    /// Moves an id with an unusable record to the dead-letter list, writing
    /// an error marker where the record should have been. Does not consume a
    /// retry attempt.
    async fn quarantine(
        &self,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
        reason: &str,
    ) -> JobResult<()> {
        let now = Utc::now();
        let marker = Job {
            id: JobId::from(job_id),
            name: String::new(),
            description: String::new(),
            payload: Vec::new(),
            status: JobStatus::Failed,
            priority: Default::default(),
            routing_key: Default::default(),
            created_at: now,
            updated_at: now,
            scheduled_for: None,
            attempts: 0,
            max_retries: 0,
            error: format!("unreadable job record: {}", reason),
        };

        let _: () = redis::pipe()
            .lrem(self.keys.processing(), 1, job_id)
            .lpush(self.keys.dead(), job_id)
            .cmd("SET")
            .arg(self.keys.job(job_id))
            .arg(marker.to_json()?)
            .arg("EX")
            .arg(self.dead_letter_ttl.as_secs())
            .query_async(&mut *conn)
            .await?;

        warn!(job_id = %job_id, reason = %reason, "Quarantined unreadable job");
        JobMetrics::job_quarantined();

        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &Job) -> JobResult<()> {
        let record = job.to_json()?;

        let mut pipe = redis::pipe();
        self.enqueue_into(&mut pipe, job, &record);

        let mut conn = self.conn().await?;
        let _: () = pipe.query_async(&mut *conn).await?;

        debug!(
            job_id = %job.id,
            job_name = %job.name,
            priority = %job.priority,
            routing_key = %job.routing_key,
            scheduled = job.scheduled_for.is_some(),
            "Enqueued job"
        );
        JobMetrics::job_enqueued(&job.name, job.priority.as_str());

        Ok(())
    }

    async fn enqueue_batch(&self, jobs: &[Job]) -> JobResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for job in jobs {
            let record = job.to_json()?;
            self.enqueue_into(&mut pipe, job, &record);
        }

        let mut conn = self.conn().await?;
        let _: () = pipe.query_async(&mut *conn).await?;

        for job in jobs {
            JobMetrics::job_enqueued(&job.name, job.priority.as_str());
        }

        Ok(())
    }

    async fn dequeue(&self, slots: &[QueueSlot]) -> JobResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let processing = self.keys.processing();

        for (i, (route, priority)) in slots.iter().enumerate() {
            let queue_key = self.keys.queue_for(route, *priority);
            let timeout = if i + 1 == slots.len() {
                LAST_DEQUEUE_TIMEOUT
            } else {
                DEQUEUE_TIMEOUT
            };

            let popped: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&queue_key)
                .arg(&processing)
                .arg(timeout.as_secs())
                .query_async(&mut *conn)
                .await?;

            let Some(job_id) = popped else {
                continue;
            };

            // Unusable record: quarantined inside, keep draining this slot's
            // successors rather than returning empty-handed.
            if let Some(job) = self.claim_popped(&mut conn, &job_id).await? {
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    async fn complete(&self, id: &JobId) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let job_key = self.keys.job(id.as_str());

        let raw: Option<String> = conn.get(&job_key).await?;
        let Some(json) = raw else {
            // Record already gone; just make sure the lease is released.
            let _: i64 = conn.lrem(self.keys.processing(), 1, id.as_str()).await?;
            return Ok(());
        };

        let mut job = match Job::from_json(&json) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Completing job with unreadable record");
                let _: i64 = conn.lrem(self.keys.processing(), 1, id.as_str()).await?;
                return Ok(());
            }
        };

        job.status = JobStatus::Completed;
        job.scheduled_for = None;
        job.updated_at = Utc::now();

        let _: () = redis::pipe()
            .lrem(self.keys.processing(), 1, id.as_str())
            .cmd("SET")
            .arg(&job_key)
            .arg(job.to_json()?)
            .arg("EX")
            .arg(self.completed_ttl.as_secs())
            .query_async(&mut *conn)
            .await?;

        debug!(job_id = %id, job_name = %job.name, "Completed job");
        JobMetrics::job_completed(&job.name);

        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> JobResult<()> {
        let mut job = job.clone();
        job.attempts += 1;
        job.error = error.to_string();
        job.updated_at = Utc::now();

        let job_key = self.keys.job(job.id.as_str());
        let mut conn = self.conn().await?;

        if job.attempts < job.max_retries {
            let delay = retry_delay(job.attempts);
            let run_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
            job.scheduled_for = Some(run_at);
            job.status = JobStatus::Pending;

            let _: () = redis::pipe()
                .cmd("SET")
                .arg(&job_key)
                .arg(job.to_json()?)
                .zadd(self.keys.scheduled(), job.id.as_str(), run_at.timestamp())
                .lrem(self.keys.processing(), 1, job.id.as_str())
                .query_async(&mut *conn)
                .await?;

            debug!(
                job_id = %job.id,
                job_name = %job.name,
                attempt = job.attempts,
                retry_at = %run_at,
                error = %error,
                "Scheduled job retry"
            );
            JobMetrics::job_retried(&job.name, job.attempts);
        } else {
            job.scheduled_for = None;
            job.status = JobStatus::Failed;

            let _: () = redis::pipe()
                .cmd("SET")
                .arg(&job_key)
                .arg(job.to_json()?)
                .arg("EX")
                .arg(self.dead_letter_ttl.as_secs())
                .lpush(self.keys.dead(), job.id.as_str())
                .lrem(self.keys.processing(), 1, job.id.as_str())
                .query_async(&mut *conn)
                .await?;

            warn!(
                job_id = %job.id,
                job_name = %job.name,
                attempts = job.attempts,
                error = %error,
                "Moved job to dead-letter list"
            );
            JobMetrics::job_dead_lettered(&job.name);
        }

        Ok(())
    }

    async fn promote_scheduled(&self) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        let now = Utc::now().timestamp();

        let due: Vec<String> = conn
            .zrangebyscore(self.keys.scheduled(), "-inf", now)
            .await?;

        let mut moved = 0u64;

        for job_id in due {
            let job_key = self.keys.job(&job_id);
            let raw: Option<String> = conn.get(&job_key).await?;

            let mut job = match raw.as_deref().map(Job::from_json) {
                Some(Ok(job)) => job,
                Some(Err(e)) => {
                    warn!(job_id = %job_id, error = %e, "Dropping scheduled id with unreadable record");
                    let _: i64 = conn.zrem(self.keys.scheduled(), &job_id).await?;
                    continue;
                }
                None => {
                    warn!(job_id = %job_id, "Dropping scheduled id with missing record");
                    let _: i64 = conn.zrem(self.keys.scheduled(), &job_id).await?;
                    continue;
                }
            };

            job.scheduled_for = None;
            job.status = JobStatus::Pending;
            job.updated_at = Utc::now();

            let queue_key = self.keys.queue_for(&job.routing_key, job.priority);
            let _: () = redis::pipe()
                .cmd("SET")
                .arg(&job_key)
                .arg(job.to_json()?)
                .lpush(&queue_key, &job_id)
                .zrem(self.keys.scheduled(), &job_id)
                .query_async(&mut *conn)
                .await?;

            moved += 1;
        }

        if moved > 0 {
            debug!(count = moved, "Promoted scheduled jobs");
        }

        Ok(moved)
    }

    async fn get_job(&self, id: &JobId) -> JobResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.keys.job(id.as_str())).await?;

        match raw {
            Some(json) => Ok(Some(Job::from_json(&json)?)),
            None => Ok(None),
        }
    }

    async fn stats(&self) -> JobResult<QueueStats> {
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        for key in &self.queue_keys {
            pipe.llen(key);
        }
        pipe.llen(self.keys.processing());
        pipe.cmd("ZCARD").arg(self.keys.scheduled());
        pipe.llen(self.keys.dead());

        let counts: Vec<u64> = pipe.query_async(&mut *conn).await?;
        let n = self.queue_keys.len();

        Ok(QueueStats {
            pending: self
                .queue_keys
                .iter()
                .cloned()
                .zip(counts.iter().copied())
                .collect(),
            processing: counts.get(n).copied().unwrap_or(0),
            scheduled: counts.get(n + 1).copied().unwrap_or(0),
            dead: counts.get(n + 2).copied().unwrap_or(0),
        })
    }

    async fn list_dead(&self, limit: usize) -> JobResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .lrange(self.keys.dead(), 0, limit as isize - 1)
            .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.keys.job(id)).collect();
        let records: Vec<Option<String>> = conn.mget(&keys).await?;

        Ok(records
            .into_iter()
            .flatten()
            .filter_map(|json| Job::from_json(&json).ok())
            .collect())
    }

    async fn list_processing(&self) -> JobResult<Vec<Job>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.lrange(self.keys.processing(), 0, -1).await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.keys.job(id)).collect();
        let records: Vec<Option<String>> = conn.mget(&keys).await?;

        Ok(records
            .into_iter()
            .flatten()
            .filter_map(|json| Job::from_json(&json).ok())
            .collect())
    }

    async fn list_scheduled(&self, limit: usize) -> JobResult<Vec<(Job, DateTime<Utc>)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let entries: Vec<(String, i64)> = conn
            .zrange_withscores(self.keys.scheduled(), 0, limit as isize - 1)
            .await?;

        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = entries.iter().map(|(id, _)| self.keys.job(id)).collect();
        let records: Vec<Option<String>> = conn.mget(&keys).await?;

        Ok(entries
            .into_iter()
            .zip(records)
            .filter_map(|((_, score), record)| {
                let job = Job::from_json(&record?).ok()?;
                let run_at = DateTime::from_timestamp(score, 0)?;
                Some((job, run_at))
            })
            .collect())
    }

    async fn retry_dead(&self, id: &JobId) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let job_key = self.keys.job(id.as_str());

        let raw: Option<String> = conn.get(&job_key).await?;
        let Some(json) = raw else {
            return Err(JobError::NotFound(id.to_string()));
        };

        let mut job = Job::from_json(&json)?;
        job.status = JobStatus::Pending;
        job.scheduled_for = None;
        job.attempts = 0;
        job.error.clear();
        job.updated_at = Utc::now();

        let queue_key = self.keys.queue_for(&job.routing_key, job.priority);

        // The plain SET drops the dead-letter TTL along with the old state.
        let _: () = redis::pipe()
            .lrem(self.keys.dead(), 1, id.as_str())
            .cmd("SET")
            .arg(&job_key)
            .arg(job.to_json()?)
            .lpush(&queue_key, id.as_str())
            .query_async(&mut *conn)
            .await?;

        info!(job_id = %id, job_name = %job.name, "Requeued job from dead-letter list");
        JobMetrics::job_enqueued(&job.name, job.priority.as_str());

        Ok(())
    }

    async fn cancel(&self, id: &JobId) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let job_key = self.keys.job(id.as_str());

        let raw: Option<String> = conn.get(&job_key).await?;
        let Some(json) = raw else {
            return Err(JobError::NotFound(id.to_string()));
        };

        let job = Job::from_json(&json)?;
        if job.status == JobStatus::Processing {
            return Err(JobError::InvalidState {
                expected: "pending".to_string(),
                actual: "processing".to_string(),
            });
        }

        let queue_key = self.keys.queue_for(&job.routing_key, job.priority);
        let _: () = redis::pipe()
            .del(&job_key)
            .lrem(&queue_key, 1, id.as_str())
            .zrem(self.keys.scheduled(), id.as_str())
            .lrem(self.keys.dead(), 1, id.as_str())
            .query_async(&mut *conn)
            .await?;

        info!(job_id = %id, job_name = %job.name, "Cancelled job");

        Ok(())
    }

    async fn health_check(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Priority, RoutingKey};

    #[test]
    fn dequeue_timeouts() {
        assert_eq!(DEQUEUE_TIMEOUT, Duration::from_secs(1));
        assert_eq!(LAST_DEQUEUE_TIMEOUT, Duration::from_secs(3));
    }

    #[test]
    fn stats_queue_keys_follow_worker_config() {
        let mut config = JobsConfig::default();
        config.worker.routing_keys = vec![
            RoutingKey::new("gpu").unwrap(),
            RoutingKey::default(),
        ];
        config.worker.priorities = vec![Priority::High, Priority::Low];

        let keys = RedisKeys::new(&config.redis.key_prefix);
        let expected: Vec<String> =
            precedence(&config.worker.routing_keys, &config.worker.priorities)
                .iter()
                .map(|(r, p)| keys.queue_for(r, *p))
                .collect();

        assert_eq!(
            expected,
            vec![
                "bananas:route:gpu:queue:high",
                "bananas:route:gpu:queue:low",
                "bananas:queue:high",
                "bananas:queue:low",
            ]
        );
    }

    #[test]
    fn quarantine_marker_shape() {
        let now = Utc::now();
        let marker = Job {
            id: JobId::from("abc"),
            name: String::new(),
            description: String::new(),
            payload: Vec::new(),
            status: JobStatus::Failed,
            priority: Default::default(),
            routing_key: Default::default(),
            created_at: now,
            updated_at: now,
            scheduled_for: None,
            attempts: 0,
            max_retries: 0,
            error: "unreadable job record: job record missing".to_string(),
        };

        let json = marker.to_json().unwrap();
        let restored = Job::from_json(&json).unwrap();
        assert_eq!(restored.status, JobStatus::Failed);
        assert_eq!(restored.attempts, 0);
        assert!(restored.error.starts_with("unreadable job record"));
    }
}
