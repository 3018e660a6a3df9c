//! Redis-backed queue engine.

mod queue;

pub use queue::RedisJobQueue;

use crate::config::RedisConfig;
use crate::error::{JobError, JobResult};
use crate::job::{Priority, RoutingKey};
use crate::retry::connect_backoff;
use deadpool_redis::{Config, Pool, Runtime};
use tracing::{info, warn};

/// Create a Redis connection pool and verify it with PING. Connection
/// establishment retries with exponential backoff capped at 30 seconds.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    backoff::future::retry(connect_backoff(), || async {
        let mut conn = pool
            .get()
            .await
            .map_err(JobError::from)
            .map_err(backoff::Error::transient)?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(JobError::from)
            .map_err(|e| {
                warn!(error = %e, "Redis ping failed, retrying");
                backoff::Error::transient(e)
            })?;
        Ok::<(), backoff::Error<JobError>>(())
    })
    .await?;

    info!(url = %config.url, pool_size = config.pool_size, "Connected to Redis");

    Ok(pool)
}

/// Redis key builder. The full layout under the prefix:
///
/// - `job:{id}` — serialized job record
/// - `queue:{priority}` / `route:{key}:queue:{priority}` — pending id lists
/// - `queue:processing` — in-flight id list
/// - `queue:scheduled` — sorted set, score = epoch seconds of next run
/// - `queue:dead` — dead-letter id list
/// - `schedules:{id}` — cron run-state hash
/// - `schedules:{id}:lock` — per-schedule lock
/// - `results:{id}` — serialized result with TTL
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Job record key.
    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Pending queue key for a (routing key, priority) pair. The `"default"`
    /// route maps to the unrouted key; producers and consumers must both
    /// derive through here so the choice stays consistent on the wire.
    pub fn queue_for(&self, route: &RoutingKey, priority: Priority) -> String {
        if route.is_default() {
            format!("{}:queue:{}", self.prefix, priority)
        } else {
            format!("{}:route:{}:queue:{}", self.prefix, route, priority)
        }
    }

    /// Processing list key.
    pub fn processing(&self) -> String {
        format!("{}:queue:processing", self.prefix)
    }

    /// Scheduled sorted-set key.
    pub fn scheduled(&self) -> String {
        format!("{}:queue:scheduled", self.prefix)
    }

    /// Dead-letter list key.
    pub fn dead(&self) -> String {
        format!("{}:queue:dead", self.prefix)
    }

    /// Cron run-state hash key for a schedule.
    pub fn schedule_state(&self, schedule_id: &str) -> String {
        format!("{}:schedules:{}", self.prefix, schedule_id)
    }

    /// Per-schedule lock key.
    pub fn schedule_lock(&self, schedule_id: &str) -> String {
        format!("{}:schedules:{}:lock", self.prefix, schedule_id)
    }

    /// Result key.
    pub fn result(&self, job_id: &str) -> String {
        format!("{}:results:{}", self.prefix, job_id)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("bananas")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let keys = RedisKeys::default();

        assert_eq!(keys.job("123"), "bananas:job:123");
        assert_eq!(keys.processing(), "bananas:queue:processing");
        assert_eq!(keys.scheduled(), "bananas:queue:scheduled");
        assert_eq!(keys.dead(), "bananas:queue:dead");
        assert_eq!(keys.schedule_state("daily"), "bananas:schedules:daily");
        assert_eq!(keys.schedule_lock("daily"), "bananas:schedules:daily:lock");
        assert_eq!(keys.result("123"), "bananas:results:123");
    }

    #[test]
    fn default_route_uses_unrouted_queue_key() {
        let keys = RedisKeys::default();
        assert_eq!(
            keys.queue_for(&RoutingKey::default(), Priority::High),
            "bananas:queue:high"
        );
    }

    #[test]
    fn named_route_uses_routed_queue_key() {
        let keys = RedisKeys::default();
        let gpu = RoutingKey::new("gpu").unwrap();
        assert_eq!(
            keys.queue_for(&gpu, Priority::Low),
            "bananas:route:gpu:queue:low"
        );
    }
}
