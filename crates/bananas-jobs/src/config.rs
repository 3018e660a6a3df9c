//! Job queue configuration.
//!
//! Serde-default structs with an environment override layer. The documented
//! variables are the full surface: `REDIS_URL`, `WORKER_CONCURRENCY`,
//! `WORKER_PRIORITIES`, `WORKER_ROUTING_KEYS`, `WORKER_JOB_TYPES`,
//! `JOB_TIMEOUT`, `MAX_RETRIES`, `CRON_SCHEDULER_ENABLED`,
//! `CRON_SCHEDULER_INTERVAL`, `CRON_LOCK_TTL`.

use crate::error::{JobError, JobResult};
use crate::job::{Priority, RoutingKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the job queue system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Queue retention and retry configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Cron scheduler configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Result backend configuration.
    #[serde(default)]
    pub results: ResultsConfig,
}

impl JobsConfig {
    /// Loads configuration from the environment, starting from defaults.
    /// A `.env` file is honored when present.
    pub fn from_env() -> JobResult<Self> {
        let _ = dotenvy::dotenv();

        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis.url = url;
        }
        if let Some(n) = env_parse::<usize>("WORKER_CONCURRENCY")? {
            if n == 0 {
                return Err(JobError::Configuration(
                    "WORKER_CONCURRENCY must be at least 1".to_string(),
                ));
            }
            config.worker.concurrency = n;
        }
        if let Ok(list) = std::env::var("WORKER_PRIORITIES") {
            config.worker.priorities = parse_priorities(&list)?;
        }
        if let Ok(list) = std::env::var("WORKER_ROUTING_KEYS") {
            config.worker.routing_keys = parse_routing_keys(&list)?;
        }
        if let Ok(list) = std::env::var("WORKER_JOB_TYPES") {
            config.worker.job_types = Some(
                list.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }
        if let Some(timeout) = env_duration("JOB_TIMEOUT")? {
            config.worker.job_timeout = timeout;
        }
        if let Some(max) = env_parse::<u32>("MAX_RETRIES")? {
            config.queue.max_retries = max;
        }
        if let Some(enabled) = env_parse::<bool>("CRON_SCHEDULER_ENABLED")? {
            config.scheduler.enabled = enabled;
        }
        if let Some(interval) = env_duration("CRON_SCHEDULER_INTERVAL")? {
            config.scheduler.tick_interval = interval;
        }
        if let Some(ttl) = env_duration("CRON_LOCK_TTL")? {
            config.scheduler.lock_ttl = ttl;
        }

        Ok(config)
    }

    /// Starts a job builder seeded with this configuration's retry budget.
    pub fn job_builder(&self, name: impl Into<String>) -> crate::job::JobBuilder {
        crate::job::JobBuilder::new(name).max_retries(self.queue.max_retries)
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for all queue keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "bananas".to_string()
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent executor slots.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Priorities drained, in precedence order.
    #[serde(default = "default_priorities")]
    pub priorities: Vec<Priority>,

    /// Routing keys drained, in precedence order.
    #[serde(default = "default_routing_keys")]
    pub routing_keys: Vec<RoutingKey>,

    /// Optional allowlist of job names; jobs outside it fail at dispatch as
    /// if no handler were registered.
    #[serde(default)]
    pub job_types: Option<Vec<String>>,

    /// Per-job execution timeout.
    #[serde(default = "default_job_timeout", with = "duration_secs")]
    pub job_timeout: Duration,

    /// Sleep after a store error in the dequeue loop.
    #[serde(default = "default_poll_interval", with = "duration_secs")]
    pub poll_interval: Duration,

    /// How long shutdown waits for in-flight executors to drain.
    #[serde(default = "default_shutdown_timeout", with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            priorities: default_priorities(),
            routing_keys: default_routing_keys(),
            job_types: None,
            job_timeout: default_job_timeout(),
            poll_interval: default_poll_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}

fn default_priorities() -> Vec<Priority> {
    Priority::ALL.to_vec()
}

fn default_routing_keys() -> Vec<RoutingKey> {
    vec![RoutingKey::default()]
}

fn default_job_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Queue retention and retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Default retry budget for jobs that do not override it.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// TTL applied to completed job records.
    #[serde(default = "default_completed_ttl", with = "duration_secs")]
    pub completed_ttl: Duration,

    /// TTL applied to dead-lettered job records.
    #[serde(default = "default_dead_letter_ttl", with = "duration_secs")]
    pub dead_letter_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            completed_ttl: default_completed_ttl(),
            dead_letter_ttl: default_dead_letter_ttl(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_completed_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_dead_letter_ttl() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

/// Cron scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable the scheduler tick loop.
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Tick interval.
    #[serde(default = "default_tick_interval", with = "duration_secs")]
    pub tick_interval: Duration,

    /// TTL on each per-schedule lock.
    #[serde(default = "default_lock_ttl", with = "duration_secs")]
    pub lock_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_interval: default_tick_interval(),
            lock_ttl: default_lock_ttl(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(60)
}

/// Result backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    /// TTL for success results.
    #[serde(default = "default_success_ttl", with = "duration_secs")]
    pub success_ttl: Duration,

    /// TTL for failure results.
    #[serde(default = "default_failure_ttl", with = "duration_secs")]
    pub failure_ttl: Duration,

    /// Polling interval used by `wait`.
    #[serde(default = "default_result_poll_interval", with = "duration_secs")]
    pub poll_interval: Duration,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            success_ttl: default_success_ttl(),
            failure_ttl: default_failure_ttl(),
            poll_interval: default_result_poll_interval(),
        }
    }
}

fn default_success_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_failure_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_result_poll_interval() -> Duration {
    Duration::from_millis(100)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Parses an ordered comma-separated priority list, e.g. `high,normal,low`.
pub fn parse_priorities(list: &str) -> JobResult<Vec<Priority>> {
    let parsed: Vec<Priority> = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Priority::parse)
        .collect::<JobResult<_>>()?;

    if parsed.is_empty() {
        return Err(JobError::Configuration(
            "WORKER_PRIORITIES must name at least one priority".to_string(),
        ));
    }
    Ok(parsed)
}

/// Parses an ordered comma-separated routing key list.
pub fn parse_routing_keys(list: &str) -> JobResult<Vec<RoutingKey>> {
    let parsed: Vec<RoutingKey> = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(RoutingKey::new)
        .collect::<JobResult<_>>()?;

    if parsed.is_empty() {
        return Err(JobError::Configuration(
            "WORKER_ROUTING_KEYS must name at least one routing key".to_string(),
        ));
    }
    Ok(parsed)
}

/// Parses a duration string: plain seconds (`300`) or an `s`/`m`/`h` suffix
/// (`1s`, `5m`, `24h`).
pub fn parse_duration(value: &str) -> JobResult<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, ""),
    };

    let n: u64 = digits
        .parse()
        .map_err(|_| JobError::Configuration(format!("invalid duration: {}", value)))?;

    let secs = match unit {
        "" | "s" => n,
        "m" => n * 60,
        "h" => n * 60 * 60,
        _ => {
            return Err(JobError::Configuration(format!(
                "invalid duration unit in: {}",
                value
            )))
        }
    };
    Ok(Duration::from_secs(secs))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> JobResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| JobError::Configuration(format!("invalid value for {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn env_duration(name: &str) -> JobResult<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => parse_duration(&raw).map(Some).map_err(|_| {
            JobError::Configuration(format!("invalid duration for {}: {}", name, raw))
        }),
        Err(_) => Ok(None),
    }
}
