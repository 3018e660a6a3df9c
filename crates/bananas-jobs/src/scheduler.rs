//! Cron scheduler with per-schedule distributed locks.
//!
//! Every tick, each enabled schedule is leased individually with a
//! SET-NX-EX lock, so replicas share schedules and fail over per schedule
//! rather than electing a single global leader.

use crate::config::SchedulerConfig;
use crate::error::{JobError, JobResult};
use crate::job::{Job, Priority};
use crate::metrics::SchedulerMetrics;
use crate::queue::JobQueue;
use crate::redis::RedisKeys;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use deadpool_redis::Pool;
use parking_lot::RwLock;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Deletes the lock only when it still holds this ticker's nonce, so a lock
/// that expired and was re-acquired by another replica is never released
/// from here.
const RELEASE_LOCK_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

/// Parses a 5-field cron expression (minute, hour, day-of-month, month,
/// day-of-week) by pinning seconds to zero for the 6-field parser.
pub fn parse_cron(expr: &str) -> JobResult<Schedule> {
    let expr = expr.trim();
    if expr.split_whitespace().count() != 5 {
        return Err(JobError::InvalidCron(format!(
            "expected 5 fields: {}",
            expr
        )));
    }

    Schedule::from_str(&format!("0 {}", expr))
        .map_err(|e| JobError::InvalidCron(format!("{}: {}", expr, e)))
}

/// A periodic job template: cron expression, timezone, and the job it
/// enqueues on each fire.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    /// Unique schedule id; also names the run-state hash and lock key.
    pub id: String,

    /// Original 5-field cron expression.
    pub cron_expression: String,

    /// Parsed schedule.
    schedule: Schedule,

    /// Handler name for the enqueued jobs.
    pub job_name: String,

    /// Payload for the enqueued jobs.
    pub payload: Vec<u8>,

    /// Priority for the enqueued jobs.
    pub priority: Priority,

    /// IANA timezone the expression is evaluated in.
    pub timezone: Tz,

    /// Disabled schedules are skipped entirely.
    pub enabled: bool,

    /// Free-form description.
    pub description: String,
}

impl CronSchedule {
    /// Creates a schedule in UTC. The expression must have exactly 5 fields.
    pub fn new(
        id: impl Into<String>,
        cron_expression: &str,
        job_name: impl Into<String>,
    ) -> JobResult<Self> {
        let schedule = parse_cron(cron_expression)?;
        Ok(Self {
            id: id.into(),
            cron_expression: cron_expression.trim().to_string(),
            schedule,
            job_name: job_name.into(),
            payload: Vec::new(),
            priority: Priority::default(),
            timezone: chrono_tz::UTC,
            enabled: true,
            description: String::new(),
        })
    }

    /// Sets the payload for enqueued jobs.
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the priority for enqueued jobs.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the timezone the expression is evaluated in.
    pub fn timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Sets the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Enables or disables the schedule.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Next fire time strictly after `from`, evaluated in the schedule's
    /// timezone. During a DST fall-back hour the earliest wall-clock mapping
    /// wins, so a repeated local time fires once; spring-forward skips times
    /// that do not exist.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&from.with_timezone(&self.timezone))
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Builds one job instance from the template.
    pub fn to_job(&self) -> Job {
        Job::builder(&self.job_name)
            .payload(self.payload.clone())
            .priority(self.priority)
            .description(&self.description)
            .build()
    }
}

/// Persisted per-schedule run state, stored as a hash.
#[derive(Debug, Clone, Default)]
pub struct ScheduleState {
    /// Last fire time.
    pub last_run: Option<DateTime<Utc>>,

    /// Next computed fire time.
    pub next_run: Option<DateTime<Utc>>,

    /// Total fires.
    pub run_count: u64,

    /// Last successful enqueue.
    pub last_success: Option<DateTime<Utc>>,

    /// Last enqueue error.
    pub last_error: Option<String>,
}

impl ScheduleState {
    /// Parses the state from a Redis hash.
    pub fn from_hash(hash: &HashMap<String, String>) -> Self {
        Self {
            last_run: hash.get("last_run").and_then(|s| parse_rfc3339(s)),
            next_run: hash.get("next_run").and_then(|s| parse_rfc3339(s)),
            run_count: hash
                .get("run_count")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            last_success: hash.get("last_success").and_then(|s| parse_rfc3339(s)),
            last_error: hash.get("last_error").cloned(),
        }
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Scheduler statistics.
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    /// Ticker id (also the lock nonce).
    pub id: String,

    /// Registered schedules.
    pub schedules: usize,

    /// Fires enqueued by this ticker.
    pub fires: u64,
}

/// Cron tick loop. Schedules are registered before `start`; there is no
/// dynamic reload.
pub struct CronScheduler<Q: JobQueue> {
    /// Ticker id, used as the lock nonce.
    id: String,

    /// Redis connection pool (locks and run state).
    pool: Pool,

    /// Queue engine for enqueuing fired jobs.
    queue: Arc<Q>,

    /// Scheduler configuration.
    config: SchedulerConfig,

    /// Redis keys.
    keys: RedisKeys,

    /// Registered schedules.
    schedules: RwLock<Vec<CronSchedule>>,

    /// Shutdown signal sender.
    shutdown_tx: broadcast::Sender<()>,

    /// Running flag.
    running: AtomicBool,

    /// Fires enqueued by this ticker.
    fires: AtomicU64,
}

impl<Q: JobQueue + 'static> CronScheduler<Q> {
    /// Create a new scheduler.
    pub fn new(
        pool: Pool,
        queue: Arc<Q>,
        key_prefix: impl Into<String>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            id: format!("cron-{}", Uuid::new_v4()),
            pool,
            queue,
            config,
            keys: RedisKeys::new(key_prefix),
            schedules: RwLock::new(Vec::new()),
            shutdown_tx,
            running: AtomicBool::new(false),
            fires: AtomicU64::new(0),
        }
    }

    /// Registers a schedule. Call before `start`.
    pub fn register(&self, schedule: CronSchedule) {
        info!(
            schedule_id = %schedule.id,
            cron = %schedule.cron_expression,
            timezone = %schedule.timezone,
            enabled = schedule.enabled,
            "Registered cron schedule"
        );
        self.schedules.write().push(schedule);
    }

    /// Ticker id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs the tick loop until `stop` is called.
    pub async fn start(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Scheduler("Scheduler already running".to_string()));
        }
        if !self.config.enabled {
            info!(scheduler_id = %self.id, "Cron scheduler disabled");
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }

        info!(
            scheduler_id = %self.id,
            tick_interval = ?self.config.tick_interval,
            schedules = self.schedules.read().len(),
            "Starting cron scheduler"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tick = interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(scheduler_id = %self.id, "Received shutdown signal");
                    break;
                }

                _ = tick.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(scheduler_id = %self.id, error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(scheduler_id = %self.id, "Cron scheduler stopped");

        Ok(())
    }

    /// Signal the scheduler to stop.
    pub fn stop(&self) {
        info!(scheduler_id = %self.id, "Stopping cron scheduler");
        let _ = self.shutdown_tx.send(());
    }

    /// One pass over all enabled schedules. Normally driven by `start`;
    /// public so operators can force an evaluation pass.
    pub async fn tick(&self) -> JobResult<()> {
        let now = Utc::now();
        let schedules: Vec<CronSchedule> = self
            .schedules
            .read()
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect();

        for schedule in schedules {
            if !self.try_lock(&schedule.id).await? {
                continue;
            }

            let evaluated = self.evaluate(&schedule, now).await;
            self.release_lock(&schedule.id).await?;

            if let Err(e) = evaluated {
                error!(
                    schedule_id = %schedule.id,
                    error = %e,
                    "Failed to evaluate schedule"
                );
            }
        }

        Ok(())
    }

    /// Acquire the per-schedule lock with this ticker's nonce.
    async fn try_lock(&self, schedule_id: &str) -> JobResult<bool> {
        let mut conn = self.pool.get().await?;
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.keys.schedule_lock(schedule_id))
            .arg(&self.id)
            .arg("NX")
            .arg("EX")
            .arg(self.config.lock_ttl.as_secs())
            .query_async(&mut *conn)
            .await?;

        Ok(acquired.is_some())
    }

    /// Release the per-schedule lock if this ticker still holds it.
    async fn release_lock(&self, schedule_id: &str) -> JobResult<()> {
        let mut conn = self.pool.get().await?;
        let _: i32 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(self.keys.schedule_lock(schedule_id))
            .arg(&self.id)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    /// Evaluate one leased schedule: fire when the stored next-run time has
    /// arrived, then advance it. Missed windows are not backfilled; the next
    /// run is always recomputed from now.
    async fn evaluate(&self, schedule: &CronSchedule, now: DateTime<Utc>) -> JobResult<()> {
        let state_key = self.keys.schedule_state(&schedule.id);
        let mut conn = self.pool.get().await?;

        let raw: HashMap<String, String> = conn.hgetall(&state_key).await?;
        let state = ScheduleState::from_hash(&raw);

        let next_run = match state.next_run {
            Some(next_run) => next_run,
            None => {
                // First evaluation: seed the next fire time, nothing is due.
                let Some(seeded) = schedule.next_after(now) else {
                    warn!(schedule_id = %schedule.id, "Schedule has no future fire time");
                    return Ok(());
                };
                let _: () = conn
                    .hset(&state_key, "next_run", seeded.to_rfc3339())
                    .await?;
                debug!(
                    schedule_id = %schedule.id,
                    next_run = %seeded,
                    "Seeded schedule state"
                );
                return Ok(());
            }
        };

        if next_run > now {
            return Ok(());
        }

        let job = schedule.to_job();
        let advanced = schedule.next_after(now);

        match self.queue.enqueue(&job).await {
            Ok(()) => {
                let mut fields: Vec<(String, String)> = vec![
                    ("last_run".to_string(), now.to_rfc3339()),
                    ("last_success".to_string(), now.to_rfc3339()),
                ];
                if let Some(advanced) = advanced {
                    fields.push(("next_run".to_string(), advanced.to_rfc3339()));
                }

                let _: () = redis::pipe()
                    .hset_multiple(&state_key, &fields)
                    .cmd("HINCRBY")
                    .arg(&state_key)
                    .arg("run_count")
                    .arg(1)
                    .query_async(&mut *conn)
                    .await?;

                self.fires.fetch_add(1, Ordering::Relaxed);
                SchedulerMetrics::schedule_fired(&schedule.id, &schedule.job_name);
                info!(
                    schedule_id = %schedule.id,
                    job_id = %job.id,
                    job_name = %job.name,
                    "Enqueued scheduled job"
                );
            }
            Err(e) => {
                let _: () = conn
                    .hset(&state_key, "last_error", e.to_string())
                    .await?;

                SchedulerMetrics::schedule_errored(&schedule.id);
                error!(
                    schedule_id = %schedule.id,
                    error = %e,
                    "Failed to enqueue scheduled job"
                );
            }
        }

        Ok(())
    }

    /// Get scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            id: self.id.clone(),
            schedules: self.schedules.read().len(),
            fires: self.fires.load(Ordering::Relaxed),
        }
    }
}
