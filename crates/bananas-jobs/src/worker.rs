//! Worker pool for processing jobs.

use crate::config::WorkerConfig;
use crate::error::JobError;
use crate::job::Job;
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::queue::{precedence, JobQueue, QueueSlot};
use crate::registry::{JobContext, JobRegistry};
use crate::results::{JobOutcome, ResultBackend};
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Fixed interval of the scheduled-promoter loop.
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

/// Worker pool: up to `concurrency` executors draining a precedence-ordered
/// set of queues, plus the promoter that moves due scheduled jobs back into
/// them.
pub struct WorkerPool<Q: JobQueue, R: ResultBackend> {
    /// Unique pool ID.
    id: String,

    /// Queue engine.
    queue: Arc<Q>,

    /// Result backend; outcomes are written before queue transitions.
    results: Arc<R>,

    /// Handler registry, read-only once the pool starts.
    registry: Arc<JobRegistry>,

    /// Pool configuration.
    config: WorkerConfig,

    /// Dequeue precedence: routes x priorities, route-major.
    slots: Vec<QueueSlot>,

    /// Shutdown signal sender.
    shutdown_tx: broadcast::Sender<()>,

    /// Running flag.
    running: Arc<AtomicBool>,

    /// Jobs completed counter.
    jobs_processed: Arc<AtomicU64>,

    /// Jobs failed counter (every failed invocation, including retried).
    jobs_failed: Arc<AtomicU64>,
}

impl<Q: JobQueue + 'static, R: ResultBackend + 'static> WorkerPool<Q, R> {
    /// Create a new worker pool.
    pub fn new(queue: Arc<Q>, results: Arc<R>, registry: Arc<JobRegistry>, config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let slots = precedence(&config.routing_keys, &config.priorities);

        Self {
            id: format!("worker-pool-{}", Uuid::new_v4()),
            queue,
            results,
            registry,
            config,
            slots,
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
            jobs_processed: Arc::new(AtomicU64::new(0)),
            jobs_failed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run the pool until `stop` is called. Spawns the promoter, then loops
    /// dispatching free executor slots; after the shutdown signal, waits for
    /// in-flight executors to drain (bounded by `shutdown_timeout`).
    pub async fn start(&self) -> Result<(), JobError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Worker("Worker pool already running".to_string()));
        }

        info!(
            pool_id = %self.id,
            concurrency = self.config.concurrency,
            slots = self.slots.len(),
            "Starting worker pool"
        );
        WorkerMetrics::update_slots(&self.id, 0, self.config.concurrency);

        let promoter = self.spawn_promoter();

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(pool_id = %self.id, "Received shutdown signal");
                    break;
                }

                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break };

                    let queue = self.queue.clone();
                    let results = self.results.clone();
                    let registry = self.registry.clone();
                    let config = self.config.clone();
                    let slots = self.slots.clone();
                    let worker_id = format!("{}-{}", self.id, Uuid::new_v4());
                    let jobs_processed = self.jobs_processed.clone();
                    let jobs_failed = self.jobs_failed.clone();
                    let mut slot_shutdown = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            biased;

                            // No new dispatch once shutdown is signaled; an
                            // abandoned blocking pop returns within 3s.
                            _ = slot_shutdown.recv() => {}

                            dequeued = queue.dequeue(&slots) => match dequeued {
                                Ok(Some(job)) => {
                                    execute_job(
                                        queue.as_ref(),
                                        results.as_ref(),
                                        registry.as_ref(),
                                        &config,
                                        &worker_id,
                                        job,
                                        &jobs_processed,
                                        &jobs_failed,
                                    )
                                    .await;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    error!(worker_id = %worker_id, error = %e, "Failed to dequeue job");
                                    tokio::time::sleep(config.poll_interval).await;
                                }
                            }
                        }

                        drop(permit);
                    }.instrument(tracing::info_span!("executor")));
                }
            }
        }

        // Wait for in-flight executors to finish.
        info!(pool_id = %self.id, "Waiting for executors to drain");
        let _ = timeout(self.config.shutdown_timeout, async {
            while semaphore.available_permits() < self.config.concurrency {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        let _ = promoter.await;

        self.running.store(false, Ordering::SeqCst);

        info!(
            pool_id = %self.id,
            processed = self.jobs_processed.load(Ordering::Relaxed),
            failed = self.jobs_failed.load(Ordering::Relaxed),
            "Worker pool stopped"
        );

        Ok(())
    }

    /// Signal the pool to stop.
    pub fn stop(&self) {
        info!(pool_id = %self.id, "Stopping worker pool");
        let _ = self.shutdown_tx.send(());
    }

    /// Spawn the 1 Hz loop that moves due scheduled jobs back to their
    /// priority queues.
    fn spawn_promoter(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let pool_id = self.id.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PROMOTE_INTERVAL);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,
                    _ = tick.tick() => {}
                }

                match queue.promote_scheduled().await {
                    Ok(0) => {}
                    Ok(count) => {
                        debug!(pool_id = %pool_id, count, "Promoted scheduled jobs");
                        JobMetrics::jobs_promoted(count);
                    }
                    Err(e) => {
                        error!(pool_id = %pool_id, error = %e, "Failed to promote scheduled jobs");
                    }
                }
            }
        })
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the pool ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            id: self.id.clone(),
            running: self.is_running(),
            concurrency: self.config.concurrency,
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }
}

/// Runs one dequeued job to its terminal or retry transition: allowlist and
/// registry lookup, deadline, panic capture, outcome write, then the queue
/// transition. The outcome is written before `complete`/`fail` so a reader
/// that observes the terminal status always finds the outcome record.
#[allow(clippy::too_many_arguments)]
async fn execute_job<Q: JobQueue, R: ResultBackend>(
    queue: &Q,
    results: &R,
    registry: &JobRegistry,
    config: &WorkerConfig,
    worker_id: &str,
    job: Job,
    jobs_processed: &AtomicU64,
    jobs_failed: &AtomicU64,
) {
    let started_at = Utc::now();
    let ctx = JobContext {
        job_id: job.id.clone(),
        attempt: job.attempts,
        max_retries: job.max_retries,
        deadline: started_at
            + chrono::Duration::from_std(config.job_timeout).unwrap_or_default(),
        worker_id: worker_id.to_string(),
    };

    debug!(
        job_id = %job.id,
        job_name = %job.name,
        attempt = job.attempts,
        worker_id = %worker_id,
        "Processing job"
    );

    let allowed = config
        .job_types
        .as_ref()
        .map_or(true, |types| types.iter().any(|name| name == &job.name));

    let dispatched = if allowed {
        registry.dispatch(ctx, job.clone())
    } else {
        None
    };

    let verdict: Result<Vec<u8>, (String, &'static str)> = match dispatched {
        None => Err((JobError::UnknownHandler(job.name.clone()).to_string(), "unknown_handler")),
        Some(handler) => {
            match timeout(config.job_timeout, AssertUnwindSafe(handler).catch_unwind()).await {
                Err(_) => Err((JobError::Timeout.to_string(), "timeout")),
                Ok(Err(panic)) => {
                    Err((JobError::Panic(panic_message(panic)).to_string(), "panic"))
                }
                Ok(Ok(Err(e))) => Err((e.to_string(), "handler")),
                Ok(Ok(Ok(payload))) => Ok(payload),
            }
        }
    };

    match verdict {
        Ok(payload) => {
            let outcome = JobOutcome::success(job.id.clone(), payload, started_at);
            let duration = Duration::from_millis(outcome.duration_ms);

            if let Err(e) = results.write(&outcome).await {
                error!(job_id = %job.id, error = %e, "Failed to store job outcome");
            }
            if let Err(e) = queue.complete(&job.id).await {
                error!(job_id = %job.id, error = %e, "Failed to mark job as complete");
            }

            jobs_processed.fetch_add(1, Ordering::Relaxed);
            JobMetrics::job_duration(&job.name, "completed", duration);
            debug!(job_id = %job.id, "Job completed successfully");
        }
        Err((message, error_type)) => {
            let outcome = JobOutcome::failure(job.id.clone(), message.clone(), started_at);
            let duration = Duration::from_millis(outcome.duration_ms);

            if let Err(e) = results.write(&outcome).await {
                error!(job_id = %job.id, error = %e, "Failed to store job outcome");
            }
            if let Err(e) = queue.fail(&job, &message).await {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
            }

            jobs_failed.fetch_add(1, Ordering::Relaxed);
            JobMetrics::job_failed(&job.name, error_type);
            if error_type == "timeout" {
                JobMetrics::job_timed_out(&job.name);
            }
            JobMetrics::job_duration(&job.name, "failed", duration);
            warn!(job_id = %job.id, error = %message, "Job execution failed");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Worker pool statistics.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    /// Pool ID.
    pub id: String,

    /// Is running.
    pub running: bool,

    /// Configured concurrency.
    pub concurrency: usize,

    /// Jobs completed.
    pub jobs_processed: u64,

    /// Failed invocations.
    pub jobs_failed: u64,
}
