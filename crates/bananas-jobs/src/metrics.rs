//! Prometheus-facade metrics for queue monitoring.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "bananas_jobs_enqueued_total";
    /// Total jobs dequeued for processing.
    pub const JOBS_DEQUEUED_TOTAL: &str = "bananas_jobs_dequeued_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "bananas_jobs_completed_total";
    /// Total job failures (including retried ones).
    pub const JOBS_FAILED_TOTAL: &str = "bananas_jobs_failed_total";
    /// Total retries scheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "bananas_jobs_retried_total";
    /// Total jobs moved to the dead-letter list.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "bananas_jobs_dead_lettered_total";
    /// Total jobs that hit their execution deadline.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "bananas_jobs_timed_out_total";
    /// Total unreadable records quarantined on dequeue.
    pub const JOBS_QUARANTINED_TOTAL: &str = "bananas_jobs_quarantined_total";
    /// Total scheduled ids promoted back to priority queues.
    pub const JOBS_PROMOTED_TOTAL: &str = "bananas_jobs_promoted_total";

    /// Current pending ids (per queue key).
    pub const JOBS_PENDING: &str = "bananas_jobs_pending";
    /// Current in-flight ids.
    pub const JOBS_PROCESSING: &str = "bananas_jobs_processing";
    /// Current scheduled ids.
    pub const JOBS_SCHEDULED: &str = "bananas_jobs_scheduled";
    /// Current dead-letter list size.
    pub const JOBS_DEAD: &str = "bananas_jobs_dead";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "bananas_job_duration_seconds";

    /// Busy executor slots.
    pub const WORKERS_BUSY: &str = "bananas_workers_busy";
    /// Configured executor slots.
    pub const WORKERS_CONCURRENCY: &str = "bananas_workers_concurrency";

    /// Cron fires enqueued.
    pub const SCHEDULER_FIRES_TOTAL: &str = "bananas_scheduler_fires_total";
    /// Cron enqueue failures.
    pub const SCHEDULER_ERRORS_TOTAL: &str = "bananas_scheduler_errors_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_DEQUEUED_TOTAL,
        "Total number of jobs dequeued for processing"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of job failures");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of retries scheduled");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs moved to the dead-letter list"
    );
    describe_counter!(
        names::JOBS_TIMED_OUT_TOTAL,
        "Total number of jobs that hit their execution deadline"
    );
    describe_counter!(
        names::JOBS_QUARANTINED_TOTAL,
        "Total number of unreadable job records quarantined"
    );
    describe_counter!(
        names::JOBS_PROMOTED_TOTAL,
        "Total number of scheduled jobs promoted to priority queues"
    );

    describe_gauge!(names::JOBS_PENDING, "Current number of pending jobs");
    describe_gauge!(names::JOBS_PROCESSING, "Current number of in-flight jobs");
    describe_gauge!(names::JOBS_SCHEDULED, "Current number of scheduled jobs");
    describe_gauge!(names::JOBS_DEAD, "Current dead-letter list size");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );

    describe_gauge!(names::WORKERS_BUSY, "Busy executor slots");
    describe_gauge!(names::WORKERS_CONCURRENCY, "Configured executor slots");

    describe_counter!(names::SCHEDULER_FIRES_TOTAL, "Cron fires enqueued");
    describe_counter!(names::SCHEDULER_ERRORS_TOTAL, "Cron enqueue failures");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(job_name: &str, priority: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "job_name" => job_name.to_string(),
            "priority" => priority.to_string()
        )
        .increment(1);
    }

    /// Record a job dequeued.
    pub fn job_dequeued(job_name: &str, priority: &str) {
        counter!(
            names::JOBS_DEQUEUED_TOTAL,
            "job_name" => job_name.to_string(),
            "priority" => priority.to_string()
        )
        .increment(1);
    }

    /// Record a job completed, with its execution duration.
    pub fn job_completed(job_name: &str) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a failed handler invocation.
    pub fn job_failed(job_name: &str, error_type: &str) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "job_name" => job_name.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);
    }

    /// Record a retry scheduled.
    pub fn job_retried(job_name: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "job_name" => job_name.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a job moved to the dead-letter list.
    pub fn job_dead_lettered(job_name: &str) {
        counter!(
            names::JOBS_DEAD_LETTERED_TOTAL,
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a deadline hit.
    pub fn job_timed_out(job_name: &str) {
        counter!(
            names::JOBS_TIMED_OUT_TOTAL,
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record an unreadable record quarantined.
    pub fn job_quarantined() {
        counter!(names::JOBS_QUARANTINED_TOTAL).increment(1);
    }

    /// Record scheduled ids promoted.
    pub fn jobs_promoted(count: u64) {
        counter!(names::JOBS_PROMOTED_TOTAL).increment(count);
    }

    /// Record execution duration.
    pub fn job_duration(job_name: &str, outcome: &str, duration: Duration) {
        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_name" => job_name.to_string(),
            "outcome" => outcome.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Update queue depth gauges from a stats snapshot.
    pub fn update_queue_depths(pending: u64, processing: u64, scheduled: u64, dead: u64) {
        gauge!(names::JOBS_PENDING).set(pending as f64);
        gauge!(names::JOBS_PROCESSING).set(processing as f64);
        gauge!(names::JOBS_SCHEDULED).set(scheduled as f64);
        gauge!(names::JOBS_DEAD).set(dead as f64);
    }
}

/// Worker pool metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Update slot occupancy.
    pub fn update_slots(pool_id: &str, busy: usize, concurrency: usize) {
        gauge!(
            names::WORKERS_BUSY,
            "pool_id" => pool_id.to_string()
        )
        .set(busy as f64);

        gauge!(
            names::WORKERS_CONCURRENCY,
            "pool_id" => pool_id.to_string()
        )
        .set(concurrency as f64);
    }
}

/// Scheduler metrics recorder.
#[derive(Clone)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    /// Record a cron fire enqueued.
    pub fn schedule_fired(schedule_id: &str, job_name: &str) {
        counter!(
            names::SCHEDULER_FIRES_TOTAL,
            "schedule_id" => schedule_id.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a cron enqueue failure.
    pub fn schedule_errored(schedule_id: &str) {
        counter!(
            names::SCHEDULER_ERRORS_TOTAL,
            "schedule_id" => schedule_id.to_string()
        )
        .increment(1);
    }
}
