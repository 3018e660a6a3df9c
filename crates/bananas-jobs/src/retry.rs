//! Retry delay schedule for failed jobs.

use backoff::ExponentialBackoff;
use std::time::Duration;

/// Returns the delay before the next attempt, given the number of completed
/// failures. The schedule is fixed exponential: 2, 4, 8, 16, ... seconds.
/// `max_retries` is the only cap.
pub fn retry_delay(attempts: u32) -> Duration {
    // 2^attempts, saturating well past any realistic max_retries.
    let exp = attempts.min(62);
    Duration::from_secs(1u64 << exp)
}

/// Backoff policy for the initial store connection. Applies only to
/// connection establishment; dequeue timeouts and job retries have their own
/// schedules.
pub fn connect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: Some(Duration::from_secs(120)),
        ..Default::default()
    }
}
