//! Job queue abstraction.

use crate::error::JobResult;
use crate::job::{Job, JobId, Priority, RoutingKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One (routing key, priority) dequeue source, in precedence order.
pub type QueueSlot = (RoutingKey, Priority);

/// Queue engine trait. All invariants over the shared store live behind this
/// seam; callers never touch keys directly.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Stores the job record and pushes its id onto the queue selected by
    /// (routing_key, priority), or onto the scheduled set when
    /// `scheduled_for` is in the future.
    async fn enqueue(&self, job: &Job) -> JobResult<()>;

    /// Enqueues several jobs in one pipeline.
    async fn enqueue_batch(&self, jobs: &[Job]) -> JobResult<()>;

    /// Blocks on each queue in `precedence` order and returns the first job
    /// popped, after moving its id to the processing list. Returns `None`
    /// when every queue timed out empty.
    async fn dequeue(&self, precedence: &[QueueSlot]) -> JobResult<Option<Job>>;

    /// Marks a job completed: removes the id from the processing list and
    /// rewrites the record with the completed TTL. Idempotent.
    async fn complete(&self, id: &JobId) -> JobResult<()>;

    /// Records a failure. Under the retry budget the job is rescheduled with
    /// exponential backoff; at the budget it moves to the dead-letter list.
    async fn fail(&self, job: &Job, error: &str) -> JobResult<()>;

    /// Moves every scheduled id whose run time has arrived back to its
    /// priority queue. Returns the number moved.
    async fn promote_scheduled(&self) -> JobResult<u64>;

    /// Reads a job record by id.
    async fn get_job(&self, id: &JobId) -> JobResult<Option<Job>>;

    /// Snapshot of queue depths.
    async fn stats(&self) -> JobResult<QueueStats>;

    /// Reads up to `limit` records from the dead-letter list, newest first.
    async fn list_dead(&self, limit: usize) -> JobResult<Vec<Job>>;

    /// Reads the records of every id currently leased by a worker. A record
    /// whose `updated_at` is far in the past belongs to a crashed worker;
    /// re-`fail`ing it is how an operator reclaims the lease.
    async fn list_processing(&self) -> JobResult<Vec<Job>>;

    /// Reads up to `limit` scheduled entries with their run times, soonest
    /// first.
    async fn list_scheduled(&self, limit: usize) -> JobResult<Vec<(Job, DateTime<Utc>)>>;

    /// Moves a dead-lettered job back to its priority queue with a reset
    /// retry budget.
    async fn retry_dead(&self, id: &JobId) -> JobResult<()>;

    /// Cancels a job that is not processing: removes its id from the pending
    /// and scheduled structures and deletes the record.
    async fn cancel(&self, id: &JobId) -> JobResult<()>;

    /// Pings the store.
    async fn health_check(&self) -> JobResult<()>;
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending ids per priority queue key (includes routed queues).
    pub pending: Vec<(String, u64)>,

    /// Ids currently leased by workers.
    pub processing: u64,

    /// Ids waiting in the scheduled set.
    pub scheduled: u64,

    /// Ids in the dead-letter list.
    pub dead: u64,
}

impl QueueStats {
    /// Total pending ids across all priority queues.
    pub fn total_pending(&self) -> u64 {
        self.pending.iter().map(|(_, n)| n).sum()
    }
}

/// Builds the dequeue precedence list: the cartesian product of routes and
/// priorities, route-major, preserving the configured order of both.
pub fn precedence(routes: &[RoutingKey], priorities: &[Priority]) -> Vec<QueueSlot> {
    let mut slots = Vec::with_capacity(routes.len() * priorities.len());
    for route in routes {
        for priority in priorities {
            slots.push((route.clone(), *priority));
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_is_route_major() {
        let routes = vec![
            RoutingKey::new("gpu").unwrap(),
            RoutingKey::default(),
        ];
        let priorities = vec![Priority::High, Priority::Normal, Priority::Low];

        let slots = precedence(&routes, &priorities);
        let flat: Vec<String> = slots
            .iter()
            .map(|(r, p)| format!("{}:{}", r, p))
            .collect();

        assert_eq!(
            flat,
            vec![
                "gpu:high",
                "gpu:normal",
                "gpu:low",
                "default:high",
                "default:normal",
                "default:low",
            ]
        );
    }

    #[test]
    fn precedence_respects_configured_subset() {
        let routes = vec![RoutingKey::default()];
        let priorities = vec![Priority::Low, Priority::High];

        let slots = precedence(&routes, &priorities);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].1, Priority::Low);
        assert_eq!(slots[1].1, Priority::High);
    }

    #[test]
    fn stats_total_pending() {
        let stats = QueueStats {
            pending: vec![("a".into(), 2), ("b".into(), 3)],
            processing: 1,
            scheduled: 4,
            dead: 0,
        };
        assert_eq!(stats.total_pending(), 5);
    }
}
