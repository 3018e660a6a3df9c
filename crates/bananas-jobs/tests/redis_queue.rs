//! Queue engine tests against a live Redis.
//!
//! Run with `cargo test --features test_redis` and `REDIS_URL` pointing at a
//! disposable database. Each test works under a unique key prefix and cleans
//! it up afterwards.
#![cfg(feature = "test_redis")]

use bananas_jobs::{
    create_pool, precedence, Job, JobError, JobId, JobQueue, JobStatus, JobsConfig, Priority,
    QueueSlot, RedisJobQueue, RedisResultBackend, ResultBackend, RoutingKey,
};
use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

fn test_config() -> JobsConfig {
    let mut config = JobsConfig::default();
    if let Ok(url) = std::env::var("REDIS_URL") {
        config.redis.url = url;
    }
    config.redis.key_prefix = format!("bananas-test-{}", Uuid::new_v4());
    config
}

fn default_slots() -> Vec<QueueSlot> {
    precedence(
        &[RoutingKey::default()],
        &[Priority::High, Priority::Normal, Priority::Low],
    )
}

/// Deletes every key under the test prefix.
async fn cleanup(pool: &deadpool_redis::Pool, prefix: &str) {
    let mut conn = pool.get().await.expect("cleanup: acquiring connection");
    let pattern = format!("{}:*", prefix);

    let mut cursor: u64 = 0;
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(&mut *conn)
            .await
            .expect("cleanup: scanning keyspace");

        if !keys.is_empty() {
            let mut del = redis::cmd("DEL");
            for key in &keys {
                del.arg(key);
            }
            let _: () = del
                .query_async(&mut *conn)
                .await
                .expect("cleanup: deleting keys");
        }

        cursor = next;
        if cursor == 0 {
            break;
        }
    }
}

#[tokio::test]
async fn enqueue_dequeue_complete_round_trip() {
    let config = test_config();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let queue = RedisJobQueue::new(pool.clone(), &config);

    let job = Job::builder("echo")
        .payload(br#"{"x":1}"#.to_vec())
        .build();
    let id = job.id.clone();

    queue.enqueue(&job).await.expect("enqueue");

    let leased = queue
        .dequeue(&default_slots())
        .await
        .expect("dequeue")
        .expect("job should be ready");
    assert_eq!(leased.id, id);
    assert_eq!(leased.status, JobStatus::Processing);

    let stored = queue.get_job(&id).await.expect("get").expect("record");
    assert_eq!(stored.status, JobStatus::Processing);

    queue.complete(&id).await.expect("complete");

    let stored = queue.get_job(&id).await.expect("get").expect("record");
    assert_eq!(stored.status, JobStatus::Completed);

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.total_pending(), 0);

    // A second complete is a no-op on the already-completed record.
    queue.complete(&id).await.expect("idempotent complete");

    cleanup(&pool, &config.redis.key_prefix).await;
}

#[tokio::test]
async fn priorities_drain_high_before_low() {
    let config = test_config();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let queue = RedisJobQueue::new(pool.clone(), &config);

    let low = Job::builder("order").priority(Priority::Low).build();
    let normal = Job::builder("order").priority(Priority::Normal).build();
    let high = Job::builder("order").priority(Priority::High).build();

    // Enqueued lowest first; drained strictly by priority.
    queue
        .enqueue_batch(&[low.clone(), normal.clone(), high.clone()])
        .await
        .expect("enqueue");

    let slots = default_slots();
    let mut seen = Vec::new();
    for _ in 0..3 {
        let job = queue
            .dequeue(&slots)
            .await
            .expect("dequeue")
            .expect("job should be ready");
        seen.push(job.id.clone());
        queue.complete(&job.id).await.expect("complete");
    }

    assert_eq!(seen, vec![high.id, normal.id, low.id]);

    cleanup(&pool, &config.redis.key_prefix).await;
}

#[tokio::test]
async fn routed_jobs_only_reach_their_route() {
    let config = test_config();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let queue = RedisJobQueue::new(pool.clone(), &config);

    let gpu = RoutingKey::new("gpu").unwrap();
    let job = Job::builder("train").routing_key(gpu.clone()).build();
    queue.enqueue(&job).await.expect("enqueue");

    // The default route does not see it.
    assert!(queue
        .dequeue(&default_slots())
        .await
        .expect("dequeue")
        .is_none());

    // The gpu route does.
    let slots = precedence(&[gpu], &[Priority::Normal]);
    let leased = queue
        .dequeue(&slots)
        .await
        .expect("dequeue")
        .expect("routed job should be ready");
    assert_eq!(leased.id, job.id);

    cleanup(&pool, &config.redis.key_prefix).await;
}

#[tokio::test]
async fn failure_schedules_retry_then_dead_letters() {
    let config = test_config();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let queue = RedisJobQueue::new(pool.clone(), &config);

    let job = Job::builder("flaky").max_retries(2).build();
    queue.enqueue(&job).await.expect("enqueue");

    let slots = default_slots();
    let leased = queue
        .dequeue(&slots)
        .await
        .expect("dequeue")
        .expect("ready");

    // First failure: scheduled ~2s out, attempts = 1.
    queue.fail(&leased, "nope").await.expect("fail");

    let stored = queue.get_job(&job.id).await.expect("get").expect("record");
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.error, "nope");
    let run_at = stored.scheduled_for.expect("retry time");
    assert!(run_at >= Utc::now() + chrono::Duration::seconds(1));

    let scheduled = queue.list_scheduled(10).await.expect("list");
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].0.id, job.id);

    // Nothing due yet.
    assert_eq!(queue.promote_scheduled().await.expect("promote"), 0);

    // After the backoff the id is promoted and dequeued again.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(queue.promote_scheduled().await.expect("promote"), 1);

    let leased = queue
        .dequeue(&slots)
        .await
        .expect("dequeue")
        .expect("promoted job should be ready");
    assert_eq!(leased.attempts, 1);

    // Second failure exhausts the budget.
    queue.fail(&leased, "nope").await.expect("fail");

    let stored = queue.get_job(&job.id).await.expect("get").expect("record");
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 2);
    assert!(stored.scheduled_for.is_none());

    let dead = queue.list_dead(10).await.expect("list dead");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job.id);

    cleanup(&pool, &config.redis.key_prefix).await;
}

#[tokio::test]
async fn producer_scheduled_job_waits_for_promotion() {
    let config = test_config();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let queue = RedisJobQueue::new(pool.clone(), &config);

    let job = Job::builder("later")
        .at(Utc::now() - chrono::Duration::seconds(1))
        .build();
    queue.enqueue(&job).await.expect("enqueue");

    let stored = queue.get_job(&job.id).await.expect("get").expect("record");
    assert_eq!(stored.status, JobStatus::Scheduled);

    assert_eq!(queue.promote_scheduled().await.expect("promote"), 1);

    let leased = queue
        .dequeue(&default_slots())
        .await
        .expect("dequeue")
        .expect("promoted job should be ready");
    assert_eq!(leased.id, job.id);
    assert_eq!(leased.attempts, 0);

    cleanup(&pool, &config.redis.key_prefix).await;
}

#[tokio::test]
async fn unreadable_record_is_quarantined() {
    let config = test_config();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let queue = RedisJobQueue::new(pool.clone(), &config);
    let prefix = config.redis.key_prefix.clone();

    // Plant a garbage record behind a queued id.
    let mut conn = pool.get().await.expect("connection");
    let _: () = redis::cmd("SET")
        .arg(format!("{}:job:abc", prefix))
        .arg("not json")
        .query_async(&mut *conn)
        .await
        .expect("planting record");
    let _: () = redis::cmd("LPUSH")
        .arg(format!("{}:queue:normal", prefix))
        .arg("abc")
        .query_async(&mut *conn)
        .await
        .expect("planting id");

    // The dequeue survives, quarantines the id, and comes back empty.
    assert!(queue
        .dequeue(&default_slots())
        .await
        .expect("dequeue")
        .is_none());

    let marker = queue
        .get_job(&JobId::from("abc"))
        .await
        .expect("get")
        .expect("marker record");
    assert_eq!(marker.status, JobStatus::Failed);
    assert!(marker.error.starts_with("unreadable job record"));

    let dead = queue.list_dead(10).await.expect("list dead");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id.as_str(), "abc");

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.processing, 0);

    cleanup(&pool, &prefix).await;
}

#[tokio::test]
async fn dead_lettered_job_can_be_requeued() {
    let config = test_config();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let queue = RedisJobQueue::new(pool.clone(), &config);

    let job = Job::builder("doomed").max_retries(0).build();
    queue.enqueue(&job).await.expect("enqueue");

    let slots = default_slots();
    let leased = queue
        .dequeue(&slots)
        .await
        .expect("dequeue")
        .expect("ready");
    queue.fail(&leased, "nope").await.expect("fail");

    let stored = queue.get_job(&job.id).await.expect("get").expect("record");
    assert_eq!(stored.status, JobStatus::Failed);

    queue.retry_dead(&job.id).await.expect("requeue");

    let leased = queue
        .dequeue(&slots)
        .await
        .expect("dequeue")
        .expect("requeued job should be ready");
    assert_eq!(leased.id, job.id);
    assert_eq!(leased.attempts, 0);
    assert!(leased.error.is_empty());

    assert!(queue.list_dead(10).await.expect("list dead").is_empty());

    cleanup(&pool, &config.redis.key_prefix).await;
}

#[tokio::test]
async fn pending_job_can_be_cancelled() {
    let config = test_config();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let queue = RedisJobQueue::new(pool.clone(), &config);

    let job = Job::builder("unwanted").build();
    queue.enqueue(&job).await.expect("enqueue");

    queue.cancel(&job.id).await.expect("cancel");

    assert!(queue.get_job(&job.id).await.expect("get").is_none());
    assert!(queue
        .dequeue(&default_slots())
        .await
        .expect("dequeue")
        .is_none());

    match queue.cancel(&job.id).await {
        Err(JobError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }

    cleanup(&pool, &config.redis.key_prefix).await;
}

#[tokio::test]
async fn outcome_is_stored_and_waitable() {
    let config = test_config();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let backend = RedisResultBackend::new(
        pool.clone(),
        &config.redis.key_prefix,
        config.results.clone(),
    );

    let id = JobId::new();
    assert!(backend.get(&id).await.expect("get").is_none());
    assert!(backend
        .wait(&id, Duration::from_millis(300))
        .await
        .expect("wait")
        .is_none());

    let outcome =
        bananas_jobs::JobOutcome::success(id.clone(), b"done".to_vec(), Utc::now());
    backend.write(&outcome).await.expect("write");

    let read = backend
        .wait(&id, Duration::from_secs(1))
        .await
        .expect("wait")
        .expect("outcome should be stored");
    assert!(read.is_success());
    assert_eq!(read.payload, b"done".to_vec());

    cleanup(&pool, &config.redis.key_prefix).await;
}
