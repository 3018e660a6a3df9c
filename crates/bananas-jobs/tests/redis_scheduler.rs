//! Cron scheduler tests against a live Redis.
//!
//! Run with `cargo test --features test_redis` and `REDIS_URL` pointing at a
//! disposable database.
#![cfg(feature = "test_redis")]

use bananas_jobs::{
    create_pool, CronSchedule, CronScheduler, JobQueue, JobsConfig, RedisJobQueue,
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

fn test_config() -> JobsConfig {
    let mut config = JobsConfig::default();
    if let Ok(url) = std::env::var("REDIS_URL") {
        config.redis.url = url;
    }
    config.redis.key_prefix = format!("bananas-test-{}", Uuid::new_v4());
    config
}

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

async fn read_state(
    pool: &deadpool_redis::Pool,
    prefix: &str,
    schedule_id: &str,
) -> HashMap<String, String> {
    let mut conn = pool.get().await.expect("connection");
    redis::cmd("HGETALL")
        .arg(format!("{}:schedules:{}", prefix, schedule_id))
        .query_async(&mut *conn)
        .await
        .expect("reading schedule state")
}

#[tokio::test]
async fn first_tick_seeds_then_due_tick_fires_once() {
    let config = test_config();
    let prefix = config.redis.key_prefix.clone();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let queue = Arc::new(RedisJobQueue::new(pool.clone(), &config));

    let scheduler = CronScheduler::new(
        pool.clone(),
        queue.clone(),
        &prefix,
        config.scheduler.clone(),
    );
    scheduler.register(
        CronSchedule::new("minutely", "* * * * *", "heartbeat")
            .unwrap()
            .payload(b"tick".to_vec()),
    );

    // First tick only seeds next_run; nothing fires.
    scheduler.tick().await.expect("tick");
    let state = read_state(&pool, &prefix, "minutely").await;
    assert!(state.contains_key("next_run"));
    assert!(!state.contains_key("last_run"));
    assert_eq!(scheduler.stats().fires, 0);

    // Pull next_run into the past; the next tick fires exactly once.
    let mut conn = pool.get().await.expect("connection");
    let _: () = redis::cmd("HSET")
        .arg(format!("{}:schedules:minutely", prefix))
        .arg("next_run")
        .arg("2020-01-01T00:00:00+00:00")
        .query_async(&mut *conn)
        .await
        .expect("rewriting next_run");

    scheduler.tick().await.expect("tick");
    assert_eq!(scheduler.stats().fires, 1);

    let state = read_state(&pool, &prefix, "minutely").await;
    assert_eq!(state.get("run_count").map(String::as_str), Some("1"));
    assert!(state.contains_key("last_run"));
    assert!(state.contains_key("last_success"));

    // next_run was advanced into the future, so another tick is a no-op.
    scheduler.tick().await.expect("tick");
    assert_eq!(scheduler.stats().fires, 1);

    // The fired job landed in the queue with the schedule's template.
    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.total_pending(), 1);

    cleanup(&pool, &prefix).await;
}

#[tokio::test]
async fn foreign_lock_blocks_the_tick_and_survives_it() {
    let config = test_config();
    let prefix = config.redis.key_prefix.clone();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let queue = Arc::new(RedisJobQueue::new(pool.clone(), &config));

    let scheduler = CronScheduler::new(
        pool.clone(),
        queue.clone(),
        &prefix,
        config.scheduler.clone(),
    );
    scheduler.register(CronSchedule::new("minutely", "* * * * *", "heartbeat").unwrap());

    // Another replica holds the per-schedule lock.
    let lock_key = format!("{}:schedules:minutely:lock", prefix);
    let mut conn = pool.get().await.expect("connection");
    let _: () = redis::cmd("SET")
        .arg(&lock_key)
        .arg("other-replica")
        .arg("EX")
        .arg(60)
        .query_async(&mut *conn)
        .await
        .expect("planting lock");

    scheduler.tick().await.expect("tick");

    // Skipped entirely: no state was seeded and the foreign lock is intact.
    let state = read_state(&pool, &prefix, "minutely").await;
    assert!(state.is_empty());

    let held: Option<String> = redis::cmd("GET")
        .arg(&lock_key)
        .query_async(&mut *conn)
        .await
        .expect("reading lock");
    assert_eq!(held.as_deref(), Some("other-replica"));

    cleanup(&pool, &prefix).await;
}

#[tokio::test]
async fn disabled_schedules_are_skipped() {
    let config = test_config();
    let prefix = config.redis.key_prefix.clone();
    let pool = create_pool(&config.redis).await.expect("connecting");
    let queue = Arc::new(RedisJobQueue::new(pool.clone(), &config));

    let scheduler = CronScheduler::new(
        pool.clone(),
        queue.clone(),
        &prefix,
        config.scheduler.clone(),
    );
    scheduler.register(
        CronSchedule::new("paused", "* * * * *", "heartbeat")
            .unwrap()
            .enabled(false),
    );

    scheduler.tick().await.expect("tick");

    // No lock, no state, no job.
    let state = read_state(&pool, &prefix, "paused").await;
    assert!(state.is_empty());
    assert_eq!(queue.stats().await.expect("stats").total_pending(), 0);

    cleanup(&pool, &prefix).await;
}
