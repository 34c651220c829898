//! Runs the shared `taskq_core::test_support` conformance suite against the
//! networked backend. Requires a reachable Redis-compatible server at
//! `TASKQ_TEST_REDIS_URL` (default `redis://127.0.0.1:6379`); `#[ignore]`d so
//! `cargo test` doesn't fail in environments without one, matching how this
//! pack's other suites gate on `testcontainers`.

use std::sync::Arc;

use taskq_core::storage::{LeaseStorage, QueueStorage};
use taskq_core::test_support::{run_lease_storage_conformance, run_queue_storage_conformance};
use taskq_redis::{RedisLeaseStorage, RedisQueueStorage};

fn redis_url() -> String {
    std::env::var("TASKQ_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn connection() -> redis::aio::ConnectionManager {
    let client = redis::Client::open(redis_url()).expect("invalid redis url");
    let mut conn = redis::aio::ConnectionManager::new(client)
        .await
        .expect("failed to connect to redis, is TASKQ_TEST_REDIS_URL reachable?");
    // Each conformance check expects an empty backend; this suite is only
    // meant to run against a disposable test instance.
    let _: () = redis::cmd("FLUSHDB")
        .query_async(&mut conn)
        .await
        .expect("failed to flush test redis database");
    conn
}

#[tokio::test]
#[ignore = "requires a reachable Redis server; run with `cargo test -- --ignored`"]
async fn redis_queue_storage_is_conformant() {
    run_queue_storage_conformance(|| async {
        Arc::new(RedisQueueStorage::new(connection().await)) as Arc<dyn QueueStorage>
    })
    .await;
}

#[tokio::test]
#[ignore = "requires a reachable Redis server; run with `cargo test -- --ignored`"]
async fn redis_lease_storage_is_conformant() {
    run_lease_storage_conformance(|| async {
        Arc::new(RedisLeaseStorage::new(connection().await)) as Arc<dyn LeaseStorage>
    })
    .await;
}
