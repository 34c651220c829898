//! End-to-end scheduler scenarios from spec.md §8.
//!
//! These drive a real `Scheduler` against the in-memory storage backends —
//! no mocked trigger runtime — so they exercise the same lease-gated tick
//! loop and cron/interval job registration a production replica uses.

use std::sync::Arc;
use std::time::Duration;

use taskq_core::memory::{InMemoryLeaseStorage, InMemoryQueueStorage};
use taskq_core::metrics::{Metrics, METRIC_QUEUE_LENGTH};
use taskq_core::model::{Priority, Schedule};
use taskq_core::{PeriodicTask, Queue};
use taskq_scheduler::{Scheduler, StaticPeriodicTaskSource};

fn every_second_task(id: &str, name: &str) -> PeriodicTask {
    PeriodicTask {
        id: id.to_string(),
        name: name.to_string(),
        handler: "echo".to_string(),
        priority: Priority::Normal,
        payload: "hello".to_string(),
        schedule: Schedule::EverySecond,
        schedule_crontab: None,
        timeout: None,
    }
}

/// Scenario 1 (spec.md §8): a single `EVERY_SECOND` scraper with no
/// competing replica produces at least one enqueued task within 2.5s of
/// scheduler polling at a fast cadence.
#[tokio::test]
async fn scheduled_execution_enqueues_at_least_one_task() {
    let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
    let lease = Arc::new(InMemoryLeaseStorage::new());
    let source = Arc::new(StaticPeriodicTaskSource::new(vec![every_second_task(
        "s1",
        "scrape_feed",
    )]));

    let scheduler = Arc::new(
        Scheduler::new(source, lease, queue.clone())
            .await
            .unwrap()
            .with_tasks_poll_delay(Duration::from_millis(100))
            .with_lease_duration(Duration::from_secs(30)),
    );
    let handle = scheduler.clone().start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    handle.abort();
    scheduler.stop().await.unwrap();

    let instances = queue.get_task_instances("scrape_feed").await.unwrap();
    assert!(
        !instances.is_empty(),
        "expected at least one enqueued instance of scrape_feed"
    );
    assert_eq!(instances[0].handler, "echo");
    assert_eq!(instances[0].payload, "hello");
}

/// Scenario 6 (spec.md §8): two scheduler replicas share a lease store and a
/// single `EVERY_SECOND` scraper. Over a 3s window, the per-name active-run
/// guard must keep at most one `Pending`/`Started` instance live at a time
/// regardless of which replica currently holds the lease, and every
/// enqueued instance must have a distinct id.
#[tokio::test]
async fn two_scheduler_replicas_never_double_run_the_same_name() {
    let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
    let lease = Arc::new(InMemoryLeaseStorage::new());

    let mut handles = Vec::new();
    let mut schedulers = Vec::new();
    for _ in 0..2 {
        let source = Arc::new(StaticPeriodicTaskSource::new(vec![every_second_task(
            "s1",
            "scrape_feed",
        )]));
        let scheduler = Arc::new(
            Scheduler::new(source, lease.clone(), queue.clone())
                .await
                .unwrap()
                .with_tasks_poll_delay(Duration::from_millis(100))
                .with_lease_duration(Duration::from_secs(1)),
        );
        handles.push(scheduler.clone().start().await.unwrap());
        schedulers.push(scheduler);
    }

    tokio::time::sleep(Duration::from_millis(3_000)).await;
    for handle in handles {
        handle.abort();
    }
    for scheduler in &schedulers {
        scheduler.stop().await.ok();
    }

    let instances = queue.get_task_instances("scrape_feed").await.unwrap();
    assert!(!instances.is_empty());

    let mut ids: Vec<u64> = instances.iter().map(|t| t.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(
        ids.len(),
        instances.len(),
        "every enqueued instance must have a distinct id"
    );

    let active_count = instances
        .iter()
        .filter(|t| {
            matches!(
                t.status,
                taskq_core::model::TaskStatus::Pending | taskq_core::model::TaskStatus::Started
            )
        })
        .count();
    assert!(
        active_count <= 1,
        "at most one instance of scrape_feed may be Pending/Started at once, found {active_count}"
    );
}

/// spec.md §4.4(e): the scheduler must expose the pending queue length as a
/// gauge on every tick it holds the lease. No triggers are registered here
/// (the lone descriptor is `Inactive`) so the queue's contents are driven
/// entirely by this test, making the gauge's value deterministic.
#[tokio::test]
async fn leader_publishes_queue_length_gauge_each_tick() {
    let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
    let lease = Arc::new(InMemoryLeaseStorage::new());
    let mut inactive = every_second_task("s1", "scrape_feed");
    inactive.schedule = Schedule::Inactive;
    let source = Arc::new(StaticPeriodicTaskSource::new(vec![inactive]));
    let metrics = Arc::new(Metrics::new());

    queue
        .enqueue(taskq_core::model::EnqueueTaskRequest {
            name: "unrelated_pending".to_string(),
            handler: "echo".to_string(),
            priority: Priority::Normal,
            payload: String::new(),
            timeout: None,
        })
        .await
        .unwrap();

    let scheduler = Arc::new(
        Scheduler::new(source, lease, queue.clone())
            .await
            .unwrap()
            .with_tasks_poll_delay(Duration::from_millis(50))
            .with_lease_duration(Duration::from_secs(30))
            .with_metrics(metrics.clone()),
    );
    let handle = scheduler.clone().start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.abort();
    scheduler.stop().await.unwrap();

    assert_eq!(metrics.gauge_snapshot(METRIC_QUEUE_LENGTH, "default"), 1);
}
