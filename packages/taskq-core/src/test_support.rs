//! Backend-agnostic conformance checks shared by every `QueueStorage`/
//! `LeaseStorage` implementation.
//!
//! Per the Design Note in `spec.md` §9 ("Multiple storage backends behind
//! one interface ... Integration tests should run the same suite against
//! each backend"), these functions exercise the contract once and are
//! invoked against both the in-process backend (in this crate's own test
//! modules) and the networked backend (`taskq-redis`'s integration tests,
//! gated behind a reachable Redis instance).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::model::{Priority, Task, TaskStatus};
use crate::storage::{LeaseStorage, QueueStorage};

fn task(name: &str, priority: Priority) -> Task {
    Task {
        id: 0,
        name: name.to_string(),
        handler: "noop".to_string(),
        status: TaskStatus::Pending,
        priority,
        created_at: Utc::now(),
        started_at: None,
        last_active_at: None,
        finished_at: None,
        payload: "{}".to_string(),
        result: None,
        timeout: None,
    }
}

/// I4: ids assigned by `enqueue` are strictly increasing.
pub async fn ids_are_strictly_increasing(storage: &dyn QueueStorage) {
    let a = storage.enqueue(task("a", Priority::Normal)).await.unwrap();
    let b = storage.enqueue(task("b", Priority::Normal)).await.unwrap();
    let c = storage.enqueue(task("c", Priority::Normal)).await.unwrap();
    assert!(b.id > a.id);
    assert!(c.id > b.id);
}

/// I1: dequeue returns the minimum-ordered pending record by `(priority, id)`.
pub async fn dequeue_orders_by_priority_then_id(storage: &dyn QueueStorage) {
    let low_first = storage.enqueue(task("low", Priority::Normal)).await.unwrap();
    let low_second = storage.enqueue(task("low", Priority::Normal)).await.unwrap();
    let high = storage.enqueue(task("high", Priority::Utmost)).await.unwrap();

    let first = storage.dequeue().await.unwrap().unwrap();
    assert_eq!(first.id, high.id);
    let second = storage.dequeue().await.unwrap().unwrap();
    assert_eq!(second.id, low_first.id);
    let third = storage.dequeue().await.unwrap().unwrap();
    assert_eq!(third.id, low_second.id);
    assert!(storage.dequeue().await.unwrap().is_none());
}

/// `update_task` must reject silent creation (compare-and-set on existence).
pub async fn update_rejects_unknown_id(storage: &dyn QueueStorage) {
    let mut ghost = task("ghost", Priority::Normal);
    ghost.id = 999_999;
    let err = storage.update_task(ghost).await.unwrap_err();
    assert!(matches!(err, crate::error::QueueError::TaskNotFound(999_999)));
}

/// `get_task` fails with `TaskNotFound` for an absent id.
pub async fn get_task_fails_for_unknown_id(storage: &dyn QueueStorage) {
    let err = storage.get_task(999_999).await.unwrap_err();
    assert!(matches!(err, crate::error::QueueError::TaskNotFound(999_999)));
}

/// I6: retention keeps at most `keep_last` non-pending instances per name and
/// never deletes a pending one.
pub async fn delete_old_respects_retention_and_spares_pending(storage: &dyn QueueStorage) {
    let mut first = storage.enqueue(task("scrape_feed", Priority::Normal)).await.unwrap();
    first.status = TaskStatus::Succeeded;
    storage.update_task(first.clone()).await.unwrap();

    let mut second = storage.enqueue(task("scrape_feed", Priority::Normal)).await.unwrap();
    second.status = TaskStatus::Succeeded;
    storage.update_task(second.clone()).await.unwrap();

    let pending = storage.enqueue(task("scrape_feed", Priority::Normal)).await.unwrap();

    storage.delete_old(1).await.unwrap();

    assert!(storage.get_task(first.id).await.is_err());
    assert!(storage.get_task(second.id).await.is_ok());
    assert!(storage.get_task(pending.id).await.is_ok());
}

/// R2: a renewal by the same owner succeeds and refreshes `acquired_until`.
pub async fn same_owner_can_renew(storage: &dyn LeaseStorage) {
    let first = storage
        .maybe_acquire("scheduler", "replica-a", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let renewed = storage
        .maybe_acquire("scheduler", "replica-a", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert!(renewed.acquired_until >= first.acquired_until);
}

/// I5: a second owner cannot acquire a lease that is still live.
pub async fn other_owner_cannot_acquire_live_lease(storage: &dyn LeaseStorage) {
    storage
        .maybe_acquire("scheduler", "replica-a", Duration::from_secs(30))
        .await
        .unwrap();
    let result = storage
        .maybe_acquire("scheduler", "replica-b", Duration::from_secs(30))
        .await
        .unwrap();
    assert!(result.is_none());
}

/// Runs every `QueueStorage` conformance check, each against a fresh
/// instance produced by `new_storage` — the checks assume an empty backend,
/// so they must not share state with one another.
pub async fn run_queue_storage_conformance<F, Fut>(new_storage: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Arc<dyn QueueStorage>>,
{
    ids_are_strictly_increasing(new_storage().await.as_ref()).await;
    dequeue_orders_by_priority_then_id(new_storage().await.as_ref()).await;
    update_rejects_unknown_id(new_storage().await.as_ref()).await;
    get_task_fails_for_unknown_id(new_storage().await.as_ref()).await;
    delete_old_respects_retention_and_spares_pending(new_storage().await.as_ref()).await;
}

/// Runs every `LeaseStorage` conformance check, each against a fresh
/// instance produced by `new_storage`.
pub async fn run_lease_storage_conformance<F, Fut>(new_storage: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Arc<dyn LeaseStorage>>,
{
    same_owner_can_renew(new_storage().await.as_ref()).await;
    other_owner_cannot_acquire_live_lease(new_storage().await.as_ref()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryLeaseStorage, InMemoryQueueStorage};

    #[tokio::test]
    async fn in_memory_queue_storage_is_conformant() {
        run_queue_storage_conformance(|| async {
            Arc::new(InMemoryQueueStorage::new()) as Arc<dyn QueueStorage>
        })
        .await;
    }

    #[tokio::test]
    async fn in_memory_lease_storage_is_conformant() {
        run_lease_storage_conformance(|| async {
            Arc::new(InMemoryLeaseStorage::new()) as Arc<dyn LeaseStorage>
        })
        .await;
    }
}
