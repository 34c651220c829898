//! Storage contracts shared by every queue/lease backend.
//!
//! Two backends (in-process, networked key/value store) implement these
//! traits and must reproduce identical ordering, at-most-one-in-flight and
//! CAS-on-update semantics — that is a property of the contract, not of any
//! one backend.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LeaseError, QueueError};
use crate::model::{Lease, Task};

/// Priority queue persistence. Implementations must guarantee:
///
/// - `dequeue` returns the minimum-ordered pending record by `(priority, id)`.
/// - Ids assigned by `enqueue` are strictly increasing.
/// - `update_task` rejects silent creation (fails with `TaskNotFound` if the
///   id does not already exist).
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Assigns a unique increasing id, persists the record, and places it in
    /// the pending ordering. Does not enforce the per-name active-run guard —
    /// that lives in the `Queue` logical layer above this trait.
    async fn enqueue(&self, task: Task) -> Result<Task, QueueError>;

    /// Atomically removes and returns the minimum-ordered pending record, or
    /// `None` if the queue is empty. Does not transition status.
    async fn dequeue(&self) -> Result<Option<Task>, QueueError>;

    /// Exact lookup by id.
    async fn get_task(&self, id: u64) -> Result<Task, QueueError>;

    /// All recorded tasks with the given logical name, newest-id first.
    async fn get_task_instances(&self, name: &str) -> Result<Vec<Task>, QueueError>;

    /// All recorded tasks, in no particular guaranteed order (used by
    /// `kill_dead_tasks` to scan the whole set).
    async fn get_tasks(&self) -> Result<Vec<Task>, QueueError>;

    /// Persists a mutated record. Fails with `TaskNotFound` if the id is
    /// absent — this is the compare-and-set-on-existence guard.
    async fn update_task(&self, task: Task) -> Result<Task, QueueError>;

    /// Count of currently pending records.
    async fn get_queue_len(&self) -> Result<u64, QueueError>;

    /// For each logical name, retains every pending record plus the
    /// `keep_last` non-pending records with the highest ids; a pending
    /// record is never deleted and never counts against `keep_last`.
    async fn delete_old(&self, keep_last: u64) -> Result<(), QueueError>;
}

/// Named, time-bounded exclusive lease persistence used for leader election.
#[async_trait]
pub trait LeaseStorage: Send + Sync {
    /// Succeeds iff no lease exists for `name`, the existing lease is
    /// expired, or the existing owner equals `owner` (renewal). On success
    /// sets `acquired_until = now + duration` and returns the new lease.
    async fn maybe_acquire(
        &self,
        name: &str,
        owner: &str,
        duration: Duration,
    ) -> Result<Option<Lease>, LeaseError>;

    /// No-op unless a lease exists for `name` and the caller could legally
    /// re-acquire it (same owner or expired).
    async fn release(&self, name: &str, owner: &str) -> Result<(), LeaseError>;
}
