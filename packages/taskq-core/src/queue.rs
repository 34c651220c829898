//! Logical queue layer above a `QueueStorage` backend: enforces the
//! at-most-one-in-flight-per-name guard, the status state machine, and dead
//! task reaping.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::model::{EnqueueTaskRequest, Task, TaskStatus};
use crate::storage::QueueStorage;

const DEFAULT_DEAD_TASK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Priority task queue. Not linearizable across replicas — see the
/// `enqueue` docs for why the resulting race is acceptable.
pub struct Queue {
    storage: Arc<dyn QueueStorage>,
    dead_task_timeout: Duration,
}

impl Queue {
    pub fn new(storage: Arc<dyn QueueStorage>) -> Self {
        Self {
            storage,
            dead_task_timeout: DEFAULT_DEAD_TASK_TIMEOUT,
        }
    }

    pub fn with_dead_task_timeout(mut self, timeout: Duration) -> Self {
        self.dead_task_timeout = timeout;
        self
    }

    /// Enqueues a new task, raising `TaskHasActiveRun` if another instance of
    /// the same logical name is `Pending` or `Started`.
    ///
    /// This check-then-act is not linearizable across replicas: two
    /// producers (e.g. the scheduler and an admin API) can race between the
    /// read and the write. That race is accepted because both typical
    /// producers are effectively singletons (the scheduler lease; a
    /// human-driven admin call), and any duplicate is recovered at dequeue
    /// time — the second `PENDING` row just sits until it too is taken, at
    /// which point the handler's own idempotency (or a future enqueue
    /// attempt failing with `TaskHasActiveRun`) absorbs the duplicate.
    pub async fn enqueue(&self, request: EnqueueTaskRequest) -> Result<Task, QueueError> {
        let existing = self.storage.get_task_instances(&request.name).await?;
        if existing
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Started))
        {
            return Err(QueueError::TaskHasActiveRun(request.name));
        }
        let task = Task {
            id: 0,
            name: request.name,
            handler: request.handler,
            status: TaskStatus::Pending,
            priority: request.priority,
            created_at: Utc::now(),
            started_at: None,
            last_active_at: None,
            finished_at: None,
            payload: request.payload,
            result: None,
            timeout: request.timeout,
        };
        self.storage.enqueue(task).await
    }

    /// Dequeues the next pending task and transitions it to `Started`, or
    /// returns `None` if the queue is empty.
    pub async fn dequeue(&self) -> Result<Option<Task>, QueueError> {
        let Some(mut task) = self.storage.dequeue().await? else {
            return Ok(None);
        };
        task.started_at = Some(Utc::now());
        task.status = TaskStatus::Started;
        let task = self.storage.update_task(task).await?;
        Ok(Some(task))
    }

    /// Records a heartbeat. Fails with `TaskPingNotStarted` if the task is
    /// still `Pending`, or `TaskPingFinished` if it has already left
    /// `Started` (including an out-of-band `Killed`).
    pub async fn ping_task(&self, id: u64) -> Result<Task, QueueError> {
        let mut task = self.storage.get_task(id).await?;
        match task.status {
            TaskStatus::Pending => return Err(QueueError::TaskPingNotStarted(id)),
            TaskStatus::Started => {}
            _ => return Err(QueueError::TaskPingFinished(id)),
        }
        task.last_active_at = Some(Utc::now());
        self.storage.update_task(task).await
    }

    pub async fn update_task(&self, task: Task) -> Result<Task, QueueError> {
        self.storage.update_task(task).await
    }

    pub async fn get_task_instances(&self, name: &str) -> Result<Vec<Task>, QueueError> {
        self.storage.get_task_instances(name).await
    }

    pub async fn get_task_instance(&self, id: u64) -> Result<Task, QueueError> {
        self.storage.get_task(id).await
    }

    pub async fn get_queue_len(&self) -> Result<u64, QueueError> {
        self.storage.get_queue_len().await
    }

    /// Scans every recorded task and marks any `Started` task whose last
    /// activity is older than the dead-task timeout as `Dead`. Returns the
    /// tasks that were killed.
    ///
    /// The staleness check is `now - max(last_active_at, started_at,
    /// created_at) > dead_timeout`; an earlier revision of this logic
    /// compared `status` against the wrong operand and a reversed time
    /// delta — both corrected here.
    pub async fn kill_dead_tasks(&self) -> Result<Vec<Task>, QueueError> {
        let tasks = self.storage.get_tasks().await?;
        let mut killed = Vec::new();
        for mut task in tasks {
            if !self.is_dead(&task) {
                continue;
            }
            task.status = TaskStatus::Dead;
            task.finished_at = Some(Utc::now());
            debug!(task.id = task.id, task.name = %task.name, "marking task dead");
            killed.push(self.storage.update_task(task).await?);
        }
        Ok(killed)
    }

    fn is_dead(&self, task: &Task) -> bool {
        if task.status != TaskStatus::Started {
            return false;
        }
        let last_activity = [task.last_active_at, task.started_at, Some(task.created_at)]
            .into_iter()
            .flatten()
            .max();
        match last_activity {
            Some(ts) => {
                let elapsed = Utc::now() - ts;
                elapsed.to_std().unwrap_or_default() > self.dead_task_timeout
            }
            None => false,
        }
    }

    pub async fn delete_old_tasks(&self, keep_last: u64) -> Result<(), QueueError> {
        self.storage.delete_old(keep_last).await
    }
}

/// Name of the internal periodic task that runs `Queue::kill_dead_tasks`.
pub const KILL_DEAD_TASKS_TASK_NAME: &str = "internal::queue::kill_dead_tasks";
/// Name of the internal periodic task that runs `Queue::delete_old_tasks`.
pub const DELETE_OLD_TASKS_TASK_NAME: &str = "internal::queue::delete_old_tasks";

pub fn log_unexpected_ping_error(name: &str, err: &QueueError) {
    warn!(task.name = %name, error = %err, "heartbeat failed, will retry next tick");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryQueueStorage;

    fn request(name: &str) -> EnqueueTaskRequest {
        EnqueueTaskRequest {
            name: name.to_string(),
            handler: "noop".to_string(),
            priority: crate::model::Priority::Normal,
            payload: "{}".to_string(),
            timeout: None,
        }
    }

    fn queue() -> Queue {
        Queue::new(Arc::new(InMemoryQueueStorage::new()))
    }

    #[tokio::test]
    async fn enqueue_rejects_second_active_instance() {
        let queue = queue();
        queue.enqueue(request("scrape_feed")).await.unwrap();

        let err = queue.enqueue(request("scrape_feed")).await.unwrap_err();
        assert!(matches!(err, QueueError::TaskHasActiveRun(name) if name == "scrape_feed"));
    }

    #[tokio::test]
    async fn enqueue_allows_new_instance_after_previous_finished() {
        let queue = queue();
        let first = queue.enqueue(request("scrape_feed")).await.unwrap();
        let mut first = queue.get_task_instance(first.id).await.unwrap();
        first.status = TaskStatus::Succeeded;
        queue.update_task(first).await.unwrap();

        queue.enqueue(request("scrape_feed")).await.unwrap();
    }

    #[tokio::test]
    async fn dequeue_honors_priority_then_id_ordering() {
        let queue = queue();
        let mut low = request("low");
        low.priority = crate::model::Priority::Normal;
        let mut high = request("high");
        high.priority = crate::model::Priority::Utmost;

        queue.enqueue(low).await.unwrap();
        queue.enqueue(high).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.name, "high");
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.name, "low");
    }

    #[tokio::test]
    async fn ping_rejects_pending_and_finished_tasks() {
        let queue = queue();
        let task = queue.enqueue(request("scrape_feed")).await.unwrap();

        let err = queue.ping_task(task.id).await.unwrap_err();
        assert!(matches!(err, QueueError::TaskPingNotStarted(id) if id == task.id));

        let started = queue.dequeue().await.unwrap().unwrap();
        queue.ping_task(started.id).await.unwrap();

        let mut done = queue.get_task_instance(started.id).await.unwrap();
        done.status = TaskStatus::Succeeded;
        queue.update_task(done).await.unwrap();

        let err = queue.ping_task(started.id).await.unwrap_err();
        assert!(matches!(err, QueueError::TaskPingFinished(id) if id == started.id));
    }

    #[tokio::test]
    async fn kill_dead_tasks_only_kills_stale_started_tasks() {
        let queue = Queue::new(Arc::new(InMemoryQueueStorage::new()))
            .with_dead_task_timeout(Duration::from_secs(0));
        let task = queue.enqueue(request("scrape_feed")).await.unwrap();
        let started = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(started.id, task.id);

        let killed = queue.kill_dead_tasks().await.unwrap();
        assert_eq!(killed.len(), 1);
        assert_eq!(killed[0].status, TaskStatus::Dead);
    }

    #[tokio::test]
    async fn kill_dead_tasks_spares_healthy_tasks() {
        let queue = queue();
        let task = queue.enqueue(request("scrape_feed")).await.unwrap();
        queue.dequeue().await.unwrap();

        let killed = queue.kill_dead_tasks().await.unwrap();
        assert!(killed.is_empty());

        let still_started = queue.get_task_instance(task.id).await.unwrap();
        assert_eq!(still_started.status, TaskStatus::Started);
    }
}
