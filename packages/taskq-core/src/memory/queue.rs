//! In-process queue storage. Development/single-replica use only — state does
//! not survive a process restart and is invisible to other replicas.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::model::{Task, TaskStatus};
use crate::storage::QueueStorage;

#[derive(Debug, Eq, PartialEq)]
struct HeapEntry {
    key: (u64, u64),
    id: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want the smallest (priority, id) out
        // first, so invert the comparison.
        other.key.cmp(&self.key)
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    next_id: AtomicU64,
    pending: Mutex<BinaryHeap<HeapEntry>>,
    tasks: Mutex<HashMap<u64, Task>>,
    names: Mutex<HashMap<String, HashSet<u64>>>,
}

/// `BinaryHeap` + id-indexed map + name-indexed multimap, guarded by short
/// critical sections — never held across an `.await`.
pub struct InMemoryQueueStorage {
    inner: Inner,
}

impl InMemoryQueueStorage {
    pub fn new() -> Self {
        Self {
            inner: Inner {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(BinaryHeap::new()),
                tasks: Mutex::new(HashMap::new()),
                names: Mutex::new(HashMap::new()),
            },
        }
    }
}

impl Default for InMemoryQueueStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStorage for InMemoryQueueStorage {
    async fn enqueue(&self, mut task: Task) -> Result<Task, QueueError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        task.id = id;

        {
            let mut names = self.inner.names.lock().unwrap();
            names.entry(task.name.clone()).or_default().insert(id);
        }
        {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.push(HeapEntry {
                key: task.ordering_key(),
                id,
            });
        }
        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            tasks.insert(id, task.clone());
        }
        Ok(task)
    }

    async fn dequeue(&self) -> Result<Option<Task>, QueueError> {
        let id = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.pop().map(|entry| entry.id)
        };
        let Some(id) = id else {
            return Ok(None);
        };
        let tasks = self.inner.tasks.lock().unwrap();
        match tasks.get(&id) {
            Some(task) => Ok(Some(task.clone())),
            None => Ok(None),
        }
    }

    async fn get_task(&self, id: u64) -> Result<Task, QueueError> {
        let tasks = self.inner.tasks.lock().unwrap();
        tasks.get(&id).cloned().ok_or(QueueError::TaskNotFound(id))
    }

    async fn get_task_instances(&self, name: &str) -> Result<Vec<Task>, QueueError> {
        let ids: Vec<u64> = {
            let names = self.inner.names.lock().unwrap();
            names.get(name).map(|s| s.iter().copied().collect()).unwrap_or_default()
        };
        let tasks = self.inner.tasks.lock().unwrap();
        let mut result: Vec<Task> = ids.into_iter().filter_map(|id| tasks.get(&id).cloned()).collect();
        result.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(result)
    }

    async fn get_tasks(&self) -> Result<Vec<Task>, QueueError> {
        let tasks = self.inner.tasks.lock().unwrap();
        let mut result: Vec<Task> = tasks.values().cloned().collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }

    async fn update_task(&self, task: Task) -> Result<Task, QueueError> {
        let mut tasks = self.inner.tasks.lock().unwrap();
        if !tasks.contains_key(&task.id) {
            return Err(QueueError::TaskNotFound(task.id));
        }
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_queue_len(&self) -> Result<u64, QueueError> {
        let pending = self.inner.pending.lock().unwrap();
        Ok(pending.len() as u64)
    }

    async fn delete_old(&self, keep_last: u64) -> Result<(), QueueError> {
        let mut names = self.inner.names.lock().unwrap();
        let mut tasks = self.inner.tasks.lock().unwrap();
        for ids in names.values_mut() {
            // Pending instances never count against the retention budget: a
            // pending task would otherwise occupy a "kept" slot that belongs
            // to the keep_last highest-id non-pending records.
            let mut non_pending: Vec<u64> = ids
                .iter()
                .copied()
                .filter(|id| {
                    !tasks
                        .get(id)
                        .map(|t| matches!(t.status, TaskStatus::Pending))
                        .unwrap_or(false)
                })
                .collect();
            non_pending.sort_unstable_by(|a, b| b.cmp(a));
            for id in non_pending.into_iter().skip(keep_last as usize) {
                ids.remove(&id);
                tasks.remove(&id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use chrono::Utc;

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

    #[tokio::test]
    async fn enqueue_assigns_strictly_increasing_ids() {
        let storage = InMemoryQueueStorage::new();
        let a = storage.enqueue(task("a", Priority::Normal)).await.unwrap();
        let b = storage.enqueue(task("b", Priority::Normal)).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn dequeue_returns_none_when_empty() {
        let storage = InMemoryQueueStorage::new();
        assert!(storage.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_task_rejects_unknown_id() {
        let storage = InMemoryQueueStorage::new();
        let mut ghost = task("ghost", Priority::Normal);
        ghost.id = 999;
        let err = storage.update_task(ghost).await.unwrap_err();
        assert!(matches!(err, QueueError::TaskNotFound(999)));
    }

    #[tokio::test]
    async fn delete_old_keeps_pending_tasks_regardless_of_age() {
        let storage = InMemoryQueueStorage::new();
        let first = storage.enqueue(task("scrape_feed", Priority::Normal)).await.unwrap();
        let second = storage.enqueue(task("scrape_feed", Priority::Normal)).await.unwrap();

        storage.delete_old(0).await.unwrap();

        assert!(storage.get_task(first.id).await.is_ok());
        assert!(storage.get_task(second.id).await.is_ok());
    }

    #[tokio::test]
    async fn delete_old_removes_finished_tasks_beyond_keep_last() {
        let storage = InMemoryQueueStorage::new();
        let mut first = storage.enqueue(task("scrape_feed", Priority::Normal)).await.unwrap();
        first.status = TaskStatus::Succeeded;
        storage.update_task(first.clone()).await.unwrap();

        let mut second = storage.enqueue(task("scrape_feed", Priority::Normal)).await.unwrap();
        second.status = TaskStatus::Succeeded;
        storage.update_task(second.clone()).await.unwrap();

        storage.delete_old(1).await.unwrap();

        assert!(storage.get_task(first.id).await.is_err());
        assert!(storage.get_task(second.id).await.is_ok());
    }
}
