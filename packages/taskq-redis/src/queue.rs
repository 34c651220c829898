use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use taskq_core::error::QueueError;
use taskq_core::model::Task;
use taskq_core::storage::QueueStorage;
use tracing::instrument;

/// Default TTL applied to a task record. Past this window a stale record is
/// reclaimed by Redis even if nothing ever deleted it explicitly.
pub const DEFAULT_TASK_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const QUEUE_SET_NAME: &str = "internal::queue";
const ID_COUNTER_KEY: &str = "internal::id_counter";
const SCORE_PRIORITY_BIT_OFFSET: u32 = 32;

fn task_key(id: u64) -> String {
    format!("task::{id}")
}

fn task_name_key(name: &str) -> String {
    format!("task_name::{name}")
}

fn task_name_from_key(key: &str) -> String {
    key.strip_prefix("task_name::").unwrap_or(key).to_string()
}

fn task_score(task: &Task) -> f64 {
    // Sorted set members with equal score are ordered lexicographically, so
    // folding priority into the high bits of the score orders by priority
    // first and by id second within a priority band.
    ((task.priority.value() << SCORE_PRIORITY_BIT_OFFSET) + task.id) as f64
}

/// Redis-backed `QueueStorage`. The priority queue is a sorted set (`ZADD` /
/// `ZPOPMIN`) of task keys; `task_name::<name>` sets index every instance of
/// a logical name for `get_task_instances`/`delete_old`.
pub struct RedisQueueStorage {
    conn: ConnectionManager,
    task_ttl: Duration,
}

impl RedisQueueStorage {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_task_ttl(conn, DEFAULT_TASK_TTL)
    }

    pub fn with_task_ttl(conn: ConnectionManager, task_ttl: Duration) -> Self {
        Self { conn, task_ttl }
    }

    async fn generate_id(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let id: u64 = conn.incr(ID_COUNTER_KEY, 1).await.map_err(anyhow::Error::from)?;
        Ok(id)
    }

    async fn fetch_task(&self, key: &str) -> Result<Option<Task>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await.map_err(anyhow::Error::from)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(anyhow::Error::from)?)),
            None => Ok(None),
        }
    }

    async fn task_name_keys(&self, name: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(task_name_key(name)).await.map_err(anyhow::Error::from)?;
        Ok(keys)
    }
}

#[async_trait]
impl QueueStorage for RedisQueueStorage {
    #[instrument(skip(self, task), fields(task.name = %task.name))]
    async fn enqueue(&self, mut task: Task) -> Result<Task, QueueError> {
        task.id = self.generate_id().await?;
        let key = task_key(task.id);
        let score = task_score(&task);
        let body = serde_json::to_string(&task).map_err(anyhow::Error::from)?;

        let mut conn = self.conn.clone();
        let ttl_secs = self.task_ttl.as_secs();
        redis::pipe()
            .atomic()
            .set_ex(&key, &body, ttl_secs)
            .sadd(task_name_key(&task.name), &key)
            .zadd(QUEUE_SET_NAME, &key, score)
            .query_async::<()>(&mut conn)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(task)
    }

    async fn dequeue(&self) -> Result<Option<Task>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = conn.zpopmin(QUEUE_SET_NAME, 1).await.map_err(anyhow::Error::from)?;
        let Some((key, _score)) = popped.into_iter().next() else {
            return Ok(None);
        };
        self.fetch_task(&key).await?.map(Ok).unwrap_or_else(|| {
            Err(QueueError::Backend(anyhow::anyhow!(
                "queue referenced task key {key} with no body"
            )))
        })
    }

    async fn get_task(&self, id: u64) -> Result<Task, QueueError> {
        self.fetch_task(&task_key(id)).await?.ok_or(QueueError::TaskNotFound(id))
    }

    async fn get_task_instances(&self, name: &str) -> Result<Vec<Task>, QueueError> {
        let keys = self.task_name_keys(name).await?;
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(task) = self.fetch_task(&key).await? {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(tasks)
    }

    async fn get_tasks(&self) -> Result<Vec<Task>, QueueError> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> = conn
            .scan_match("task_name::*")
            .await
            .map_err(anyhow::Error::from)?;
        while let Some(key) = iter.next_item().await {
            names.push(task_name_from_key(&key));
        }
        drop(iter);

        let mut tasks = Vec::new();
        for name in names {
            tasks.extend(self.get_task_instances(&name).await?);
        }
        tasks.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(tasks)
    }

    async fn update_task(&self, task: Task) -> Result<Task, QueueError> {
        let key = task_key(task.id);
        let body = serde_json::to_string(&task).map_err(anyhow::Error::from)?;
        let mut conn = self.conn.clone();
        // SET ... XX only writes if the key already exists, giving us the
        // same compare-and-set-on-existence guarantee as the in-memory backend.
        let wrote: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&body)
            .arg("EX")
            .arg(self.task_ttl.as_secs())
            .arg("XX")
            .query_async(&mut conn)
            .await
            .map_err(anyhow::Error::from)?;
        if wrote.is_none() {
            return Err(QueueError::TaskNotFound(task.id));
        }
        Ok(task)
    }

    async fn get_queue_len(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn
            .zcount(QUEUE_SET_NAME, "-inf", "+inf")
            .await
            .map_err(anyhow::Error::from)?;
        Ok(len)
    }

    async fn delete_old(&self, keep_last: u64) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = Vec::new();
        let mut iter: redis::AsyncIter<'_, String> = conn
            .scan_match("task_name::*")
            .await
            .map_err(anyhow::Error::from)?;
        while let Some(key) = iter.next_item().await {
            names.push(task_name_from_key(&key));
        }
        drop(iter);

        for name in names {
            let instances = self.get_task_instances(&name).await?;
            // Pending instances never count against the retention budget: a
            // pending task would otherwise occupy a "kept" slot that belongs
            // to the keep_last highest-id non-pending records.
            let mut non_pending: Vec<Task> = instances
                .into_iter()
                .filter(|t| t.status != taskq_core::model::TaskStatus::Pending)
                .collect();
            non_pending.sort_by(|a, b| b.id.cmp(&a.id));
            for task in non_pending.into_iter().skip(keep_last as usize) {
                let key = task_key(task.id);
                let mut conn = self.conn.clone();
                redis::pipe()
                    .atomic()
                    .del(&key)
                    .srem(task_name_key(&name), &key)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(anyhow::Error::from)?;
            }
        }
        Ok(())
    }
}
