//! Built-in handlers bound to the internal housekeeping periodic tasks
//! (`kill_dead_tasks`, `delete_old_tasks`), mirroring
//! `sneakpeek/queue/tasks.py::KillDeadTasksHandler`/`DeleteOldTasksHandler`.
//! These are infrastructure, not scraper handlers — no dynamic/user code is
//! compiled or executed here (handler authoring is out of scope).

use std::sync::Arc;

use async_trait::async_trait;
use taskq_core::queue::{DELETE_OLD_TASKS_TASK_NAME, KILL_DEAD_TASKS_TASK_NAME};
use taskq_core::{Queue, Task};
use taskq_worker::{Context, TaskHandler};

pub struct KillDeadTasksHandler {
    queue: Arc<Queue>,
}

impl KillDeadTasksHandler {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl TaskHandler for KillDeadTasksHandler {
    fn name(&self) -> &str {
        KILL_DEAD_TASKS_TASK_NAME
    }

    async fn process(&self, _task: &Task, _context: Context) -> anyhow::Result<String> {
        let killed = self.queue.kill_dead_tasks().await?;
        Ok(format!("killed {} dead task(s)", killed.len()))
    }
}

pub struct DeleteOldTasksHandler {
    queue: Arc<Queue>,
    keep_last: u64,
}

impl DeleteOldTasksHandler {
    pub fn new(queue: Arc<Queue>, keep_last: u64) -> Self {
        Self { queue, keep_last }
    }
}

#[async_trait]
impl TaskHandler for DeleteOldTasksHandler {
    fn name(&self) -> &str {
        DELETE_OLD_TASKS_TASK_NAME
    }

    async fn process(&self, _task: &Task, _context: Context) -> anyhow::Result<String> {
        self.queue.delete_old_tasks(self.keep_last).await?;
        Ok(format!("retained at most {} instance(s) per name", self.keep_last))
    }
}

/// Trivial demo handler: returns the task's payload unchanged. Useful as a
/// smoke-test handler when running the CLI against no real scraper
/// registry.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn process(&self, task: &Task, _context: Context) -> anyhow::Result<String> {
        Ok(task.payload.clone())
    }
}
