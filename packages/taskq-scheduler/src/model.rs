//! Periodic task sourcing: anything that can be diffed against currently
//! scheduled jobs and turned into trigger registrations.

use async_trait::async_trait;
use taskq_core::model::{Priority, Schedule};
use taskq_core::queue::{DELETE_OLD_TASKS_TASK_NAME, KILL_DEAD_TASKS_TASK_NAME};
use taskq_core::PeriodicTask;
use uuid::Uuid;

/// Source of periodic task descriptors the scheduler should keep registered.
/// Implementations may be backed by a scraper registry, a static fixed set,
/// or an aggregation of other sources.
#[async_trait]
pub trait PeriodicTaskSource: Send + Sync {
    async fn get_periodic_tasks(&self) -> anyhow::Result<Vec<PeriodicTask>>;
}

/// Fixed, never-changing set of periodic task descriptors. Used to
/// contribute the internal housekeeping jobs (`kill_dead_tasks`,
/// `delete_old_tasks`), mirroring `sneakpeek/queue/tasks.py::queue_periodic_tasks`.
pub struct StaticPeriodicTaskSource {
    tasks: Vec<PeriodicTask>,
}

impl StaticPeriodicTaskSource {
    pub fn new(tasks: Vec<PeriodicTask>) -> Self {
        Self { tasks }
    }

    /// The two internal housekeeping descriptors every deployment registers
    /// regardless of which scrapers are configured.
    pub fn internal_housekeeping() -> Self {
        Self::new(vec![
            PeriodicTask {
                id: Uuid::new_v4().to_string(),
                name: KILL_DEAD_TASKS_TASK_NAME.to_string(),
                handler: KILL_DEAD_TASKS_TASK_NAME.to_string(),
                priority: Priority::Normal,
                payload: String::new(),
                schedule: Schedule::EveryHour,
                schedule_crontab: None,
                timeout: None,
            },
            PeriodicTask {
                id: Uuid::new_v4().to_string(),
                name: DELETE_OLD_TASKS_TASK_NAME.to_string(),
                handler: DELETE_OLD_TASKS_TASK_NAME.to_string(),
                priority: Priority::Normal,
                payload: String::new(),
                schedule: Schedule::EveryHour,
                schedule_crontab: None,
                timeout: None,
            },
        ])
    }
}

#[async_trait]
impl PeriodicTaskSource for StaticPeriodicTaskSource {
    async fn get_periodic_tasks(&self) -> anyhow::Result<Vec<PeriodicTask>> {
        Ok(self.tasks.clone())
    }
}

/// Aggregates multiple sources into one, mirroring
/// `sneakpeek/scheduler/model.py::MultiPeriodicTasksStorage`.
pub struct CompositePeriodicTaskSource {
    sources: Vec<Box<dyn PeriodicTaskSource>>,
}

impl CompositePeriodicTaskSource {
    pub fn new(sources: Vec<Box<dyn PeriodicTaskSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl PeriodicTaskSource for CompositePeriodicTaskSource {
    async fn get_periodic_tasks(&self) -> anyhow::Result<Vec<PeriodicTask>> {
        let mut all = Vec::new();
        for source in &self.sources {
            all.extend(source.get_periodic_tasks().await?);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn internal_housekeeping_contributes_both_descriptors() {
        let source = StaticPeriodicTaskSource::internal_housekeeping();
        let tasks = source.get_periodic_tasks().await.unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&KILL_DEAD_TASKS_TASK_NAME));
        assert!(names.contains(&DELETE_OLD_TASKS_TASK_NAME));
    }

    #[tokio::test]
    async fn composite_source_aggregates_all_children() {
        let composite = CompositePeriodicTaskSource::new(vec![
            Box::new(StaticPeriodicTaskSource::internal_housekeeping()),
            Box::new(StaticPeriodicTaskSource::new(vec![])),
        ]);
        let tasks = composite.get_periodic_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2);
    }
}
