//! Single-leader periodic task scheduler.
//!
//! Ported from `sneakpeek/scheduler/scheduler.py::Scheduler`: a lease-gated
//! tick loop polls the configured `PeriodicTaskSource` and diffs it against
//! currently registered trigger jobs, adding/removing/replacing jobs on a
//! cron/interval job runtime as descriptors appear, change or disappear.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskq_core::metrics::{Metrics, METRIC_QUEUE_LENGTH};
use taskq_core::model::{EnqueueTaskRequest, Schedule};
use taskq_core::{PeriodicTask, Queue};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::model::PeriodicTaskSource;

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_TASKS_POLL_DELAY: Duration = Duration::from_secs(5);
const LEASE_NAME: &str = "taskq::scheduler";

struct RegisteredJob {
    task: PeriodicTask,
    job_id: Uuid,
}

/// Drives trigger registration and the lease-gated update loop. Only the
/// replica currently holding the `taskq::scheduler` lease actually enqueues
/// tasks; every replica still runs the tick loop so that whichever one
/// acquires the lease picks straight back up.
pub struct Scheduler {
    tasks_source: Arc<dyn PeriodicTaskSource>,
    lease_storage: Arc<dyn taskq_core::LeaseStorage>,
    queue: Arc<Queue>,
    owner_id: String,
    tasks_poll_delay: Duration,
    lease_duration: Duration,
    cron: JobScheduler,
    registered: Mutex<HashMap<String, RegisteredJob>>,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    pub async fn new(
        tasks_source: Arc<dyn PeriodicTaskSource>,
        lease_storage: Arc<dyn taskq_core::LeaseStorage>,
        queue: Arc<Queue>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            tasks_source,
            lease_storage,
            queue,
            owner_id: Uuid::new_v4().to_string(),
            tasks_poll_delay: DEFAULT_TASKS_POLL_DELAY,
            lease_duration: DEFAULT_LEASE_DURATION,
            cron: JobScheduler::new().await?,
            registered: Mutex::new(HashMap::new()),
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn with_tasks_poll_delay(mut self, delay: Duration) -> Self {
        self.tasks_poll_delay = delay;
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Starts the underlying job runtime and spawns the lease-gated update
    /// loop. The returned handle keeps running independently of whether the
    /// caller awaits or drops it.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        self.cron.start().await?;
        let scheduler = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                scheduler.on_tick().await;
                tokio::time::sleep(scheduler.tasks_poll_delay).await;
            }
        }))
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.cron.shutdown().await?;
        Ok(())
    }

    async fn on_tick(self: &Arc<Self>) {
        debug!("scheduler tick");
        let lease = match self
            .lease_storage
            .maybe_acquire(LEASE_NAME, &self.owner_id, self.lease_duration)
            .await
        {
            Ok(lease) => lease,
            Err(err) => {
                error!(error = %err, "failed to acquire scheduler lease");
                return;
            }
        };
        let Some(lease) = lease else {
            debug!("did not acquire scheduler lease this tick");
            return;
        };
        info!(acquired_until = %lease.acquired_until, "holding scheduler lease");

        if let Err(err) = self.update_tasks().await {
            error!(error = %err, "failed to refresh periodic task registrations");
        }

        match self.queue.get_queue_len().await {
            Ok(len) => {
                debug!(queue_len = len, "pending queue length");
                self.metrics.set_gauge(METRIC_QUEUE_LENGTH, "default", len as i64);
            }
            Err(err) => warn!(error = %err, "failed to read queue length"),
        }
    }

    /// Diffs the current source against currently registered jobs: removes
    /// jobs whose descriptor disappeared or went `Inactive`, re-registers
    /// changed descriptors, and adds brand new ones.
    async fn update_tasks(self: &Arc<Self>) -> anyhow::Result<()> {
        let tasks = self.tasks_source.get_periodic_tasks().await?;
        let index: HashMap<String, PeriodicTask> =
            tasks.into_iter().map(|t| (t.id.clone(), t)).collect();

        let stale: Vec<String> = {
            let registered = self.registered.lock().await;
            registered
                .iter()
                .filter(|(id, reg)| match index.get(*id) {
                    None => true,
                    Some(current) => current.schedule == Schedule::Inactive || *current != reg.task,
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in stale {
            self.stop_scheduling_task(&id).await?;
        }

        for task in index.values() {
            let already_registered = self.registered.lock().await.contains_key(&task.id);
            if !already_registered && task.schedule != Schedule::Inactive {
                self.start_scheduling_task(task.clone()).await?;
            }
        }
        Ok(())
    }

    async fn stop_scheduling_task(&self, task_id: &str) -> anyhow::Result<()> {
        let removed = self.registered.lock().await.remove(task_id);
        if let Some(reg) = removed {
            info!(task.id = %task_id, task.name = %reg.task.name, "stopping periodic task");
            self.cron.remove(&reg.job_id).await?;
        }
        Ok(())
    }

    async fn start_scheduling_task(self: &Arc<Self>, task: PeriodicTask) -> anyhow::Result<()> {
        info!(task.id = %task.id, task.name = %task.name, "starting periodic task");
        let Some(job_id) = self.register_trigger(&task).await? else {
            return Ok(());
        };
        self.registered
            .lock()
            .await
            .insert(task.id.clone(), RegisteredJob { task, job_id });
        Ok(())
    }

    /// Registers the job with the cron/interval runtime, computing an
    /// interval schedule's first fire time from the most recent task
    /// instance's `finished_at` (falling back to "fire immediately").
    async fn register_trigger(self: &Arc<Self>, task: &PeriodicTask) -> anyhow::Result<Option<Uuid>> {
        let interval = match task.schedule {
            Schedule::Inactive => return Ok(None),
            Schedule::Crontab => {
                let expr = task
                    .schedule_crontab
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("crontab schedule with no expression"))?;
                let job_id = self.add_enqueue_job_cron(expr, task.id.clone()).await?;
                return Ok(Some(job_id));
            }
            Schedule::EverySecond => Duration::from_secs(1),
            Schedule::EveryMinute => Duration::from_secs(60),
            Schedule::EveryHour => Duration::from_secs(60 * 60),
            Schedule::EveryDay => Duration::from_secs(24 * 60 * 60),
            Schedule::EveryWeek => Duration::from_secs(7 * 24 * 60 * 60),
            Schedule::EveryMonth => Duration::from_secs(30 * 24 * 60 * 60),
        };

        let last_finished_at = self
            .queue
            .get_task_instances(&task.name)
            .await
            .ok()
            .and_then(|instances| instances.into_iter().max_by_key(|t| t.id))
            .and_then(|t| t.finished_at);

        let initial_delay = match last_finished_at {
            Some(finished_at) => {
                let next_fire = finished_at + chrono::Duration::from_std(interval).unwrap_or_default();
                let remaining = next_fire - Utc::now();
                remaining.to_std().unwrap_or(Duration::ZERO)
            }
            None => Duration::ZERO,
        };

        let job_id = self
            .add_enqueue_job_repeated(interval, initial_delay, task.id.clone())
            .await?;
        Ok(Some(job_id))
    }

    async fn add_enqueue_job_cron(
        self: &Arc<Self>,
        cron_expr: &str,
        task_id: String,
    ) -> anyhow::Result<Uuid> {
        let scheduler = self.clone();
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let scheduler = scheduler.clone();
            let task_id = task_id.clone();
            Box::pin(async move {
                scheduler.enqueue_periodic_task(&task_id).await;
            })
        })?;
        let job_id = self.cron.add(job).await?;
        Ok(job_id)
    }

    /// Registers the repeating job. When `initial_delay` is non-zero, the
    /// first fire is a one-shot job scheduled after the delay, which itself
    /// registers the steady-state repeated job once it runs — this is how
    /// `EVERY_*` triggers honor the last instance's `finished_at` without the
    /// underlying job runtime supporting an explicit start-date parameter.
    async fn add_enqueue_job_repeated(
        self: &Arc<Self>,
        interval: Duration,
        initial_delay: Duration,
        task_id: String,
    ) -> anyhow::Result<Uuid> {
        if initial_delay.is_zero() {
            let scheduler = self.clone();
            let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
                let scheduler = scheduler.clone();
                let task_id = task_id.clone();
                Box::pin(async move {
                    scheduler.enqueue_periodic_task(&task_id).await;
                })
            })?;
            return Ok(self.cron.add(job).await?);
        }

        let scheduler = self.clone();
        let job = Job::new_one_shot_async(initial_delay, move |_uuid, mut lock| {
            let scheduler = scheduler.clone();
            let task_id = task_id.clone();
            Box::pin(async move {
                scheduler.enqueue_periodic_task(&task_id).await;
                let follow_up_scheduler = scheduler.clone();
                let follow_up_task_id = task_id.clone();
                let follow_up = Job::new_repeated_async(interval, move |_uuid, _lock| {
                    let scheduler = follow_up_scheduler.clone();
                    let task_id = follow_up_task_id.clone();
                    Box::pin(async move {
                        scheduler.enqueue_periodic_task(&task_id).await;
                    })
                });
                if let Ok(follow_up) = follow_up {
                    if let Err(err) = lock.add(follow_up).await {
                        error!(error = %err, "failed to register follow-up interval job");
                    }
                }
            })
        })?;
        Ok(self.cron.add(job).await?)
    }

    async fn enqueue_periodic_task(&self, task_id: &str) {
        let task = { self.registered.lock().await.get(task_id).map(|r| r.task.clone()) };
        let Some(task) = task else {
            warn!(task.id = %task_id, "tried to enqueue unknown periodic task");
            return;
        };
        self.enqueue(&task).await;
    }

    async fn enqueue(&self, task: &PeriodicTask) {
        let is_leader = matches!(
            self.lease_storage
                .maybe_acquire(LEASE_NAME, &self.owner_id, self.lease_duration)
                .await,
            Ok(Some(_))
        );
        if !is_leader {
            debug!(task.id = %task.id, "skipping enqueue, lease not held");
            return;
        }
        let request = EnqueueTaskRequest {
            name: task.name.clone(),
            handler: task.handler.clone(),
            priority: task.priority,
            payload: task.payload.clone(),
            timeout: task.timeout,
        };
        match self.queue.enqueue(request).await {
            Ok(enqueued) => info!(task.id = enqueued.id, task.name = %task.name, "enqueued periodic task"),
            Err(taskq_core::QueueError::TaskHasActiveRun(name)) => {
                debug!(task.name = %name, "skipped enqueue, instance already active")
            }
            Err(err) => error!(task.name = %task.name, error = %err, "failed to enqueue periodic task"),
        }
    }
}
