//! Task consumer: bounded-concurrency dequeue loop plus the per-task
//! supervised execution that races a handler activity against a heartbeat
//! activity.
//!
//! Grounded on `sneakpeek/queue/consumer.py::Consumer`: the main loop polls
//! `queue.dequeue()` while under `max_concurrency`, and every dequeued task
//! is driven by two cooperating coroutines — the handler invocation and a
//! heartbeat loop that pings the queue, watches for timeout, and watches for
//! an external kill. Whichever finishes first cancels the other.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskq_core::metrics::{
    Metrics, METRIC_TASKS_DEAD, METRIC_TASKS_FAILED, METRIC_TASKS_KILLED, METRIC_TASKS_SUCCEEDED,
    METRIC_TASK_DURATION,
};
use taskq_core::model::{Task, TaskStatus};
use taskq_core::queue::log_unexpected_ping_error;
use taskq_core::{Queue, QueueError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::context::Context;
use crate::registry::{HandlerRegistry, TaskHandler};

const DEFAULT_MAX_CONCURRENCY: usize = 50;
const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_PING_DELAY: Duration = Duration::from_secs(1);

/// Why a supervised task execution ended, decided by whichever of the two
/// racing activities finishes first.
enum Outcome {
    Succeeded(String),
    Failed(String),
    /// Observed `TaskPingFinished` while heartbeating — something else (an
    /// operator, or this same consumer on a prior pass) already moved the
    /// task to a terminal state. The consumer must not overwrite it.
    AlreadyFinished,
}

/// A factory the consumer asks for a fresh `Context` for each dequeued task.
/// Kept as a trait so the worker crate does not have to know how the caller
/// wires up scraper state lookup, params, or the middleware chain.
#[async_trait::async_trait]
pub trait ContextFactory: Send + Sync {
    async fn build(&self, task: &Task, cancellation: CancellationToken) -> anyhow::Result<Context>;
}

/// Drives the bounded-concurrency dequeue loop and supervises every
/// in-flight task. One `Consumer` is one replica; replicas coordinate only
/// through the shared `Queue`.
pub struct Consumer {
    queue: Arc<Queue>,
    registry: Arc<HandlerRegistry>,
    context_factory: Arc<dyn ContextFactory>,
    metrics: Arc<Metrics>,
    max_concurrency: usize,
    poll_delay: Duration,
    ping_delay: Duration,
    active: Arc<Semaphore>,
    active_count: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Consumer {
    pub fn new(
        queue: Arc<Queue>,
        registry: Arc<HandlerRegistry>,
        context_factory: Arc<dyn ContextFactory>,
    ) -> Self {
        let max_concurrency = DEFAULT_MAX_CONCURRENCY;
        Self {
            queue,
            registry,
            context_factory,
            metrics: Arc::new(Metrics::new()),
            max_concurrency,
            poll_delay: DEFAULT_POLL_DELAY,
            ping_delay: DEFAULT_PING_DELAY,
            active: Arc::new(Semaphore::new(max_concurrency)),
            active_count: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self.active = Arc::new(Semaphore::new(self.max_concurrency));
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub fn with_ping_delay(mut self, delay: Duration) -> Self {
        self.ping_delay = delay;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Number of tasks currently being supervised by this replica.
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Requests that the poll loop stop accepting new work. In-flight
    /// supervised executions are allowed to run to their natural join point;
    /// this only stops step 2 of the main loop from dequeuing more.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the main loop until the shutdown token is cancelled. Returns
    /// once no further dequeues will be attempted; already-dispatched
    /// supervised executions are fire-and-forget tasks that keep running.
    pub async fn run(self: Arc<Self>) {
        info!(max_concurrency = self.max_concurrency, "consumer starting");
        loop {
            if self.shutdown.is_cancelled() {
                info!("consumer shutting down, no further dequeues");
                return;
            }

            let permit = match self.active.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tokio::time::sleep(self.poll_delay).await;
                    continue;
                }
            };

            let task = match self.queue.dequeue().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(self.poll_delay).await;
                    continue;
                }
                Err(err) => {
                    drop(permit);
                    error!(error = %err, "dequeue failed, will retry next tick");
                    tokio::time::sleep(self.poll_delay).await;
                    continue;
                }
            };

            self.active_count.fetch_add(1, Ordering::SeqCst);
            let consumer = self.clone();
            tokio::spawn(async move {
                consumer.supervise(task).await;
                consumer.active_count.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }
    }

    /// Runs the handler and heartbeat activities for one dequeued task and
    /// persists whichever outcome wins the race, per the join rules in
    /// spec §4.5.
    async fn supervise(&self, task: Task) {
        let span = taskq_core::logging::task_span(&task);
        self.supervise_inner(task).instrument(span).await;
    }

    async fn supervise_inner(&self, task: Task) {
        let queue_wait = task
            .started_at
            .map(|started| started - task.created_at)
            .and_then(|d| d.to_std().ok())
            .unwrap_or_default();
        self.metrics
            .observe_latency(METRIC_TASK_DURATION, format!("{}:queue_wait", task.handler), queue_wait);

        let handler = match self.registry.get(&task.handler) {
            Ok(handler) => handler,
            Err(err) => {
                warn!(error = %err, "unknown task handler");
                self.finish(task, Outcome::Failed(err.to_string())).await;
                return;
            }
        };

        let cancellation = CancellationToken::new();
        let context = match self.context_factory.build(&task, cancellation.child_token()).await {
            Ok(context) => context,
            Err(err) => {
                error!(error = %err, "failed to build handler context");
                self.finish(task, Outcome::Failed(format!("failed to build context: {err}")))
                    .await;
                return;
            }
        };

        let outcome = self.race(&task, handler, context, cancellation).await;
        self.finish(task, outcome).await;
    }

    /// Races the handler activity against the heartbeat activity. The first
    /// to complete decides the outcome and cancels the other side.
    async fn race(
        &self,
        task: &Task,
        handler: Arc<dyn TaskHandler>,
        context: Context,
        cancellation: CancellationToken,
    ) -> Outcome {
        let handler_cancellation = cancellation.clone();
        let handler_task = task.clone();
        let mut handler_fut = Box::pin(async move {
            tokio::select! {
                result = handler.process(&handler_task, context) => result,
                _ = handler_cancellation.cancelled() => {
                    Err(anyhow::anyhow!("cancelled"))
                }
            }
        });

        let mut heartbeat_fut = Box::pin(self.heartbeat(task.clone()));

        tokio::select! {
            result = &mut handler_fut => {
                cancellation.cancel();
                match result {
                    Ok(value) => Outcome::Succeeded(value),
                    Err(err) => Outcome::Failed(format!("{err:#}")),
                }
            }
            signal = &mut heartbeat_fut => {
                cancellation.cancel();
                // Give the handler a brief window to observe cancellation and
                // unwind before we move on; we do not block indefinitely on
                // it, matching the spec's "cancelled or left to run to a
                // natural stopping point" latitude.
                let _ = tokio::time::timeout(Duration::from_millis(50), &mut handler_fut).await;
                signal
            }
        }
    }

    /// Heartbeat activity: pings the queue on `ping_delay`, watching for
    /// timeout and for an out-of-band kill. Returns only when one of those
    /// two signals fires — it never races the handler's natural success path
    /// on its own, that is `race`'s job via `tokio::select!`.
    async fn heartbeat(&self, task: Task) -> Outcome {
        loop {
            tokio::time::sleep(self.ping_delay).await;

            if let Some(timeout) = task.timeout {
                let started = task.started_at.unwrap_or(task.created_at);
                let elapsed = Utc::now() - started;
                if elapsed.to_std().unwrap_or_default() > timeout {
                    warn!(task.id = task.id, ?timeout, "task timed out");
                    return Outcome::Failed(format!("task timed out after {timeout:?}"));
                }
            }

            match self.queue.ping_task(task.id).await {
                Ok(_) => {}
                Err(QueueError::TaskPingFinished(_)) => {
                    debug!(task.id = task.id, "task already finished, stopping heartbeat");
                    return Outcome::AlreadyFinished;
                }
                Err(QueueError::TaskPingNotStarted(_)) => {
                    // Should not happen: the consumer only heartbeats tasks it
                    // itself moved to Started. Treat as transient and retry.
                    warn!(task.id = task.id, "heartbeat observed task still pending");
                }
                Err(err) => log_unexpected_ping_error(&task.name, &err),
            }
        }
    }

    /// Persists the terminal outcome, unless the outcome is
    /// `AlreadyFinished` (an out-of-band kill observed mid-run), in which
    /// case the consumer logs and leaves the persisted terminal state alone.
    async fn finish(&self, mut task: Task, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded(result) => {
                task.status = TaskStatus::Succeeded;
                task.result = Some(result);
                task.finished_at = Some(Utc::now());
                self.metrics.increment(METRIC_TASKS_SUCCEEDED, task.handler.clone());
            }
            Outcome::Failed(result) => {
                task.status = TaskStatus::Failed;
                task.result = Some(result);
                task.finished_at = Some(Utc::now());
                self.metrics.increment(METRIC_TASKS_FAILED, task.handler.clone());
            }
            Outcome::AlreadyFinished => {
                info!(task.id = task.id, "task finished out of band, not overwriting terminal state");
                match self.queue.get_task_instance(task.id).await {
                    Ok(observed) if observed.status == TaskStatus::Killed => {
                        self.metrics.increment(METRIC_TASKS_KILLED, task.handler.clone());
                    }
                    Ok(observed) if observed.status == TaskStatus::Dead => {
                        self.metrics.increment(METRIC_TASKS_DEAD, task.handler.clone());
                    }
                    _ => {}
                }
                return;
            }
        }

        if let Err(err) = self.queue.update_task(task).await {
            error!(error = %err, "failed to persist terminal task state, abandoning");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use taskq_core::memory::InMemoryQueueStorage;
    use taskq_core::model::{EnqueueTaskRequest, Priority};

    struct NoopContextFactory;

    #[async_trait]
    impl ContextFactory for NoopContextFactory {
        async fn build(&self, _task: &Task, cancellation: CancellationToken) -> anyhow::Result<Context> {
            Ok(Context::new(
                reqwest::Client::new(),
                Vec::new(),
                Default::default(),
                json!({}),
                None,
                cancellation,
            ))
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        fn name(&self) -> &str {
            "echo"
        }

        async fn process(&self, _task: &Task, _context: Context) -> anyhow::Result<String> {
            Ok("ok".to_string())
        }
    }

    struct SleepyHandler(Duration);

    #[async_trait]
    impl TaskHandler for SleepyHandler {
        fn name(&self) -> &str {
            "sleepy"
        }

        async fn process(&self, _task: &Task, context: Context) -> anyhow::Result<String> {
            tokio::select! {
                _ = tokio::time::sleep(self.0) => Ok("would be success".to_string()),
                _ = context.cancellation().cancelled() => Err(anyhow::anyhow!("cancelled")),
            }
        }
    }

    fn consumer_with(
        queue: Arc<Queue>,
        handler: Arc<dyn TaskHandler>,
        ping_delay: Duration,
    ) -> Arc<Consumer> {
        let mut registry = HandlerRegistry::new();
        registry.register(handler).unwrap();
        Arc::new(
            Consumer::new(queue, Arc::new(registry), Arc::new(NoopContextFactory))
                .with_ping_delay(ping_delay)
                .with_poll_delay(Duration::from_millis(10)),
        )
    }

    fn request(name: &str, handler: &str, timeout: Option<Duration>) -> EnqueueTaskRequest {
        EnqueueTaskRequest {
            name: name.to_string(),
            handler: handler.to_string(),
            priority: Priority::Normal,
            payload: "{}".to_string(),
            timeout,
        }
    }

    #[tokio::test]
    async fn successful_handler_marks_task_succeeded() {
        let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
        let enqueued = queue.enqueue(request("scrape_feed", "echo", None)).await.unwrap();
        let consumer = consumer_with(queue.clone(), Arc::new(EchoHandler), Duration::from_millis(50));

        let task = queue.dequeue().await.unwrap().unwrap();
        consumer.supervise(task).await;

        let finished = queue.get_task_instance(enqueued.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Succeeded);
        assert_eq!(finished.result.as_deref(), Some("ok"));
        assert!(finished.finished_at.is_some());
    }

    #[tokio::test]
    async fn timeout_cancels_handler_and_marks_failed() {
        let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
        let enqueued = queue
            .enqueue(request("scrape_slow", "sleepy", Some(Duration::from_millis(10))))
            .await
            .unwrap();
        let consumer = consumer_with(
            queue.clone(),
            Arc::new(SleepyHandler(Duration::from_secs(10))),
            Duration::from_millis(20),
        );

        let task = queue.dequeue().await.unwrap().unwrap();
        consumer.supervise(task).await;

        let finished = queue.get_task_instance(enqueued.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        assert!(finished.result.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn external_kill_wins_over_late_handler_success() {
        let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
        let enqueued = queue.enqueue(request("scrape_feed", "sleepy", None)).await.unwrap();
        let consumer = consumer_with(
            queue.clone(),
            Arc::new(SleepyHandler(Duration::from_millis(200))),
            Duration::from_millis(10),
        );

        let task = queue.dequeue().await.unwrap().unwrap();

        let kill_queue = queue.clone();
        let id = task.id;
        let killer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let mut killed = kill_queue.get_task_instance(id).await.unwrap();
            killed.status = TaskStatus::Killed;
            killed.finished_at = Some(Utc::now());
            kill_queue.update_task(killed).await.unwrap();
        });

        consumer.supervise(task).await;
        killer.await.unwrap();

        let finished = queue.get_task_instance(enqueued.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Killed);
        assert_ne!(finished.result.as_deref(), Some("would be success"));
    }

    #[tokio::test]
    async fn unknown_handler_fails_the_task() {
        let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
        let enqueued = queue
            .enqueue(request("scrape_feed", "does_not_exist", None))
            .await
            .unwrap();
        let consumer = consumer_with(queue.clone(), Arc::new(EchoHandler), Duration::from_millis(50));

        let task = queue.dequeue().await.unwrap().unwrap();
        consumer.supervise(task).await;

        let finished = queue.get_task_instance(enqueued.id).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Failed);
        assert!(finished.result.unwrap().contains("does_not_exist"));
    }

    #[tokio::test]
    async fn priority_ordering_drains_utmost_before_high() {
        let queue = Arc::new(Queue::new(Arc::new(InMemoryQueueStorage::new())));
        let mut high = request("a", "echo", None);
        high.priority = Priority::High;
        let mut utmost = request("b", "echo", None);
        utmost.priority = Priority::Utmost;

        queue.enqueue(high).await.unwrap();
        queue.enqueue(utmost).await.unwrap();

        let consumer = consumer_with(queue.clone(), Arc::new(EchoHandler), Duration::from_millis(50));

        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.name, "b");
        consumer.supervise(first).await;
        let b_finished = queue.get_task_instances("b").await.unwrap()[0].finished_at;

        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.name, "a");
        consumer.supervise(second).await;
        let a_finished = queue.get_task_instances("a").await.unwrap()[0].finished_at;

        assert!(b_finished.unwrap() <= a_finished.unwrap());
    }
}
