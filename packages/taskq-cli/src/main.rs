//! Process entry point: wires a chosen storage backend (in-process or
//! Redis-compatible networked) to a scheduler replica, a consumer replica,
//! or both, and registers the internal housekeeping handlers plus a trivial
//! demo echo handler.
//!
//! This is a thin runnable harness around `taskq-core`/`taskq-scheduler`/
//! `taskq-worker` — it is not the JSON-RPC/HTTP admin surface (out of core
//! scope); `enqueue` below is a local convenience for exercising the runtime
//! without one.

mod context_factory;
mod handlers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use taskq_core::model::{EnqueueTaskRequest, Priority, Schedule};
use taskq_core::{Config, LeaseStorage, PeriodicTask, Queue, QueueStorage};
use taskq_scheduler::{CompositePeriodicTaskSource, Scheduler, StaticPeriodicTaskSource};
use taskq_worker::{Consumer, HandlerRegistry};
use tracing_subscriber::EnvFilter;

use context_factory::DefaultContextFactory;
use handlers::{DeleteOldTasksHandler, EchoHandler, KillDeadTasksHandler};

#[derive(Parser)]
#[command(name = "taskq", about = "Task orchestration runtime entry point")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a scheduler replica: acquires the scheduler lease and keeps the
    /// configured periodic tasks' triggers registered.
    Scheduler,
    /// Runs a consumer replica: drains the queue up to max concurrency.
    Worker,
    /// Runs both a scheduler and a consumer replica in one process — the
    /// common single-replica deployment shape.
    Run,
    /// Enqueues one task directly, bypassing the (out-of-scope) admin
    /// surface. Useful for local smoke-testing.
    Enqueue {
        #[arg(long, default_value = "echo")]
        name: String,
        #[arg(long, default_value = "echo")]
        handler: String,
        #[arg(long, default_value = "hello from taskq")]
        payload: String,
    },
}

struct Backend {
    queue: Arc<Queue>,
    lease: Arc<dyn LeaseStorage>,
}

async fn build_backend(config: &Config) -> Result<Backend> {
    match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            let queue_storage: Arc<dyn QueueStorage> =
                Arc::new(taskq_redis::RedisQueueStorage::with_task_ttl(conn.clone(), config.task_record_ttl));
            let lease: Arc<dyn LeaseStorage> = Arc::new(taskq_redis::RedisLeaseStorage::new(conn));
            let queue = Arc::new(Queue::new(queue_storage).with_dead_task_timeout(config.dead_task_timeout));
            Ok(Backend { queue, lease })
        }
        None => {
            let queue_storage: Arc<dyn QueueStorage> = Arc::new(taskq_core::memory::InMemoryQueueStorage::new());
            let lease: Arc<dyn LeaseStorage> = Arc::new(taskq_core::memory::InMemoryLeaseStorage::new());
            let queue = Arc::new(Queue::new(queue_storage).with_dead_task_timeout(config.dead_task_timeout));
            Ok(Backend { queue, lease })
        }
    }
}

fn demo_periodic_tasks() -> CompositePeriodicTaskSource {
    let demo = PeriodicTask {
        id: "demo-echo".to_string(),
        name: "demo_echo".to_string(),
        handler: "echo".to_string(),
        priority: Priority::Normal,
        payload: "hello from the scheduler".to_string(),
        schedule: Schedule::EverySecond,
        schedule_crontab: None,
        timeout: None,
    };
    CompositePeriodicTaskSource::new(vec![
        Box::new(StaticPeriodicTaskSource::internal_housekeeping()),
        Box::new(StaticPeriodicTaskSource::new(vec![demo])),
    ])
}

async fn run_scheduler(config: &Config, backend: &Backend) -> Result<Scheduler> {
    let source = Arc::new(demo_periodic_tasks());
    let scheduler = Scheduler::new(source, backend.lease.clone(), backend.queue.clone())
        .await?
        .with_tasks_poll_delay(config.scheduler_poll_delay)
        .with_lease_duration(config.scheduler_lease_duration);
    Ok(scheduler)
}

fn build_registry(queue: Arc<Queue>, config: &Config) -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(KillDeadTasksHandler::new(queue.clone())))?;
    registry.register(Arc::new(DeleteOldTasksHandler::new(queue, config.task_retention)))?;
    registry.register(Arc::new(EchoHandler))?;
    Ok(registry)
}

fn build_consumer(backend: &Backend, config: &Config) -> Result<Arc<Consumer>> {
    let registry = Arc::new(build_registry(backend.queue.clone(), config)?);
    Ok(Arc::new(
        Consumer::new(backend.queue.clone(), registry, Arc::new(DefaultContextFactory))
            .with_max_concurrency(config.consumer_max_concurrency)
            .with_poll_delay(config.consumer_poll_delay)
            .with_ping_delay(config.consumer_ping_delay),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let backend = build_backend(&config).await?;

    match cli.command {
        Command::Scheduler => {
            let scheduler = Arc::new(run_scheduler(&config, &backend).await?);
            scheduler.start().await?.await?;
        }
        Command::Worker => {
            let consumer = build_consumer(&backend, &config)?;
            consumer.run().await;
        }
        Command::Run => {
            let scheduler = Arc::new(run_scheduler(&config, &backend).await?);
            let scheduler_handle = scheduler.start().await?;
            let consumer = build_consumer(&backend, &config)?;
            tokio::select! {
                res = scheduler_handle => { res?; }
                _ = consumer.run() => {}
            }
        }
        Command::Enqueue { name, handler, payload } => {
            let task = backend
                .queue
                .enqueue(EnqueueTaskRequest {
                    name,
                    handler,
                    priority: Priority::Normal,
                    payload,
                    timeout: None,
                })
                .await?;
            println!("enqueued task {} ({})", task.id, task.name);
        }
    }

    Ok(())
}
