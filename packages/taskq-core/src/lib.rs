//! Data model, storage contracts, logical queue, metrics and logging shared
//! by every crate in the task orchestration runtime.

pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod storage;
pub mod test_support;

pub use config::Config;
pub use error::{LeaseError, QueueError, ScraperError};
pub use model::{EnqueueTaskRequest, Lease, PeriodicTask, Priority, Schedule, Scraper, Task, TaskStatus};
pub use queue::Queue;
pub use storage::{LeaseStorage, QueueStorage};
