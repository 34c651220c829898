//! Structured, pattern-matchable error types for the queue and lease stores.
//!
//! Each condition the orchestration engine can raise gets its own
//! discriminant rather than a stringly-typed error, so callers (the
//! scheduler, the consumer, an eventual admin surface) can match on it
//! instead of parsing messages.

use thiserror::Error;

/// Errors raised by `QueueStorage`/`Queue` operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task {0} not found")]
    TaskNotFound(u64),

    #[error("task '{0}' already has an active pending or started run")]
    TaskHasActiveRun(String),

    #[error("tried to ping task {0} before it started")]
    TaskPingNotStarted(u64),

    #[error("tried to ping task {0} after it finished")]
    TaskPingFinished(u64),

    #[error("task {0} timed out")]
    TaskTimedOut(u64),

    #[error("no handler registered with name '{0}'")]
    UnknownTaskHandler(String),

    #[error("storage backend is read-only")]
    StorageIsReadOnly,

    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Errors raised by `LeaseStorage` operations.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Errors raised looking up scrapers through the admin-facing registry.
#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("scraper '{0}' not found")]
    ScraperNotFound(String),

    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}
