//! Errors raised by handler execution and the handler-facing context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("no handler registered with name '{0}'")]
    UnknownHandler(String),

    #[error("handler '{0}' is already registered")]
    HandlerAlreadyRegistered(String),

    #[error(transparent)]
    Queue(#[from] taskq_core::QueueError),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("number of file paths ({paths}) does not match number of urls ({urls})")]
    MismatchedFilePaths { paths: usize, urls: usize },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to write downloaded file: {0}")]
    Io(#[from] std::io::Error),

    #[error("scraper state update callback is not configured")]
    NoStateUpdateCallback,
}
