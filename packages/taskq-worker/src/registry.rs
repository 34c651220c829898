//! Handler registry: maps a handler name to the trait object that processes
//! tasks with it, rejecting duplicate registrations up front.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use taskq_core::Task;

use crate::context::Context;
use crate::error::ConsumerError;

/// A unit of work the consumer can invoke. Implementations receive the task
/// being processed and a `Context` scoped to that single invocation, and
/// return an opaque result string persisted onto `Task::result`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, task: &Task, context: Context) -> anyhow::Result<String>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), ConsumerError> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(ConsumerError::HandlerAlreadyRegistered(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn TaskHandler>, ConsumerError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| ConsumerError::UnknownHandler(name.to_string()))
    }
}
