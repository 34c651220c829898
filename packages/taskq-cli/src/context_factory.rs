//! Default `ContextFactory`: builds a handler context with no middleware
//! chain and no scraper state backing — enough to run the internal
//! housekeeping handlers and simple demo handlers end to end. A deployment
//! wiring in a real scraper registry (admin surface, out of core scope)
//! would supply params/state/middleware from that registry instead.

use async_trait::async_trait;
use serde_json::Value;
use taskq_core::Task;
use taskq_worker::{Context, ContextFactory};
use tokio_util::sync::CancellationToken;

pub struct DefaultContextFactory;

#[async_trait]
impl ContextFactory for DefaultContextFactory {
    async fn build(&self, _task: &Task, cancellation: CancellationToken) -> anyhow::Result<Context> {
        Ok(Context::new(
            reqwest::Client::new(),
            Vec::new(),
            Default::default(),
            Value::Null,
            None,
            cancellation,
        ))
    }
}
