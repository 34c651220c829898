//! Task-scoped structured logging helpers.
//!
//! Every handler invocation runs inside a `tracing` span carrying the task
//! id, name and handler, so every log line emitted by handler code — or by
//! anything it calls — is automatically attributable without threading a
//! logger argument through the call stack.

use tracing::Span;

use crate::model::Task;

/// Builds the span a task execution should run inside. Entered by the
/// consumer before invoking a handler; handler code does not create this
/// itself.
pub fn task_span(task: &Task) -> Span {
    tracing::info_span!(
        "task",
        task.id = task.id,
        task.name = %task.name,
        task.handler = %task.handler,
        task.priority = task.priority.value(),
    )
}
