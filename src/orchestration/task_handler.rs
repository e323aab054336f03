use async_trait::async_trait;

use crate::models::{Task, TaskExecutionContext};
use crate::registry::RegistrableHandler;

/// State handed to [`TaskHandler::finalize_hook`] once a task is complete
#[derive(Debug, Clone)]
pub struct TaskFinalizationContext {
    pub task: Task,
    pub execution_context: TaskExecutionContext,
}

/// Task-level extension point.
///
/// The hook runs after the task has been marked complete; a failing hook is
/// logged and published but never reverts the completion.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn finalize_hook(&self, _context: &TaskFinalizationContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl RegistrableHandler for dyn TaskHandler {
    fn handler_kind(&self) -> &'static str {
        "task handler"
    }

    fn validate_capabilities(&self) -> Result<(), String> {
        self.validate()
    }
}
