//! Step handler contract.
//!
//! A step handler receives a [`StepExecutionContext`] and returns a JSON
//! result or a [`StepHandlerError`]. The error's kind decides whether the
//! step stays retry-eligible.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::registry::RegistrableHandler;
use crate::state_machine::StepFailure;

/// Everything a handler may read while executing one attempt of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionContext {
    pub task_uuid: Uuid,
    pub namespace: String,
    pub task_name: String,
    pub task_version: String,
    pub step_uuid: Uuid,
    pub step_name: String,
    /// 1-based number of the attempt being executed
    pub attempt: i32,
    pub retry_limit: i32,
    pub task_context: Value,
    pub step_inputs: Option<Value>,
    /// Results of direct parents, keyed by parent step name
    pub dependency_results: HashMap<String, Value>,
}

impl StepExecutionContext {
    pub fn dependency_result(&self, step_name: &str) -> Option<&Value> {
        self.dependency_results.get(step_name)
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.retry_limit
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StepHandlerError {
    /// Worth retrying; `retry_after` overrides the exponential schedule
    #[error("{message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Retrying cannot help; the step is exhausted immediately
    #[error("{message}")]
    Permanent { message: String },
}

impl StepHandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn retry_after(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

impl From<StepHandlerError> for StepFailure {
    fn from(error: StepHandlerError) -> Self {
        match error {
            StepHandlerError::Transient {
                message,
                retry_after: Some(delay),
            } => StepFailure::transient(message).with_retry_after(delay),
            StepHandlerError::Transient { message, .. } => StepFailure::transient(message),
            StepHandlerError::Permanent { message } => StepFailure::permanent(message),
        }
    }
}

impl From<anyhow::Error> for StepHandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::transient(format!("{error:#}"))
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, context: StepExecutionContext) -> Result<Value, StepHandlerError>;

    /// Capability check run once at registration
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl RegistrableHandler for dyn StepHandler {
    fn handler_kind(&self) -> &'static str {
        "step handler"
    }

    fn validate_capabilities(&self) -> Result<(), String> {
        self.validate()
    }
}
