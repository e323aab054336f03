use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Events that can trigger task state transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskEvent {
    /// An orchestration pass takes ownership of the task
    Start,
    /// Mark task as complete
    Complete,
    /// Mark task as failed with error message
    Fail(String),
    /// Park the task until its next orchestration pass
    Requeue(String),
    /// Cancel the task
    Cancel,
    /// Manually resolve the task
    ResolveManually,
    /// Operator reset from error back to pending
    Reset,
}

impl TaskEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::Requeue(_) => "requeue",
            Self::Cancel => "cancel",
            Self::ResolveManually => "resolve_manually",
            Self::Reset => "reset",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Fail(_) | Self::Cancel | Self::ResolveManually
        )
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}

/// Failure detail carried by [`StepEvent::Fail`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub message: String,
    /// Permanent failures clear the step's retryable flag
    #[serde(default)]
    pub permanent: bool,
    /// Server-requested delay before the next attempt
    #[serde(default)]
    pub retry_after_seconds: Option<u32>,
}

impl StepFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
            retry_after_seconds: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
            retry_after_seconds: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_seconds = Some(u32::try_from(retry_after.as_secs()).unwrap_or(u32::MAX));
        self
    }
}

/// Events that can trigger workflow step state transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StepEvent {
    /// Dispatch the step to its handler
    Start,
    /// Mark step as complete with optional results
    Complete(Option<Value>),
    /// Mark step as failed
    Fail(StepFailure),
    /// Cancel the step
    Cancel,
    /// Manually resolve the step
    ResolveManually,
    /// Return an errored step to pending for an explicit retry
    Retry,
}

impl StepEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete(_) => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
            Self::ResolveManually => "resolve_manually",
            Self::Retry => "retry",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(failure) => Some(&failure.message),
            _ => None,
        }
    }

    pub fn results(&self) -> Option<&Value> {
        match self {
            Self::Complete(results) => results.as_ref(),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete(_) | Self::Cancel | Self::ResolveManually
        )
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(StepFailure::transient(error))
    }

    pub fn complete_with_results(results: Value) -> Self {
        Self::Complete(Some(results))
    }
}
