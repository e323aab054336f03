//! # Error Handling
//!
//! Crate-wide error taxonomy for the orchestration core.
//!
//! Step-level failures are deliberately absent from this enum: a handler
//! returning an error is recorded as a step transition and folded into the
//! next readiness pass. Only configuration faults, graph integrity faults,
//! registry misuse and task-level terminal conditions surface as
//! [`TaskerError`].

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskerError {
    /// Bad configuration or a malformed graph, fatal at load time
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Duplicate registry key registered without `allow_replace`
    #[error("Conflict: handler already registered for {key}")]
    ConflictError { key: String },

    /// Unknown handler, task or step
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// A step, edge or transition record is missing or inconsistent
    #[error("Data integrity error: {0}")]
    DataIntegrityError(String),

    #[error("State transition error: {0}")]
    StateTransitionError(String),

    /// No ready steps, no terminal condition and no pending backoff
    #[error("Stall detected for task {task_uuid}: {reason}")]
    StallDetected { task_uuid: Uuid, reason: String },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Orchestration error: {0}")]
    OrchestrationError(String),
}

impl TaskerError {
    /// Whether the caller may reasonably retry the operation that produced this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TaskerError::ConflictError { .. } | TaskerError::StorageError(_)
        )
    }
}

impl From<serde_json::Error> for TaskerError {
    fn from(error: serde_json::Error) -> Self {
        TaskerError::ValidationError(format!("Serialization error: {error}"))
    }
}

pub type Result<T> = std::result::Result<T, TaskerError>;
