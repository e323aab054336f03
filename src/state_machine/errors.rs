use thiserror::Error;

use crate::error::TaskerError;

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("Invalid transition from {from} on event {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },

    #[error("Persistence failed: {0}")]
    Persistence(#[from] TaskerError),
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

impl From<StateMachineError> for TaskerError {
    fn from(error: StateMachineError) -> Self {
        match error {
            StateMachineError::Persistence(inner) => inner,
            other => TaskerError::StateTransitionError(other.to_string()),
        }
    }
}
