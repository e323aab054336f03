use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::constants::system;
use crate::error::{Result, TaskerError};
use crate::state_machine::WorkflowStepState;

/// A named unit of work inside exactly one task.
///
/// The retry policy lives on the step itself (`retry_limit`, `retryable`),
/// as does `skippable`, which lets the step run once its parents have all
/// reached *any* terminal state rather than only success.
///
/// `current_state`, `attempts`, `last_attempted_at`, `last_failure_at`,
/// `results` and `backoff_request_seconds` are materialised by the graph
/// store whenever a transition is appended; readiness never rescans the
/// transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub workflow_step_uuid: Uuid,
    pub task_uuid: Uuid,
    /// Unique within the task
    pub name: String,
    /// Name the step handler is registered under
    pub handler_name: String,
    pub current_state: WorkflowStepState,
    pub attempts: i32,
    pub retry_limit: i32,
    pub retryable: bool,
    pub skippable: bool,
    pub backoff_request_seconds: Option<i32>,
    pub inputs: Option<Value>,
    pub results: Option<Value>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New WorkflowStep for creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflowStep {
    pub task_uuid: Uuid,
    pub name: String,
    pub handler_name: Option<String>,
    /// `None` takes the store's configured default
    pub retry_limit: Option<i32>,
    pub retryable: bool,
    pub skippable: bool,
    pub inputs: Option<Value>,
}

impl NewWorkflowStep {
    pub fn new(task_uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            task_uuid,
            name: name.into(),
            handler_name: None,
            retry_limit: None,
            retryable: true,
            skippable: false,
            inputs: None,
        }
    }

    pub fn with_handler(mut self, handler_name: impl Into<String>) -> Self {
        self.handler_name = Some(handler_name.into());
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: i32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }
}

impl WorkflowStep {
    /// Materialise a step record from a creation request
    pub fn from_new(new_step: NewWorkflowStep, now: DateTime<Utc>) -> Self {
        let handler_name = new_step
            .handler_name
            .unwrap_or_else(|| new_step.name.clone());

        Self {
            workflow_step_uuid: Uuid::new_v4(),
            task_uuid: new_step.task_uuid,
            name: new_step.name,
            handler_name,
            current_state: WorkflowStepState::Pending,
            attempts: 0,
            retry_limit: new_step.retry_limit.unwrap_or(system::DEFAULT_RETRY_LIMIT),
            retryable: new_step.retryable,
            skippable: new_step.skippable,
            backoff_request_seconds: None,
            inputs: new_step.inputs,
            results: None,
            last_attempted_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reject records that could not have been produced by a well-behaved store
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TaskerError::DataIntegrityError(format!(
                "Step {} has an empty name",
                self.workflow_step_uuid
            )));
        }
        if self.attempts < 0 || self.retry_limit < 0 {
            return Err(TaskerError::DataIntegrityError(format!(
                "Step '{}' has negative attempts ({}) or retry limit ({})",
                self.name, self.attempts, self.retry_limit
            )));
        }
        if let Some(backoff) = self.backoff_request_seconds {
            if backoff < 0 {
                return Err(TaskerError::DataIntegrityError(format!(
                    "Step '{}' has negative backoff request ({backoff}s)",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Check if step has exhausted its retry budget
    pub fn has_exceeded_retry_limit(&self) -> bool {
        self.attempts >= self.retry_limit
    }

    pub fn is_in_error(&self) -> bool {
        self.current_state == WorkflowStepState::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_defaults_from_new() {
        let task_uuid = Uuid::new_v4();
        let step = WorkflowStep::from_new(
            NewWorkflowStep::new(task_uuid, "validate_order").with_inputs(json!({"strict": true})),
            Utc::now(),
        );

        assert_eq!(step.task_uuid, task_uuid);
        assert_eq!(step.handler_name, "validate_order");
        assert_eq!(step.current_state, WorkflowStepState::Pending);
        assert_eq!(step.attempts, 0);
        assert_eq!(step.retry_limit, system::DEFAULT_RETRY_LIMIT);
        assert!(step.retryable);
        assert!(!step.skippable);
        assert!(step.validate().is_ok());
    }

    #[test]
    fn test_malformed_step_is_rejected() {
        let mut step = WorkflowStep::from_new(NewWorkflowStep::new(Uuid::new_v4(), "s"), Utc::now());
        step.retry_limit = -1;
        assert!(matches!(
            step.validate(),
            Err(TaskerError::DataIntegrityError(_))
        ));

        step.retry_limit = 3;
        step.name.clear();
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_retry_limit_check() {
        let mut step = WorkflowStep::from_new(
            NewWorkflowStep::new(Uuid::new_v4(), "fetch").with_retry_limit(2),
            Utc::now(),
        );
        assert!(!step.has_exceeded_retry_limit());
        step.attempts = 2;
        assert!(step.has_exceeded_retry_limit());
    }
}
