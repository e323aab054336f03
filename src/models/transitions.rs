//! Append-only transition logs for steps and tasks.
//!
//! Every transition carries a monotonically increasing `sort_key` within its
//! owner and a `most_recent` marker; exactly one transition per owner is
//! most recent, and its `to_state` equals the owner's materialised
//! `current_state`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::state_machine::{StepFailure, TaskState, WorkflowStepState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStepTransition {
    pub transition_uuid: Uuid,
    pub workflow_step_uuid: Uuid,
    pub from_state: Option<WorkflowStepState>,
    pub to_state: WorkflowStepState,
    /// Event detail: results on completion, error payload on failure
    pub metadata: Option<Value>,
    pub sort_key: i32,
    pub most_recent: bool,
    pub created_at: DateTime<Utc>,
}

/// New WorkflowStepTransition for creation.
///
/// `from_state` is the state the writer observed; the store rejects the
/// append if the step has moved on since.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflowStepTransition {
    pub from_state: Option<WorkflowStepState>,
    pub to_state: WorkflowStepState,
    pub results: Option<Value>,
    pub failure: Option<StepFailure>,
}

impl NewWorkflowStepTransition {
    pub fn new(from_state: Option<WorkflowStepState>, to_state: WorkflowStepState) -> Self {
        Self {
            from_state,
            to_state,
            results: None,
            failure: None,
        }
    }

    /// Metadata persisted alongside the transition
    pub fn metadata(&self) -> Option<Value> {
        if let Some(failure) = &self.failure {
            return Some(json!({
                "error": {
                    "message": failure.message,
                    "permanent": failure.permanent,
                    "retry_after_seconds": failure.retry_after_seconds,
                }
            }));
        }
        self.results
            .as_ref()
            .map(|results| json!({ "results": results }))
    }
}

impl WorkflowStepTransition {
    pub fn is_failure(&self) -> bool {
        self.to_state == WorkflowStepState::Error
    }

    /// Error message recorded on a failure transition
    pub fn error_message(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("error"))
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub transition_uuid: Uuid,
    pub task_uuid: Uuid,
    pub from_state: Option<TaskState>,
    pub to_state: TaskState,
    pub metadata: Option<Value>,
    pub sort_key: i32,
    pub most_recent: bool,
    pub created_at: DateTime<Utc>,
}

/// New TaskTransition for creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTaskTransition {
    pub from_state: Option<TaskState>,
    pub to_state: TaskState,
    pub metadata: Option<Value>,
}

impl NewTaskTransition {
    pub fn new(from_state: Option<TaskState>, to_state: TaskState) -> Self {
        Self {
            from_state,
            to_state,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
