//! # Step Readiness Status
//!
//! Derived, never persisted. One record per step, recomputed by
//! [`crate::orchestration::StepReadinessCalculator`] at the start of every
//! orchestration pass and discarded at its end.
//!
//! The record answers three separate questions about a step:
//!
//! - are its dependencies satisfied (`completed_parents == total_parents`)?
//! - may it be attempted again (`retry_eligible`)?
//! - is it ready *now* (`ready_for_execution`, which also folds in backoff)?
//!
//! Keeping "not retry eligible" apart from "retry eligible but still backing
//! off" is what lets the aggregator tell a permanently blocked task from one
//! that is only waiting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::WorkflowStepState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReadinessStatus {
    pub workflow_step_uuid: Uuid,
    pub task_uuid: Uuid,
    pub name: String,
    pub current_state: WorkflowStepState,
    pub skippable: bool,
    pub dependencies_satisfied: bool,
    pub retry_eligible: bool,
    pub ready_for_execution: bool,
    /// An ancestor can never complete, so this step can never run
    pub blocked_by_failure: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Earliest instant the step may be attempted; `now` when it never failed
    pub next_retry_at: DateTime<Utc>,
    pub total_parents: i32,
    pub completed_parents: i32,
    pub attempts: i32,
    pub retry_limit: i32,
    pub backoff_request_seconds: Option<i32>,
    pub last_attempted_at: Option<DateTime<Utc>>,
}

impl StepReadinessStatus {
    pub fn is_ready(&self) -> bool {
        self.ready_for_execution
    }

    /// Check if this step is still waiting on its parents
    pub fn is_blocked(&self) -> bool {
        !self.dependencies_satisfied
    }

    pub fn can_retry(&self) -> bool {
        self.retry_eligible
    }

    pub fn is_processing(&self) -> bool {
        self.current_state == WorkflowStepState::InProgress
    }

    /// Complete or manually resolved
    pub fn is_complete(&self) -> bool {
        self.current_state.satisfies_dependencies()
    }

    pub fn has_failed(&self) -> bool {
        self.current_state == WorkflowStepState::Error
    }

    /// Errored with no retries left: exhausted or marked non-retryable
    pub fn is_permanently_failed(&self) -> bool {
        self.has_failed() && !self.retry_eligible
    }

    /// The step will never reach a dependency-satisfying state on its own
    pub fn is_dead_end(&self) -> bool {
        self.is_permanently_failed() || self.current_state == WorkflowStepState::Cancelled
    }

    /// Retry eligible with satisfied dependencies, only held back by backoff timing
    pub fn is_backing_off(&self) -> bool {
        self.current_state.is_startable()
            && self.dependencies_satisfied
            && self.retry_eligible
            && !self.ready_for_execution
    }

    /// Pending on parents that can still complete
    pub fn is_waiting_on_dependencies(&self) -> bool {
        self.current_state == WorkflowStepState::Pending
            && !self.dependencies_satisfied
            && !self.blocked_by_failure
    }

    /// Time remaining until the step may be retried, if any
    pub fn time_until_retry(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        (self.next_retry_at > now).then(|| self.next_retry_at - now)
    }
}
