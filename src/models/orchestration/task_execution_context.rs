//! # Task Execution Context
//!
//! Derived, never persisted. Rolls a task's [`StepReadinessStatus`] set up
//! into step counts, an [`ExecutionStatus`], the matching
//! [`RecommendedAction`], a completion percentage and a [`HealthStatus`].
//!
//! ## Status priority
//!
//! 1. every step terminal and none stuck in error: `all_complete`
//! 2. any step ready now: `has_ready_steps`
//! 3. some step is a dead end (permanently failed or cancelled) and nothing
//!    else is running, backing off or waiting on live parents:
//!    `blocked_by_failures`
//! 4. anything backing off or waiting on live parents:
//!    `waiting_for_dependencies`
//! 5. otherwise: `processing`
//!
//! A step in `error` whose retries remain is *backing off*, never a dead end.
//! Only rule 3 may send a task to `error`, and it never fires while a retry
//! is pending.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StepReadinessStatus;
use crate::constants::{ExecutionStatus, HealthStatus, RecommendedAction};
use crate::state_machine::WorkflowStepState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionContext {
    pub task_uuid: Uuid,
    pub total_steps: i64,
    pub pending_steps: i64,
    pub in_progress_steps: i64,
    /// Complete or manually resolved
    pub completed_steps: i64,
    /// Currently in `error`, retryable or not
    pub failed_steps: i64,
    pub cancelled_steps: i64,
    pub ready_steps: i64,
    pub backing_off_steps: i64,
    pub permanently_failed_steps: i64,
    /// Steps that can never run because an ancestor is a dead end
    pub blocked_steps: i64,
    pub execution_status: ExecutionStatus,
    pub recommended_action: RecommendedAction,
    pub completion_percentage: f64,
    pub health_status: HealthStatus,
    /// Earliest retry instant among steps that are backing off
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl TaskExecutionContext {
    /// Aggregate a readiness set into a task-level context.
    ///
    /// `blocked_failure_ratio` is the share of permanently failed steps at
    /// which health is reported as `blocked` even while other work remains.
    pub fn from_readiness(
        task_uuid: Uuid,
        statuses: &[StepReadinessStatus],
        blocked_failure_ratio: f64,
    ) -> Self {
        let mut ctx = Self::empty(task_uuid);
        let mut live_waiting = 0i64;

        for status in statuses {
            ctx.total_steps += 1;
            match status.current_state {
                WorkflowStepState::Pending => ctx.pending_steps += 1,
                WorkflowStepState::InProgress => ctx.in_progress_steps += 1,
                WorkflowStepState::Complete | WorkflowStepState::ResolvedManually => {
                    ctx.completed_steps += 1
                }
                WorkflowStepState::Error => ctx.failed_steps += 1,
                WorkflowStepState::Cancelled => ctx.cancelled_steps += 1,
            }
            if status.is_ready() {
                ctx.ready_steps += 1;
            }
            if status.is_permanently_failed() {
                ctx.permanently_failed_steps += 1;
            }
            if status.blocked_by_failure && !status.current_state.is_terminal() {
                ctx.blocked_steps += 1;
            }
            if status.is_waiting_on_dependencies() {
                live_waiting += 1;
            }
            if status.is_backing_off() {
                ctx.backing_off_steps += 1;
                ctx.next_retry_at = Some(match ctx.next_retry_at {
                    Some(current) => current.min(status.next_retry_at),
                    None => status.next_retry_at,
                });
            }
        }

        let dead_ends = ctx.permanently_failed_steps + ctx.cancelled_steps;

        // Cancelled steps are terminal but never complete the task
        ctx.execution_status = if ctx.completed_steps == ctx.total_steps {
            ExecutionStatus::AllComplete
        } else if ctx.ready_steps > 0 {
            ExecutionStatus::HasReadySteps
        } else if dead_ends > 0
            && ctx.in_progress_steps == 0
            && ctx.backing_off_steps == 0
            && live_waiting == 0
        {
            ExecutionStatus::BlockedByFailures
        } else if ctx.backing_off_steps > 0 || live_waiting > 0 {
            ExecutionStatus::WaitingForDependencies
        } else {
            ExecutionStatus::Processing
        };
        ctx.recommended_action = ctx.execution_status.recommended_action();

        ctx.completion_percentage = if ctx.total_steps == 0 {
            100.0
        } else {
            ctx.completed_steps as f64 / ctx.total_steps as f64 * 100.0
        };

        ctx.health_status = if ctx.execution_status == ExecutionStatus::BlockedByFailures {
            HealthStatus::Blocked
        } else if ctx.failed_steps == 0 {
            HealthStatus::Healthy
        } else if ctx.permanently_failed_steps as f64 / ctx.total_steps as f64
            >= blocked_failure_ratio
        {
            HealthStatus::Blocked
        } else {
            HealthStatus::Degraded
        };

        ctx
    }

    fn empty(task_uuid: Uuid) -> Self {
        Self {
            task_uuid,
            total_steps: 0,
            pending_steps: 0,
            in_progress_steps: 0,
            completed_steps: 0,
            failed_steps: 0,
            cancelled_steps: 0,
            ready_steps: 0,
            backing_off_steps: 0,
            permanently_failed_steps: 0,
            blocked_steps: 0,
            execution_status: ExecutionStatus::Processing,
            recommended_action: RecommendedAction::Wait,
            completion_percentage: 0.0,
            health_status: HealthStatus::Healthy,
            next_retry_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.execution_status == ExecutionStatus::AllComplete
    }

    pub fn is_blocked(&self) -> bool {
        self.execution_status == ExecutionStatus::BlockedByFailures
    }

    pub fn has_ready_steps(&self) -> bool {
        self.ready_steps > 0
    }
}
