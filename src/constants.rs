//! # System Constants
//!
//! Event names, orchestration status enums and system-wide limits shared by
//! the readiness calculator, the aggregator, the finalizer and the event sink.

use serde::{Deserialize, Serialize};
use std::fmt;

pub use crate::state_machine::{TaskState as TaskStatus, WorkflowStepState as WorkflowStepStatus};

/// Event names passed to [`crate::events::EventSink::publish`]
pub mod events {
    // Task lifecycle events
    pub const TASK_START_REQUESTED: &str = "task.start_requested";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_REQUEUED: &str = "task.requeued";
    pub const TASK_RETRY_REQUESTED: &str = "task.retry_requested";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_RESOLVED_MANUALLY: &str = "task.resolved_manually";

    // Step lifecycle events
    pub const STEP_EXECUTION_REQUESTED: &str = "step.execution_requested";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const STEP_RETRY_REQUESTED: &str = "step.retry_requested";
    pub const STEP_CANCELLED: &str = "step.cancelled";
    pub const STEP_RESOLVED_MANUALLY: &str = "step.resolved_manually";
    pub const STEP_TIMED_OUT: &str = "step.timed_out";

    // Finalization decisions
    pub const TASK_FINALIZED: &str = "task.finalized";
    pub const TASK_REENQUEUED: &str = "task.reenqueued";
    pub const TASK_STALLED: &str = "task.stalled";
    pub const TASK_FINALIZE_HOOK_FAILED: &str = "task.finalize_hook_failed";

    // Orchestration loop
    pub const WORKFLOW_VIABLE_STEPS_DISCOVERED: &str = "workflow.viable_steps_discovered";
    pub const WORKFLOW_BATCH_EXECUTED: &str = "workflow.batch_executed";

    // Registry mutations
    pub const HANDLER_REGISTERED: &str = "registry.handler_registered";
    pub const HANDLER_REPLACED: &str = "registry.handler_replaced";
}

/// Task-level execution status chosen by the aggregator, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    AllComplete,
    HasReadySteps,
    BlockedByFailures,
    WaitingForDependencies,
    Processing,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllComplete => "all_complete",
            Self::HasReadySteps => "has_ready_steps",
            Self::BlockedByFailures => "blocked_by_failures",
            Self::WaitingForDependencies => "waiting_for_dependencies",
            Self::Processing => "processing",
        }
    }

    /// The action that follows 1:1 from this status
    pub fn recommended_action(&self) -> RecommendedAction {
        match self {
            Self::AllComplete => RecommendedAction::FinalizeTask,
            Self::HasReadySteps => RecommendedAction::ExecuteReadySteps,
            Self::BlockedByFailures => RecommendedAction::HandleFailures,
            Self::WaitingForDependencies | Self::Processing => RecommendedAction::Wait,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AllComplete | Self::BlockedByFailures)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    ExecuteReadySteps,
    HandleFailures,
    Wait,
    FinalizeTask,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteReadySteps => "execute_ready_steps",
            Self::HandleFailures => "handle_failures",
            Self::Wait => "wait",
            Self::FinalizeTask => "finalize_task",
        }
    }
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task health derived from the share of permanently failed steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Blocked,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Blocked => "blocked",
        }
    }

    pub fn is_problematic(&self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an asynchronous finalization put the task back on the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReenqueueReason {
    ReadyStepsAvailable,
    AwaitingDependencies,
    RetryBackoff,
    StepsInProgress,
}

impl ReenqueueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadyStepsAvailable => "ready_steps_available",
            Self::AwaitingDependencies => "awaiting_dependencies",
            Self::RetryBackoff => "retry_backoff",
            Self::StepsInProgress => "steps_in_progress",
        }
    }
}

/// Why a synchronous finalization left the task non-terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingReason {
    ReadyForProcessing,
    WaitingForDependencies,
    WaitingForStepCompletion,
}

impl PendingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadyForProcessing => "ready_for_processing",
            Self::WaitingForDependencies => "waiting_for_dependencies",
            Self::WaitingForStepCompletion => "waiting_for_step_completion",
        }
    }
}

/// System-wide constants
pub mod system {
    /// Default edge name for workflow dependencies
    pub const PROVIDES_EDGE_NAME: &str = "provides";

    /// Retry limit given to steps that do not set one
    pub const DEFAULT_RETRY_LIMIT: i32 = 3;

    /// Hard cap on dependency traversal depth
    pub const MAX_DEPENDENCY_DEPTH: usize = 50;

    /// Maximum number of steps in a single workflow
    pub const MAX_WORKFLOW_STEPS: usize = 1000;
}

/// Event published when a task moves between two states
pub fn task_transition_event(from: Option<TaskStatus>, to: TaskStatus) -> Option<&'static str> {
    use TaskStatus::*;
    match (from, to) {
        (Some(Pending), InProgress) => Some(events::TASK_START_REQUESTED),
        (Some(Error), Pending) => Some(events::TASK_RETRY_REQUESTED),
        (Some(InProgress), Pending) => Some(events::TASK_REQUEUED),
        (_, Complete) => Some(events::TASK_COMPLETED),
        (_, Error) => Some(events::TASK_FAILED),
        (_, Cancelled) => Some(events::TASK_CANCELLED),
        (_, ResolvedManually) => Some(events::TASK_RESOLVED_MANUALLY),
        _ => None,
    }
}

/// Event published when a step moves between two states
pub fn step_transition_event(
    from: Option<WorkflowStepStatus>,
    to: WorkflowStepStatus,
) -> Option<&'static str> {
    use WorkflowStepStatus::*;
    match (from, to) {
        (Some(Pending), InProgress) => Some(events::STEP_EXECUTION_REQUESTED),
        (Some(Error), InProgress) | (Some(Error), Pending) => Some(events::STEP_RETRY_REQUESTED),
        (_, Complete) => Some(events::STEP_COMPLETED),
        (_, Error) => Some(events::STEP_FAILED),
        (_, Cancelled) => Some(events::STEP_CANCELLED),
        (_, ResolvedManually) => Some(events::STEP_RESOLVED_MANUALLY),
        _ => None,
    }
}
