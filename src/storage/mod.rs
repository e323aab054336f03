//! # Graph Store
//!
//! The query/command surface the orchestration core consumes. The core does
//! not prescribe a storage engine, only that reads reflect the most recent
//! committed append from the same process.
//!
//! Appending a transition is the single write path for step and task state:
//! the store appends to the ordered log, flips `most_recent`, and updates the
//! owner's materialised fields in one atomic operation.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    NewTaskTransition, NewWorkflowStepTransition, Task, TaskTransition, WorkflowStep,
    WorkflowStepEdge, WorkflowStepTransition,
};

pub mod in_memory;

pub use in_memory::InMemoryGraphStore;

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_task(&self, task_uuid: Uuid) -> Result<Task>;

    /// Steps of a task in creation order
    async fn get_steps_for_task(&self, task_uuid: Uuid) -> Result<Vec<WorkflowStep>>;

    async fn get_step(&self, workflow_step_uuid: Uuid) -> Result<WorkflowStep>;

    async fn get_edges(&self, task_uuid: Uuid) -> Result<Vec<WorkflowStepEdge>>;

    /// Step transition log ordered by `sort_key`
    async fn get_transitions(&self, workflow_step_uuid: Uuid) -> Result<Vec<WorkflowStepTransition>>;

    async fn get_task_transitions(&self, task_uuid: Uuid) -> Result<Vec<TaskTransition>>;

    /// Append a step transition and return the updated step.
    ///
    /// Materialisation rules:
    /// - entering `in_progress` increments `attempts` and stamps `last_attempted_at`
    /// - entering `complete` stores `results`
    /// - entering `error` stamps `last_failure_at`, records the failure's
    ///   `retry_after_seconds` as `backoff_request_seconds`, and clears
    ///   `retryable` for permanent failures
    ///
    /// Fails with `StateTransitionError` if `from_state` no longer matches the
    /// step's current state.
    async fn append_step_transition(
        &self,
        workflow_step_uuid: Uuid,
        transition: NewWorkflowStepTransition,
    ) -> Result<WorkflowStep>;

    /// Append a task transition and return the updated task
    async fn append_task_transition(
        &self,
        task_uuid: Uuid,
        transition: NewTaskTransition,
    ) -> Result<Task>;
}
