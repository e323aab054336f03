//! # Data Models
//!
//! Persisted records (tasks, steps, edges, transitions) as the graph store
//! hands them to the core, plus the derived orchestration views computed
//! from them.

pub mod orchestration;
pub mod task;
pub mod transitions;
pub mod workflow_step;
pub mod workflow_step_edge;

pub use orchestration::{
    DependencyGraph, StepDagRelationship, StepReadinessStatus, TaskExecutionContext,
};
pub use task::{NewTask, Task};
pub use transitions::{
    NewTaskTransition, NewWorkflowStepTransition, TaskTransition, WorkflowStepTransition,
};
pub use workflow_step::{NewWorkflowStep, WorkflowStep};
pub use workflow_step_edge::{NewWorkflowStepEdge, WorkflowStepEdge};
