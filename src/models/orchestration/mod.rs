//! Derived orchestration views, recomputed on demand and never stored.

pub mod step_dag_relationship;
pub mod step_readiness_status;
pub mod task_execution_context;

pub use step_dag_relationship::{validate_acyclic, DependencyGraph, StepDagRelationship};
pub use step_readiness_status::StepReadinessStatus;
pub use task_execution_context::TaskExecutionContext;
