//! # Orchestration Engine
//!
//! The per-task orchestration pass and the components it is built from:
//!
//! - [`StepReadinessCalculator`]: which steps may run now
//! - [`crate::models::TaskExecutionContext`]: what the task as a whole should do next
//! - [`ConcurrencyGovernor`]: how many steps may run at once, and for how long
//! - [`StepExecutor`]: runs a batch of ready steps through their handlers
//! - [`TaskFinalizer`]: turns the aggregated state into a task transition
//! - [`WorkflowCoordinator`]: loops the above until the task settles
//!
//! Handlers plug in through [`StepHandler`] and [`TaskHandler`], resolved
//! from the versioned registries in [`crate::registry`].

pub mod backoff_calculator;
pub mod concurrency_governor;
pub mod step_executor;
pub mod step_handler;
pub mod step_readiness;
pub mod task_enqueuer;
pub mod task_finalizer;
pub mod task_handler;
pub mod workflow_coordinator;

pub use backoff_calculator::{BackoffCalculator, BackoffCalculatorConfig, BackoffResult, BackoffType};
pub use concurrency_governor::{ConcurrencyGovernor, PressureSignals};
pub use step_executor::{
    BatchExecutionResult, StepExecutionResult, StepExecutor, StepFailureKind, StepOutcome,
};
pub use step_handler::{StepExecutionContext, StepHandler, StepHandlerError};
pub use step_readiness::{is_retry_eligible, StepReadinessCalculator};
pub use task_enqueuer::{
    ChannelEnqueueHandler, EnqueueError, EnqueueHandler, EnqueueOperation, EnqueueRequest,
    TaskEnqueuer,
};
pub use task_finalizer::{
    FinalizationAction, FinalizationError, FinalizationMode, FinalizationResult, TaskFinalizer,
};
pub use task_handler::{TaskFinalizationContext, TaskHandler};
pub use workflow_coordinator::{
    PressureSource, TaskOrchestrationResult, WorkflowCoordinator, WorkflowExecutionMetrics,
    WorkflowExecutionReport,
};
