#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Engine
//!
//! Dependency-graph workflow orchestration core. A task is a DAG of named
//! steps; the engine decides which steps are ready, runs them concurrently
//! within computed bounds, retries failures with backoff, and finalizes the
//! task once it is complete, permanently blocked, or has to wait.
//!
//! ## Module Organization
//!
//! - [`models`] - tasks, steps, edges, transitions and the derived readiness views
//! - [`storage`] - the [`storage::GraphStore`] interface and an in-memory store
//! - [`state_machine`] - task and step lifecycles
//! - [`orchestration`] - readiness, concurrency, execution, finalization, coordination
//! - [`registry`] - versioned handler registries
//! - [`events`] - the event sink interface and a broadcast publisher
//! - [`config`] - layered configuration loading
//! - [`logging`] - structured logging setup
//! - [`error`] - crate-wide error taxonomy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasker_engine::config::TaskerConfig;
//! use tasker_engine::events::EventPublisher;
//! use tasker_engine::models::{NewTask, NewWorkflowStep};
//! use tasker_engine::orchestration::WorkflowCoordinator;
//! use tasker_engine::registry::StepHandlerRegistry;
//! use tasker_engine::storage::InMemoryGraphStore;
//!
//! # async fn example() -> Result<(), tasker_engine::TaskerError> {
//! let store = Arc::new(InMemoryGraphStore::new());
//! let task = store.create_task(NewTask::new("payments", "refund"))?;
//! let validate = store.create_step(NewWorkflowStep::new(task.task_uuid, "validate"))?;
//! let refund = store.create_step(NewWorkflowStep::new(task.task_uuid, "refund"))?;
//! store.add_dependency(&validate, &refund)?;
//!
//! let registry = Arc::new(StepHandlerRegistry::new());
//! // registry.register("payments", "validate", "1.0.0", handler, false).await?;
//!
//! let coordinator = WorkflowCoordinator::new(
//!     store,
//!     registry,
//!     Arc::new(EventPublisher::default()),
//!     TaskerConfig::default(),
//! )?;
//! let report = coordinator.execute_task_workflow(task.task_uuid).await?;
//! println!("{:?}", report.result);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod state_machine;
pub mod storage;

pub use config::{ConfigManager, TaskerConfig};
pub use error::{Result, TaskerError};
pub use events::{EventPublisher, EventSink};
pub use models::{
    NewTask, NewWorkflowStep, NewWorkflowStepEdge, StepReadinessStatus, Task,
    TaskExecutionContext, WorkflowStep, WorkflowStepEdge,
};
pub use orchestration::{
    ConcurrencyGovernor, FinalizationMode, StepExecutor, StepHandler, StepReadinessCalculator,
    TaskFinalizer, TaskHandler, TaskOrchestrationResult, WorkflowCoordinator,
};
pub use registry::{HandlerKey, HandlerRegistry, StepHandlerRegistry, TaskHandlerRegistry};
pub use state_machine::{TaskState, WorkflowStepState};
pub use storage::{GraphStore, InMemoryGraphStore};
