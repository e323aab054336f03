//! Task and step lifecycles.
//!
//! States and events are plain enums; the machines apply a transition table,
//! check guards, persist through [`crate::storage::GraphStore`] and publish
//! the matching lifecycle event.

pub mod errors;
pub mod events;
pub mod states;
pub mod step_state_machine;
pub mod task_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::{StepEvent, StepFailure, TaskEvent};
pub use states::{TaskState, WorkflowStepState};
pub use step_state_machine::StepStateMachine;
pub use task_state_machine::TaskStateMachine;
