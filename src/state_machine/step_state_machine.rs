use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::StepEvent,
    states::WorkflowStepState,
};
use crate::constants::step_transition_event;
use crate::events::{payload, publish_quietly, EventSink};
use crate::models::{NewWorkflowStepTransition, WorkflowStep};
use crate::storage::GraphStore;

/// Drives one step through its lifecycle, persisting every transition
/// through the graph store and publishing the matching event.
pub struct StepStateMachine {
    step: WorkflowStep,
    store: Arc<dyn GraphStore>,
    events: Arc<dyn EventSink>,
}

impl StepStateMachine {
    pub fn new(step: WorkflowStep, store: Arc<dyn GraphStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            step,
            store,
            events,
        }
    }

    pub fn current_state(&self) -> WorkflowStepState {
        self.step.current_state
    }

    pub fn step(&self) -> &WorkflowStep {
        &self.step
    }

    pub fn into_step(self) -> WorkflowStep {
        self.step
    }

    /// Apply `event`, returning the new state.
    ///
    /// The store rejects the append if another writer moved the step first,
    /// which surfaces here as a persistence error.
    pub async fn transition(&mut self, event: StepEvent) -> StateMachineResult<WorkflowStepState> {
        let current_state = self.step.current_state;
        let target_state = determine_target_state(current_state, &event)?;
        self.check_guards(current_state, target_state)?;

        let mut new_transition = NewWorkflowStepTransition::new(Some(current_state), target_state);
        match event {
            StepEvent::Complete(results) => new_transition.results = results,
            StepEvent::Fail(failure) => new_transition.failure = Some(failure),
            _ => {}
        }
        let error_message = new_transition.failure.as_ref().map(|f| f.message.clone());

        self.step = self
            .store
            .append_step_transition(self.step.workflow_step_uuid, new_transition)
            .await?;

        debug!(
            step_uuid = %self.step.workflow_step_uuid,
            step_name = %self.step.name,
            from = %current_state,
            to = %target_state,
            attempts = self.step.attempts,
            "Step transition persisted"
        );

        if let Some(event_name) = step_transition_event(Some(current_state), target_state) {
            let mut fields = payload([
                ("task_uuid", json!(self.step.task_uuid)),
                ("step_uuid", json!(self.step.workflow_step_uuid)),
                ("step_name", json!(self.step.name)),
                ("from_state", json!(current_state)),
                ("to_state", json!(target_state)),
                ("attempts", json!(self.step.attempts)),
            ]);
            if let Some(message) = error_message {
                fields.insert("error".to_string(), json!(message));
            }
            publish_quietly(self.events.as_ref(), event_name, fields).await;
        }

        Ok(target_state)
    }

    fn check_guards(
        &self,
        current_state: WorkflowStepState,
        target_state: WorkflowStepState,
    ) -> StateMachineResult<()> {
        // Retrying an errored step consumes retry budget
        if current_state == WorkflowStepState::Error && target_state == WorkflowStepState::InProgress
        {
            if !self.step.retryable {
                return Err(StateMachineError::GuardFailed {
                    reason: format!("Step '{}' is not retryable", self.step.name),
                });
            }
            if self.step.has_exceeded_retry_limit() {
                return Err(StateMachineError::GuardFailed {
                    reason: format!(
                        "Step '{}' exhausted its retry limit ({}/{})",
                        self.step.name, self.step.attempts, self.step.retry_limit
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Transition table for steps
pub fn determine_target_state(
    current_state: WorkflowStepState,
    event: &StepEvent,
) -> StateMachineResult<WorkflowStepState> {
    use WorkflowStepState::*;

    let target = match (current_state, event) {
        (Pending, StepEvent::Start) | (Error, StepEvent::Start) => InProgress,
        (InProgress, StepEvent::Complete(_)) => Complete,
        (InProgress, StepEvent::Fail(_)) | (Pending, StepEvent::Fail(_)) => Error,
        (Pending | InProgress | Error, StepEvent::Cancel) => Cancelled,
        (Error, StepEvent::Retry) => Pending,
        (Pending | InProgress | Error, StepEvent::ResolveManually) => ResolvedManually,
        (from_state, _) => {
            return Err(StateMachineError::InvalidTransition {
                from: from_state.to_string(),
                event: event.event_type().to_string(),
            })
        }
    };

    Ok(target)
}
