use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    states::TaskState,
};
use crate::constants::task_transition_event;
use crate::events::{payload, publish_quietly, EventSink};
use crate::models::{NewTaskTransition, Task};
use crate::storage::GraphStore;

/// Task lifecycle management backed by the graph store
pub struct TaskStateMachine {
    task: Task,
    store: Arc<dyn GraphStore>,
    events: Arc<dyn EventSink>,
}

impl TaskStateMachine {
    pub fn new(task: Task, store: Arc<dyn GraphStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            task,
            store,
            events,
        }
    }

    pub fn current_state(&self) -> TaskState {
        self.task.current_state
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub async fn transition(&mut self, event: TaskEvent) -> StateMachineResult<TaskState> {
        let current_state = self.task.current_state;
        let target_state = determine_target_state(current_state, &event)?;

        let mut new_transition = NewTaskTransition::new(Some(current_state), target_state);
        match &event {
            TaskEvent::Fail(reason) | TaskEvent::Requeue(reason) => {
                new_transition = new_transition.with_metadata(json!({ "reason": reason }));
            }
            _ => {}
        }

        self.task = self
            .store
            .append_task_transition(self.task.task_uuid, new_transition)
            .await?;

        debug!(
            task_uuid = %self.task.task_uuid,
            from = %current_state,
            to = %target_state,
            event = event.event_type(),
            "Task transition persisted"
        );

        if let Some(event_name) = task_transition_event(Some(current_state), target_state) {
            let mut fields = payload([
                ("task_uuid", json!(self.task.task_uuid)),
                ("namespace", json!(self.task.namespace)),
                ("task_name", json!(self.task.name)),
                ("from_state", json!(current_state)),
                ("to_state", json!(target_state)),
            ]);
            if let Some(reason) = event.error_message() {
                fields.insert("error".to_string(), json!(reason));
            }
            publish_quietly(self.events.as_ref(), event_name, fields).await;
        }

        Ok(target_state)
    }

    /// Move to `in_progress` unless already there
    pub async fn ensure_in_progress(&mut self) -> StateMachineResult<()> {
        match self.task.current_state {
            TaskState::InProgress => Ok(()),
            TaskState::Pending => self.transition(TaskEvent::Start).await.map(|_| ()),
            other => Err(StateMachineError::GuardFailed {
                reason: format!("Task {} cannot be started from {other}", self.task.task_uuid),
            }),
        }
    }
}

/// Transition table for tasks
pub fn determine_target_state(
    current_state: TaskState,
    event: &TaskEvent,
) -> StateMachineResult<TaskState> {
    use TaskState::*;

    let target = match (current_state, event) {
        (Pending, TaskEvent::Start) => InProgress,
        (InProgress, TaskEvent::Complete) => Complete,
        (Pending | InProgress, TaskEvent::Fail(_)) => Error,
        (InProgress, TaskEvent::Requeue(_)) => Pending,
        (Pending | InProgress | Error, TaskEvent::Cancel) => Cancelled,
        (Pending | InProgress | Error, TaskEvent::ResolveManually) => ResolvedManually,
        (Error, TaskEvent::Reset) => Pending,
        (from_state, _) => {
            return Err(StateMachineError::InvalidTransition {
                from: from_state.to_string(),
                event: event.event_type().to_string(),
            })
        }
    };

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;
    use crate::models::NewTask;
    use crate::storage::InMemoryGraphStore;

    #[test]
    fn test_transition_table() {
        use TaskState::*;
        assert_eq!(determine_target_state(Pending, &TaskEvent::Start).unwrap(), InProgress);
        assert_eq!(
            determine_target_state(InProgress, &TaskEvent::Requeue("waiting".into())).unwrap(),
            Pending
        );
        assert_eq!(determine_target_state(Error, &TaskEvent::Reset).unwrap(), Pending);
        assert!(determine_target_state(Pending, &TaskEvent::Complete).is_err());
        assert!(determine_target_state(Complete, &TaskEvent::Cancel).is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_through_store() {
        let store = Arc::new(InMemoryGraphStore::new());
        let task = store.create_task(NewTask::new("test", "wf")).unwrap();
        let events = Arc::new(EventPublisher::default());
        let mut rx = events.subscribe();
        let mut machine = TaskStateMachine::new(task, store.clone(), events.clone());

        machine.ensure_in_progress().await.unwrap();
        machine.ensure_in_progress().await.unwrap();
        machine.transition(TaskEvent::Complete).await.unwrap();

        assert_eq!(machine.current_state(), TaskState::Complete);
        assert!(machine.task().completed_at.is_some());
        assert_eq!(rx.recv().await.unwrap().name, "task.start_requested");
        assert_eq!(rx.recv().await.unwrap().name, "task.completed");
        assert!(machine.ensure_in_progress().await.is_err());
    }
}
