//! Process-local [`GraphStore`] backed by a single `parking_lot::RwLock`.
//!
//! Every append takes the write lock once, so readers never observe a
//! transition without its materialised step update. Also provides the
//! creation commands (tasks, steps, edges) that a persistent store would
//! expose through its own API.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::GraphStore;
use crate::config::SystemConfig;
use crate::constants::system;
use crate::error::{Result, TaskerError};
use crate::models::orchestration::validate_acyclic;
use crate::models::{
    NewTask, NewTaskTransition, NewWorkflowStep, NewWorkflowStepEdge, NewWorkflowStepTransition,
    Task, TaskTransition, WorkflowStep, WorkflowStepEdge, WorkflowStepTransition,
};
use crate::state_machine::{TaskState, WorkflowStepState};

#[derive(Debug, Default)]
struct StoreInner {
    tasks: HashMap<Uuid, Task>,
    task_steps: HashMap<Uuid, Vec<Uuid>>,
    steps: HashMap<Uuid, WorkflowStep>,
    edges: HashMap<Uuid, Vec<WorkflowStepEdge>>,
    step_transitions: HashMap<Uuid, Vec<WorkflowStepTransition>>,
    task_transitions: HashMap<Uuid, Vec<TaskTransition>>,
}

#[derive(Debug)]
pub struct InMemoryGraphStore {
    inner: RwLock<StoreInner>,
    max_workflow_steps: usize,
    default_retry_limit: i32,
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::with_max_workflow_steps(system::MAX_WORKFLOW_STEPS)
    }

    pub fn with_max_workflow_steps(max_workflow_steps: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            max_workflow_steps,
            default_retry_limit: system::DEFAULT_RETRY_LIMIT,
        }
    }

    pub fn from_config(config: &SystemConfig) -> Self {
        Self {
            default_retry_limit: config.default_retry_limit,
            ..Self::with_max_workflow_steps(config.max_workflow_steps)
        }
    }

    pub fn create_task(&self, new_task: NewTask) -> Result<Task> {
        if new_task.namespace.is_empty() || new_task.name.is_empty() {
            return Err(TaskerError::ValidationError(
                "Task namespace and name must not be empty".to_string(),
            ));
        }

        let task = Task::from_new(new_task, Utc::now());
        let mut inner = self.inner.write();
        inner.task_steps.insert(task.task_uuid, Vec::new());
        inner.edges.insert(task.task_uuid, Vec::new());
        inner.task_transitions.insert(task.task_uuid, Vec::new());
        inner.tasks.insert(task.task_uuid, task.clone());
        Ok(task)
    }

    pub fn create_step(&self, mut new_step: NewWorkflowStep) -> Result<WorkflowStep> {
        new_step.retry_limit.get_or_insert(self.default_retry_limit);
        let mut inner = self.inner.write();
        let StoreInner {
            task_steps, steps, ..
        } = &mut *inner;

        let step_uuids = task_steps.get_mut(&new_step.task_uuid).ok_or_else(|| {
            TaskerError::NotFoundError(format!("Task {} not found", new_step.task_uuid))
        })?;
        if step_uuids.len() >= self.max_workflow_steps {
            return Err(TaskerError::ValidationError(format!(
                "Task {} already has the maximum of {} steps",
                new_step.task_uuid, self.max_workflow_steps
            )));
        }
        if step_uuids
            .iter()
            .any(|uuid| steps.get(uuid).is_some_and(|s| s.name == new_step.name))
        {
            return Err(TaskerError::ValidationError(format!(
                "Step name '{}' is already used in task {}",
                new_step.name, new_step.task_uuid
            )));
        }

        let step = WorkflowStep::from_new(new_step, Utc::now());
        step.validate()
            .map_err(|e| TaskerError::ValidationError(e.to_string()))?;

        step_uuids.push(step.workflow_step_uuid);
        steps.insert(step.workflow_step_uuid, step.clone());
        inner
            .step_transitions
            .insert(step.workflow_step_uuid, Vec::new());
        Ok(step)
    }

    /// Add a dependency edge, rejecting cross-task edges, duplicates and cycles
    pub fn create_edge(&self, new_edge: NewWorkflowStepEdge) -> Result<WorkflowStepEdge> {
        let mut inner = self.inner.write();

        let from_task = inner
            .steps
            .get(&new_edge.from_step_uuid)
            .map(|s| s.task_uuid)
            .ok_or_else(|| {
                TaskerError::NotFoundError(format!("Step {} not found", new_edge.from_step_uuid))
            })?;
        let to_task = inner
            .steps
            .get(&new_edge.to_step_uuid)
            .map(|s| s.task_uuid)
            .ok_or_else(|| {
                TaskerError::NotFoundError(format!("Step {} not found", new_edge.to_step_uuid))
            })?;
        if from_task != to_task {
            return Err(TaskerError::ValidationError(format!(
                "Edge {} -> {} crosses tasks",
                new_edge.from_step_uuid, new_edge.to_step_uuid
            )));
        }

        let edges = inner.edges.entry(from_task).or_default();
        if edges.iter().any(|e| {
            e.from_step_uuid == new_edge.from_step_uuid && e.to_step_uuid == new_edge.to_step_uuid
        }) {
            return Err(TaskerError::ValidationError(format!(
                "Edge {} -> {} already exists",
                new_edge.from_step_uuid, new_edge.to_step_uuid
            )));
        }
        validate_acyclic(edges, new_edge.from_step_uuid, new_edge.to_step_uuid)?;

        let edge = WorkflowStepEdge::from_new(new_edge, Utc::now());
        edges.push(edge.clone());
        Ok(edge)
    }

    /// Convenience for building graphs: `to` depends on `from`
    pub fn add_dependency(&self, from: &WorkflowStep, to: &WorkflowStep) -> Result<WorkflowStepEdge> {
        self.create_edge(NewWorkflowStepEdge::provides(
            from.workflow_step_uuid,
            to.workflow_step_uuid,
        ))
    }
}

fn step_not_found(uuid: Uuid) -> TaskerError {
    TaskerError::NotFoundError(format!("Workflow step {uuid} not found"))
}

fn task_not_found(uuid: Uuid) -> TaskerError {
    TaskerError::NotFoundError(format!("Task {uuid} not found"))
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get_task(&self, task_uuid: Uuid) -> Result<Task> {
        self.inner
            .read()
            .tasks
            .get(&task_uuid)
            .cloned()
            .ok_or_else(|| task_not_found(task_uuid))
    }

    async fn get_steps_for_task(&self, task_uuid: Uuid) -> Result<Vec<WorkflowStep>> {
        let inner = self.inner.read();
        let step_uuids = inner
            .task_steps
            .get(&task_uuid)
            .ok_or_else(|| task_not_found(task_uuid))?;

        step_uuids
            .iter()
            .map(|uuid| {
                inner.steps.get(uuid).cloned().ok_or_else(|| {
                    TaskerError::DataIntegrityError(format!(
                        "Task {task_uuid} references missing step {uuid}"
                    ))
                })
            })
            .collect()
    }

    async fn get_step(&self, workflow_step_uuid: Uuid) -> Result<WorkflowStep> {
        self.inner
            .read()
            .steps
            .get(&workflow_step_uuid)
            .cloned()
            .ok_or_else(|| step_not_found(workflow_step_uuid))
    }

    async fn get_edges(&self, task_uuid: Uuid) -> Result<Vec<WorkflowStepEdge>> {
        self.inner
            .read()
            .edges
            .get(&task_uuid)
            .cloned()
            .ok_or_else(|| task_not_found(task_uuid))
    }

    async fn get_transitions(&self, workflow_step_uuid: Uuid) -> Result<Vec<WorkflowStepTransition>> {
        self.inner
            .read()
            .step_transitions
            .get(&workflow_step_uuid)
            .cloned()
            .ok_or_else(|| step_not_found(workflow_step_uuid))
    }

    async fn get_task_transitions(&self, task_uuid: Uuid) -> Result<Vec<TaskTransition>> {
        self.inner
            .read()
            .task_transitions
            .get(&task_uuid)
            .cloned()
            .ok_or_else(|| task_not_found(task_uuid))
    }

    async fn append_step_transition(
        &self,
        workflow_step_uuid: Uuid,
        transition: NewWorkflowStepTransition,
    ) -> Result<WorkflowStep> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let StoreInner {
            steps,
            step_transitions,
            ..
        } = &mut *inner;

        let step = steps
            .get_mut(&workflow_step_uuid)
            .ok_or_else(|| step_not_found(workflow_step_uuid))?;
        let expected = transition.from_state.unwrap_or(WorkflowStepState::Pending);
        if step.current_state != expected {
            return Err(TaskerError::StateTransitionError(format!(
                "Step {} is {} but transition expected {}",
                workflow_step_uuid, step.current_state, expected
            )));
        }

        let log = step_transitions.entry(workflow_step_uuid).or_default();
        let sort_key = log.last().map(|t| t.sort_key + 1).unwrap_or(1);
        for previous in log.iter_mut() {
            previous.most_recent = false;
        }
        log.push(WorkflowStepTransition {
            transition_uuid: Uuid::new_v4(),
            workflow_step_uuid,
            from_state: Some(step.current_state),
            to_state: transition.to_state,
            metadata: transition.metadata(),
            sort_key,
            most_recent: true,
            created_at: now,
        });

        match transition.to_state {
            WorkflowStepState::InProgress => {
                step.attempts += 1;
                step.last_attempted_at = Some(now);
            }
            WorkflowStepState::Complete => {
                step.results = transition.results;
            }
            WorkflowStepState::Error => {
                step.last_failure_at = Some(now);
                // A retry_after only applies to the failure that requested it
                step.backoff_request_seconds = None;
                if let Some(failure) = transition.failure {
                    step.backoff_request_seconds = failure
                        .retry_after_seconds
                        .map(|secs| i32::try_from(secs).unwrap_or(i32::MAX));
                    if failure.permanent {
                        step.retryable = false;
                    }
                }
            }
            _ => {}
        }
        step.current_state = transition.to_state;
        step.updated_at = now;

        Ok(step.clone())
    }

    async fn append_task_transition(
        &self,
        task_uuid: Uuid,
        transition: NewTaskTransition,
    ) -> Result<Task> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let StoreInner {
            tasks,
            task_transitions,
            ..
        } = &mut *inner;

        let task = tasks
            .get_mut(&task_uuid)
            .ok_or_else(|| task_not_found(task_uuid))?;
        let expected = transition.from_state.unwrap_or(TaskState::Pending);
        if task.current_state != expected {
            return Err(TaskerError::StateTransitionError(format!(
                "Task {} is {} but transition expected {}",
                task_uuid, task.current_state, expected
            )));
        }

        let log = task_transitions.entry(task_uuid).or_default();
        let sort_key = log.last().map(|t| t.sort_key + 1).unwrap_or(1);
        for previous in log.iter_mut() {
            previous.most_recent = false;
        }
        log.push(TaskTransition {
            transition_uuid: Uuid::new_v4(),
            task_uuid,
            from_state: Some(task.current_state),
            to_state: transition.to_state,
            metadata: transition.metadata,
            sort_key,
            most_recent: true,
            created_at: now,
        });

        task.current_state = transition.to_state;
        task.updated_at = now;
        if transition.to_state == TaskState::Complete {
            task.completed_at = Some(now);
        }

        Ok(task.clone())
    }
}
