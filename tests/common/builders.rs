//! Workflow builders over the in-memory graph store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tasker_engine::models::{
    NewTask, NewWorkflowStep, NewWorkflowStepEdge, NewWorkflowStepTransition, Task, WorkflowStep,
    WorkflowStepEdge,
};
use tasker_engine::state_machine::{StepFailure, WorkflowStepState};
use tasker_engine::storage::{GraphStore, InMemoryGraphStore};

pub const NAMESPACE: &str = "test";

/// A task with named steps, created in the store step by step
pub struct TestWorkflow {
    pub store: Arc<InMemoryGraphStore>,
    pub task: Task,
    steps: HashMap<String, WorkflowStep>,
}

impl TestWorkflow {
    pub fn new(task_name: &str) -> Self {
        Self::in_store(Arc::new(InMemoryGraphStore::new()), task_name)
    }

    /// Another task in an existing store
    pub fn in_store(store: Arc<InMemoryGraphStore>, task_name: &str) -> Self {
        let task = store
            .create_task(NewTask::new(NAMESPACE, task_name))
            .expect("create task");
        Self {
            store,
            task,
            steps: HashMap::new(),
        }
    }

    /// Linear chain `names[0] -> names[1] -> ...`
    pub fn chain(task_name: &str, names: &[&str]) -> Self {
        let mut workflow = Self::new(task_name);
        for name in names {
            workflow = workflow.step(name);
        }
        for pair in names.windows(2) {
            workflow = workflow.edge(pair[0], pair[1]);
        }
        workflow
    }

    /// `a -> {b, c} -> d`
    pub fn diamond(task_name: &str) -> Self {
        Self::new(task_name).diamond_steps()
    }

    pub fn diamond_steps(self) -> Self {
        self.step("a")
            .step("b")
            .step("c")
            .step("d")
            .edge("a", "b")
            .edge("a", "c")
            .edge("b", "d")
            .edge("c", "d")
    }

    pub fn step(self, name: &str) -> Self {
        let task_uuid = self.task.task_uuid;
        self.step_with(NewWorkflowStep::new(task_uuid, name))
    }

    pub fn step_with(mut self, new_step: NewWorkflowStep) -> Self {
        let step = self.store.create_step(new_step).expect("create step");
        self.steps.insert(step.name.clone(), step);
        self
    }

    pub fn edge(self, from: &str, to: &str) -> Self {
        let new_edge = NewWorkflowStepEdge::provides(self.uuid(from), self.uuid(to));
        self.store.create_edge(new_edge).expect("create edge");
        self
    }

    pub fn uuid(&self, name: &str) -> uuid::Uuid {
        self.steps
            .get(name)
            .unwrap_or_else(|| panic!("unknown step {name}"))
            .workflow_step_uuid
    }

    pub async fn load(&self, name: &str) -> WorkflowStep {
        self.store.get_step(self.uuid(name)).await.expect("load step")
    }

    pub async fn task_state(&self) -> tasker_engine::TaskState {
        self.store
            .get_task(self.task.task_uuid)
            .await
            .expect("load task")
            .current_state
    }

    pub async fn steps(&self) -> Vec<WorkflowStep> {
        self.store
            .get_steps_for_task(self.task.task_uuid)
            .await
            .expect("load steps")
    }

    pub async fn edges(&self) -> Vec<WorkflowStepEdge> {
        self.store.get_edges(self.task.task_uuid).await.expect("load edges")
    }

    async fn append(&self, name: &str, to: WorkflowStepState, failure: Option<StepFailure>) {
        let step = self.load(name).await;
        let mut transition = NewWorkflowStepTransition::new(Some(step.current_state), to);
        transition.failure = failure;
        self.store
            .append_step_transition(step.workflow_step_uuid, transition)
            .await
            .expect("append transition");
    }

    pub async fn complete(&self, name: &str) {
        self.append(name, WorkflowStepState::InProgress, None).await;
        self.append(name, WorkflowStepState::Complete, None).await;
    }

    /// Run one attempt that ends in `failure`
    pub async fn fail(&self, name: &str, failure: StepFailure) {
        self.append(name, WorkflowStepState::InProgress, None).await;
        self.append(name, WorkflowStepState::Error, Some(failure)).await;
    }

    /// Fail `attempts` times in a row
    pub async fn fail_times(&self, name: &str, attempts: usize) {
        for attempt in 1..=attempts {
            self.fail(name, StepFailure::transient(format!("attempt {attempt} failed")))
                .await;
        }
    }

    pub async fn start(&self, name: &str) {
        self.append(name, WorkflowStepState::InProgress, None).await;
    }

    pub async fn cancel(&self, name: &str) {
        self.append(name, WorkflowStepState::Cancelled, None).await;
    }

    pub async fn last_failure_at(&self, name: &str) -> DateTime<Utc> {
        self.load(name)
            .await
            .last_failure_at
            .expect("step has failed at least once")
    }
}
