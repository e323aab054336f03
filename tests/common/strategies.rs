//! Proptest strategies for random, internally consistent workflow graphs.

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use tasker_engine::models::{NewWorkflowStep, NewWorkflowStepEdge, WorkflowStep, WorkflowStepEdge};
use tasker_engine::state_machine::WorkflowStepState;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StepShape {
    pub state: WorkflowStepState,
    pub attempts: i32,
    pub retry_limit: i32,
    pub retryable: bool,
    pub skippable: bool,
    pub failed_seconds_ago: i64,
}

#[derive(Debug, Clone)]
pub struct GeneratedWorkflow {
    pub task_uuid: Uuid,
    pub steps: Vec<WorkflowStep>,
    pub edges: Vec<WorkflowStepEdge>,
    pub now: DateTime<Utc>,
}

pub fn step_state_strategy() -> impl Strategy<Value = WorkflowStepState> {
    prop_oneof![
        3 => Just(WorkflowStepState::Pending),
        1 => Just(WorkflowStepState::InProgress),
        3 => Just(WorkflowStepState::Complete),
        2 => Just(WorkflowStepState::Error),
        1 => Just(WorkflowStepState::Cancelled),
        1 => Just(WorkflowStepState::ResolvedManually),
    ]
}

pub fn step_shape_strategy() -> impl Strategy<Value = StepShape> {
    (
        step_state_strategy(),
        0i32..=4,
        0i32..=4,
        any::<bool>(),
        prop::bool::weighted(0.2),
        0i64..=120,
    )
        .prop_map(
            |(state, attempts, retry_limit, retryable, skippable, failed_seconds_ago)| {
                // Anything that has run has at least one attempt
                let attempts = match state {
                    WorkflowStepState::Pending | WorkflowStepState::Cancelled => attempts,
                    _ => attempts.max(1),
                };
                StepShape {
                    state,
                    attempts,
                    retry_limit,
                    retryable,
                    skippable,
                    failed_seconds_ago,
                }
            },
        )
}

/// Acyclic graphs of `1..=max_steps` steps; edges only point from lower to
/// higher index
pub fn workflow_strategy(max_steps: usize) -> impl Strategy<Value = GeneratedWorkflow> {
    (1..=max_steps)
        .prop_flat_map(|n| {
            (
                prop::collection::vec(step_shape_strategy(), n),
                prop::collection::vec(prop::bool::weighted(0.3), n * (n - 1) / 2),
            )
        })
        .prop_map(|(shapes, edge_mask)| build_workflow(&shapes, &edge_mask))
}

pub fn build_workflow(shapes: &[StepShape], edge_mask: &[bool]) -> GeneratedWorkflow {
    let task_uuid = Uuid::new_v4();
    let now = Utc::now();

    let steps: Vec<WorkflowStep> = shapes
        .iter()
        .enumerate()
        .map(|(index, shape)| {
            let mut new_step = NewWorkflowStep::new(task_uuid, format!("step_{index}"))
                .with_retry_limit(shape.retry_limit)
                .with_retryable(shape.retryable);
            if shape.skippable {
                new_step = new_step.skippable();
            }
            let mut step = WorkflowStep::from_new(new_step, now - Duration::minutes(10));
            step.current_state = shape.state;
            step.attempts = shape.attempts;
            if shape.attempts > 0 {
                let failed_at = now - Duration::seconds(shape.failed_seconds_ago);
                step.last_attempted_at = Some(failed_at);
                if shape.state != WorkflowStepState::Complete {
                    step.last_failure_at = Some(failed_at);
                }
            }
            step
        })
        .collect();

    let mut edges = Vec::new();
    let mut mask = edge_mask.iter();
    for from in 0..steps.len() {
        for to in (from + 1)..steps.len() {
            if mask.next().copied().unwrap_or(false) {
                edges.push(WorkflowStepEdge::from_new(
                    NewWorkflowStepEdge::provides(
                        steps[from].workflow_step_uuid,
                        steps[to].workflow_step_uuid,
                    ),
                    now,
                ));
            }
        }
    }

    GeneratedWorkflow {
        task_uuid,
        steps,
        edges,
        now,
    }
}

/// Pool utilisation including out-of-range and non-finite samples
pub fn utilization_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![
        8 => 0.0f64..=1.0,
        1 => -1.0f64..2.0,
        1 => Just(f64::NAN),
    ]
}
