//! # Step Readiness Calculator
//!
//! Computes one [`StepReadinessStatus`] per step of a task from the step
//! records and the task's edge set.
//!
//! ## Rules
//!
//! - **Dependencies**: a parent counts as completed when it is `complete` or
//!   `resolved_manually`. For a `skippable` step, a parent that is a dead end
//!   (permanently failed or cancelled) counts as completed too. Roots are
//!   always dependency-satisfied.
//! - **Retry eligibility**: the first attempt of a pending step is always
//!   eligible. After that the step must be retryable, startable and below its
//!   retry limit.
//! - **Backoff**: `next_retry_at` is the last failure plus the backoff delay,
//!   or `now` for a step that never failed.
//! - **Doom**: a step whose parent is a dead end (and which is not
//!   skippable), or whose parent is itself doomed, is `blocked_by_failure`.
//!   Doom is resolved in topological order so it reaches every descendant.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::backoff_calculator::{BackoffCalculator, BackoffCalculatorConfig};
use crate::config::TaskerConfig;
use crate::error::{Result, TaskerError};
use crate::models::{
    DependencyGraph, StepDagRelationship, StepReadinessStatus, WorkflowStep, WorkflowStepEdge,
};
use crate::state_machine::WorkflowStepState;
use crate::storage::GraphStore;

pub struct StepReadinessCalculator {
    store: Arc<dyn GraphStore>,
    backoff: BackoffCalculator,
    max_depth: usize,
}

impl StepReadinessCalculator {
    pub fn new(store: Arc<dyn GraphStore>, backoff: BackoffCalculator, max_depth: usize) -> Self {
        Self {
            store,
            backoff,
            max_depth,
        }
    }

    pub fn from_config(store: Arc<dyn GraphStore>, config: &TaskerConfig) -> Self {
        Self::new(
            store,
            BackoffCalculator::new(BackoffCalculatorConfig::from(&config.backoff)),
            config.dependency_graph.max_depth,
        )
    }

    pub fn backoff(&self) -> &BackoffCalculator {
        &self.backoff
    }

    /// Readiness for the requested steps of a task, or for all of them when
    /// `step_uuids` is `None`.
    ///
    /// Readiness always depends on the whole graph, so the full step set is
    /// loaded either way. Asking for a step the task does not own is a
    /// `NotFoundError`.
    #[instrument(skip(self, step_uuids), fields(task_uuid = %task_uuid))]
    pub async fn calculate_for_task(
        &self,
        task_uuid: Uuid,
        step_uuids: Option<&[Uuid]>,
    ) -> Result<Vec<StepReadinessStatus>> {
        let steps = self.store.get_steps_for_task(task_uuid).await?;
        let edges = self.store.get_edges(task_uuid).await?;
        let statuses = self.compute(task_uuid, &steps, &edges, Utc::now())?;

        let statuses = match step_uuids {
            None => statuses,
            Some(requested) => {
                let mut by_uuid: HashMap<Uuid, StepReadinessStatus> = statuses
                    .into_iter()
                    .map(|status| (status.workflow_step_uuid, status))
                    .collect();
                let mut selected = Vec::with_capacity(requested.len());
                for step_uuid in requested {
                    let status = by_uuid.remove(step_uuid).ok_or_else(|| {
                        TaskerError::NotFoundError(format!(
                            "Step {step_uuid} does not belong to task {task_uuid}"
                        ))
                    })?;
                    selected.push(status);
                }
                selected
            }
        };

        debug!(
            task_uuid = %task_uuid,
            step_count = statuses.len(),
            ready = statuses.iter().filter(|s| s.ready_for_execution).count(),
            "Step readiness calculated"
        );

        Ok(statuses)
    }

    /// Parent/child structure and root depth of every step in the task
    pub async fn dag_relationships(&self, task_uuid: Uuid) -> Result<Vec<StepDagRelationship>> {
        let steps = self.store.get_steps_for_task(task_uuid).await?;
        let edges = self.store.get_edges(task_uuid).await?;
        let graph = DependencyGraph::build(steps.iter().map(|s| s.workflow_step_uuid), &edges)?;
        Ok(StepDagRelationship::for_graph(&graph, self.max_depth))
    }

    /// Pure readiness computation over already-loaded records, in step order
    pub fn compute(
        &self,
        task_uuid: Uuid,
        steps: &[WorkflowStep],
        edges: &[WorkflowStepEdge],
        now: DateTime<Utc>,
    ) -> Result<Vec<StepReadinessStatus>> {
        let mut names = HashSet::with_capacity(steps.len());
        for step in steps {
            step.validate()?;
            if step.task_uuid != task_uuid {
                return Err(TaskerError::DataIntegrityError(format!(
                    "Step {} belongs to task {}, not {task_uuid}",
                    step.workflow_step_uuid, step.task_uuid
                )));
            }
            if !names.insert(step.name.as_str()) {
                return Err(TaskerError::DataIntegrityError(format!(
                    "Duplicate step name '{}' in task {task_uuid}",
                    step.name
                )));
            }
        }

        let graph = DependencyGraph::build(steps.iter().map(|s| s.workflow_step_uuid), edges)?;
        let order = graph.topological_order(self.max_depth)?;
        let by_uuid: HashMap<Uuid, &WorkflowStep> =
            steps.iter().map(|s| (s.workflow_step_uuid, s)).collect();

        let eligible: HashMap<Uuid, bool> = steps
            .iter()
            .map(|s| (s.workflow_step_uuid, is_retry_eligible(s)))
            .collect();
        let dead_end = |uuid: &Uuid| -> bool {
            by_uuid.get(uuid).is_some_and(|parent| match parent.current_state {
                WorkflowStepState::Cancelled => true,
                WorkflowStepState::Error => !eligible.get(uuid).copied().unwrap_or(false),
                _ => false,
            })
        };

        let mut doomed: HashMap<Uuid, bool> = HashMap::with_capacity(steps.len());
        for uuid in &order {
            let Some(step) = by_uuid.get(uuid) else {
                continue;
            };
            let can_be_doomed = !step.current_state.is_terminal()
                && step.current_state != WorkflowStepState::InProgress;
            let is_doomed = can_be_doomed
                && graph.parents(uuid).iter().any(|parent| {
                    doomed.get(parent).copied().unwrap_or(false)
                        || (dead_end(parent) && !step.skippable)
                });
            doomed.insert(*uuid, is_doomed);
        }

        let statuses = steps
            .iter()
            .map(|step| {
                let uuid = step.workflow_step_uuid;
                let parents = graph.parents(&uuid);
                let completed_parents = parents
                    .iter()
                    .filter(|parent| {
                        let satisfied = by_uuid
                            .get(parent)
                            .is_some_and(|p| p.current_state.satisfies_dependencies());
                        satisfied || (step.skippable && dead_end(parent))
                    })
                    .count() as i32;
                let total_parents = parents.len() as i32;
                let dependencies_satisfied = completed_parents == total_parents;
                let retry_eligible = eligible.get(&uuid).copied().unwrap_or(false);
                let next_retry_at = self.backoff.next_retry_at(
                    uuid,
                    step.attempts,
                    step.backoff_request_seconds,
                    step.last_failure_at,
                    now,
                );
                let ready_for_execution = step.current_state.is_startable()
                    && dependencies_satisfied
                    && retry_eligible
                    && now >= next_retry_at;

                StepReadinessStatus {
                    workflow_step_uuid: uuid,
                    task_uuid,
                    name: step.name.clone(),
                    current_state: step.current_state,
                    skippable: step.skippable,
                    dependencies_satisfied,
                    retry_eligible,
                    ready_for_execution,
                    blocked_by_failure: doomed.get(&uuid).copied().unwrap_or(false),
                    last_failure_at: step.last_failure_at,
                    next_retry_at,
                    total_parents,
                    completed_parents,
                    attempts: step.attempts,
                    retry_limit: step.retry_limit,
                    backoff_request_seconds: step.backoff_request_seconds,
                    last_attempted_at: step.last_attempted_at,
                }
            })
            .collect();

        Ok(statuses)
    }
}

/// Whether the step may be attempted (again)
pub fn is_retry_eligible(step: &WorkflowStep) -> bool {
    if step.current_state == WorkflowStepState::Pending && step.attempts == 0 {
        return true;
    }
    step.current_state.is_startable() && step.retryable && step.attempts < step.retry_limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewWorkflowStep, NewWorkflowStepEdge};
    use crate::storage::InMemoryGraphStore;
    use chrono::Duration;

    fn calculator() -> StepReadinessCalculator {
        let backoff = BackoffCalculator::new(BackoffCalculatorConfig {
            base_delay_seconds: 2,
            max_delay_seconds: 60,
            multiplier: 2.0,
            jitter_enabled: false,
            max_jitter: 0.0,
        });
        StepReadinessCalculator::new(Arc::new(InMemoryGraphStore::new()), backoff, 50)
    }

    fn step(task_uuid: Uuid, name: &str) -> WorkflowStep {
        WorkflowStep::from_new(NewWorkflowStep::new(task_uuid, name), Utc::now())
    }

    fn edge(from: &WorkflowStep, to: &WorkflowStep) -> WorkflowStepEdge {
        WorkflowStepEdge::from_new(
            NewWorkflowStepEdge::provides(from.workflow_step_uuid, to.workflow_step_uuid),
            Utc::now(),
        )
    }

    fn find<'a>(statuses: &'a [StepReadinessStatus], name: &str) -> &'a StepReadinessStatus {
        statuses.iter().find(|s| s.name == name).unwrap()
    }

    #[test]
    fn test_roots_are_ready_and_children_wait() {
        let task_uuid = Uuid::new_v4();
        let a = step(task_uuid, "a");
        let b = step(task_uuid, "b");
        let edges = vec![edge(&a, &b)];
        let now = Utc::now();

        let statuses = calculator()
            .compute(task_uuid, &[a, b], &edges, now)
            .unwrap();

        let a = find(&statuses, "a");
        assert!(a.dependencies_satisfied);
        assert!(a.ready_for_execution);
        assert_eq!(a.next_retry_at, now);

        let b = find(&statuses, "b");
        assert_eq!(b.total_parents, 1);
        assert_eq!(b.completed_parents, 0);
        assert!(!b.ready_for_execution);
        assert!(b.is_waiting_on_dependencies());
    }

    #[test]
    fn test_failed_step_backs_off_then_becomes_ready() {
        let task_uuid = Uuid::new_v4();
        let mut a = step(task_uuid, "a");
        let failed_at = Utc::now();
        a.current_state = WorkflowStepState::Error;
        a.attempts = 1;
        a.last_failure_at = Some(failed_at);
        let calc = calculator();

        let statuses = calc.compute(task_uuid, &[a.clone()], &[], failed_at).unwrap();
        assert!(statuses[0].retry_eligible);
        assert!(!statuses[0].ready_for_execution);
        assert!(statuses[0].is_backing_off());
        assert_eq!(statuses[0].next_retry_at, failed_at + Duration::seconds(2));

        let later = failed_at + Duration::seconds(2);
        let statuses = calc.compute(task_uuid, &[a], &[], later).unwrap();
        assert!(statuses[0].ready_for_execution);
    }

    #[test]
    fn test_exhausted_step_dooms_descendants() {
        let task_uuid = Uuid::new_v4();
        let mut a = step(task_uuid, "a");
        a.current_state = WorkflowStepState::Error;
        a.attempts = 3;
        a.retry_limit = 3;
        let b = step(task_uuid, "b");
        let c = step(task_uuid, "c");
        let edges = vec![edge(&a, &b), edge(&b, &c)];

        let statuses = calculator()
            .compute(task_uuid, &[a, b, c], &edges, Utc::now())
            .unwrap();

        assert!(find(&statuses, "a").is_permanently_failed());
        assert!(find(&statuses, "b").blocked_by_failure);
        assert!(find(&statuses, "c").blocked_by_failure);
        assert!(!find(&statuses, "c").is_waiting_on_dependencies());
    }

    #[test]
    fn test_skippable_step_proceeds_past_dead_end_parent() {
        let task_uuid = Uuid::new_v4();
        let mut a = step(task_uuid, "a");
        a.current_state = WorkflowStepState::Error;
        a.attempts = 1;
        a.retryable = false;
        let mut b = step(task_uuid, "b");
        b.skippable = true;
        let edges = vec![edge(&a, &b)];

        let statuses = calculator()
            .compute(task_uuid, &[a, b], &edges, Utc::now())
            .unwrap();

        let b = find(&statuses, "b");
        assert!(b.dependencies_satisfied);
        assert!(!b.blocked_by_failure);
        assert!(b.ready_for_execution);
    }

    #[test]
    fn test_first_attempt_ignores_retry_budget() {
        let task_uuid = Uuid::new_v4();
        let mut a = step(task_uuid, "a");
        a.retry_limit = 0;
        a.retryable = false;
        assert!(is_retry_eligible(&a));

        a.attempts = 1;
        assert!(!is_retry_eligible(&a));
    }

    #[test]
    fn test_integrity_faults_are_reported() {
        let task_uuid = Uuid::new_v4();
        let a = step(task_uuid, "a");
        let foreign = step(Uuid::new_v4(), "foreign");
        let calc = calculator();

        let result = calc.compute(task_uuid, &[a.clone(), foreign], &[], Utc::now());
        assert!(matches!(result, Err(TaskerError::DataIntegrityError(_))));

        let dangling = edge(&a, &step(task_uuid, "ghost"));
        let result = calc.compute(task_uuid, &[a], &[dangling], Utc::now());
        assert!(matches!(result, Err(TaskerError::DataIntegrityError(_))));
    }

    #[tokio::test]
    async fn test_calculate_for_task_filters_requested_steps() {
        let store = Arc::new(InMemoryGraphStore::new());
        let task = store
            .create_task(crate::models::NewTask::new("payments", "charge"))
            .unwrap();
        let a = store
            .create_step(NewWorkflowStep::new(task.task_uuid, "a"))
            .unwrap();
        let b = store
            .create_step(NewWorkflowStep::new(task.task_uuid, "b"))
            .unwrap();
        store.add_dependency(&a, &b).unwrap();

        let calc = StepReadinessCalculator::from_config(store.clone(), &TaskerConfig::default());
        let only_b = calc
            .calculate_for_task(task.task_uuid, Some(&[b.workflow_step_uuid]))
            .await
            .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].name, "b");

        let missing = calc
            .calculate_for_task(task.task_uuid, Some(&[Uuid::new_v4()]))
            .await;
        assert!(matches!(missing, Err(TaskerError::NotFoundError(_))));
    }
}
