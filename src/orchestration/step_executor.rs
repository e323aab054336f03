//! # Step Executor
//!
//! Runs one batch of ready steps concurrently under a permit limit and a
//! batch deadline.
//!
//! Per step: acquire a permit, move the step to `in_progress`, call its
//! handler, then record `complete` or `error` through the step state
//! machine. A failing or panicking handler only fails its own step; siblings
//! keep running.
//!
//! When the batch deadline passes, the remaining work is detached rather than
//! aborted. Steps already running stay `in_progress` and record their own
//! outcome when they finish; the next readiness pass picks that up. Steps
//! still waiting for a permit at the deadline are never started.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::step_handler::{StepExecutionContext, StepHandler};
use crate::constants::events;
use crate::error::{Result, TaskerError};
use crate::events::{payload, publish_quietly, EventSink};
use crate::logging::log_step_operation;
use crate::models::{Task, WorkflowStep, WorkflowStepEdge};
use crate::registry::StepHandlerRegistry;
use crate::state_machine::{StepEvent, StepFailure, StepStateMachine};
use crate::storage::GraphStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureKind {
    Transient,
    Permanent,
}

/// What happened to one step of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded { result: Value },
    Failed { error: String, kind: StepFailureKind },
    /// Still running (or never started) when the batch deadline passed
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub workflow_step_uuid: Uuid,
    pub step_name: String,
    pub outcome: StepOutcome,
    pub duration: Duration,
}

/// Per-batch outcome and counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchExecutionResult {
    pub results: Vec<StepExecutionResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Never started: moved by another writer, or the deadline passed first
    pub not_dispatched: usize,
    pub elapsed: Duration,
}

impl BatchExecutionResult {
    pub fn dispatched(&self) -> usize {
        self.results.len()
    }

    fn record(&mut self, result: StepExecutionResult) {
        match &result.outcome {
            StepOutcome::Succeeded { .. } => self.succeeded += 1,
            StepOutcome::Failed { .. } => self.failed += 1,
            StepOutcome::TimedOut => self.timed_out += 1,
        }
        self.results.push(result);
    }
}

enum StepRun {
    Finished(StepExecutionResult),
    /// Never started; the batch deadline passed while waiting for a permit
    DeadlinePassed { workflow_step_uuid: Uuid },
    StartRejected { workflow_step_uuid: Uuid },
}

pub struct StepExecutor {
    store: Arc<dyn GraphStore>,
    registry: Arc<StepHandlerRegistry>,
    events: Arc<dyn EventSink>,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        registry: Arc<StepHandlerRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            registry,
            events,
        }
    }

    /// Execute `steps` with at most `concurrency` handlers in flight.
    ///
    /// Every handler is resolved before anything is dispatched: an unknown
    /// handler fails the call with `NotFoundError` and leaves all steps
    /// untouched.
    #[instrument(skip(self, task, steps), fields(task_uuid = %task.task_uuid, step_count = steps.len()))]
    pub async fn execute_batch(
        &self,
        task: &Task,
        steps: Vec<WorkflowStep>,
        concurrency: usize,
        batch_timeout: Duration,
    ) -> Result<BatchExecutionResult> {
        let started = Instant::now();
        let mut batch = BatchExecutionResult::default();
        if steps.is_empty() {
            return Ok(batch);
        }

        let mut dispatch = Vec::with_capacity(steps.len());
        for step in steps {
            if step.task_uuid != task.task_uuid {
                return Err(TaskerError::DataIntegrityError(format!(
                    "Step {} does not belong to task {}",
                    step.workflow_step_uuid, task.task_uuid
                )));
            }
            let handler = self
                .registry
                .resolve_key(&task.step_handler_key(&step.handler_name))?;
            dispatch.push((step, handler));
        }

        let all_steps = self.store.get_steps_for_task(task.task_uuid).await?;
        let edges = self.store.get_edges(task.task_uuid).await?;
        let mut dependency_results = collect_dependency_results(&all_steps, &edges);

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let deadline = Instant::now() + batch_timeout;
        let mut outstanding: HashMap<Uuid, String> = HashMap::with_capacity(dispatch.len());
        let mut join_set = JoinSet::new();

        for (step, handler) in dispatch {
            outstanding.insert(step.workflow_step_uuid, step.name.clone());
            let context = StepExecutionContext {
                task_uuid: task.task_uuid,
                namespace: task.namespace.clone(),
                task_name: task.name.clone(),
                task_version: task.version.clone(),
                step_uuid: step.workflow_step_uuid,
                step_name: step.name.clone(),
                attempt: step.attempts + 1,
                retry_limit: step.retry_limit,
                task_context: task.context.clone(),
                step_inputs: step.inputs.clone(),
                dependency_results: dependency_results
                    .remove(&step.workflow_step_uuid)
                    .unwrap_or_default(),
            };
            let machine = StepStateMachine::new(step, self.store.clone(), self.events.clone());
            join_set.spawn(run_step(
                machine,
                handler,
                context,
                semaphore.clone(),
                deadline,
            ));
        }

        let tokio_deadline = tokio::time::Instant::from_std(deadline);
        loop {
            match tokio::time::timeout_at(tokio_deadline, join_set.join_next()).await {
                Ok(Some(Ok(StepRun::Finished(result)))) => {
                    outstanding.remove(&result.workflow_step_uuid);
                    batch.record(result);
                }
                Ok(Some(Ok(
                    StepRun::StartRejected { workflow_step_uuid }
                    | StepRun::DeadlinePassed { workflow_step_uuid },
                ))) => {
                    outstanding.remove(&workflow_step_uuid);
                    batch.not_dispatched += 1;
                }
                Ok(Some(Err(join_error))) => {
                    error!(task_uuid = %task.task_uuid, error = %join_error, "Step execution task aborted");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        task_uuid = %task.task_uuid,
                        outstanding = outstanding.len(),
                        timeout_ms = batch_timeout.as_millis() as u64,
                        "Batch timeout reached; detaching in-flight steps"
                    );
                    join_set.detach_all();
                    break;
                }
            }
        }

        for (workflow_step_uuid, step_name) in outstanding {
            publish_quietly(
                self.events.as_ref(),
                events::STEP_TIMED_OUT,
                payload([
                    ("task_uuid", json!(task.task_uuid)),
                    ("step_uuid", json!(workflow_step_uuid)),
                    ("step_name", json!(step_name)),
                ]),
            )
            .await;
            batch.record(StepExecutionResult {
                workflow_step_uuid,
                step_name,
                outcome: StepOutcome::TimedOut,
                duration: batch_timeout,
            });
        }

        batch.elapsed = started.elapsed();

        info!(
            task_uuid = %task.task_uuid,
            succeeded = batch.succeeded,
            failed = batch.failed,
            timed_out = batch.timed_out,
            not_dispatched = batch.not_dispatched,
            elapsed_ms = batch.elapsed.as_millis() as u64,
            "Step batch executed"
        );
        publish_quietly(
            self.events.as_ref(),
            events::WORKFLOW_BATCH_EXECUTED,
            payload([
                ("task_uuid", json!(task.task_uuid)),
                ("succeeded", json!(batch.succeeded)),
                ("failed", json!(batch.failed)),
                ("timed_out", json!(batch.timed_out)),
                ("elapsed_ms", json!(batch.elapsed.as_millis() as u64)),
            ]),
        )
        .await;

        Ok(batch)
    }
}

async fn run_step(
    mut machine: StepStateMachine,
    handler: Arc<dyn StepHandler>,
    mut context: StepExecutionContext,
    semaphore: Arc<Semaphore>,
    deadline: Instant,
) -> StepRun {
    let workflow_step_uuid = context.step_uuid;
    // The semaphore is owned by this batch and never closed
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return StepRun::DeadlinePassed { workflow_step_uuid };
    };
    if Instant::now() >= deadline {
        return StepRun::DeadlinePassed { workflow_step_uuid };
    }

    if let Err(error) = machine.transition(StepEvent::Start).await {
        warn!(
            step_uuid = %workflow_step_uuid,
            step_name = %context.step_name,
            error = %error,
            "Step could not be started; leaving it for the next pass"
        );
        return StepRun::StartRejected { workflow_step_uuid };
    }
    context.attempt = machine.step().attempts;
    log_step_operation(
        "execute",
        Some(context.task_uuid),
        Some(workflow_step_uuid),
        Some(context.step_name.as_str()),
        "started",
        None,
    );

    let started = Instant::now();
    let step_name = context.step_name.clone();
    let (outcome, event) = match AssertUnwindSafe(handler.execute(context)).catch_unwind().await {
        Ok(Ok(result)) => (
            StepOutcome::Succeeded {
                result: result.clone(),
            },
            StepEvent::Complete(Some(result)),
        ),
        Ok(Err(handler_error)) => {
            let kind = if handler_error.is_permanent() {
                StepFailureKind::Permanent
            } else {
                StepFailureKind::Transient
            };
            let failure = StepFailure::from(handler_error);
            (
                StepOutcome::Failed {
                    error: failure.message.clone(),
                    kind,
                },
                StepEvent::Fail(failure),
            )
        }
        Err(panic) => {
            let failure = StepFailure::transient(format!(
                "Step handler panicked: {}",
                panic_message(panic.as_ref())
            ));
            (
                StepOutcome::Failed {
                    error: failure.message.clone(),
                    kind: StepFailureKind::Transient,
                },
                StepEvent::Fail(failure),
            )
        }
    };
    let duration = started.elapsed();

    if let Err(error) = machine.transition(event).await {
        error!(
            step_uuid = %workflow_step_uuid,
            step_name = %step_name,
            error = %error,
            "Failed to record step outcome; step remains in progress"
        );
    }

    debug!(
        step_uuid = %workflow_step_uuid,
        step_name = %step_name,
        duration_ms = duration.as_millis() as u64,
        succeeded = matches!(outcome, StepOutcome::Succeeded { .. }),
        "Step handler finished"
    );

    StepRun::Finished(StepExecutionResult {
        workflow_step_uuid,
        step_name,
        outcome,
        duration,
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Results of each step's direct parents, keyed by parent step name
fn collect_dependency_results(
    steps: &[WorkflowStep],
    edges: &[WorkflowStepEdge],
) -> HashMap<Uuid, HashMap<String, Value>> {
    let by_uuid: HashMap<Uuid, &WorkflowStep> =
        steps.iter().map(|s| (s.workflow_step_uuid, s)).collect();
    let mut results: HashMap<Uuid, HashMap<String, Value>> = HashMap::new();

    for edge in edges {
        let Some(parent) = by_uuid.get(&edge.from_step_uuid) else {
            continue;
        };
        if let Some(parent_results) = &parent.results {
            results
                .entry(edge.to_step_uuid)
                .or_default()
                .insert(parent.name.clone(), parent_results.clone());
        }
    }

    results
}
