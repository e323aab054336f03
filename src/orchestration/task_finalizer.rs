//! # Task Finalizer
//!
//! Turns a freshly computed [`TaskExecutionContext`] into a task-level
//! decision.
//!
//! | execution status | synchronous | asynchronous |
//! |---|---|---|
//! | `all_complete` | complete | complete |
//! | `blocked_by_failures` | error | error |
//! | `has_ready_steps` | stay `in_progress`, caller runs the steps | re-enqueue |
//! | `waiting_for_dependencies` | park as `pending` | re-enqueue after the backoff |
//! | `processing`, steps in flight | park as `pending` | re-enqueue |
//! | `processing`, nothing in flight | stall | stall |
//!
//! The mode is always supplied by the caller. A synchronous caller is already
//! inside an orchestration pass and owns the next step, so the finalizer must
//! never also re-enqueue; that would let two passes run the same task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::step_readiness::StepReadinessCalculator;
use super::task_enqueuer::{EnqueueRequest, TaskEnqueuer};
use super::task_handler::TaskFinalizationContext;
use crate::config::{BackoffConfig, TaskerConfig};
use crate::constants::{events, ExecutionStatus, HealthStatus, PendingReason, ReenqueueReason};
use crate::error::TaskerError;
use crate::events::{payload, publish_quietly, EventSink};
use crate::logging::{log_error, log_task_operation};
use crate::models::{StepReadinessStatus, Task, TaskExecutionContext};
use crate::registry::TaskHandlerRegistry;
use crate::state_machine::{StateMachineError, TaskEvent, TaskState, TaskStateMachine};
use crate::storage::GraphStore;

/// Who is asking for finalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationMode {
    /// Called from inside an active orchestration pass
    Synchronous,
    /// Called by an independent trigger such as a stalled-task sweep
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationAction {
    Completed,
    Failed,
    /// Left non-terminal for the active pass (or the next one) to continue
    Pending,
    Reenqueued,
    /// The task was already terminal
    NoAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizationResult {
    pub task_uuid: Uuid,
    pub action: FinalizationAction,
    pub completion_percentage: Option<f64>,
    pub total_steps: Option<i64>,
    pub health_status: Option<HealthStatus>,
    pub reason: Option<String>,
    pub pending_reason: Option<PendingReason>,
    pub reenqueue_delay: Option<Duration>,
    /// Earliest retry among backing-off steps, for callers that may wait in-session
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl FinalizationResult {
    fn new(
        task_uuid: Uuid,
        action: FinalizationAction,
        context: Option<&TaskExecutionContext>,
    ) -> Self {
        Self {
            task_uuid,
            action,
            completion_percentage: context.map(|c| c.completion_percentage),
            total_steps: context.map(|c| c.total_steps),
            health_status: context.map(|c| c.health_status),
            reason: None,
            pending_reason: None,
            reenqueue_delay: None,
            next_retry_at: context.and_then(|c| c.next_retry_at),
        }
    }

    fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.action,
            FinalizationAction::Completed | FinalizationAction::Failed | FinalizationAction::NoAction
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FinalizationError {
    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Tasker(#[from] TaskerError),

    #[error("Task {task_uuid} stalled: {reason}")]
    Stalled { task_uuid: Uuid, reason: String },
}

impl From<FinalizationError> for TaskerError {
    fn from(error: FinalizationError) -> Self {
        match error {
            FinalizationError::StateMachine(error) => error.into(),
            FinalizationError::Tasker(error) => error,
            FinalizationError::Stalled { task_uuid, reason } => {
                TaskerError::StallDetected { task_uuid, reason }
            }
        }
    }
}

pub struct TaskFinalizer {
    store: Arc<dyn GraphStore>,
    events: Arc<dyn EventSink>,
    readiness: StepReadinessCalculator,
    backoff: BackoffConfig,
    blocked_failure_ratio: f64,
    task_handlers: Option<Arc<TaskHandlerRegistry>>,
    enqueuer: Option<Arc<TaskEnqueuer>>,
}

impl TaskFinalizer {
    pub fn new(store: Arc<dyn GraphStore>, events: Arc<dyn EventSink>, config: &TaskerConfig) -> Self {
        Self {
            readiness: StepReadinessCalculator::from_config(store.clone(), config),
            store,
            events,
            backoff: config.backoff.clone(),
            blocked_failure_ratio: config.health.blocked_failure_ratio,
            task_handlers: None,
            enqueuer: None,
        }
    }

    /// Run `finalize_hook` of the task's registered handler on completion
    pub fn with_task_handlers(mut self, registry: Arc<TaskHandlerRegistry>) -> Self {
        self.task_handlers = Some(registry);
        self
    }

    /// Queue used by asynchronous finalization
    pub fn with_enqueuer(mut self, enqueuer: Arc<TaskEnqueuer>) -> Self {
        self.enqueuer = Some(enqueuer);
        self
    }

    /// Readiness set and aggregated context for the task as it is now
    pub async fn execution_context(
        &self,
        task_uuid: Uuid,
    ) -> Result<(Vec<StepReadinessStatus>, TaskExecutionContext), TaskerError> {
        let statuses = self.readiness.calculate_for_task(task_uuid, None).await?;
        let context =
            TaskExecutionContext::from_readiness(task_uuid, &statuses, self.blocked_failure_ratio);
        Ok((statuses, context))
    }

    #[instrument(skip(self), fields(task_uuid = %task_uuid, mode = ?mode))]
    pub async fn finalize_task(
        &self,
        task_uuid: Uuid,
        mode: FinalizationMode,
    ) -> Result<FinalizationResult, FinalizationError> {
        let task = self.store.get_task(task_uuid).await?;
        if task.is_terminal() {
            debug!(task_uuid = %task_uuid, state = %task.current_state, "Task already terminal");
            return Ok(FinalizationResult::new(task_uuid, FinalizationAction::NoAction, None)
                .with_reason(format!("task already {}", task.current_state)));
        }

        let (statuses, context) = self.execution_context(task_uuid).await?;
        debug!(
            task_uuid = %task_uuid,
            execution_status = %context.execution_status,
            ready_steps = context.ready_steps,
            in_progress_steps = context.in_progress_steps,
            backing_off_steps = context.backing_off_steps,
            permanently_failed_steps = context.permanently_failed_steps,
            "Finalizing task"
        );

        let result = match context.execution_status {
            ExecutionStatus::AllComplete => self.complete_task(task, &context).await?,
            ExecutionStatus::BlockedByFailures => {
                self.error_task(task, &context, &statuses).await?
            }
            ExecutionStatus::HasReadySteps => match mode {
                FinalizationMode::Synchronous => {
                    let mut machine = self.machine(task);
                    machine.ensure_in_progress().await?;
                    let mut result =
                        FinalizationResult::new(task_uuid, FinalizationAction::Pending, Some(&context));
                    result.pending_reason = Some(PendingReason::ReadyForProcessing);
                    result
                }
                FinalizationMode::Asynchronous => {
                    let delay = Duration::from_secs(self.backoff.reenqueue_delays.has_ready_steps);
                    self.reenqueue_task(task, &context, ReenqueueReason::ReadyStepsAvailable, delay)
                        .await?
                }
            },
            ExecutionStatus::WaitingForDependencies => match mode {
                FinalizationMode::Synchronous => {
                    self.pending_task(task, &context, PendingReason::WaitingForDependencies)
                        .await?
                }
                FinalizationMode::Asynchronous => {
                    let (delay, reason) = self.waiting_delay(&context, Utc::now());
                    self.reenqueue_task(task, &context, reason, delay).await?
                }
            },
            ExecutionStatus::Processing if context.in_progress_steps > 0 => match mode {
                FinalizationMode::Synchronous => {
                    self.pending_task(task, &context, PendingReason::WaitingForStepCompletion)
                        .await?
                }
                FinalizationMode::Asynchronous => {
                    let delay = Duration::from_secs(self.backoff.reenqueue_delays.processing);
                    self.reenqueue_task(task, &context, ReenqueueReason::StepsInProgress, delay)
                        .await?
                }
            },
            ExecutionStatus::Processing => return Err(self.stalled(&task, &context).await),
        };

        log_task_operation(
            "finalize",
            Some(task_uuid),
            None,
            None,
            &format!("{:?}", result.action).to_lowercase(),
            result.reason.as_deref(),
        );

        Ok(result)
    }

    /// Delay before an asynchronous retry of a waiting task: time until the
    /// earliest backoff expires plus a buffer, or the configured delay when
    /// nothing is backing off
    pub fn waiting_delay(
        &self,
        context: &TaskExecutionContext,
        now: DateTime<Utc>,
    ) -> (Duration, ReenqueueReason) {
        match context.next_retry_at {
            Some(next_retry_at) => {
                let until = (next_retry_at - now).to_std().unwrap_or(Duration::ZERO);
                (
                    until + Duration::from_secs(self.backoff.buffer_seconds),
                    ReenqueueReason::RetryBackoff,
                )
            }
            None => (
                Duration::from_secs(self.backoff.reenqueue_delays.waiting_for_dependencies),
                ReenqueueReason::AwaitingDependencies,
            ),
        }
    }

    fn machine(&self, task: Task) -> TaskStateMachine {
        TaskStateMachine::new(task, self.store.clone(), self.events.clone())
    }

    async fn complete_task(
        &self,
        task: Task,
        context: &TaskExecutionContext,
    ) -> Result<FinalizationResult, FinalizationError> {
        let task_uuid = task.task_uuid;
        let mut machine = self.machine(task);
        machine.ensure_in_progress().await?;
        machine.transition(TaskEvent::Complete).await?;
        let task = machine.task().clone();

        info!(
            task_uuid = %task_uuid,
            total_steps = context.total_steps,
            "Task completed"
        );

        self.run_finalize_hook(&task, context).await;
        self.publish_finalized(task_uuid, FinalizationAction::Completed, context)
            .await;

        Ok(FinalizationResult::new(
            task_uuid,
            FinalizationAction::Completed,
            Some(context),
        ))
    }

    async fn error_task(
        &self,
        task: Task,
        context: &TaskExecutionContext,
        statuses: &[StepReadinessStatus],
    ) -> Result<FinalizationResult, FinalizationError> {
        let task_uuid = task.task_uuid;
        let reason = self.failure_reason(statuses).await?;

        let mut machine = self.machine(task);
        machine.transition(TaskEvent::Fail(reason.clone())).await?;

        warn!(
            task_uuid = %task_uuid,
            permanently_failed_steps = context.permanently_failed_steps,
            blocked_steps = context.blocked_steps,
            reason = %reason,
            "Task blocked by failures"
        );
        self.publish_finalized(task_uuid, FinalizationAction::Failed, context)
            .await;

        Ok(
            FinalizationResult::new(task_uuid, FinalizationAction::Failed, Some(context))
                .with_reason(reason),
        )
    }

    async fn pending_task(
        &self,
        task: Task,
        context: &TaskExecutionContext,
        pending_reason: PendingReason,
    ) -> Result<FinalizationResult, FinalizationError> {
        let task_uuid = task.task_uuid;
        let mut machine = self.machine(task);
        if machine.current_state() == TaskState::InProgress {
            machine
                .transition(TaskEvent::Requeue(pending_reason.as_str().to_string()))
                .await?;
        }

        let mut result =
            FinalizationResult::new(task_uuid, FinalizationAction::Pending, Some(context))
                .with_reason(pending_reason.as_str());
        result.pending_reason = Some(pending_reason);
        Ok(result)
    }

    async fn reenqueue_task(
        &self,
        task: Task,
        context: &TaskExecutionContext,
        reason: ReenqueueReason,
        delay: Duration,
    ) -> Result<FinalizationResult, FinalizationError> {
        let task_uuid = task.task_uuid;
        let mut machine = self.machine(task);
        if machine.current_state() == TaskState::InProgress {
            machine
                .transition(TaskEvent::Requeue(reason.as_str().to_string()))
                .await?;
        }

        let Some(enqueuer) = &self.enqueuer else {
            warn!(task_uuid = %task_uuid, "No enqueuer configured; task left pending");
            return Ok(
                FinalizationResult::new(task_uuid, FinalizationAction::Pending, Some(context))
                    .with_reason("no enqueuer configured"),
            );
        };

        let request = EnqueueRequest::reenqueue(task_uuid, reason).with_delay(delay);
        if let Err(error) = enqueuer.enqueue(request).await {
            log_error(
                "task_finalizer",
                "reenqueue",
                &error.to_string(),
                Some(&task_uuid.to_string()),
            );
            return Ok(
                FinalizationResult::new(task_uuid, FinalizationAction::Pending, Some(context))
                    .with_reason(format!("re-enqueue failed: {error}")),
            );
        }

        let mut result =
            FinalizationResult::new(task_uuid, FinalizationAction::Reenqueued, Some(context))
                .with_reason(reason.as_str());
        result.reenqueue_delay = Some(delay);
        Ok(result)
    }

    async fn stalled(&self, task: &Task, context: &TaskExecutionContext) -> FinalizationError {
        let reason = format!(
            "no ready, running or backing-off steps ({} pending, {} failed of {})",
            context.pending_steps, context.failed_steps, context.total_steps
        );
        warn!(task_uuid = %task.task_uuid, reason = %reason, "Task stalled");
        publish_quietly(
            self.events.as_ref(),
            events::TASK_STALLED,
            payload([
                ("task_uuid", json!(task.task_uuid)),
                ("reason", json!(reason)),
                ("pending_steps", json!(context.pending_steps)),
            ]),
        )
        .await;
        FinalizationError::Stalled {
            task_uuid: task.task_uuid,
            reason,
        }
    }

    /// "name: last error" for every permanently failed step
    async fn failure_reason(
        &self,
        statuses: &[StepReadinessStatus],
    ) -> Result<String, FinalizationError> {
        let mut failures = Vec::new();
        for status in statuses.iter().filter(|s| s.is_dead_end()) {
            let transitions = self.store.get_transitions(status.workflow_step_uuid).await?;
            let message = transitions
                .iter()
                .rev()
                .find_map(|t| t.error_message())
                .unwrap_or(if status.has_failed() {
                    "retries exhausted"
                } else {
                    "cancelled"
                });
            failures.push(format!("{}: {message}", status.name));
        }

        Ok(if failures.is_empty() {
            "Steps blocked by failures".to_string()
        } else {
            format!("Steps permanently failed: {}", failures.join("; "))
        })
    }

    async fn run_finalize_hook(&self, task: &Task, context: &TaskExecutionContext) {
        let Some(registry) = &self.task_handlers else {
            return;
        };
        let Ok(handler) = registry.resolve_key(&task.handler_key()) else {
            debug!(task_uuid = %task.task_uuid, "No task handler registered; skipping finalize hook");
            return;
        };

        let hook_context = TaskFinalizationContext {
            task: task.clone(),
            execution_context: context.clone(),
        };
        if let Err(error) = handler.finalize_hook(&hook_context).await {
            warn!(task_uuid = %task.task_uuid, error = %error, "Finalize hook failed");
            publish_quietly(
                self.events.as_ref(),
                events::TASK_FINALIZE_HOOK_FAILED,
                payload([
                    ("task_uuid", json!(task.task_uuid)),
                    ("error", json!(format!("{error:#}"))),
                ]),
            )
            .await;
        }
    }

    async fn publish_finalized(
        &self,
        task_uuid: Uuid,
        action: FinalizationAction,
        context: &TaskExecutionContext,
    ) {
        publish_quietly(
            self.events.as_ref(),
            events::TASK_FINALIZED,
            payload([
                ("task_uuid", json!(task_uuid)),
                ("action", json!(action)),
                ("completion_percentage", json!(context.completion_percentage)),
                ("health_status", json!(context.health_status)),
            ]),
        )
        .await;
    }
}
