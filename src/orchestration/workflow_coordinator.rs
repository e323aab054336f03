//! # Workflow Coordinator
//!
//! Drives a task through repeated orchestration passes:
//!
//! ```text
//! readiness -> aggregate -> governor -> executor -> finalize (synchronous)
//!     ^                                                   |
//!     +---------------- ready steps remain ---------------+
//! ```
//!
//! A run ends when the task is terminal, when it has to wait longer than the
//! configured in-session limit, when it is cancelled, or when the pass limit
//! is reached. Cancellation is checked before every batch; handlers already
//! running are never interrupted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::concurrency_governor::{ConcurrencyGovernor, PressureSignals};
use super::step_executor::StepExecutor;
use super::step_readiness::StepReadinessCalculator;
use super::task_finalizer::{FinalizationAction, FinalizationMode, TaskFinalizer};
use crate::config::TaskerConfig;
use crate::constants::{events, PendingReason};
use crate::error::{Result, TaskerError};
use crate::events::{payload, publish_quietly, EventSink};
use crate::models::TaskExecutionContext;
use crate::registry::{StepHandlerRegistry, TaskHandlerRegistry};
use crate::state_machine::{TaskEvent, TaskState, TaskStateMachine};
use crate::storage::GraphStore;

/// Samples resource pressure for the concurrency governor
pub type PressureSource = Arc<dyn Fn() -> PressureSignals + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOrchestrationResult {
    Complete {
        completion_percentage: f64,
    },
    Failed {
        reason: String,
    },
    /// Nothing runnable before `next_retry_at`; the task is parked as pending
    Waiting {
        next_retry_at: Option<DateTime<Utc>>,
    },
    /// Pass limit reached, or steps from a timed-out batch are still running
    InProgress {
        reason: String,
    },
    Cancelled,
}

impl TaskOrchestrationResult {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowExecutionMetrics {
    pub passes: u32,
    pub batches: u32,
    pub steps_executed: usize,
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub steps_timed_out: usize,
    pub in_session_wait: Duration,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionReport {
    pub task_uuid: Uuid,
    pub result: TaskOrchestrationResult,
    pub metrics: WorkflowExecutionMetrics,
}

pub struct WorkflowCoordinator {
    store: Arc<dyn GraphStore>,
    events: Arc<dyn EventSink>,
    readiness: StepReadinessCalculator,
    governor: Arc<ConcurrencyGovernor>,
    executor: StepExecutor,
    finalizer: TaskFinalizer,
    pressure: PressureSource,
    config: TaskerConfig,
    cancellations: DashSet<Uuid>,
}

impl WorkflowCoordinator {
    /// Fails with `ValidationError` when `config` does not pass
    /// [`TaskerConfig::validate`]
    pub fn new(
        store: Arc<dyn GraphStore>,
        step_handlers: Arc<StepHandlerRegistry>,
        events: Arc<dyn EventSink>,
        config: TaskerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            readiness: StepReadinessCalculator::from_config(store.clone(), &config),
            governor: Arc::new(ConcurrencyGovernor::new(&config.execution)?),
            executor: StepExecutor::new(store.clone(), step_handlers, events.clone()),
            finalizer: TaskFinalizer::new(store.clone(), events.clone(), &config),
            pressure: Arc::new(PressureSignals::idle),
            store,
            events,
            config,
            cancellations: DashSet::new(),
        })
    }

    pub fn with_task_handlers(mut self, registry: Arc<TaskHandlerRegistry>) -> Self {
        self.finalizer = self.finalizer.with_task_handlers(registry);
        self
    }

    /// Share one governor (and its cached recommendation) across coordinators
    pub fn with_governor(mut self, governor: Arc<ConcurrencyGovernor>) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_pressure_source(mut self, pressure: PressureSource) -> Self {
        self.pressure = pressure;
        self
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    /// Stop dispatching new batches for the task. In-flight handlers finish;
    /// the task moves to `cancelled` before its next batch would start.
    pub fn cancel_task(&self, task_uuid: Uuid) {
        info!(task_uuid = %task_uuid, "Cancellation requested");
        self.cancellations.insert(task_uuid);
    }

    pub fn is_cancellation_requested(&self, task_uuid: Uuid) -> bool {
        self.cancellations.contains(&task_uuid)
    }

    #[instrument(skip(self), fields(task_uuid = %task_uuid))]
    pub async fn execute_task_workflow(&self, task_uuid: Uuid) -> Result<WorkflowExecutionReport> {
        let started = Instant::now();
        let mut metrics = WorkflowExecutionMetrics::default();
        let result = self.run_passes(task_uuid, &mut metrics).await;
        metrics.elapsed = started.elapsed();

        let result = match result {
            Ok(result) => result,
            Err(error) => {
                self.cancellations.remove(&task_uuid);
                return Err(error);
            }
        };
        if result.is_terminal() {
            self.cancellations.remove(&task_uuid);
        }
        info!(
            task_uuid = %task_uuid,
            result = ?result,
            passes = metrics.passes,
            steps_executed = metrics.steps_executed,
            elapsed_ms = metrics.elapsed.as_millis() as u64,
            "Workflow run finished"
        );

        Ok(WorkflowExecutionReport {
            task_uuid,
            result,
            metrics,
        })
    }

    /// Run several tasks, at most `max_concurrent_tasks` at a time
    pub async fn execute_tasks(
        &self,
        task_uuids: Vec<Uuid>,
    ) -> Vec<(Uuid, Result<WorkflowExecutionReport>)> {
        let limit = self.config.execution.max_concurrent_tasks.max(1);
        stream::iter(task_uuids)
            .map(|task_uuid| async move { (task_uuid, self.execute_task_workflow(task_uuid).await) })
            .buffer_unordered(limit)
            .collect()
            .await
    }

    async fn run_passes(
        &self,
        task_uuid: Uuid,
        metrics: &mut WorkflowExecutionMetrics,
    ) -> Result<TaskOrchestrationResult> {
        let max_passes = self.config.execution.max_orchestration_passes;

        while metrics.passes < max_passes {
            metrics.passes += 1;

            let task = self.store.get_task(task_uuid).await?;
            match task.current_state {
                TaskState::Complete | TaskState::ResolvedManually => {
                    return Ok(TaskOrchestrationResult::Complete {
                        completion_percentage: 100.0,
                    });
                }
                TaskState::Cancelled => return Ok(TaskOrchestrationResult::Cancelled),
                TaskState::Error => {
                    return Ok(TaskOrchestrationResult::Failed {
                        reason: self.last_failure_reason(task_uuid).await?,
                    });
                }
                TaskState::Pending | TaskState::InProgress => {}
            }

            if self.is_cancellation_requested(task_uuid) {
                let mut machine =
                    TaskStateMachine::new(task, self.store.clone(), self.events.clone());
                machine.transition(TaskEvent::Cancel).await?;
                return Ok(TaskOrchestrationResult::Cancelled);
            }

            let statuses = self.readiness.calculate_for_task(task_uuid, None).await?;
            let context = TaskExecutionContext::from_readiness(
                task_uuid,
                &statuses,
                self.config.health.blocked_failure_ratio,
            );

            if context.has_ready_steps() {
                let ready: HashSet<Uuid> = statuses
                    .iter()
                    .filter(|s| s.ready_for_execution)
                    .map(|s| s.workflow_step_uuid)
                    .collect();
                let steps: Vec<_> = self
                    .store
                    .get_steps_for_task(task_uuid)
                    .await?
                    .into_iter()
                    .filter(|step| ready.contains(&step.workflow_step_uuid))
                    .collect();

                publish_quietly(
                    self.events.as_ref(),
                    events::WORKFLOW_VIABLE_STEPS_DISCOVERED,
                    payload([
                        ("task_uuid", json!(task_uuid)),
                        ("step_count", json!(steps.len())),
                        (
                            "step_names",
                            json!(steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()),
                        ),
                    ]),
                )
                .await;

                let mut machine =
                    TaskStateMachine::new(task, self.store.clone(), self.events.clone());
                machine.ensure_in_progress().await?;

                let concurrency = self.governor.recommended_concurrency((self.pressure)());
                let batch_timeout = self.governor.batch_timeout(steps.len());
                let batch = self
                    .executor
                    .execute_batch(machine.task(), steps, concurrency, batch_timeout)
                    .await?;

                metrics.batches += 1;
                metrics.steps_executed += batch.dispatched();
                metrics.steps_succeeded += batch.succeeded;
                metrics.steps_failed += batch.failed;
                metrics.steps_timed_out += batch.timed_out;
            }

            let finalization = self
                .finalizer
                .finalize_task(task_uuid, FinalizationMode::Synchronous)
                .await
                .map_err(TaskerError::from)?;
            debug!(
                task_uuid = %task_uuid,
                pass = metrics.passes,
                action = ?finalization.action,
                "Pass finalized"
            );

            match finalization.action {
                FinalizationAction::Completed => {
                    return Ok(TaskOrchestrationResult::Complete {
                        completion_percentage: finalization.completion_percentage.unwrap_or(100.0),
                    });
                }
                FinalizationAction::Failed => {
                    return Ok(TaskOrchestrationResult::Failed {
                        reason: finalization.reason.unwrap_or_default(),
                    });
                }
                FinalizationAction::NoAction => continue,
                FinalizationAction::Reenqueued => {
                    return Ok(TaskOrchestrationResult::Waiting {
                        next_retry_at: finalization.next_retry_at,
                    });
                }
                FinalizationAction::Pending => match finalization.pending_reason {
                    Some(PendingReason::ReadyForProcessing) => continue,
                    Some(PendingReason::WaitingForDependencies) => {
                        match self.in_session_wait(finalization.next_retry_at) {
                            Some(wait) => {
                                debug!(
                                    task_uuid = %task_uuid,
                                    wait_ms = wait.as_millis() as u64,
                                    "Waiting in-session for backoff"
                                );
                                tokio::time::sleep(wait).await;
                                metrics.in_session_wait += wait;
                            }
                            None => {
                                return Ok(TaskOrchestrationResult::Waiting {
                                    next_retry_at: finalization.next_retry_at,
                                });
                            }
                        }
                    }
                    Some(PendingReason::WaitingForStepCompletion) => {
                        return Ok(TaskOrchestrationResult::InProgress {
                            reason: PendingReason::WaitingForStepCompletion.as_str().to_string(),
                        });
                    }
                    None => {
                        return Ok(TaskOrchestrationResult::Waiting {
                            next_retry_at: finalization.next_retry_at,
                        });
                    }
                },
            }
        }

        warn!(
            task_uuid = %task_uuid,
            max_passes,
            "Orchestration pass limit reached"
        );
        Ok(TaskOrchestrationResult::InProgress {
            reason: format!("pass limit of {max_passes} reached"),
        })
    }

    /// How long to sleep before the next pass, if the backoff is short enough
    fn in_session_wait(&self, next_retry_at: Option<DateTime<Utc>>) -> Option<Duration> {
        let limit = self.config.execution.max_in_session_wait();
        if limit.is_zero() {
            return None;
        }
        let next_retry_at = next_retry_at?;
        let wait = (next_retry_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            + Duration::from_millis(10);
        (wait <= limit).then_some(wait)
    }

    async fn last_failure_reason(&self, task_uuid: Uuid) -> Result<String> {
        let transitions = self.store.get_task_transitions(task_uuid).await?;
        Ok(transitions
            .iter()
            .rev()
            .find(|t| t.to_state == TaskState::Error)
            .and_then(|t| t.metadata.as_ref())
            .and_then(|metadata| metadata.get("reason"))
            .and_then(|reason| reason.as_str())
            .unwrap_or("task in error state")
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;
    use crate::models::{NewTask, NewWorkflowStep};
    use crate::orchestration::step_handler::{StepExecutionContext, StepHandler, StepHandlerError};
    use crate::storage::InMemoryGraphStore;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Succeeds;

    #[async_trait]
    impl StepHandler for Succeeds {
        async fn execute(
            &self,
            context: StepExecutionContext,
        ) -> std::result::Result<Value, StepHandlerError> {
            Ok(json!({ "done": context.step_name }))
        }
    }

    async fn coordinator_with(
        names: &[&str],
    ) -> (Arc<InMemoryGraphStore>, WorkflowCoordinator, Uuid) {
        let store = Arc::new(InMemoryGraphStore::new());
        let registry = Arc::new(StepHandlerRegistry::new());
        let task = store.create_task(NewTask::new("test", "chain")).unwrap();
        let mut previous = None;
        for name in names {
            registry
                .register("test", name, &task.version, Arc::new(Succeeds), false)
                .await
                .unwrap();
            let step = store
                .create_step(NewWorkflowStep::new(task.task_uuid, *name))
                .unwrap();
            if let Some(parent) = &previous {
                store.add_dependency(parent, &step).unwrap();
            }
            previous = Some(step);
        }
        let coordinator = WorkflowCoordinator::new(
            store.clone(),
            registry,
            Arc::new(EventPublisher::default()),
            TaskerConfig::for_testing(),
        )
        .unwrap();
        (store, coordinator, task.task_uuid)
    }

    #[tokio::test]
    async fn test_linear_chain_runs_to_completion() {
        let (store, coordinator, task_uuid) = coordinator_with(&["a", "b", "c"]).await;

        let report = coordinator.execute_task_workflow(task_uuid).await.unwrap();

        assert_eq!(
            report.result,
            TaskOrchestrationResult::Complete {
                completion_percentage: 100.0
            }
        );
        assert_eq!(report.metrics.batches, 3);
        assert_eq!(report.metrics.steps_succeeded, 3);
        let task = store.get_task(task_uuid).await.unwrap();
        assert_eq!(task.current_state, TaskState::Complete);
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_first_batch() {
        let (store, coordinator, task_uuid) = coordinator_with(&["a"]).await;

        coordinator.cancel_task(task_uuid);
        let report = coordinator.execute_task_workflow(task_uuid).await.unwrap();

        assert_eq!(report.result, TaskOrchestrationResult::Cancelled);
        assert_eq!(report.metrics.batches, 0);
        let task = store.get_task(task_uuid).await.unwrap();
        assert_eq!(task.current_state, TaskState::Cancelled);
        assert!(!coordinator.is_cancellation_requested(task_uuid));
    }

    #[tokio::test]
    async fn test_wide_fan_out_runs_in_one_batch() {
        let store = Arc::new(InMemoryGraphStore::new());
        let registry = Arc::new(StepHandlerRegistry::new());
        let task = store.create_task(NewTask::new("test", "fan_out")).unwrap();
        registry
            .register("test", "leaf", &task.version, Arc::new(Succeeds), false)
            .await
            .unwrap();
        for index in 0..64 {
            store
                .create_step(
                    NewWorkflowStep::new(task.task_uuid, format!("leaf_{index}")).with_handler("leaf"),
                )
                .unwrap();
        }
        let coordinator = WorkflowCoordinator::new(
            store.clone(),
            registry,
            Arc::new(EventPublisher::default()),
            TaskerConfig::for_testing(),
        )
        .unwrap();

        let report = coordinator.execute_task_workflow(task.task_uuid).await.unwrap();

        assert!(report.result.is_terminal());
        assert_eq!(report.metrics.batches, 1);
        assert_eq!(report.metrics.steps_succeeded, 64);
    }

    #[tokio::test]
    async fn test_failed_run_drops_pending_cancellation() {
        let (_store, coordinator, _task_uuid) = coordinator_with(&["a"]).await;
        let unknown = Uuid::new_v4();

        coordinator.cancel_task(unknown);
        let result = coordinator.execute_task_workflow(unknown).await;

        assert!(matches!(result, Err(TaskerError::NotFoundError(_))));
        assert!(!coordinator.is_cancellation_requested(unknown));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = TaskerConfig::for_testing();
        config.execution.min_concurrent_steps = 20;
        config.execution.max_concurrent_steps_limit = 4;

        let result = WorkflowCoordinator::new(
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(StepHandlerRegistry::new()),
            Arc::new(EventPublisher::default()),
            config,
        );

        assert!(matches!(result, Err(TaskerError::ValidationError(_))));
    }
}
