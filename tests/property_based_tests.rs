//! Property-based tests over randomly generated workflow graphs.

mod common;

use std::sync::Arc;

use common::strategies::*;
use proptest::prelude::*;
use tasker_engine::config::ExecutionConfig;
use tasker_engine::constants::ExecutionStatus;
use tasker_engine::orchestration::{
    BackoffCalculator, BackoffCalculatorConfig, ConcurrencyGovernor, PressureSignals,
    StepReadinessCalculator,
};
use tasker_engine::state_machine::WorkflowStepState;
use tasker_engine::storage::InMemoryGraphStore;
use tasker_engine::{StepReadinessStatus, TaskExecutionContext};

fn calculator() -> StepReadinessCalculator {
    let backoff = BackoffCalculator::new(BackoffCalculatorConfig {
        base_delay_seconds: 2,
        max_delay_seconds: 60,
        multiplier: 2.0,
        jitter_enabled: true,
        max_jitter: 0.1,
    });
    StepReadinessCalculator::new(Arc::new(InMemoryGraphStore::new()), backoff, 50)
}

fn readiness(workflow: &GeneratedWorkflow) -> Vec<StepReadinessStatus> {
    calculator()
        .compute(
            workflow.task_uuid,
            &workflow.steps,
            &workflow.edges,
            workflow.now,
        )
        .expect("generated workflows are valid")
}

fn governor() -> ConcurrencyGovernor {
    ConcurrencyGovernor::new(&ExecutionConfig {
        min_concurrent_steps: 2,
        max_concurrent_steps_limit: 12,
        ..ExecutionConfig::default()
    })
    .expect("valid bounds")
}

proptest! {
    #[test]
    fn prop_roots_are_dependency_satisfied(workflow in workflow_strategy(10)) {
        for status in readiness(&workflow) {
            if status.total_parents == 0 {
                prop_assert!(status.dependencies_satisfied, "root {} not satisfied", status.name);
                prop_assert!(!status.blocked_by_failure);
            }
        }
    }

    #[test]
    fn prop_ready_implies_every_precondition(workflow in workflow_strategy(10)) {
        for status in readiness(&workflow) {
            if status.ready_for_execution {
                prop_assert!(status.current_state.is_startable());
                prop_assert!(status.dependencies_satisfied);
                prop_assert!(status.retry_eligible);
                prop_assert!(workflow.now >= status.next_retry_at);
            }
        }
    }

    #[test]
    fn prop_parent_counts_are_bounded(workflow in workflow_strategy(10)) {
        for status in readiness(&workflow) {
            prop_assert!(status.completed_parents >= 0);
            prop_assert!(status.completed_parents <= status.total_parents);
            prop_assert_eq!(
                status.dependencies_satisfied,
                status.completed_parents == status.total_parents
            );
        }
    }

    #[test]
    fn prop_terminal_and_running_steps_are_never_doomed(workflow in workflow_strategy(10)) {
        for status in readiness(&workflow) {
            if status.current_state.is_terminal()
                || status.current_state == WorkflowStepState::InProgress
            {
                prop_assert!(!status.blocked_by_failure);
            }
        }
    }

    #[test]
    fn prop_blocked_task_has_no_live_work(workflow in workflow_strategy(10)) {
        let statuses = readiness(&workflow);
        let context = TaskExecutionContext::from_readiness(workflow.task_uuid, &statuses, 0.5);

        if context.execution_status == ExecutionStatus::BlockedByFailures {
            prop_assert_eq!(context.ready_steps, 0);
            prop_assert_eq!(context.in_progress_steps, 0);
            prop_assert_eq!(context.backing_off_steps, 0);
            prop_assert!(context.permanently_failed_steps + context.cancelled_steps > 0);
        }
        if context.backing_off_steps > 0 {
            prop_assert_ne!(context.execution_status, ExecutionStatus::BlockedByFailures);
            prop_assert!(context.next_retry_at.is_some());
        }
    }

    #[test]
    fn prop_state_counts_partition_the_task(workflow in workflow_strategy(12)) {
        let statuses = readiness(&workflow);
        let context = TaskExecutionContext::from_readiness(workflow.task_uuid, &statuses, 0.5);

        prop_assert_eq!(context.total_steps, workflow.steps.len() as i64);
        prop_assert_eq!(
            context.pending_steps
                + context.in_progress_steps
                + context.completed_steps
                + context.failed_steps
                + context.cancelled_steps,
            context.total_steps
        );
        prop_assert!((0.0..=100.0).contains(&context.completion_percentage));
    }

    #[test]
    fn prop_completing_a_step_never_lowers_completion(
        workflow in workflow_strategy(10),
        pick in any::<prop::sample::Index>(),
    ) {
        let before = TaskExecutionContext::from_readiness(
            workflow.task_uuid,
            &readiness(&workflow),
            0.5,
        );

        let mut advanced = workflow.clone();
        let index = pick.index(advanced.steps.len());
        advanced.steps[index].current_state = WorkflowStepState::Complete;
        let after = TaskExecutionContext::from_readiness(
            advanced.task_uuid,
            &readiness(&advanced),
            0.5,
        );

        prop_assert!(after.completion_percentage >= before.completion_percentage);
    }

    #[test]
    fn prop_governor_stays_within_bounds(
        utilization in utilization_strategy(),
        available in prop::option::of(0usize..20),
    ) {
        let governor = governor();
        let concurrency = governor.compute_concurrency(PressureSignals {
            pool_utilization: utilization,
            available_connections: available,
        });
        prop_assert!((2..=12).contains(&concurrency));
    }

    #[test]
    fn prop_governor_is_monotone_in_pressure(a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
        let governor = governor();
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(
            governor.compute_concurrency(PressureSignals::with_utilization(low))
                >= governor.compute_concurrency(PressureSignals::with_utilization(high))
        );
    }

    #[test]
    fn prop_batch_timeout_never_exceeds_cap(steps in 0usize..10_000) {
        let governor = governor();
        let cap = ExecutionConfig::default().max_batch_timeout();
        prop_assert!(governor.batch_timeout(steps) <= cap);
    }
}
