//! Step and task handlers with scripted behaviour.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tasker_engine::events::{EventPayload, EventSink, PublishError};
use tasker_engine::orchestration::{
    StepExecutionContext, StepHandler, StepHandlerError, TaskFinalizationContext, TaskHandler,
};
use tasker_engine::registry::StepHandlerRegistry;

/// Returns its step name and the names of the parents it saw
pub struct Succeeding;

#[async_trait]
impl StepHandler for Succeeding {
    async fn execute(&self, context: StepExecutionContext) -> Result<Value, StepHandlerError> {
        let mut parents: Vec<&String> = context.dependency_results.keys().collect();
        parents.sort();
        Ok(json!({ "step": context.step_name, "parents": parents }))
    }
}

pub struct Failing {
    pub permanent: bool,
    pub message: &'static str,
}

impl Failing {
    pub fn permanent(message: &'static str) -> Self {
        Self {
            permanent: true,
            message,
        }
    }

    pub fn transient(message: &'static str) -> Self {
        Self {
            permanent: false,
            message,
        }
    }
}

#[async_trait]
impl StepHandler for Failing {
    async fn execute(&self, _context: StepExecutionContext) -> Result<Value, StepHandlerError> {
        if self.permanent {
            Err(StepHandlerError::permanent(self.message))
        } else {
            Err(StepHandlerError::transient(self.message))
        }
    }
}

/// Fails transiently for the first `failures` calls, then succeeds
pub struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

impl Flaky {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepHandler for Flaky {
    async fn execute(&self, context: StepExecutionContext) -> Result<Value, StepHandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err(StepHandlerError::transient(format!("flaky call {call}")))
        } else {
            Ok(json!({ "step": context.step_name, "attempt": context.attempt }))
        }
    }
}

/// Counts invocations and succeeds
#[derive(Default)]
pub struct Counting {
    calls: AtomicUsize,
}

impl Counting {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepHandler for Counting {
    async fn execute(&self, _context: StepExecutionContext) -> Result<Value, StepHandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "counted": true }))
    }
}

pub struct Slow(pub Duration);

#[async_trait]
impl StepHandler for Slow {
    async fn execute(&self, _context: StepExecutionContext) -> Result<Value, StepHandlerError> {
        tokio::time::sleep(self.0).await;
        Ok(json!({ "slept_ms": self.0.as_millis() as u64 }))
    }
}

/// Records every task that reached its finalize hook
#[derive(Default)]
pub struct RecordingTaskHandler {
    pub finalized: Mutex<Vec<uuid::Uuid>>,
}

#[async_trait]
impl TaskHandler for RecordingTaskHandler {
    async fn finalize_hook(&self, context: &TaskFinalizationContext) -> anyhow::Result<()> {
        self.finalized.lock().push(context.task.task_uuid);
        Ok(())
    }
}

/// Event sink that rejects everything
pub struct RejectingEventSink;

#[async_trait]
impl EventSink for RejectingEventSink {
    async fn publish(&self, event_name: &str, _payload: EventPayload) -> Result<(), PublishError> {
        Err(PublishError::Rejected {
            event_name: event_name.to_string(),
            reason: "sink offline".to_string(),
        })
    }
}

/// Registry with each handler keyed by its step name in the test namespace
pub async fn registry_with(
    handlers: Vec<(&str, Arc<dyn StepHandler>)>,
) -> Arc<StepHandlerRegistry> {
    let registry = Arc::new(StepHandlerRegistry::new());
    for (name, handler) in handlers {
        registry
            .register(super::NAMESPACE, name, "1.0.0", handler, false)
            .await
            .expect("register handler");
    }
    registry
}
