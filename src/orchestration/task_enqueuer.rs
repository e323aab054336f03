//! # Task Enqueuer
//!
//! Hands a task back to whatever drives independent orchestration runs.
//! Only asynchronous finalization re-enqueues; an in-session pass never does.
//!
//! The queue itself sits behind [`EnqueueHandler`]. [`ChannelEnqueueHandler`]
//! forwards requests over a tokio channel to an in-process consumer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::constants::{events, ReenqueueReason};
use crate::error::TaskerError;
use crate::events::{payload, publish_quietly, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOperation {
    Enqueue,
    Reenqueue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub task_uuid: Uuid,
    pub operation: EnqueueOperation,
    pub delay: Duration,
    pub reason: Option<ReenqueueReason>,
    pub requested_at: DateTime<Utc>,
}

impl EnqueueRequest {
    pub fn new(task_uuid: Uuid) -> Self {
        Self {
            task_uuid,
            operation: EnqueueOperation::Enqueue,
            delay: Duration::ZERO,
            reason: None,
            requested_at: Utc::now(),
        }
    }

    pub fn reenqueue(task_uuid: Uuid, reason: ReenqueueReason) -> Self {
        Self {
            operation: EnqueueOperation::Reenqueue,
            reason: Some(reason),
            ..Self::new(task_uuid)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn is_delayed(&self) -> bool {
        !self.delay.is_zero()
    }

    /// Earliest instant the consumer should pick the task up
    pub fn process_at(&self) -> DateTime<Utc> {
        self.requested_at
            + chrono::Duration::from_std(self.delay).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Handler error: {0}")]
    Handler(String),
}

impl From<EnqueueError> for TaskerError {
    fn from(error: EnqueueError) -> Self {
        TaskerError::OrchestrationError(error.to_string())
    }
}

/// Queue backend for enqueue requests
#[async_trait]
pub trait EnqueueHandler: Send + Sync {
    async fn handle_enqueue(&self, request: EnqueueRequest) -> Result<(), EnqueueError>;

    fn handler_name(&self) -> &'static str;
}

/// Forwards requests to an in-process consumer over an mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelEnqueueHandler {
    sender: mpsc::Sender<EnqueueRequest>,
}

impl ChannelEnqueueHandler {
    /// Handler plus the receiving end the consumer should drain
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EnqueueRequest>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EnqueueHandler for ChannelEnqueueHandler {
    async fn handle_enqueue(&self, request: EnqueueRequest) -> Result<(), EnqueueError> {
        self.sender
            .send(request)
            .await
            .map_err(|_| EnqueueError::QueueUnavailable("enqueue channel closed".to_string()))
    }

    fn handler_name(&self) -> &'static str {
        "channel"
    }
}

pub struct TaskEnqueuer {
    handler: Arc<dyn EnqueueHandler>,
    events: Arc<dyn EventSink>,
}

impl TaskEnqueuer {
    pub fn new(handler: Arc<dyn EnqueueHandler>, events: Arc<dyn EventSink>) -> Self {
        Self { handler, events }
    }

    pub fn handler_name(&self) -> &'static str {
        self.handler.handler_name()
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<(), EnqueueError> {
        let task_uuid = request.task_uuid;
        let operation = request.operation;
        let delay = request.delay;
        let reason = request.reason;

        debug!(
            task_uuid = %task_uuid,
            handler = self.handler.handler_name(),
            delay_ms = delay.as_millis() as u64,
            "Enqueueing task"
        );
        self.handler.handle_enqueue(request).await?;

        if operation == EnqueueOperation::Reenqueue {
            info!(
                task_uuid = %task_uuid,
                delay_seconds = delay.as_secs(),
                reason = reason.map(|r| r.as_str()).unwrap_or("unspecified"),
                "Task re-enqueued"
            );
            publish_quietly(
                self.events.as_ref(),
                events::TASK_REENQUEUED,
                payload([
                    ("task_uuid", json!(task_uuid)),
                    ("delay_seconds", json!(delay.as_secs())),
                    ("reason", json!(reason.map(|r| r.as_str()))),
                ]),
            )
            .await;
        }

        Ok(())
    }
}
