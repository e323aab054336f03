use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::EventsConfig;

/// Flat key-value event payload
pub type EventPayload = HashMap<String, Value>;

/// Build an [`EventPayload`] from `(key, value)` pairs
pub fn payload<'a>(fields: impl IntoIterator<Item = (&'a str, Value)>) -> EventPayload {
    fields
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Destination for lifecycle events.
///
/// Delivery is fire-and-forget: callers log a failed publish and carry on,
/// see [`publish_quietly`].
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event_name: &str, payload: EventPayload) -> Result<(), PublishError>;
}

/// Publish and swallow any sink failure after logging it
pub async fn publish_quietly(sink: &dyn EventSink, event_name: &str, payload: EventPayload) {
    if let Err(error) = sink.publish(event_name, payload).await {
        tracing::warn!(event_name, error = %error, "Event publish failed; continuing");
    }
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    pub payload: EventPayload,
    pub published_at: DateTime<Utc>,
}

/// Broadcast-channel event sink for in-process subscribers
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
    enabled: bool,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            enabled: true,
        }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        let mut publisher = Self::new(config.channel_capacity);
        publisher.enabled = config.enabled;
        publisher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[async_trait]
impl EventSink for EventPublisher {
    async fn publish(&self, event_name: &str, payload: EventPayload) -> Result<(), PublishError> {
        if !self.enabled {
            return Ok(());
        }

        let event = PublishedEvent {
            name: event_name.to_string(),
            payload,
            published_at: Utc::now(),
        };

        // No subscribers is not a failure
        let _ = self.sender.send(event);
        Ok(())
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Error types for event publishing
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Event channel is closed")]
    ChannelClosed,
    #[error("Event sink rejected {event_name}: {reason}")]
    Rejected { event_name: String, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<PublishError> for crate::error::TaskerError {
    fn from(error: PublishError) -> Self {
        crate::error::TaskerError::EventError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let publisher = EventPublisher::new(16);
        let mut rx = publisher.subscribe();

        publisher
            .publish("step.completed", payload([("step_name", json!("fetch"))]))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "step.completed");
        assert_eq!(event.payload["step_name"], json!("fetch"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::default();
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(publisher.publish("task.completed", EventPayload::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_disabled_publisher_drops_events() {
        let publisher = EventPublisher::from_config(&EventsConfig {
            enabled: false,
            channel_capacity: 4,
        });
        let mut rx = publisher.subscribe();
        publisher
            .publish("task.completed", EventPayload::new())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
