pub mod publisher;

pub use publisher::{
    payload, publish_quietly, EventPayload, EventPublisher, EventSink, PublishError, PublishedEvent,
};
