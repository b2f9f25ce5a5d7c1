//! Error types for the domain event pipeline.

use thiserror::Error;
use uuid::Uuid;

use crate::events::{EventFamily, EventKind, EventType};

/// Result type alias for envelope construction and publishing.
pub type EventResult<T> = Result<T, EventError>;

/// Errors raised while building, encoding or decoding envelopes.
#[derive(Error, Debug)]
pub enum EventError {
    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An entity projected to something other than a JSON object
    #[error("Projection of {0} did not produce a field map")]
    NotAFieldMap(&'static str),

    /// Discriminator does not belong to the envelope's family
    #[error("Event type {event_type} does not belong to the {expected} family")]
    FamilyMismatch {
        event_type: EventType,
        expected: EventFamily,
    },

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Unknown entity family: {0}")]
    UnknownFamily(String),

    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    #[error(transparent)]
    Topic(#[from] TopicError),
}

/// Errors raised while building or querying the topic catalog.
#[derive(Error, Debug)]
pub enum TopicError {
    #[error("No topic declared for {family}/{kind}")]
    Undeclared { family: EventFamily, kind: EventKind },

    #[error("Topic for {family}/{kind} is empty")]
    Empty { family: EventFamily, kind: EventKind },

    #[error("Invalid topic route '{0}', expected topic=entity")]
    InvalidRoute(String),

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Errors returned by a broker transport when sending a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying (leader election, timeouts, full local queue).
    #[error("Transient broker error: {0}")]
    Transient(String),

    #[error("Permanent broker error: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Errors raised by the consumer group subscriber.
#[derive(Error, Debug)]
pub enum SubscriberError {
    #[error("Subscriber already started")]
    AlreadyStarted,

    #[error("Subscriber stopped before the group became ready")]
    StoppedBeforeReady,

    #[error("Consumer is disabled for this service")]
    Disabled,

    #[error("Consumer closed")]
    Closed,

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Consumer error: {0}")]
    Consumer(String),
}

/// Errors raised by the in-memory data-access layer.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("{schema} row {id} not found")]
    NotFound { schema: &'static str, id: Uuid },

    #[error("{schema} row {id} already exists")]
    Duplicate { schema: &'static str, id: Uuid },

    #[error(transparent)]
    Event(#[from] EventError),
}

/// Errors raised while assembling the pipeline at startup.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Subscriber(#[from] SubscriberError),
}
