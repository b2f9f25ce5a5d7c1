//! Broker seam.
//!
//! The producer talks to a [`BrokerTransport`] and the subscriber to a
//! [`GroupConsumer`]. Kafka implementations live in [`kafka`]; [`memory`]
//! provides an in-process log with the same partitioning and group
//! semantics for tests and embedded use.

use async_trait::async_trait;

use crate::error::{SubscriberError, TransportError};

pub mod kafka;
pub mod memory;

pub use kafka::{KafkaGroupConsumer, KafkaTransport};
pub use memory::{MemoryBroker, MemoryGroupConsumer, StoredRecord};

/// A message waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    /// Canonical text form of the subject entity id.
    pub key: String,
    pub value: Vec<u8>,
}

/// A message received from the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

/// Group membership changes reported by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Assigned(Vec<(String, i32)>),
    Revoked(Vec<(String, i32)>),
    RebalanceFailed(String),
}

/// One step of the consumer stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled {
    Message(InboundMessage),
    Group(GroupEvent),
}

/// Sends one message and waits for the broker acknowledgement.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// A member of a consumer group.
#[async_trait]
pub trait GroupConsumer: Send + Sync {
    /// Join the group on the given topics.
    fn subscribe(&self, topics: &[String]) -> Result<(), SubscriberError>;

    /// Wait for the next message or membership change. Must be cancel safe.
    async fn poll(&self) -> Result<Polled, SubscriberError>;

    /// Record the message as processed so its offset is committed.
    fn mark_processed(&self, message: &InboundMessage) -> Result<(), SubscriberError>;

    /// Leave the group.
    async fn close(&self);
}
