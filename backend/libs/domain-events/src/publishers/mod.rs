//! Per-family publishing services.
//!
//! Each publisher holds the shared producer and its family's slice of the
//! topic catalog. Publishing projects the entity to a field map, adds the
//! pre-change value for change events, builds the typed envelope, picks the
//! topic, enqueues it and then runs the publisher's local handlers.
//!
//! Projection errors are returned to the caller. Broker errors are not:
//! delivery happens asynchronously in the producer.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{EventResult, TopicError};
use crate::events::{DomainEvent, Envelope, EventFamily, EventType};
use crate::models::Entity;
use crate::producer::{AsyncProducer, Enqueue};
use crate::registry::{invoke_all, HandlerRegistry, HandlerResult};
use crate::topics::{FamilyTopics, TopicCatalog};

mod invoice;
mod order_flow;
mod payment;
mod shipping;
mod tracking;
mod transaction;

pub use invoice::InvoiceEventPublisher;
pub use order_flow::OrderFlowPublisher;
pub use payment::PaymentEventPublisher;
pub use shipping::ShippingEventPublisher;
pub use tracking::TrackingEventPublisher;
pub use transaction::TransactionEventPublisher;

/// Lifecycle events every family publishes.
#[async_trait]
pub trait LifecyclePublisher<E: Entity>: Send + Sync {
    async fn created(&self, entity: &E) -> EventResult<()>;
    async fn updated(&self, entity: &E) -> EventResult<()>;
    async fn deleted(&self, entity: &E) -> EventResult<()>;
}

/// Producer, topics and local handlers shared by one family's publisher.
#[derive(Clone)]
pub(crate) struct PublisherCore {
    producer: AsyncProducer,
    topics: FamilyTopics,
    local: Arc<RwLock<HandlerRegistry>>,
}

impl PublisherCore {
    pub(crate) fn new(
        producer: AsyncProducer,
        catalog: &TopicCatalog,
        family: EventFamily,
    ) -> Result<Self, TopicError> {
        Ok(Self {
            producer,
            topics: catalog.family(family)?,
            local: Arc::new(RwLock::new(HandlerRegistry::new())),
        })
    }

    pub(crate) async fn send<Ev>(&self, envelope: Ev) -> EventResult<Ev>
    where
        Ev: Envelope + Into<DomainEvent>,
    {
        let event_type = envelope.event_type();
        let topic = self.topics.topic(event_type.kind())?;
        let key = envelope.key();
        let payload = envelope.encode()?;

        if self.producer.publish(topic, &key, payload).await == Enqueue::Accepted {
            debug!(event_type = %event_type, topic = %topic, key = %key, "Published domain event");
        }

        self.dispatch_local(&envelope.clone().into());
        Ok(envelope)
    }

    pub(crate) fn register_local<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.local.write().register(event_type, handler);
    }

    fn dispatch_local(&self, event: &DomainEvent) {
        // Copy the list out so a handler may register further handlers.
        let handlers = self.local.read().handlers_for(event.event_type()).to_vec();
        if !handlers.is_empty() {
            invoke_all(&handlers, event);
        }
    }
}

/// All family publishers over one producer.
#[derive(Clone)]
pub struct EventPublishers {
    pub payment: PaymentEventPublisher,
    pub invoice: InvoiceEventPublisher,
    pub transaction: TransactionEventPublisher,
    pub shipping: ShippingEventPublisher,
    pub tracking: TrackingEventPublisher,
}

impl EventPublishers {
    pub fn new(producer: &AsyncProducer, catalog: &TopicCatalog) -> Result<Self, TopicError> {
        Ok(Self {
            payment: PaymentEventPublisher::new(producer.clone(), catalog)?,
            invoice: InvoiceEventPublisher::new(producer.clone(), catalog)?,
            transaction: TransactionEventPublisher::new(producer.clone(), catalog)?,
            shipping: ShippingEventPublisher::new(producer.clone(), catalog)?,
            tracking: TrackingEventPublisher::new(producer.clone(), catalog)?,
        })
    }
}
