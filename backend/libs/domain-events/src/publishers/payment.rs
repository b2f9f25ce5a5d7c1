use async_trait::async_trait;
use serde_json::Value;

use super::{LifecyclePublisher, PublisherCore};
use crate::error::{EventResult, TopicError};
use crate::events::{DomainEvent, EventFamily, EventType, PaymentEvent};
use crate::models::{Entity, Payment, PaymentStatus};
use crate::producer::AsyncProducer;
use crate::registry::HandlerResult;
use crate::topics::TopicCatalog;

/// Publishes `PAYMENT_*` lifecycle events.
#[derive(Clone)]
pub struct PaymentEventPublisher {
    core: PublisherCore,
}

impl PaymentEventPublisher {
    pub fn new(producer: AsyncProducer, catalog: &TopicCatalog) -> Result<Self, TopicError> {
        Ok(Self {
            core: PublisherCore::new(producer, catalog, EventFamily::Payment)?,
        })
    }

    pub async fn publish_created(&self, payment: &Payment) -> EventResult<PaymentEvent> {
        self.emit(EventType::PaymentCreated, payment, None).await
    }

    pub async fn publish_updated(&self, payment: &Payment) -> EventResult<PaymentEvent> {
        self.emit(EventType::PaymentUpdated, payment, None).await
    }

    pub async fn publish_status_changed(
        &self,
        payment: &Payment,
        old_status: PaymentStatus,
    ) -> EventResult<PaymentEvent> {
        self.emit(
            EventType::PaymentStatusChanged,
            payment,
            Some(("old_status", Value::from(old_status.as_str()))),
        )
        .await
    }

    pub async fn publish_deleted(&self, payment: &Payment) -> EventResult<PaymentEvent> {
        self.emit(EventType::PaymentDeleted, payment, None).await
    }

    /// Handler run in-process whenever this publisher emits `event_type`.
    pub fn register_local_handler<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.core.register_local(event_type, handler);
    }

    async fn emit(
        &self,
        event_type: EventType,
        payment: &Payment,
        extra: Option<(&str, Value)>,
    ) -> EventResult<PaymentEvent> {
        let mut data = payment.projection()?;
        if let Some((field, value)) = extra {
            data.insert(field.to_string(), value);
        }
        let envelope = PaymentEvent::new(event_type, payment.id, data)?;
        self.core.send(envelope).await
    }
}

#[async_trait]
impl LifecyclePublisher<Payment> for PaymentEventPublisher {
    async fn created(&self, entity: &Payment) -> EventResult<()> {
        self.publish_created(entity).await.map(|_| ())
    }

    async fn updated(&self, entity: &Payment) -> EventResult<()> {
        self.publish_updated(entity).await.map(|_| ())
    }

    async fn deleted(&self, entity: &Payment) -> EventResult<()> {
        self.publish_deleted(entity).await.map(|_| ())
    }
}
