use serde_json::Value;

use super::PublisherCore;
use crate::error::{EventResult, TopicError};
use crate::events::{EventData, EventFamily, EventType, PaymentEvent};
use crate::models::Payment;
use crate::producer::AsyncProducer;
use crate::topics::TopicCatalog;

/// Order-coordination events for the order service.
///
/// Unlike the lifecycle publisher these carry a compact payload
/// (`order_id`, `payment_id`, `amount`, `status`, optional `reason`) rather
/// than the full payment snapshot.
#[derive(Clone)]
pub struct OrderFlowPublisher {
    core: PublisherCore,
}

impl OrderFlowPublisher {
    pub fn new(producer: AsyncProducer, catalog: &TopicCatalog) -> Result<Self, TopicError> {
        Ok(Self {
            core: PublisherCore::new(producer, catalog, EventFamily::Payment)?,
        })
    }

    pub async fn publish_confirmed(&self, payment: &Payment) -> EventResult<PaymentEvent> {
        self.emit(EventType::PaymentConfirmed, payment, None).await
    }

    pub async fn publish_failed(&self, payment: &Payment, reason: &str) -> EventResult<PaymentEvent> {
        self.emit(EventType::PaymentFailed, payment, Some(reason)).await
    }

    /// Order-flow variant of `PAYMENT_UPDATED`.
    pub async fn publish_order_update(&self, payment: &Payment) -> EventResult<PaymentEvent> {
        self.emit(EventType::PaymentUpdated, payment, None).await
    }

    async fn emit(
        &self,
        event_type: EventType,
        payment: &Payment,
        reason: Option<&str>,
    ) -> EventResult<PaymentEvent> {
        let mut data = EventData::new();
        data.insert("order_id".into(), Value::from(payment.order_id.to_string()));
        data.insert("payment_id".into(), Value::from(payment.id.to_string()));
        data.insert("amount".into(), serde_json::to_value(payment.amount)?);
        data.insert("status".into(), Value::from(payment.status.as_str()));
        if let Some(reason) = reason {
            data.insert("reason".into(), Value::from(reason));
        }

        let envelope = PaymentEvent::new(event_type, payment.id, data)?;
        self.core.send(envelope).await
    }
}
