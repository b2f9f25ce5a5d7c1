use async_trait::async_trait;
use serde_json::Value;

use super::{LifecyclePublisher, PublisherCore};
use crate::error::{EventResult, TopicError};
use crate::events::{DomainEvent, EventFamily, EventType, TransactionEvent};
use crate::models::{Entity, PaymentTransaction};
use crate::producer::AsyncProducer;
use crate::registry::HandlerResult;
use crate::topics::TopicCatalog;

/// Publishes `TRANSACTION_*` events for gateway interactions.
#[derive(Clone)]
pub struct TransactionEventPublisher {
    core: PublisherCore,
}

impl TransactionEventPublisher {
    pub fn new(producer: AsyncProducer, catalog: &TopicCatalog) -> Result<Self, TopicError> {
        Ok(Self {
            core: PublisherCore::new(producer, catalog, EventFamily::Transaction)?,
        })
    }

    pub async fn publish_created(
        &self,
        transaction: &PaymentTransaction,
    ) -> EventResult<TransactionEvent> {
        self.emit(EventType::TransactionCreated, transaction, None).await
    }

    pub async fn publish_updated(
        &self,
        transaction: &PaymentTransaction,
    ) -> EventResult<TransactionEvent> {
        self.emit(EventType::TransactionUpdated, transaction, None).await
    }

    /// Gateway status is free-form, so the previous value is passed through
    /// as reported.
    pub async fn publish_status_changed(
        &self,
        transaction: &PaymentTransaction,
        old_status: &str,
    ) -> EventResult<TransactionEvent> {
        self.emit(
            EventType::TransactionStatusChanged,
            transaction,
            Some(("old_status", Value::from(old_status))),
        )
        .await
    }

    pub async fn publish_deleted(
        &self,
        transaction: &PaymentTransaction,
    ) -> EventResult<TransactionEvent> {
        self.emit(EventType::TransactionDeleted, transaction, None).await
    }

    pub fn register_local_handler<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.core.register_local(event_type, handler);
    }

    async fn emit(
        &self,
        event_type: EventType,
        transaction: &PaymentTransaction,
        extra: Option<(&str, Value)>,
    ) -> EventResult<TransactionEvent> {
        let mut data = transaction.projection()?;
        if let Some((field, value)) = extra {
            data.insert(field.to_string(), value);
        }
        let envelope = TransactionEvent::new(event_type, transaction.id, data)?;
        self.core.send(envelope).await
    }
}

#[async_trait]
impl LifecyclePublisher<PaymentTransaction> for TransactionEventPublisher {
    async fn created(&self, entity: &PaymentTransaction) -> EventResult<()> {
        self.publish_created(entity).await.map(|_| ())
    }

    async fn updated(&self, entity: &PaymentTransaction) -> EventResult<()> {
        self.publish_updated(entity).await.map(|_| ())
    }

    async fn deleted(&self, entity: &PaymentTransaction) -> EventResult<()> {
        self.publish_deleted(entity).await.map(|_| ())
    }
}
