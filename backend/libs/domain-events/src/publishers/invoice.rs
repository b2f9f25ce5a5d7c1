use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use super::{LifecyclePublisher, PublisherCore};
use crate::error::{EventResult, TopicError};
use crate::events::{DomainEvent, EventFamily, EventType, InvoiceEvent};
use crate::models::{Entity, Invoice};
use crate::producer::AsyncProducer;
use crate::registry::HandlerResult;
use crate::topics::TopicCatalog;

/// Publishes `INVOICE_*` lifecycle events.
#[derive(Clone)]
pub struct InvoiceEventPublisher {
    core: PublisherCore,
}

impl InvoiceEventPublisher {
    pub fn new(producer: AsyncProducer, catalog: &TopicCatalog) -> Result<Self, TopicError> {
        Ok(Self {
            core: PublisherCore::new(producer, catalog, EventFamily::Invoice)?,
        })
    }

    pub async fn publish_created(&self, invoice: &Invoice) -> EventResult<InvoiceEvent> {
        self.emit(EventType::InvoiceCreated, invoice, None).await
    }

    pub async fn publish_updated(&self, invoice: &Invoice) -> EventResult<InvoiceEvent> {
        self.emit(EventType::InvoiceUpdated, invoice, None).await
    }

    pub async fn publish_due_date_changed(
        &self,
        invoice: &Invoice,
        old_due_date: NaiveDate,
    ) -> EventResult<InvoiceEvent> {
        self.emit(
            EventType::InvoiceDueDateChanged,
            invoice,
            Some(("old_due_date", Value::from(old_due_date.format("%Y-%m-%d").to_string()))),
        )
        .await
    }

    pub async fn publish_deleted(&self, invoice: &Invoice) -> EventResult<InvoiceEvent> {
        self.emit(EventType::InvoiceDeleted, invoice, None).await
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
        invoice: &Invoice,
        extra: Option<(&str, Value)>,
    ) -> EventResult<InvoiceEvent> {
        let mut data = invoice.projection()?;
        if let Some((field, value)) = extra {
            data.insert(field.to_string(), value);
        }
        let envelope = InvoiceEvent::new(event_type, invoice.id, data)?;
        self.core.send(envelope).await
    }
}

#[async_trait]
impl LifecyclePublisher<Invoice> for InvoiceEventPublisher {
    async fn created(&self, entity: &Invoice) -> EventResult<()> {
        self.publish_created(entity).await.map(|_| ())
    }

    async fn updated(&self, entity: &Invoice) -> EventResult<()> {
        self.publish_updated(entity).await.map(|_| ())
    }

    async fn deleted(&self, entity: &Invoice) -> EventResult<()> {
        self.publish_deleted(entity).await.map(|_| ())
    }
}
