use async_trait::async_trait;
use serde_json::Value;

use super::{LifecyclePublisher, PublisherCore};
use crate::error::{EventResult, TopicError};
use crate::events::{DomainEvent, EventFamily, EventType, ShippingEvent};
use crate::models::{Entity, Shipping, ShippingStatus};
use crate::producer::AsyncProducer;
use crate::registry::HandlerResult;
use crate::topics::TopicCatalog;

/// Publishes `SHIPPING_*` lifecycle events.
#[derive(Clone)]
pub struct ShippingEventPublisher {
    core: PublisherCore,
}

impl ShippingEventPublisher {
    pub fn new(producer: AsyncProducer, catalog: &TopicCatalog) -> Result<Self, TopicError> {
        Ok(Self {
            core: PublisherCore::new(producer, catalog, EventFamily::Shipping)?,
        })
    }

    pub async fn publish_created(&self, shipping: &Shipping) -> EventResult<ShippingEvent> {
        self.emit(EventType::ShippingCreated, shipping, None).await
    }

    pub async fn publish_updated(&self, shipping: &Shipping) -> EventResult<ShippingEvent> {
        self.emit(EventType::ShippingUpdated, shipping, None).await
    }

    pub async fn publish_status_changed(
        &self,
        shipping: &Shipping,
        old_status: ShippingStatus,
    ) -> EventResult<ShippingEvent> {
        self.emit(
            EventType::ShippingStatusChanged,
            shipping,
            Some(("old_status", Value::from(old_status.as_str()))),
        )
        .await
    }

    pub async fn publish_deleted(&self, shipping: &Shipping) -> EventResult<ShippingEvent> {
        self.emit(EventType::ShippingDeleted, shipping, None).await
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
        shipping: &Shipping,
        extra: Option<(&str, Value)>,
    ) -> EventResult<ShippingEvent> {
        let mut data = shipping.projection()?;
        if let Some((field, value)) = extra {
            data.insert(field.to_string(), value);
        }
        let envelope = ShippingEvent::new(event_type, shipping.id, data)?;
        self.core.send(envelope).await
    }
}

#[async_trait]
impl LifecyclePublisher<Shipping> for ShippingEventPublisher {
    async fn created(&self, entity: &Shipping) -> EventResult<()> {
        self.publish_created(entity).await.map(|_| ())
    }

    async fn updated(&self, entity: &Shipping) -> EventResult<()> {
        self.publish_updated(entity).await.map(|_| ())
    }

    async fn deleted(&self, entity: &Shipping) -> EventResult<()> {
        self.publish_deleted(entity).await.map(|_| ())
    }
}
