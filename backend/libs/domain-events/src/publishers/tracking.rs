use async_trait::async_trait;

use super::{LifecyclePublisher, PublisherCore};
use crate::error::{EventResult, TopicError};
use crate::events::{DomainEvent, EventFamily, EventType, TrackingEvent};
use crate::models::{Entity, ShipmentTracking};
use crate::producer::AsyncProducer;
use crate::registry::HandlerResult;
use crate::topics::TopicCatalog;

/// Publishes `TRACKING_*` events. There is no status-changed kind for
/// tracking entries; a corrected status rides on `TRACKING_UPDATED`.
#[derive(Clone)]
pub struct TrackingEventPublisher {
    core: PublisherCore,
}

impl TrackingEventPublisher {
    pub fn new(producer: AsyncProducer, catalog: &TopicCatalog) -> Result<Self, TopicError> {
        Ok(Self {
            core: PublisherCore::new(producer, catalog, EventFamily::Tracking)?,
        })
    }

    pub async fn publish_created(&self, tracking: &ShipmentTracking) -> EventResult<TrackingEvent> {
        self.emit(EventType::TrackingCreated, tracking).await
    }

    pub async fn publish_updated(&self, tracking: &ShipmentTracking) -> EventResult<TrackingEvent> {
        self.emit(EventType::TrackingUpdated, tracking).await
    }

    pub async fn publish_deleted(&self, tracking: &ShipmentTracking) -> EventResult<TrackingEvent> {
        self.emit(EventType::TrackingDeleted, tracking).await
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
        tracking: &ShipmentTracking,
    ) -> EventResult<TrackingEvent> {
        let data = tracking.projection()?;
        let envelope = TrackingEvent::new(event_type, tracking.id, tracking.shipping_id, data)?;
        self.core.send(envelope).await
    }
}

#[async_trait]
impl LifecyclePublisher<ShipmentTracking> for TrackingEventPublisher {
    async fn created(&self, entity: &ShipmentTracking) -> EventResult<()> {
        self.publish_created(entity).await.map(|_| ())
    }

    async fn updated(&self, entity: &ShipmentTracking) -> EventResult<()> {
        self.publish_updated(entity).await.map(|_| ())
    }

    async fn deleted(&self, entity: &ShipmentTracking) -> EventResult<()> {
        self.publish_deleted(entity).await.map(|_| ())
    }
}
