//! Shipment operations used by the API layer and the fulfillment worker.
//! Events come from the commit hooks on the stores.

use std::sync::Arc;

use chrono::NaiveDate;
use domain_events::{ShipmentTracking, Shipping, ShippingStatus};
use tracing::info;
use uuid::Uuid;

use super::fulfillment::{ShipmentStore, TrackingLog};
use crate::db::ShipmentChange;
use crate::error::{ServiceError, ServiceResult};

#[derive(Clone)]
pub struct ShippingService {
    shippings: Arc<dyn ShipmentStore>,
    trackings: Arc<dyn TrackingLog>,
}

impl ShippingService {
    pub fn new(shippings: Arc<dyn ShipmentStore>, trackings: Arc<dyn TrackingLog>) -> Self {
        Self {
            shippings,
            trackings,
        }
    }

    /// Open the order's shipment with its first tracking entry at `origin`.
    /// Returns `None` when the order already has one.
    pub async fn open_shipment(
        &self,
        order_id: Uuid,
        origin: &str,
        notes: Option<String>,
    ) -> ServiceResult<Option<Shipping>> {
        if self.shippings.find_by_order(order_id).await?.is_some() {
            return Ok(None);
        }

        let shipping = self.shippings.create(&Shipping::new(order_id)).await?;
        let mut entry = ShipmentTracking::new(shipping.id, origin, shipping.status.as_str());
        entry.notes = notes;
        self.trackings.append(&entry).await?;
        Ok(Some(shipping))
    }

    /// Move a shipment to `status` and log where it happened.
    pub async fn update_status(
        &self,
        shipping_id: Uuid,
        status: ShippingStatus,
        location: &str,
        notes: Option<String>,
    ) -> ServiceResult<Shipping> {
        let shipping = self
            .shippings
            .update(shipping_id, ShipmentChange::status(status))
            .await?;

        let mut entry = ShipmentTracking::new(shipping.id, location, status.as_str());
        entry.notes = notes;
        self.trackings.append(&entry).await?;

        info!(shipping_id = %shipping_id, status = %status, location, "Shipment status updated");
        Ok(shipping)
    }

    pub async fn assign_carrier(
        &self,
        shipping_id: Uuid,
        carrier: &str,
        tracking_number: &str,
        estimated_delivery: Option<NaiveDate>,
    ) -> ServiceResult<Shipping> {
        if carrier.trim().is_empty() || tracking_number.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "carrier and tracking number are required".to_string(),
            ));
        }
        self.shippings
            .update(
                shipping_id,
                ShipmentChange {
                    status: Some(ShippingStatus::Preparing),
                    carrier: Some(carrier.to_string()),
                    tracking_number: Some(tracking_number.to_string()),
                    estimated_delivery,
                },
            )
            .await
    }

    /// Record a checkpoint without changing the shipment status.
    pub async fn record_tracking(
        &self,
        shipping_id: Uuid,
        location: &str,
        status: &str,
        notes: Option<String>,
    ) -> ServiceResult<ShipmentTracking> {
        if self.shippings.find_by_id(shipping_id).await?.is_none() {
            return Err(ServiceError::NotFound(format!("shipping {}", shipping_id)));
        }
        let mut entry = ShipmentTracking::new(shipping_id, location, status);
        entry.notes = notes;
        self.trackings.append(&entry).await
    }

    pub async fn history(&self, shipping_id: Uuid) -> ServiceResult<Vec<ShipmentTracking>> {
        self.trackings.find_by_shipping(shipping_id).await
    }

    pub async fn delete_shipment(&self, shipping_id: Uuid) -> ServiceResult<Shipping> {
        self.shippings.delete(shipping_id).await
    }
}
