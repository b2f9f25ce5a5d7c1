//! Shipment auto-creation.
//!
//! Every confirmed payment gets exactly one shipment for its order. The
//! subscriber handler for `PAYMENT_CONFIRMED` only enqueues a job; a worker
//! task drains the bounded queue and writes the shipment together with its
//! first tracking entry.

use async_trait::async_trait;
use domain_events::persistence::MemoryTable;
use domain_events::{DomainEvent, HandlerResult, ShipmentTracking, Shipping};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::shipments::ShippingService;
use crate::db::ShipmentChange;
use crate::error::ServiceResult;

/// Shipment storage.
#[async_trait]
pub trait ShipmentStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> ServiceResult<Option<Shipping>>;
    async fn find_by_order(&self, order_id: Uuid) -> ServiceResult<Option<Shipping>>;
    async fn create(&self, shipping: &Shipping) -> ServiceResult<Shipping>;
    async fn update(&self, id: Uuid, change: ShipmentChange) -> ServiceResult<Shipping>;
    async fn delete(&self, id: Uuid) -> ServiceResult<Shipping>;
}

#[async_trait]
impl ShipmentStore for MemoryTable<Shipping> {
    async fn find_by_id(&self, id: Uuid) -> ServiceResult<Option<Shipping>> {
        Ok(self.get(id))
    }

    async fn find_by_order(&self, order_id: Uuid) -> ServiceResult<Option<Shipping>> {
        Ok(self.all().into_iter().find(|s| s.order_id == order_id))
    }

    async fn create(&self, shipping: &Shipping) -> ServiceResult<Shipping> {
        Ok(self.insert(shipping.clone()).await?)
    }

    async fn update(&self, id: Uuid, change: ShipmentChange) -> ServiceResult<Shipping> {
        Ok(self.modify(id, move |shipping| change.apply(shipping)).await?)
    }

    async fn delete(&self, id: Uuid) -> ServiceResult<Shipping> {
        Ok(MemoryTable::delete(self, id).await?)
    }
}

/// Append-only tracking storage.
#[async_trait]
pub trait TrackingLog: Send + Sync {
    async fn append(&self, entry: &ShipmentTracking) -> ServiceResult<ShipmentTracking>;
    async fn find_by_shipping(&self, shipping_id: Uuid) -> ServiceResult<Vec<ShipmentTracking>>;
}

#[async_trait]
impl TrackingLog for MemoryTable<ShipmentTracking> {
    async fn append(&self, entry: &ShipmentTracking) -> ServiceResult<ShipmentTracking> {
        Ok(self.insert(entry.clone()).await?)
    }

    async fn find_by_shipping(&self, shipping_id: Uuid) -> ServiceResult<Vec<ShipmentTracking>> {
        let mut entries: Vec<ShipmentTracking> = self
            .all()
            .into_iter()
            .filter(|t| t.shipping_id == shipping_id)
            .collect();
        entries.sort_by_key(|t| t.timestamp);
        Ok(entries)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentJob {
    pub order_id: Uuid,
    pub payment_id: Uuid,
}

pub type FulfillmentSender = mpsc::Sender<FulfillmentJob>;
pub type FulfillmentReceiver = mpsc::Receiver<FulfillmentJob>;

pub fn create_fulfillment_queue(capacity: usize) -> (FulfillmentSender, FulfillmentReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Subscriber handler for `PAYMENT_CONFIRMED`.
pub fn fulfillment_handler(
    sender: FulfillmentSender,
) -> impl Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static {
    move |event: &DomainEvent| {
        let order_id = event
            .data_uuid("order_id")
            .ok_or_else(|| anyhow::anyhow!("payment {} has no order_id", event.subject_id()))?;

        sender
            .try_send(FulfillmentJob {
                order_id,
                payment_id: event.subject_id(),
            })
            .map_err(|e| anyhow::anyhow!("fulfillment queue rejected job: {}", e))
    }
}

/// Everything a fulfillment worker writes to.
#[derive(Clone)]
pub struct Fulfillment {
    pub shipments: ShippingService,
    /// Location of the first tracking entry.
    pub origin: String,
}

/// Drain the queue until it closes or `shutdown` flips; jobs already queued
/// at shutdown are still processed.
pub fn spawn_fulfillment_worker(
    fulfillment: Fulfillment,
    mut receiver: FulfillmentReceiver,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Fulfillment worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    receiver.close();
                    while let Some(job) = receiver.recv().await {
                        process(&fulfillment, &job).await;
                    }
                    break;
                }
                job = receiver.recv() => match job {
                    Some(job) => process(&fulfillment, &job).await,
                    None => break,
                },
            }
        }

        info!("Fulfillment worker stopped");
    })
}

async fn process(fulfillment: &Fulfillment, job: &FulfillmentJob) {
    match ensure_shipment(fulfillment, job).await {
        Ok(Some(shipping)) => info!(
            order_id = %job.order_id,
            payment_id = %job.payment_id,
            shipping_id = %shipping.id,
            "Shipment created"
        ),
        Ok(None) => debug!(order_id = %job.order_id, "Order already has a shipment"),
        Err(e) => error!(order_id = %job.order_id, error = %e, "Failed to create shipment"),
    }
}

/// Create the shipment unless the order already has one. Redelivered
/// confirmations are no-ops.
pub async fn ensure_shipment(
    fulfillment: &Fulfillment,
    job: &FulfillmentJob,
) -> ServiceResult<Option<Shipping>> {
    fulfillment
        .shipments
        .open_shipment(
            job.order_id,
            &fulfillment.origin,
            Some(format!("Awaiting fulfillment for payment {}", job.payment_id)),
        )
        .await
}
