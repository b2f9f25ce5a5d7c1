//! Repository-backed flows. Run with `DATABASE_URL` set and `--ignored`.

use std::sync::Arc;

use domain_events::{
    EventPipeline, HookRegistry, MemoryBroker, PipelineSettings, Shipping, ShippingStatus,
};
use sqlx::PgPool;
use uuid::Uuid;

use shipping_service::db::{self, ShippingRepository, TrackingRepository};
use shipping_service::error::ServiceError;
use shipping_service::services::ShippingService;

async fn setup() -> (ShippingService, ShippingRepository, EventPipeline, MemoryBroker) {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.unwrap();
    db::migrate(&pool).await.unwrap();

    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    let pipeline = EventPipeline::new(
        PipelineSettings::defaults("shipping-service"),
        Arc::new(broker.clone()),
        hooks.clone(),
    )
    .unwrap();
    let shippings = ShippingRepository::new(pool.clone(), hooks.clone());
    let service = ShippingService::new(
        Arc::new(shippings.clone()),
        Arc::new(TrackingRepository::new(pool, hooks)),
    );
    (service, shippings, pipeline, broker)
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_status_update_publishes_status_change_and_tracking() {
    let (service, shippings, pipeline, broker) = setup().await;

    let shipping = shippings.create(&Shipping::new(Uuid::new_v4())).await.unwrap();
    let shipped = service
        .update_status(shipping.id, ShippingStatus::Shipped, "Rotterdam", None)
        .await
        .unwrap();
    pipeline.shutdown().await;

    assert!(shipped.shipped_at.is_some());
    let key = shipping.id.to_string();
    let changed = broker.records_on("shipping-status-changed");
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].key, key);
    let wire = changed[0].json().unwrap();
    assert_eq!(wire["data"]["old_status"], "PENDING");
    assert_eq!(wire["data"]["status"], "SHIPPED");

    let tracking = broker.records_on("tracking-created");
    assert_eq!(tracking.len(), 1);
    assert_eq!(tracking[0].json().unwrap()["data"]["shipping_id"], key);
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_carrier_assignment_moves_to_preparing() {
    let (service, shippings, pipeline, _broker) = setup().await;

    let shipping = shippings.create(&Shipping::new(Uuid::new_v4())).await.unwrap();
    let prepared = service
        .assign_carrier(shipping.id, "DHL", "JD014600006281230704", None)
        .await
        .unwrap();
    pipeline.shutdown().await;

    assert_eq!(prepared.status, ShippingStatus::Preparing);
    assert_eq!(prepared.carrier.as_deref(), Some("DHL"));
}

#[tokio::test]
#[ignore = "Requires PostgreSQL database"]
async fn test_tracking_for_unknown_shipment_is_not_found() {
    let (service, _shippings, pipeline, broker) = setup().await;

    let result = service
        .record_tracking(Uuid::new_v4(), "Lyon", "IN_TRANSIT", None)
        .await;
    pipeline.shutdown().await;

    assert!(matches!(result, Err(ServiceError::NotFound(_))));
    assert!(broker.records_on("tracking-created").is_empty());
}
