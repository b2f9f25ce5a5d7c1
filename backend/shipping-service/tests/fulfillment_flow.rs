//! Payment confirmations from the payment service create shipments.

use std::sync::Arc;
use std::time::Duration;

use domain_events::persistence::MemoryTable;
use domain_events::{
    EventPipeline, EventType, HookRegistry, MemoryBroker, OrderFlowPublisher, Payment,
    PaymentMethod, PaymentStatus, PipelineSettings, ProducerConfig, ShipmentTracking, Shipping,
};
use rust_decimal::Decimal;
use tokio::sync::watch;
use uuid::Uuid;

use shipping_service::services::{
    create_fulfillment_queue, fulfillment_handler, spawn_fulfillment_worker, Fulfillment,
    ShippingService,
};

fn settings(service: &str) -> PipelineSettings {
    PipelineSettings {
        producer: ProducerConfig {
            linger: Duration::from_millis(5),
            ..ProducerConfig::default()
        },
        ..PipelineSettings::defaults(service)
    }
}

async fn wait_for_shipments(shipments: &MemoryTable<Shipping>, count: usize) {
    for _ in 0..200 {
        if shipments.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} shipments, found {}", count, shipments.len());
}

#[tokio::test]
async fn test_confirmed_payment_creates_one_shipment() {
    let broker = MemoryBroker::default();

    // Payment side publishes order-flow events.
    let payment_pipeline = EventPipeline::new(
        settings("payment-service"),
        Arc::new(broker.clone()),
        Arc::new(HookRegistry::new()),
    )
    .unwrap();
    let order_flow = OrderFlowPublisher::new(
        payment_pipeline.producer().clone(),
        payment_pipeline.catalog(),
    )
    .unwrap();

    // Shipping side consumes them.
    let hooks = Arc::new(HookRegistry::new());
    let mut pipeline = EventPipeline::new(
        settings("shipping-service"),
        Arc::new(broker.clone()),
        hooks.clone(),
    )
    .unwrap()
    .with_consumer(Arc::new(broker.consumer("shipping-service-group")));

    let shipments = Arc::new(MemoryTable::<Shipping>::new(hooks.clone()));
    let tracking = Arc::new(MemoryTable::<ShipmentTracking>::new(hooks.clone()));
    let (sender, receiver) = create_fulfillment_queue(16);
    let (stop, stop_rx) = watch::channel(false);
    let worker = spawn_fulfillment_worker(
        Fulfillment {
            shipments: ShippingService::new(shipments.clone(), tracking.clone()),
            origin: "warehouse".to_string(),
        },
        receiver,
        stop_rx,
    );
    pipeline
        .register_handler(EventType::PaymentConfirmed, fulfillment_handler(sender))
        .unwrap();
    pipeline.start().await.unwrap();

    let mut payment = Payment::new(Uuid::new_v4(), Decimal::new(4200, 2), PaymentMethod::CreditCard);
    payment.status = PaymentStatus::Completed;
    order_flow.publish_confirmed(&payment).await.unwrap();
    wait_for_shipments(&shipments, 1).await;

    // A redelivered confirmation does not create a second shipment.
    order_flow.publish_confirmed(&payment).await.unwrap();
    payment_pipeline.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    pipeline.stop_consuming().await;
    stop.send(true).unwrap();
    worker.await.unwrap();
    pipeline.shutdown().await;

    let all = shipments.all();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].order_id, payment.order_id);
    assert_eq!(tracking.len(), 1);

    let created = broker.records_on("shipping-created");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].key, all[0].id.to_string());
    let wire = created[0].json().unwrap();
    assert_eq!(wire["data"]["order_id"], payment.order_id.to_string());
    assert_eq!(wire["data"]["status"], "PENDING");
    assert_eq!(broker.records_on("tracking-created").len(), 1);
}

#[tokio::test]
async fn test_disabled_consumer_rejects_fulfillment_handler() {
    let broker = MemoryBroker::default();
    let mut pipeline = EventPipeline::new(
        settings("shipping-service"),
        Arc::new(broker),
        Arc::new(HookRegistry::new()),
    )
    .unwrap();
    let (sender, _receiver) = create_fulfillment_queue(1);

    assert!(matches!(
        pipeline.register_handler(EventType::PaymentConfirmed, fulfillment_handler(sender)),
        Err(domain_events::SubscriberError::Disabled)
    ));
    pipeline.shutdown().await;
}
