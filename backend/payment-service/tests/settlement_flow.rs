//! Gateway outcomes settle payments and reach the order service.

use std::sync::Arc;
use std::time::Duration;

use domain_events::persistence::MemoryTable;
use domain_events::{
    EventPipeline, EventType, HookRegistry, MemoryBroker, OrderFlowPublisher, Payment,
    PaymentMethod, PaymentStatus, PaymentTransaction, PipelineSettings, ProducerConfig,
};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use payment_service::services::{
    create_settlement_queue, settlement_handler, spawn_settlement_worker, PaymentService,
};

fn settings() -> PipelineSettings {
    PipelineSettings {
        producer: ProducerConfig {
            linger: Duration::from_millis(5),
            ..ProducerConfig::default()
        },
        ..PipelineSettings::defaults("payment-service")
    }
}

async fn wait_for_status(payments: &MemoryTable<Payment>, id: Uuid, status: PaymentStatus) {
    for _ in 0..200 {
        if payments.get(id).map(|p| p.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("payment {} never reached {}", id, status);
}

#[tokio::test]
async fn test_declined_transaction_fails_payment_with_gateway_reason() {
    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    let mut pipeline = EventPipeline::new(settings(), Arc::new(broker.clone()), hooks.clone())
        .unwrap()
        .with_consumer(Arc::new(broker.consumer("payment-service-group")));

    let payments = Arc::new(MemoryTable::<Payment>::new(hooks.clone()));
    let transactions = Arc::new(MemoryTable::<PaymentTransaction>::new(hooks.clone()));
    let order_flow =
        OrderFlowPublisher::new(pipeline.producer().clone(), pipeline.catalog()).unwrap();
    let service = PaymentService::new(payments.clone(), transactions, order_flow);

    let (sender, receiver) = create_settlement_queue(16);
    let (stop, stop_rx) = watch::channel(false);
    let worker = spawn_settlement_worker(service.clone(), receiver, stop_rx);
    pipeline
        .register_handler(EventType::TransactionStatusChanged, settlement_handler(sender))
        .unwrap();
    pipeline.start().await.unwrap();

    let payment = service
        .create_payment(Uuid::new_v4(), Decimal::new(1999, 2), PaymentMethod::DebitCard)
        .await
        .unwrap();
    let transaction = service
        .record_transaction(payment.id, "stripe", "AUTHORIZED", Some("ch_9".into()), None)
        .await
        .unwrap();
    service
        .update_transaction_status(
            transaction.id,
            "DECLINED",
            Some(json!({"reason": "card declined"})),
        )
        .await
        .unwrap();
    wait_for_status(&payments, payment.id, PaymentStatus::Failed).await;

    pipeline.stop_consuming().await;
    stop.send(true).unwrap();
    worker.await.unwrap();
    pipeline.shutdown().await;

    let failed = broker.records_on("payment-failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key, payment.id.to_string());
    let wire = failed[0].json().unwrap();
    assert_eq!(wire["data"]["reason"], "card declined");
    assert_eq!(wire["data"]["order_id"], payment.order_id.to_string());
    assert!(broker.records_on("payment-confirmed").is_empty());
}

#[tokio::test]
async fn test_captured_transaction_confirms_payment_once() {
    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    let mut pipeline = EventPipeline::new(settings(), Arc::new(broker.clone()), hooks.clone())
        .unwrap()
        .with_consumer(Arc::new(broker.consumer("payment-service-group")));

    let payments = Arc::new(MemoryTable::<Payment>::new(hooks.clone()));
    let transactions = Arc::new(MemoryTable::<PaymentTransaction>::new(hooks.clone()));
    let order_flow =
        OrderFlowPublisher::new(pipeline.producer().clone(), pipeline.catalog()).unwrap();
    let service = PaymentService::new(payments.clone(), transactions, order_flow);

    let (sender, receiver) = create_settlement_queue(16);
    let (stop, stop_rx) = watch::channel(false);
    let worker = spawn_settlement_worker(service.clone(), receiver, stop_rx);
    pipeline
        .register_handler(EventType::TransactionStatusChanged, settlement_handler(sender))
        .unwrap();
    pipeline.start().await.unwrap();

    let payment = service
        .create_payment(Uuid::new_v4(), Decimal::new(4200, 2), PaymentMethod::CreditCard)
        .await
        .unwrap();
    let transaction = service
        .record_transaction(payment.id, "adyen", "AUTHORIZED", None, None)
        .await
        .unwrap();
    service
        .update_transaction_status(transaction.id, "CAPTURED", None)
        .await
        .unwrap();
    wait_for_status(&payments, payment.id, PaymentStatus::Completed).await;

    // The gateway reports the capture again.
    service
        .update_transaction_status(transaction.id, "SETTLED", None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    pipeline.stop_consuming().await;
    stop.send(true).unwrap();
    worker.await.unwrap();
    pipeline.shutdown().await;

    let confirmed = broker.records_on("payment-confirmed");
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].json().unwrap()["data"]["status"], "COMPLETED");
    assert_eq!(broker.records_on("payment-status-changed").len(), 1);
}
