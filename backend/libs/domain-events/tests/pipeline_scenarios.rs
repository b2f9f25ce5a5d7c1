//! End-to-end pipeline behaviour over the in-memory broker and table.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use domain_events::broker::{MemoryBroker, OutboundMessage, StoredRecord};
use domain_events::interceptor::register_interceptors;
use domain_events::persistence::MemoryTable;
use domain_events::{
    AsyncProducer, BrokerTransport, CommitEvent, CommitHook, DomainEvent, Enqueue, Entity,
    EventPipeline, EventResult, EventType, HookAction, HookRegistry, Invoice, OverflowPolicy, Payment, PaymentMethod, PaymentStatus,
    PipelineMetrics, PipelineSettings, ProducerConfig, Reconciler, SeenEntities,
    ShipmentTracking, Shipping, ShippingStatus, TransportError,
};

const PAYMENT_ID: &str = "11111111-1111-1111-1111-111111111111";
const ORDER_ID: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";

fn fast_producer() -> ProducerConfig {
    ProducerConfig {
        linger: Duration::from_millis(5),
        retry_backoff: Duration::from_millis(1),
        ..ProducerConfig::default()
    }
}

fn pipeline(broker: &MemoryBroker, hooks: &Arc<HookRegistry>) -> EventPipeline {
    let settings = PipelineSettings {
        producer: fast_producer(),
        ..PipelineSettings::defaults("scenario-test")
    };
    EventPipeline::new(settings, Arc::new(broker.clone()), hooks.clone()).unwrap()
}

fn scenario_payment() -> Payment {
    Payment {
        id: Uuid::parse_str(PAYMENT_ID).unwrap(),
        order_id: Uuid::parse_str(ORDER_ID).unwrap(),
        amount: Decimal::from_str("42.00").unwrap(),
        method: PaymentMethod::CreditCard,
        ..Payment::new(Uuid::nil(), Decimal::ZERO, PaymentMethod::CreditCard)
    }
}

fn topics(records: &[StoredRecord]) -> Vec<&str> {
    records.iter().map(|r| r.topic.as_str()).collect()
}

fn data(record: &StoredRecord) -> serde_json::Value {
    record.json().unwrap()["data"].clone()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_payment_status_change_emits_three_ordered_messages() {
    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    let pipeline = pipeline(&broker, &hooks);
    let payments = MemoryTable::<Payment>::new(hooks.clone());

    let payment = payments.insert(scenario_payment()).await.unwrap();
    payments
        .modify(payment.id, |p| p.status = PaymentStatus::Completed)
        .await
        .unwrap();
    assert_eq!(pipeline.shutdown().await, 0);

    let records = broker.records();
    assert_eq!(
        topics(&records),
        vec!["payment-created", "payment-updated", "payment-status-changed"]
    );
    assert!(records.iter().all(|r| r.key == PAYMENT_ID));

    assert_eq!(data(&records[0])["status"], "PENDING");
    assert_eq!(data(&records[1])["status"], "COMPLETED");
    assert_eq!(data(&records[2])["status"], "COMPLETED");
    assert_eq!(data(&records[2])["old_status"], "PENDING");

    let envelope = records[2].json().unwrap();
    assert_eq!(envelope["type"], "PAYMENT_STATUS_CHANGED");
    assert_eq!(envelope["payment_id"], PAYMENT_ID);
}

/// Holds up the first update it sees.
#[derive(Default)]
struct SlowFirstUpdate(AtomicBool);

#[async_trait]
impl CommitHook for SlowFirstUpdate {
    async fn on_commit(&self, _event: &CommitEvent) -> EventResult<()> {
        if !self.0.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_changes_publish_in_commit_order_behind_slow_hook() {
    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    // Registered before the pipeline so it runs ahead of the interceptors.
    hooks.register(
        "slow:after_update",
        HookAction::AfterUpdate,
        Arc::new(SlowFirstUpdate::default()),
    );
    let pipeline = pipeline(&broker, &hooks);
    let payments = Arc::new(MemoryTable::<Payment>::new(hooks.clone()));
    let id = payments.insert(scenario_payment()).await.unwrap().id;

    let completed = {
        let payments = payments.clone();
        tokio::spawn(async move {
            payments
                .modify(id, |p| p.status = PaymentStatus::Completed)
                .await
                .unwrap();
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let failed = {
        let payments = payments.clone();
        tokio::spawn(async move {
            payments
                .modify(id, |p| p.status = PaymentStatus::Failed)
                .await
                .unwrap();
        })
    };
    completed.await.unwrap();
    failed.await.unwrap();
    pipeline.shutdown().await;

    let transitions: Vec<(serde_json::Value, serde_json::Value)> = broker
        .records_on("payment-status-changed")
        .iter()
        .map(|r| (data(r)["old_status"].clone(), data(r)["status"].clone()))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (json!("PENDING"), json!("COMPLETED")),
            (json!("COMPLETED"), json!("FAILED")),
        ]
    );
    assert_eq!(hooks.sequenced_rows(), 0);
}

#[tokio::test]
async fn test_invoice_due_date_change() {
    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    let pipeline = pipeline(&broker, &hooks);
    let invoices = MemoryTable::<Invoice>::new(hooks.clone());

    let invoice = invoices
        .insert(Invoice {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            payment_id: Uuid::new_v4(),
            invoice_number: "INV-20250101-0A1B2C3D".to_string(),
            issue_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(),
        })
        .await
        .unwrap();
    invoices
        .modify(invoice.id, |i| {
            i.due_date = NaiveDate::from_ymd_opt(2025, 2, 28).unwrap()
        })
        .await
        .unwrap();
    pipeline.shutdown().await;

    let records = broker.records();
    assert_eq!(
        topics(&records),
        vec!["invoice-created", "invoice-updated", "invoice-due-date-changed"]
    );
    assert_eq!(data(&records[2])["due_date"], "2025-02-28");
    assert_eq!(data(&records[2])["old_due_date"], "2025-01-30");
    assert!(records.iter().all(|r| r.key == invoice.id.to_string()));
}

#[tokio::test]
async fn test_shipping_lifecycle() {
    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    let pipeline = pipeline(&broker, &hooks);
    let shippings = MemoryTable::<Shipping>::new(hooks.clone());

    let shipping = shippings.insert(Shipping::new(Uuid::new_v4())).await.unwrap();
    shippings
        .modify(shipping.id, |s| s.transition(ShippingStatus::Shipped))
        .await
        .unwrap();
    shippings
        .modify(shipping.id, |s| s.transition(ShippingStatus::Delivered))
        .await
        .unwrap();
    pipeline.shutdown().await;

    // One create, two updates and one status change per update. A create
    // emits no generic update, so the lifecycle yields five records.
    let records = broker.records();
    assert_eq!(
        topics(&records),
        vec![
            "shipping-created",
            "shipping-updated",
            "shipping-status-changed",
            "shipping-updated",
            "shipping-status-changed",
        ]
    );

    let transitions: Vec<(serde_json::Value, serde_json::Value)> = records
        .iter()
        .filter(|r| r.topic == "shipping-status-changed")
        .map(|r| (data(r)["old_status"].clone(), data(r)["status"].clone()))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (json!("PENDING"), json!("SHIPPED")),
            (json!("SHIPPED"), json!("DELIVERED")),
        ]
    );
}

#[tokio::test]
async fn test_tracking_entries_keyed_by_own_id() {
    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    let pipeline = pipeline(&broker, &hooks);
    let trackings = MemoryTable::<ShipmentTracking>::new(hooks.clone());

    let shipping_id = Uuid::new_v4();
    let mut ids = Vec::new();
    for location in ["Rotterdam", "Antwerp", "Lyon"] {
        let entry = trackings
            .insert(ShipmentTracking::new(shipping_id, location, "IN_TRANSIT"))
            .await
            .unwrap();
        ids.push(entry.id.to_string());
    }
    pipeline.shutdown().await;

    // Distinct keys may be delivered in any order.
    let records = broker.records_on("tracking-created");
    let mut keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
    keys.sort();
    ids.sort();
    assert_eq!(keys, ids);
    for record in &records {
        let envelope = record.json().unwrap();
        assert_eq!(envelope["tracking_id"], record.key.as_str());
        assert_eq!(envelope["shipping_id"], shipping_id.to_string());
    }
}

#[tokio::test]
async fn test_consumer_dispatches_in_publish_order() {
    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    let mut pipeline =
        pipeline(&broker, &hooks).with_consumer(Arc::new(broker.consumer("dispatch-test")));

    let calls: Arc<Mutex<Vec<(EventType, Uuid)>>> = Arc::new(Mutex::new(Vec::new()));
    for event_type in [EventType::PaymentStatusChanged, EventType::PaymentCreated] {
        let calls = calls.clone();
        pipeline
            .register_handler(event_type, move |event: &DomainEvent| {
                calls.lock().push((event.event_type(), event.subject_id()));
                Ok(())
            })
            .unwrap();
    }
    pipeline.start().await.unwrap();

    let payments = MemoryTable::<Payment>::new(hooks.clone());
    let payment = payments.insert(scenario_payment()).await.unwrap();
    payments
        .modify(payment.id, |p| p.status = PaymentStatus::Completed)
        .await
        .unwrap();

    wait_until(|| calls.lock().len() >= 2).await;
    pipeline.shutdown().await;

    assert_eq!(
        *calls.lock(),
        vec![
            (EventType::PaymentCreated, payment.id),
            (EventType::PaymentStatusChanged, payment.id),
        ]
    );
}

#[tokio::test]
async fn test_reconciliation_republishes_rows_lost_in_crash_window() {
    let broker = MemoryBroker::default();

    // Rows committed by a process that died before publishing.
    let crashed_hooks = Arc::new(HookRegistry::new());
    let payments = MemoryTable::<Payment>::new(crashed_hooks);
    let lost = payments
        .insert(Payment::new(Uuid::new_v4(), Decimal::new(1999, 2), PaymentMethod::Points))
        .await
        .unwrap();
    let delivered = payments.insert(scenario_payment()).await.unwrap();
    assert!(broker.records().is_empty());

    // The downstream consumer saw only one of them.
    let seen = SeenEntities::new();
    let observed: DomainEvent = domain_events::PaymentEvent::new(
        EventType::PaymentCreated,
        delivered.id,
        delivered.projection().unwrap(),
    )
    .unwrap()
    .into();
    seen.record(&observed);

    let hooks = Arc::new(HookRegistry::new());
    let pipeline = pipeline(&broker, &hooks);
    let report = Reconciler::new(&seen)
        .republish_unseen(&payments, &pipeline.publishers().payment)
        .await
        .unwrap();
    pipeline.shutdown().await;

    assert_eq!(report.scanned, 2);
    assert_eq!(report.republished, 1);
    let records = broker.records();
    assert_eq!(topics(&records), vec!["payment-created"]);
    assert_eq!(records[0].key, lost.id.to_string());
}

#[tokio::test]
async fn test_repeated_interceptor_registration_is_idempotent() {
    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    let pipeline = pipeline(&broker, &hooks);
    for _ in 0..3 {
        register_interceptors(&hooks, pipeline.publishers());
    }
    assert_eq!(hooks.len(), 15);

    let payments = MemoryTable::<Payment>::new(hooks.clone());
    let payment = payments.insert(scenario_payment()).await.unwrap();
    payments.delete(payment.id).await.unwrap();
    pipeline.shutdown().await;

    assert_eq!(
        topics(&broker.records()),
        vec!["payment-created", "payment-deleted"]
    );
}

#[tokio::test]
async fn test_update_without_tracked_change_emits_only_updated() {
    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    let pipeline = pipeline(&broker, &hooks);
    let payments = MemoryTable::<Payment>::new(hooks.clone());

    let payment = payments.insert(scenario_payment()).await.unwrap();
    payments
        .modify(payment.id, |p| p.amount = Decimal::from_str("43.50").unwrap())
        .await
        .unwrap();
    pipeline.shutdown().await;

    assert_eq!(
        topics(&broker.records()),
        vec!["payment-created", "payment-updated"]
    );
}

#[tokio::test]
async fn test_envelope_data_round_trips_to_projection() {
    let broker = MemoryBroker::default();
    let hooks = Arc::new(HookRegistry::new());
    let pipeline = pipeline(&broker, &hooks);
    let payments = MemoryTable::<Payment>::new(hooks.clone());

    let payment = payments.insert(scenario_payment()).await.unwrap();
    let completed = payments
        .modify(payment.id, |p| p.status = PaymentStatus::Completed)
        .await
        .unwrap();
    pipeline.shutdown().await;

    let records = broker.records();
    let created = DomainEvent::decode(domain_events::EventFamily::Payment, &records[0].value).unwrap();
    assert_eq!(created.data(), &payment.projection().unwrap());

    let changed = DomainEvent::decode(domain_events::EventFamily::Payment, &records[2].value).unwrap();
    let mut expected = completed.projection().unwrap();
    expected.insert("old_status".to_string(), json!("PENDING"));
    assert_eq!(changed.data(), &expected);
}

/// Accepts the first send and never completes it.
struct StalledTransport;

#[async_trait]
impl BrokerTransport for StalledTransport {
    async fn send(&self, _message: &OutboundMessage) -> Result<(), TransportError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_full_buffer_with_drop_policy_drops_without_error() {
    let producer = AsyncProducer::new(
        Arc::new(StalledTransport),
        ProducerConfig {
            buffer_capacity: 1,
            overflow: OverflowPolicy::Drop,
            batch_size: 1,
            ..fast_producer()
        },
        PipelineMetrics::new("drop-test"),
    );

    let mut outcomes = Vec::new();
    for i in 0..5 {
        outcomes.push(producer.publish("payment-created", "k", vec![i]).await);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(outcomes[0], Enqueue::Accepted);
    assert!(outcomes.contains(&Enqueue::Dropped));
    assert!(producer.metrics().dropped.get() >= 1);
    assert!(producer.close_within(Duration::from_millis(20)).await >= 1);
}

#[test]
fn test_handlers_rejected_after_start() {
    tokio_test::block_on(async {
        let broker = MemoryBroker::default();
        let hooks = Arc::new(HookRegistry::new());
        let mut pipeline =
            pipeline(&broker, &hooks).with_consumer(Arc::new(broker.consumer("late-handler")));
        pipeline.start().await.unwrap();

        let late = pipeline.register_handler(EventType::ShippingCreated, |_| Ok(()));
        assert!(matches!(late, Err(domain_events::SubscriberError::AlreadyStarted)));
        pipeline.shutdown().await;
    });
}
