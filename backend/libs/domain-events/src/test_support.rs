use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::broker::MemoryBroker;
use crate::metrics::PipelineMetrics;
use crate::models::{Invoice, Payment, PaymentMethod};
use crate::producer::{AsyncProducer, ProducerConfig};

pub(crate) fn fast_producer_config() -> ProducerConfig {
    ProducerConfig {
        linger: Duration::from_millis(5),
        retry_backoff: Duration::from_millis(1),
        ..ProducerConfig::default()
    }
}

pub(crate) fn memory_producer(broker: &MemoryBroker) -> AsyncProducer {
    AsyncProducer::new(
        Arc::new(broker.clone()),
        fast_producer_config(),
        PipelineMetrics::new("unit-test"),
    )
}

pub(crate) fn payment(amount: &str, method: PaymentMethod) -> Payment {
    Payment::new(Uuid::new_v4(), Decimal::from_str(amount).unwrap(), method)
}

pub(crate) fn invoice(due_date: &str) -> Invoice {
    Invoice {
        id: Uuid::new_v4(),
        order_id: Uuid::new_v4(),
        payment_id: Uuid::new_v4(),
        invoice_number: "INV-TEST-0001".to_string(),
        issue_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
        due_date: NaiveDate::parse_from_str(due_date, "%Y-%m-%d").unwrap(),
    }
}
