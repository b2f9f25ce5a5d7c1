//! Payment settlement from gateway outcomes.
//!
//! The consumer's `TRANSACTION_STATUS_CHANGED` handler maps the gateway's
//! free-form status to a payment status and enqueues a job; a worker drains
//! the bounded queue and settles the payment through [`PaymentService`], which
//! publishes the order-flow event.

use domain_events::{DomainEvent, HandlerResult, PaymentStatus};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::payments::PaymentService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementJob {
    pub payment_id: Uuid,
    pub transaction_id: Uuid,
    pub status: PaymentStatus,
    pub reason: Option<String>,
}

pub type SettlementSender = mpsc::Sender<SettlementJob>;
pub type SettlementReceiver = mpsc::Receiver<SettlementJob>;

pub fn create_settlement_queue(capacity: usize) -> (SettlementSender, SettlementReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Payment status a gateway status settles to. Intermediate gateway states
/// (`AUTHORIZED`, `PENDING`, ...) settle nothing.
pub fn gateway_outcome(gateway_status: &str) -> Option<PaymentStatus> {
    match gateway_status.trim().to_ascii_uppercase().as_str() {
        "CAPTURED" | "SUCCEEDED" | "SETTLED" | "COMPLETED" => Some(PaymentStatus::Completed),
        "DECLINED" | "FAILED" | "REJECTED" | "ERROR" => Some(PaymentStatus::Failed),
        "REFUNDED" => Some(PaymentStatus::Refunded),
        "PARTIALLY_REFUNDED" => Some(PaymentStatus::PartiallyRefunded),
        _ => None,
    }
}

/// Failure text the gateway put in its response payload, if any.
fn gateway_reason(event: &DomainEvent) -> Option<String> {
    let payload = event.data().get("response_payload")?;
    ["reason", "message", "error"]
        .iter()
        .find_map(|field| payload.get(*field).and_then(Value::as_str))
        .map(str::to_string)
}

/// Subscriber handler for `TRANSACTION_STATUS_CHANGED`.
pub fn settlement_handler(
    sender: SettlementSender,
) -> impl Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static {
    move |event: &DomainEvent| {
        let Some(status) = event.data_str("status").and_then(gateway_outcome) else {
            return Ok(());
        };
        let payment_id = event.data_uuid("payment_id").ok_or_else(|| {
            anyhow::anyhow!("transaction {} has no payment_id", event.subject_id())
        })?;

        sender
            .try_send(SettlementJob {
                payment_id,
                transaction_id: event.subject_id(),
                status,
                reason: gateway_reason(event),
            })
            .map_err(|e| anyhow::anyhow!("settlement queue rejected job: {}", e))
    }
}

/// Drain the queue until it closes or `shutdown` flips; jobs already queued
/// at shutdown are still processed.
pub fn spawn_settlement_worker(
    service: PaymentService,
    mut receiver: SettlementReceiver,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Settlement worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    receiver.close();
                    while let Some(job) = receiver.recv().await {
                        process(&service, &job).await;
                    }
                    break;
                }
                job = receiver.recv() => match job {
                    Some(job) => process(&service, &job).await,
                    None => break,
                },
            }
        }

        info!("Settlement worker stopped");
    })
}

async fn process(service: &PaymentService, job: &SettlementJob) {
    match service
        .settle(job.payment_id, job.status, job.reason.as_deref())
        .await
    {
        Ok(Some(payment)) => info!(
            payment_id = %payment.id,
            transaction_id = %job.transaction_id,
            status = %payment.status,
            "Payment settled"
        ),
        Ok(None) => debug!(payment_id = %job.payment_id, "Payment already settled"),
        Err(e) => error!(
            payment_id = %job.payment_id,
            transaction_id = %job.transaction_id,
            error = %e,
            "Failed to settle payment"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain_events::{EventData, EventType, TransactionEvent};
    use serde_json::json;

    fn status_changed(status: &str, payload: Option<Value>) -> DomainEvent {
        let mut data = EventData::new();
        data.insert("payment_id".into(), json!(Uuid::new_v4().to_string()));
        data.insert("status".into(), json!(status));
        data.insert("old_status".into(), json!("AUTHORIZED"));
        data.insert("response_payload".into(), payload.unwrap_or(Value::Null));
        TransactionEvent::new(EventType::TransactionStatusChanged, Uuid::new_v4(), data)
            .unwrap()
            .into()
    }

    #[test]
    fn test_gateway_outcome() {
        assert_eq!(gateway_outcome("captured"), Some(PaymentStatus::Completed));
        assert_eq!(gateway_outcome("DECLINED"), Some(PaymentStatus::Failed));
        assert_eq!(gateway_outcome(" Refunded "), Some(PaymentStatus::Refunded));
        assert_eq!(gateway_outcome("AUTHORIZED"), None);
    }

    #[test]
    fn test_handler_enqueues_decline_with_gateway_reason() {
        let (sender, mut receiver) = create_settlement_queue(4);
        let handler = settlement_handler(sender);

        let event = status_changed("DECLINED", Some(json!({"message": "insufficient funds"})));
        handler(&event).unwrap();

        let job = receiver.try_recv().unwrap();
        assert_eq!(job.status, PaymentStatus::Failed);
        assert_eq!(job.transaction_id, event.subject_id());
        assert_eq!(Some(job.payment_id), event.data_uuid("payment_id"));
        assert_eq!(job.reason.as_deref(), Some("insufficient funds"));
    }

    #[test]
    fn test_handler_ignores_intermediate_status() {
        let (sender, mut receiver) = create_settlement_queue(4);
        let handler = settlement_handler(sender);

        handler(&status_changed("AUTHORIZED", None)).unwrap();
        assert!(receiver.try_recv().is_err());
    }
}
