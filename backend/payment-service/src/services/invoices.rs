//! Invoice auto-generation.
//!
//! A payment entering `COMPLETED` or `REFUNDED` gets exactly one invoice.
//! The local handler on `PAYMENT_STATUS_CHANGED` only enqueues a job; a
//! worker task drains the bounded queue and writes the invoice, so the
//! publishing path never waits on the database.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use domain_events::persistence::MemoryTable;
use domain_events::{DomainEvent, HandlerResult, Invoice, Payment, PaymentStatus};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ServiceResult;

/// Storage the worker needs.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn find_by_payment(&self, payment_id: Uuid) -> ServiceResult<Option<Invoice>>;
    async fn create(&self, invoice: &Invoice) -> ServiceResult<Invoice>;
}

#[async_trait]
impl InvoiceStore for MemoryTable<Invoice> {
    async fn find_by_payment(&self, payment_id: Uuid) -> ServiceResult<Option<Invoice>> {
        Ok(self.all().into_iter().find(|i| i.payment_id == payment_id))
    }

    async fn create(&self, invoice: &Invoice) -> ServiceResult<Invoice> {
        Ok(self.insert(invoice.clone()).await?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceJob {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub status: PaymentStatus,
}

pub type InvoiceSender = mpsc::Sender<InvoiceJob>;
pub type InvoiceReceiver = mpsc::Receiver<InvoiceJob>;

pub fn create_invoice_queue(capacity: usize) -> (InvoiceSender, InvoiceReceiver) {
    mpsc::channel(capacity.max(1))
}

/// `INV-{yyyymmdd}-{first 8 hex digits of the payment id}`.
pub fn invoice_number(issue_date: NaiveDate, payment_id: Uuid) -> String {
    let simple = payment_id.simple().to_string().to_uppercase();
    format!("INV-{}-{}", issue_date.format("%Y%m%d"), &simple[..8])
}

pub fn build_invoice(job: &InvoiceJob, issue_date: NaiveDate, payment_terms_days: i64) -> Invoice {
    Invoice {
        id: Uuid::new_v4(),
        order_id: job.order_id,
        payment_id: job.payment_id,
        invoice_number: invoice_number(issue_date, job.payment_id),
        issue_date,
        due_date: issue_date + Duration::days(payment_terms_days),
    }
}

fn is_invoiced(status: PaymentStatus) -> bool {
    matches!(status, PaymentStatus::Completed | PaymentStatus::Refunded)
}

/// Local handler for `PAYMENT_STATUS_CHANGED`.
pub fn invoice_job_handler(
    sender: InvoiceSender,
) -> impl Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static {
    move |event: &DomainEvent| {
        let Some(status) = event
            .data_str("status")
            .and_then(|s| s.parse::<PaymentStatus>().ok())
        else {
            warn!(payment_id = %event.subject_id(), "Status change without a readable status");
            return Ok(());
        };
        if !is_invoiced(status) {
            return Ok(());
        }
        let order_id = event
            .data_uuid("order_id")
            .ok_or_else(|| anyhow::anyhow!("payment {} has no order_id", event.subject_id()))?;

        sender
            .try_send(InvoiceJob {
                payment_id: event.subject_id(),
                order_id,
                status,
            })
            .map_err(|e| anyhow::anyhow!("invoice queue rejected job: {}", e))
    }
}

/// Drain the queue until it closes or `shutdown` flips; jobs already queued
/// at shutdown are still processed.
pub fn spawn_invoice_worker(
    store: Arc<dyn InvoiceStore>,
    mut receiver: InvoiceReceiver,
    mut shutdown: watch::Receiver<bool>,
    payment_terms_days: i64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Invoice worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    receiver.close();
                    while let Some(job) = receiver.recv().await {
                        process(store.as_ref(), &job, payment_terms_days).await;
                    }
                    break;
                }
                job = receiver.recv() => match job {
                    Some(job) => process(store.as_ref(), &job, payment_terms_days).await,
                    None => break,
                },
            }
        }

        info!("Invoice worker stopped");
    })
}

async fn process(store: &dyn InvoiceStore, job: &InvoiceJob, payment_terms_days: i64) {
    match generate(store, job, payment_terms_days).await {
        Ok(Some(invoice)) => info!(
            payment_id = %job.payment_id,
            invoice_number = %invoice.invoice_number,
            status = %job.status,
            "Invoice generated"
        ),
        Ok(None) => debug!(payment_id = %job.payment_id, "Invoice already exists"),
        Err(e) => error!(payment_id = %job.payment_id, error = %e, "Failed to generate invoice"),
    }
}

/// Queue jobs for settled payments that have no invoice yet. Covers status
/// changes committed by a process that stopped before its worker ran.
pub async fn backfill(
    payments: &[Payment],
    store: &dyn InvoiceStore,
    sender: &InvoiceSender,
) -> ServiceResult<usize> {
    let mut queued = 0;
    for payment in payments.iter().filter(|p| is_invoiced(p.status)) {
        if store.find_by_payment(payment.id).await?.is_some() {
            continue;
        }
        let job = InvoiceJob {
            payment_id: payment.id,
            order_id: payment.order_id,
            status: payment.status,
        };
        if sender.send(job).await.is_err() {
            warn!("Invoice queue closed during backfill");
            break;
        }
        queued += 1;
    }
    if queued > 0 {
        info!(queued, "Queued missing invoices");
    }
    Ok(queued)
}

/// Create the invoice unless the payment already has one.
pub async fn generate(
    store: &dyn InvoiceStore,
    job: &InvoiceJob,
    payment_terms_days: i64,
) -> ServiceResult<Option<Invoice>> {
    if store.find_by_payment(job.payment_id).await?.is_some() {
        return Ok(None);
    }
    let invoice = build_invoice(job, Utc::now().date_naive(), payment_terms_days);
    store.create(&invoice).await.map(Some)
}
