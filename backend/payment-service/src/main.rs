use std::sync::Arc;

use anyhow::{Context, Result};
use domain_events::{
    shutdown_signal, EventPipeline, EventType, HookRegistry, OrderFlowPublisher, SubscriberError,
};
use tokio::sync::watch;
use tracing::{error, info};

use payment_service::config::ServiceConfig;
use payment_service::db::{self, InvoiceRepository, PaymentRepository, TransactionRepository};
use payment_service::services::invoices::backfill;
use payment_service::services::{
    create_invoice_queue, create_settlement_queue, invoice_job_handler, settlement_handler,
    spawn_invoice_worker, spawn_settlement_worker, PaymentService,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "payment_service=info,domain_events=info,info".into()),
        )
        .with_target(false)
        .json()
        .init();

    info!("Starting payment-service");

    let config = ServiceConfig::load().context("Failed to load configuration")?;
    info!(
        brokers = %config.pipeline.catalog.bootstrap_servers(),
        group = %config.pipeline.catalog.group_id(),
        "Configuration loaded"
    );

    let pool = db::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    db::migrate(&pool)
        .await
        .context("Failed to run database migrations")?;

    // One hook registry for this process's persistence session.
    let hooks = Arc::new(HookRegistry::new());
    let mut pipeline = EventPipeline::connect_kafka(config.pipeline.clone(), hooks.clone())
        .context("Failed to assemble event pipeline")?;

    let payments = Arc::new(PaymentRepository::new(pool.clone(), hooks.clone()));
    let transactions = Arc::new(TransactionRepository::new(pool.clone(), hooks.clone()));
    let invoices = Arc::new(InvoiceRepository::new(pool.clone(), hooks.clone()));
    let order_flow = OrderFlowPublisher::new(pipeline.producer().clone(), pipeline.catalog())
        .context("Failed to resolve order-flow topics")?;
    let payment_service = PaymentService::new(payments.clone(), transactions, order_flow);

    let (invoice_tx, invoice_rx) = create_invoice_queue(config.invoices.queue_capacity);
    let (worker_shutdown, worker_shutdown_rx) = watch::channel(false);
    let invoice_worker = spawn_invoice_worker(
        invoices.clone(),
        invoice_rx,
        worker_shutdown_rx,
        config.invoices.payment_terms_days,
    );
    pipeline.publishers().payment.register_local_handler(
        EventType::PaymentStatusChanged,
        invoice_job_handler(invoice_tx.clone()),
    );

    let (settlement_tx, settlement_rx) = create_settlement_queue(config.settlement.queue_capacity);
    let (settlement_shutdown, settlement_shutdown_rx) = watch::channel(false);
    let settlement_worker =
        spawn_settlement_worker(payment_service, settlement_rx, settlement_shutdown_rx);
    match pipeline.register_handler(
        EventType::TransactionStatusChanged,
        settlement_handler(settlement_tx),
    ) {
        Ok(()) => {}
        Err(SubscriberError::Disabled) => {
            info!("Consumer disabled; payments will not settle from gateway outcomes")
        }
        Err(e) => return Err(e).context("Failed to register transaction handler"),
    }

    let settled = payments.list().await.context("Failed to list payments")?;
    backfill(&settled, invoices.as_ref(), &invoice_tx)
        .await
        .context("Failed to backfill invoices")?;
    info!("Payment service ready");

    pipeline
        .start()
        .await
        .context("Failed to start event subscriber")?;

    shutdown_signal().await;
    info!("Shutdown signal received");

    // Settlements queue invoices and queued invoices still publish, so the
    // workers drain in that order before the producer closes.
    pipeline.stop_consuming().await;
    let _ = settlement_shutdown.send(true);
    if let Err(e) = settlement_worker.await {
        error!(error = %e, "Settlement worker failed");
    }
    let _ = worker_shutdown.send(true);
    if let Err(e) = invoice_worker.await {
        error!(error = %e, "Invoice worker failed");
    }

    let dropped = pipeline.shutdown().await;
    pool.close().await;
    info!(dropped, "payment-service stopped");
    Ok(())
}
