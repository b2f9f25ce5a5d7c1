use std::sync::Arc;

use anyhow::{Context, Result};
use domain_events::{shutdown_signal, EventPipeline, EventType, HookRegistry};
use tokio::sync::watch;
use tracing::{error, info};

use shipping_service::config::ServiceConfig;
use shipping_service::db::{self, ShippingRepository, TrackingRepository};
use shipping_service::services::{
    create_fulfillment_queue, fulfillment_handler, spawn_fulfillment_worker, Fulfillment,
    ShippingService,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "shipping_service=info,domain_events=info,info".into()),
        )
        .with_target(false)
        .json()
        .init();

    info!("Starting shipping-service");

    let config = ServiceConfig::load().context("Failed to load configuration")?;
    info!(
        brokers = %config.pipeline.catalog.bootstrap_servers(),
        group = %config.pipeline.catalog.group_id(),
        subscriptions = ?config.pipeline.catalog.subscriptions(),
        "Configuration loaded"
    );

    let pool = db::connect(&config.database)
        .await
        .context("Failed to connect to database")?;
    db::migrate(&pool)
        .await
        .context("Failed to run database migrations")?;

    let hooks = Arc::new(HookRegistry::new());
    let mut pipeline = EventPipeline::connect_kafka(config.pipeline.clone(), hooks.clone())
        .context("Failed to assemble event pipeline")?;

    let shipping_service = ShippingService::new(
        Arc::new(ShippingRepository::new(pool.clone(), hooks.clone())),
        Arc::new(TrackingRepository::new(pool.clone(), hooks.clone())),
    );
    let fulfillment = Fulfillment {
        shipments: shipping_service,
        origin: config.fulfillment.origin.clone(),
    };

    let (jobs_tx, jobs_rx) = create_fulfillment_queue(config.fulfillment.queue_capacity);
    let (worker_shutdown, worker_shutdown_rx) = watch::channel(false);
    let worker = spawn_fulfillment_worker(fulfillment, jobs_rx, worker_shutdown_rx);

    match pipeline.register_handler(EventType::PaymentConfirmed, fulfillment_handler(jobs_tx)) {
        Ok(()) => {}
        Err(domain_events::SubscriberError::Disabled) => {
            info!("Consumer disabled; shipments will not be created from payments")
        }
        Err(e) => return Err(e).context("Failed to register payment handler"),
    }

    pipeline
        .start()
        .await
        .context("Failed to start event subscriber")?;
    info!("Shipping service ready");

    shutdown_signal().await;
    info!("Shutdown signal received");

    // Stop intake first; shipments created while draining still publish.
    pipeline.stop_consuming().await;
    let _ = worker_shutdown.send(true);
    if let Err(e) = worker.await {
        error!(error = %e, "Fulfillment worker failed");
    }

    let dropped = pipeline.shutdown().await;
    pool.close().await;
    info!(dropped, "shipping-service stopped");
    Ok(())
}
