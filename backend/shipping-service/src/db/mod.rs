//! Postgres data-access layer. Commit hooks fire after `COMMIT` while the
//! row's commit ticket is still held; updates lock and read the pre-image
//! inside the write transaction.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{ServiceError, ServiceResult};

pub mod shipping_repo;
pub mod tracking_repo;

pub use shipping_repo::{ShipmentChange, ShippingRepository};
pub use tracking_repo::TrackingRepository;

pub async fn connect(config: &DatabaseConfig) -> ServiceResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    info!(
        max_connections = config.max_connections,
        "Database pool created and verified"
    );
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> ServiceResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}

pub(crate) fn corrupt(table: &'static str, reason: impl Into<String>) -> ServiceError {
    ServiceError::CorruptRow {
        table,
        reason: reason.into(),
    }
}
