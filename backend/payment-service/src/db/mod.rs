//! Postgres data-access layer.
//!
//! Every write runs in its own transaction and fires the session's commit
//! hooks once the transaction has committed. Updates read the pre-image with
//! `SELECT ... FOR UPDATE` inside the same transaction so the hooks see an
//! exact change set. Each write holds the row's commit ticket from before the
//! transaction until its hooks return, so events for one row leave in commit
//! order.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{ServiceError, ServiceResult};

pub mod invoice_repo;
pub mod payment_repo;
pub mod transaction_repo;

pub use invoice_repo::InvoiceRepository;
pub use payment_repo::PaymentRepository;
pub use transaction_repo::TransactionRepository;

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
