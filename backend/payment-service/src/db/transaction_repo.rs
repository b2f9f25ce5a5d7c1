use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain_events::persistence::{ChangeSet, CommitEvent, HookRegistry};
use domain_events::{Entity, PaymentTransaction, SnapshotSource};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::services::payments::TransactionStore;

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    payment_id: Uuid,
    external_transaction_id: Option<String>,
    gateway_name: String,
    status: String,
    response_payload: Option<Value>,
    timestamp: DateTime<Utc>,
}

impl From<TransactionRow> for PaymentTransaction {
    fn from(row: TransactionRow) -> Self {
        PaymentTransaction {
            id: row.id,
            payment_id: row.payment_id,
            external_transaction_id: row.external_transaction_id,
            gateway_name: row.gateway_name,
            status: row.status,
            response_payload: row.response_payload,
            timestamp: row.timestamp,
        }
    }
}

const COLUMNS: &str =
    "id, payment_id, external_transaction_id, gateway_name, status, response_payload, timestamp";

/// Gateway interactions. The status is whatever the gateway reported.
#[derive(Clone)]
pub struct TransactionRepository {
    pool: PgPool,
    hooks: Arc<HookRegistry>,
}

impl TransactionRepository {
    pub fn new(pool: PgPool, hooks: Arc<HookRegistry>) -> Self {
        Self { pool, hooks }
    }

    pub async fn create(&self, transaction: &PaymentTransaction) -> ServiceResult<PaymentTransaction> {
        let _ticket = self.hooks.sequence(PaymentTransaction::SCHEMA, transaction.id).await;
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            INSERT INTO payment_transactions
                (id, payment_id, external_transaction_id, gateway_name, status, response_payload, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(transaction.id)
        .bind(transaction.payment_id)
        .bind(&transaction.external_transaction_id)
        .bind(&transaction.gateway_name)
        .bind(&transaction.status)
        .bind(&transaction.response_payload)
        .bind(transaction.timestamp)
        .fetch_one(&self.pool)
        .await?;

        let created = PaymentTransaction::from(row);
        self.hooks
            .fire(&CommitEvent::created(created.clone().into_row()))
            .await;
        Ok(created)
    }

    pub async fn find_by_payment(&self, payment_id: Uuid) -> ServiceResult<Vec<PaymentTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {COLUMNS} FROM payment_transactions WHERE payment_id = $1 ORDER BY timestamp"
        ))
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PaymentTransaction::from).collect())
    }

    pub async fn list(&self) -> ServiceResult<Vec<PaymentTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {COLUMNS} FROM payment_transactions ORDER BY timestamp"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PaymentTransaction::from).collect())
    }

    /// Record the gateway's latest answer for a transaction.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: &str,
        response_payload: Option<Value>,
    ) -> ServiceResult<PaymentTransaction> {
        let _ticket = self.hooks.sequence(PaymentTransaction::SCHEMA, id).await;
        let mut tx = self.pool.begin().await?;
        let before: PaymentTransaction = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {COLUMNS} FROM payment_transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", id)))?
        .into();

        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            UPDATE payment_transactions
            SET status = $2, response_payload = COALESCE($3, response_payload), timestamp = $4
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(status)
        .bind(response_payload)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let updated = PaymentTransaction::from(row);
        let changes = ChangeSet::between(&before, &updated)?;
        self.hooks
            .fire(&CommitEvent::updated(updated.clone().into_row(), Some(changes)))
            .await;
        Ok(updated)
    }

    pub async fn delete(&self, id: Uuid) -> ServiceResult<PaymentTransaction> {
        let _ticket = self.hooks.sequence(PaymentTransaction::SCHEMA, id).await;
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "DELETE FROM payment_transactions WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", id)))?;

        let deleted = PaymentTransaction::from(row);
        self.hooks
            .fire(&CommitEvent::deleted(deleted.clone().into_row()))
            .await;
        Ok(deleted)
    }
}

#[async_trait]
impl TransactionStore for TransactionRepository {
    async fn create(&self, transaction: &PaymentTransaction) -> ServiceResult<PaymentTransaction> {
        TransactionRepository::create(self, transaction).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: &str,
        response_payload: Option<Value>,
    ) -> ServiceResult<PaymentTransaction> {
        TransactionRepository::update_status(self, id, status, response_payload).await
    }
}

#[async_trait]
impl SnapshotSource<PaymentTransaction> for TransactionRepository {
    async fn snapshot(&self) -> anyhow::Result<Vec<PaymentTransaction>> {
        Ok(self.list().await?)
    }
}
