use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain_events::persistence::{ChangeSet, CommitEvent, HookRegistry};
use domain_events::{Entity, Payment, PaymentMethod, PaymentStatus, SnapshotSource};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::corrupt;
use crate::error::{ServiceError, ServiceResult};
use crate::services::payments::PaymentStore;

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    order_id: Uuid,
    amount: Decimal,
    method: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = ServiceError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            order_id: row.order_id,
            amount: row.amount,
            method: row
                .method
                .parse::<PaymentMethod>()
                .map_err(|e| corrupt(Payment::SCHEMA, e))?,
            status: row
                .status
                .parse::<PaymentStatus>()
                .map_err(|e| corrupt(Payment::SCHEMA, e))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const COLUMNS: &str = "id, order_id, amount, method, status, created_at, updated_at";

/// Repository for payments. Commit hooks fire after each write.
#[derive(Clone)]
pub struct PaymentRepository {
    pool: PgPool,
    hooks: Arc<HookRegistry>,
}

impl PaymentRepository {
    pub fn new(pool: PgPool, hooks: Arc<HookRegistry>) -> Self {
        Self { pool, hooks }
    }

    pub async fn create(&self, payment: &Payment) -> ServiceResult<Payment> {
        let _ticket = self.hooks.sequence(Payment::SCHEMA, payment.id).await;
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            INSERT INTO payments (id, order_id, amount, method, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(payment.id)
        .bind(payment.order_id)
        .bind(payment.amount)
        .bind(payment.method.as_str())
        .bind(payment.status.as_str())
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .fetch_one(&self.pool)
        .await?;

        let created = Payment::try_from(row)?;
        self.hooks
            .fire(&CommitEvent::created(created.clone().into_row()))
            .await;
        Ok(created)
    }

    pub async fn find_by_id(&self, id: Uuid) -> ServiceResult<Option<Payment>> {
        sqlx::query_as::<_, PaymentRow>(&format!("SELECT {COLUMNS} FROM payments WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    pub async fn find_by_order(&self, order_id: Uuid) -> ServiceResult<Vec<Payment>> {
        sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {COLUMNS} FROM payments WHERE order_id = $1 ORDER BY created_at"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Payment::try_from)
        .collect()
    }

    pub async fn list(&self) -> ServiceResult<Vec<Payment>> {
        sqlx::query_as::<_, PaymentRow>(&format!("SELECT {COLUMNS} FROM payments ORDER BY created_at"))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Payment::try_from)
            .collect()
    }

    pub async fn update_status(&self, id: Uuid, status: PaymentStatus) -> ServiceResult<Payment> {
        self.modify(id, |payment| payment.status = status).await
    }

    /// Write every mutable column of `payment`.
    pub async fn update(&self, payment: &Payment) -> ServiceResult<Payment> {
        let changed = payment.clone();
        self.modify(payment.id, move |current| {
            current.amount = changed.amount;
            current.method = changed.method;
            current.status = changed.status;
        })
        .await
    }

    pub async fn delete(&self, id: Uuid) -> ServiceResult<Payment> {
        let _ticket = self.hooks.sequence(Payment::SCHEMA, id).await;
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "DELETE FROM payments WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("payment {}", id)))?;

        let deleted = Payment::try_from(row)?;
        self.hooks
            .fire(&CommitEvent::deleted(deleted.clone().into_row()))
            .await;
        Ok(deleted)
    }

    async fn modify<F>(&self, id: Uuid, change: F) -> ServiceResult<Payment>
    where
        F: FnOnce(&mut Payment),
    {
        let _ticket = self.hooks.sequence(Payment::SCHEMA, id).await;
        let mut tx = self.pool.begin().await?;
        let before = lock(&mut tx, id).await?;

        let mut after = before.clone();
        change(&mut after);
        after.updated_at = Utc::now();

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            UPDATE payments
            SET amount = $2, method = $3, status = $4, updated_at = $5
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(after.amount)
        .bind(after.method.as_str())
        .bind(after.status.as_str())
        .bind(after.updated_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let updated = Payment::try_from(row)?;
        let changes = ChangeSet::between(&before, &updated)?;
        self.hooks
            .fire(&CommitEvent::updated(updated.clone().into_row(), Some(changes)))
            .await;
        Ok(updated)
    }
}

async fn lock(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> ServiceResult<Payment> {
    sqlx::query_as::<_, PaymentRow>(&format!(
        "SELECT {COLUMNS} FROM payments WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| ServiceError::NotFound(format!("payment {}", id)))
    .and_then(Payment::try_from)
}

#[async_trait]
impl PaymentStore for PaymentRepository {
    async fn find_by_id(&self, id: Uuid) -> ServiceResult<Option<Payment>> {
        PaymentRepository::find_by_id(self, id).await
    }

    async fn create(&self, payment: &Payment) -> ServiceResult<Payment> {
        PaymentRepository::create(self, payment).await
    }

    async fn update_status(&self, id: Uuid, status: PaymentStatus) -> ServiceResult<Payment> {
        PaymentRepository::update_status(self, id, status).await
    }

    async fn delete(&self, id: Uuid) -> ServiceResult<Payment> {
        PaymentRepository::delete(self, id).await
    }
}

#[async_trait]
impl SnapshotSource<Payment> for PaymentRepository {
    async fn snapshot(&self) -> anyhow::Result<Vec<Payment>> {
        Ok(self.list().await?)
    }
}
