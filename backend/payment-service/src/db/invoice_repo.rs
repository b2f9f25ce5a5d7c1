use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use domain_events::persistence::{ChangeSet, CommitEvent, HookRegistry};
use domain_events::{Entity, Invoice, SnapshotSource};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::services::invoices::InvoiceStore;

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    order_id: Uuid,
    payment_id: Uuid,
    invoice_number: String,
    issue_date: NaiveDate,
    due_date: NaiveDate,
}

impl From<InvoiceRow> for Invoice {
    fn from(row: InvoiceRow) -> Self {
        Invoice {
            id: row.id,
            order_id: row.order_id,
            payment_id: row.payment_id,
            invoice_number: row.invoice_number,
            issue_date: row.issue_date,
            due_date: row.due_date,
        }
    }
}

const COLUMNS: &str = "id, order_id, payment_id, invoice_number, issue_date, due_date";

#[derive(Clone)]
pub struct InvoiceRepository {
    pool: PgPool,
    hooks: Arc<HookRegistry>,
}

impl InvoiceRepository {
    pub fn new(pool: PgPool, hooks: Arc<HookRegistry>) -> Self {
        Self { pool, hooks }
    }

    pub async fn create(&self, invoice: &Invoice) -> ServiceResult<Invoice> {
        let _ticket = self.hooks.sequence(Invoice::SCHEMA, invoice.id).await;
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            r#"
            INSERT INTO invoices (id, order_id, payment_id, invoice_number, issue_date, due_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(invoice.id)
        .bind(invoice.order_id)
        .bind(invoice.payment_id)
        .bind(&invoice.invoice_number)
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .fetch_one(&self.pool)
        .await?;

        let created = Invoice::from(row);
        self.hooks
            .fire(&CommitEvent::created(created.clone().into_row()))
            .await;
        Ok(created)
    }

    pub async fn find_by_id(&self, id: Uuid) -> ServiceResult<Option<Invoice>> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!("SELECT {COLUMNS} FROM invoices WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Invoice::from))
    }

    pub async fn find_by_payment(&self, payment_id: Uuid) -> ServiceResult<Option<Invoice>> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {COLUMNS} FROM invoices WHERE payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Invoice::from))
    }

    pub async fn list(&self) -> ServiceResult<Vec<Invoice>> {
        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {COLUMNS} FROM invoices ORDER BY issue_date, invoice_number"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Invoice::from).collect())
    }

    pub async fn update_due_date(&self, id: Uuid, due_date: NaiveDate) -> ServiceResult<Invoice> {
        let _ticket = self.hooks.sequence(Invoice::SCHEMA, id).await;
        let mut tx = self.pool.begin().await?;
        let before: Invoice = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {COLUMNS} FROM invoices WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("invoice {}", id)))?
        .into();

        if due_date < before.issue_date {
            return Err(ServiceError::InvalidInput(format!(
                "due date {} precedes issue date {}",
                due_date, before.issue_date
            )));
        }

        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "UPDATE invoices SET due_date = $2 WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(due_date)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let updated = Invoice::from(row);
        let changes = ChangeSet::between(&before, &updated)?;
        self.hooks
            .fire(&CommitEvent::updated(updated.clone().into_row(), Some(changes)))
            .await;
        Ok(updated)
    }

    pub async fn delete(&self, id: Uuid) -> ServiceResult<Invoice> {
        let _ticket = self.hooks.sequence(Invoice::SCHEMA, id).await;
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "DELETE FROM invoices WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("invoice {}", id)))?;

        let deleted = Invoice::from(row);
        self.hooks
            .fire(&CommitEvent::deleted(deleted.clone().into_row()))
            .await;
        Ok(deleted)
    }
}

#[async_trait]
impl InvoiceStore for InvoiceRepository {
    async fn find_by_payment(&self, payment_id: Uuid) -> ServiceResult<Option<Invoice>> {
        InvoiceRepository::find_by_payment(self, payment_id).await
    }

    async fn create(&self, invoice: &Invoice) -> ServiceResult<Invoice> {
        InvoiceRepository::create(self, invoice).await
    }
}

#[async_trait]
impl SnapshotSource<Invoice> for InvoiceRepository {
    async fn snapshot(&self) -> anyhow::Result<Vec<Invoice>> {
        Ok(self.list().await?)
    }
}
