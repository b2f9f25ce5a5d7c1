use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain_events::persistence::{ChangeSet, CommitEvent, HookRegistry};
use domain_events::{Entity, ShipmentTracking, SnapshotSource};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::services::fulfillment::TrackingLog;

#[derive(Debug, sqlx::FromRow)]
struct TrackingRow {
    id: Uuid,
    shipping_id: Uuid,
    location: String,
    timestamp: DateTime<Utc>,
    status: String,
    notes: Option<String>,
}

impl From<TrackingRow> for ShipmentTracking {
    fn from(row: TrackingRow) -> Self {
        ShipmentTracking {
            id: row.id,
            shipping_id: row.shipping_id,
            location: row.location,
            timestamp: row.timestamp,
            status: row.status,
            notes: row.notes,
        }
    }
}

const COLUMNS: &str = "id, shipping_id, location, timestamp, status, notes";

/// Append-only tracking log. Corrections go through `correct`.
#[derive(Clone)]
pub struct TrackingRepository {
    pool: PgPool,
    hooks: Arc<HookRegistry>,
}

impl TrackingRepository {
    pub fn new(pool: PgPool, hooks: Arc<HookRegistry>) -> Self {
        Self { pool, hooks }
    }

    pub async fn append(&self, entry: &ShipmentTracking) -> ServiceResult<ShipmentTracking> {
        let _ticket = self.hooks.sequence(ShipmentTracking::SCHEMA, entry.id).await;
        let row = sqlx::query_as::<_, TrackingRow>(&format!(
            r#"
            INSERT INTO shipment_trackings (id, shipping_id, location, timestamp, status, notes)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(entry.id)
        .bind(entry.shipping_id)
        .bind(&entry.location)
        .bind(entry.timestamp)
        .bind(&entry.status)
        .bind(&entry.notes)
        .fetch_one(&self.pool)
        .await?;

        let created = ShipmentTracking::from(row);
        self.hooks
            .fire(&CommitEvent::created(created.clone().into_row()))
            .await;
        Ok(created)
    }

    pub async fn find_by_shipping(&self, shipping_id: Uuid) -> ServiceResult<Vec<ShipmentTracking>> {
        let rows = sqlx::query_as::<_, TrackingRow>(&format!(
            "SELECT {COLUMNS} FROM shipment_trackings WHERE shipping_id = $1 ORDER BY timestamp"
        ))
        .bind(shipping_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ShipmentTracking::from).collect())
    }

    pub async fn list(&self) -> ServiceResult<Vec<ShipmentTracking>> {
        let rows = sqlx::query_as::<_, TrackingRow>(&format!(
            "SELECT {COLUMNS} FROM shipment_trackings ORDER BY timestamp"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ShipmentTracking::from).collect())
    }

    /// Fix the status or notes of a recorded entry.
    pub async fn correct(
        &self,
        id: Uuid,
        status: &str,
        notes: Option<String>,
    ) -> ServiceResult<ShipmentTracking> {
        let _ticket = self.hooks.sequence(ShipmentTracking::SCHEMA, id).await;
        let mut tx = self.pool.begin().await?;
        let before: ShipmentTracking = sqlx::query_as::<_, TrackingRow>(&format!(
            "SELECT {COLUMNS} FROM shipment_trackings WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("tracking entry {}", id)))?
        .into();

        let row = sqlx::query_as::<_, TrackingRow>(&format!(
            "UPDATE shipment_trackings SET status = $2, notes = $3 WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(status)
        .bind(notes)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let updated = ShipmentTracking::from(row);
        let changes = ChangeSet::between(&before, &updated)?;
        self.hooks
            .fire(&CommitEvent::updated(updated.clone().into_row(), Some(changes)))
            .await;
        Ok(updated)
    }

    pub async fn delete(&self, id: Uuid) -> ServiceResult<ShipmentTracking> {
        let _ticket = self.hooks.sequence(ShipmentTracking::SCHEMA, id).await;
        let row = sqlx::query_as::<_, TrackingRow>(&format!(
            "DELETE FROM shipment_trackings WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("tracking entry {}", id)))?;

        let deleted = ShipmentTracking::from(row);
        self.hooks
            .fire(&CommitEvent::deleted(deleted.clone().into_row()))
            .await;
        Ok(deleted)
    }
}

#[async_trait]
impl TrackingLog for TrackingRepository {
    async fn append(&self, entry: &ShipmentTracking) -> ServiceResult<ShipmentTracking> {
        TrackingRepository::append(self, entry).await
    }

    async fn find_by_shipping(&self, shipping_id: Uuid) -> ServiceResult<Vec<ShipmentTracking>> {
        TrackingRepository::find_by_shipping(self, shipping_id).await
    }
}

#[async_trait]
impl SnapshotSource<ShipmentTracking> for TrackingRepository {
    async fn snapshot(&self) -> anyhow::Result<Vec<ShipmentTracking>> {
        Ok(self.list().await?)
    }
}
