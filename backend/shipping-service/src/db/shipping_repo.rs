use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use domain_events::persistence::{ChangeSet, CommitEvent, HookRegistry};
use domain_events::{Entity, Shipping, ShippingStatus, SnapshotSource};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::corrupt;
use crate::error::{ServiceError, ServiceResult};
use crate::services::fulfillment::ShipmentStore;

#[derive(Debug, sqlx::FromRow)]
struct ShippingRow {
    id: Uuid,
    order_id: Uuid,
    status: String,
    carrier: Option<String>,
    tracking_number: Option<String>,
    estimated_delivery: Option<NaiveDate>,
    shipped_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ShippingRow> for Shipping {
    type Error = ServiceError;

    fn try_from(row: ShippingRow) -> Result<Self, Self::Error> {
        Ok(Shipping {
            id: row.id,
            order_id: row.order_id,
            status: row
                .status
                .parse::<ShippingStatus>()
                .map_err(|e| corrupt(Shipping::SCHEMA, e))?,
            carrier: row.carrier,
            tracking_number: row.tracking_number,
            estimated_delivery: row.estimated_delivery,
            shipped_at: row.shipped_at,
            delivered_at: row.delivered_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const COLUMNS: &str = "id, order_id, status, carrier, tracking_number, estimated_delivery, \
                       shipped_at, delivered_at, created_at, updated_at";

/// Fields an update may change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShipmentChange {
    pub status: Option<ShippingStatus>,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    pub estimated_delivery: Option<NaiveDate>,
}

impl ShipmentChange {
    pub fn status(status: ShippingStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(self, shipping: &mut Shipping) {
        if let Some(status) = self.status {
            shipping.transition(status);
        }
        if let Some(carrier) = self.carrier {
            shipping.carrier = Some(carrier);
        }
        if let Some(tracking_number) = self.tracking_number {
            shipping.tracking_number = Some(tracking_number);
        }
        if let Some(estimated_delivery) = self.estimated_delivery {
            shipping.estimated_delivery = Some(estimated_delivery);
        }
        shipping.updated_at = Utc::now();
    }
}

#[derive(Clone)]
pub struct ShippingRepository {
    pool: PgPool,
    hooks: Arc<HookRegistry>,
}

impl ShippingRepository {
    pub fn new(pool: PgPool, hooks: Arc<HookRegistry>) -> Self {
        Self { pool, hooks }
    }

    pub async fn create(&self, shipping: &Shipping) -> ServiceResult<Shipping> {
        let _ticket = self.hooks.sequence(Shipping::SCHEMA, shipping.id).await;
        let row = sqlx::query_as::<_, ShippingRow>(&format!(
            r#"
            INSERT INTO shippings
                (id, order_id, status, carrier, tracking_number, estimated_delivery,
                 shipped_at, delivered_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(shipping.id)
        .bind(shipping.order_id)
        .bind(shipping.status.as_str())
        .bind(&shipping.carrier)
        .bind(&shipping.tracking_number)
        .bind(shipping.estimated_delivery)
        .bind(shipping.shipped_at)
        .bind(shipping.delivered_at)
        .bind(shipping.created_at)
        .bind(shipping.updated_at)
        .fetch_one(&self.pool)
        .await?;

        let created = Shipping::try_from(row)?;
        self.hooks
            .fire(&CommitEvent::created(created.clone().into_row()))
            .await;
        Ok(created)
    }

    pub async fn find_by_id(&self, id: Uuid) -> ServiceResult<Option<Shipping>> {
        sqlx::query_as::<_, ShippingRow>(&format!("SELECT {COLUMNS} FROM shippings WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Shipping::try_from)
            .transpose()
    }

    pub async fn find_by_order(&self, order_id: Uuid) -> ServiceResult<Option<Shipping>> {
        sqlx::query_as::<_, ShippingRow>(&format!(
            "SELECT {COLUMNS} FROM shippings WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Shipping::try_from)
        .transpose()
    }

    pub async fn list(&self) -> ServiceResult<Vec<Shipping>> {
        sqlx::query_as::<_, ShippingRow>(&format!("SELECT {COLUMNS} FROM shippings ORDER BY created_at"))
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Shipping::try_from)
            .collect()
    }

    pub async fn update(&self, id: Uuid, change: ShipmentChange) -> ServiceResult<Shipping> {
        let _ticket = self.hooks.sequence(Shipping::SCHEMA, id).await;
        let mut tx = self.pool.begin().await?;
        let before = lock(&mut tx, id).await?;

        let mut after = before.clone();
        change.apply(&mut after);

        let row = sqlx::query_as::<_, ShippingRow>(&format!(
            r#"
            UPDATE shippings
            SET status = $2, carrier = $3, tracking_number = $4, estimated_delivery = $5,
                shipped_at = $6, delivered_at = $7, updated_at = $8
            WHERE id = $1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(after.status.as_str())
        .bind(&after.carrier)
        .bind(&after.tracking_number)
        .bind(after.estimated_delivery)
        .bind(after.shipped_at)
        .bind(after.delivered_at)
        .bind(after.updated_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let updated = Shipping::try_from(row)?;
        let changes = ChangeSet::between(&before, &updated)?;
        self.hooks
            .fire(&CommitEvent::updated(updated.clone().into_row(), Some(changes)))
            .await;
        Ok(updated)
    }

    pub async fn delete(&self, id: Uuid) -> ServiceResult<Shipping> {
        let _ticket = self.hooks.sequence(Shipping::SCHEMA, id).await;
        let row = sqlx::query_as::<_, ShippingRow>(&format!(
            "DELETE FROM shippings WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("shipping {}", id)))?;

        let deleted = Shipping::try_from(row)?;
        self.hooks
            .fire(&CommitEvent::deleted(deleted.clone().into_row()))
            .await;
        Ok(deleted)
    }
}

async fn lock(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> ServiceResult<Shipping> {
    sqlx::query_as::<_, ShippingRow>(&format!(
        "SELECT {COLUMNS} FROM shippings WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| ServiceError::NotFound(format!("shipping {}", id)))
    .and_then(Shipping::try_from)
}

#[async_trait]
impl ShipmentStore for ShippingRepository {
    async fn find_by_id(&self, id: Uuid) -> ServiceResult<Option<Shipping>> {
        ShippingRepository::find_by_id(self, id).await
    }

    async fn find_by_order(&self, order_id: Uuid) -> ServiceResult<Option<Shipping>> {
        ShippingRepository::find_by_order(self, order_id).await
    }

    async fn create(&self, shipping: &Shipping) -> ServiceResult<Shipping> {
        ShippingRepository::create(self, shipping).await
    }

    async fn update(&self, id: Uuid, change: ShipmentChange) -> ServiceResult<Shipping> {
        ShippingRepository::update(self, id, change).await
    }

    async fn delete(&self, id: Uuid) -> ServiceResult<Shipping> {
        ShippingRepository::delete(self, id).await
    }
}

#[async_trait]
impl SnapshotSource<Shipping> for ShippingRepository {
    async fn snapshot(&self) -> anyhow::Result<Vec<Shipping>> {
        Ok(self.list().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_stamps_shipped_once() {
        let mut shipping = Shipping::new(Uuid::new_v4());
        ShipmentChange::status(ShippingStatus::Shipped).apply(&mut shipping);
        let shipped_at = shipping.shipped_at;
        assert!(shipped_at.is_some());

        ShipmentChange::status(ShippingStatus::InTransit).apply(&mut shipping);
        ShipmentChange::status(ShippingStatus::Shipped).apply(&mut shipping);
        assert_eq!(shipping.shipped_at, shipped_at);
    }

    #[test]
    fn test_change_leaves_unset_fields_alone() {
        let mut shipping = Shipping::new(Uuid::new_v4());
        shipping.carrier = Some("DHL".to_string());

        ShipmentChange {
            tracking_number: Some("JD014600006281230704".to_string()),
            ..ShipmentChange::default()
        }
        .apply(&mut shipping);

        assert_eq!(shipping.carrier.as_deref(), Some("DHL"));
        assert_eq!(shipping.status, ShippingStatus::Pending);
        assert!(shipping.tracking_number.is_some());
    }
}
