//! Domain entities observed by the pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EventError, EventResult};
use crate::events::{EventData, EventFamily};

/// A persisted row the interceptor publishes events for.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Schema (table) name reported by the data-access layer.
    const SCHEMA: &'static str;
    const FAMILY: EventFamily;

    fn id(&self) -> Uuid;

    /// Field map placed in the envelope `data`. Defaults to a JSON
    /// round-trip of the entity; override to redact fields.
    fn projection(&self) -> EventResult<EventData> {
        project(self, Self::SCHEMA)
    }

    fn into_row(self) -> EntityRow;
}

/// JSON projection of any serializable value into a flat field map.
pub fn project<T: Serialize + ?Sized>(value: &T, what: &'static str) -> EventResult<EventData> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(EventError::NotAFieldMap(what)),
    }
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("invalid {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

text_enum!(PaymentMethod {
    CreditCard => "CREDIT_CARD",
    DebitCard => "DEBIT_CARD",
    PayPal => "PAY_PAL",
    BankTransfer => "BANK_TRANSFER",
    Crypto => "CRYPTO",
    Points => "POINTS",
    GiftCard => "GIFT_CARD",
});

text_enum!(PaymentStatus {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Refunded => "REFUNDED",
    PartiallyRefunded => "PARTIALLY_REFUNDED",
});

text_enum!(ShippingStatus {
    Pending => "PENDING",
    Preparing => "PREPARING",
    Shipped => "SHIPPED",
    InTransit => "IN_TRANSIT",
    OutForDelivery => "OUT_FOR_DELIVERY",
    Delivered => "DELIVERED",
    Failed => "FAILED",
    Returned => "RETURNED",
});

// ============================================================================
// Payment service entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(order_id: Uuid, amount: Decimal, method: PaymentMethod) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id,
            amount,
            method,
            status: PaymentStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Payment {
    const SCHEMA: &'static str = "payments";
    const FAMILY: EventFamily = EventFamily::Payment;

    fn id(&self) -> Uuid {
        self.id
    }

    fn into_row(self) -> EntityRow {
        EntityRow::Payment(self)
    }
}

/// One gateway interaction for a payment. `status` is whatever the gateway
/// reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub external_transaction_id: Option<String>,
    pub gateway_name: String,
    pub status: String,
    pub response_payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn new(payment_id: Uuid, gateway_name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id,
            external_transaction_id: None,
            gateway_name: gateway_name.into(),
            status: status.into(),
            response_payload: None,
            timestamp: Utc::now(),
        }
    }
}

impl Entity for PaymentTransaction {
    const SCHEMA: &'static str = "payment_transactions";
    const FAMILY: EventFamily = EventFamily::Transaction;

    fn id(&self) -> Uuid {
        self.id
    }

    fn into_row(self) -> EntityRow {
        EntityRow::Transaction(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub order_id: Uuid,
    pub payment_id: Uuid,
    pub invoice_number: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
}

impl Entity for Invoice {
    const SCHEMA: &'static str = "invoices";
    const FAMILY: EventFamily = EventFamily::Invoice;

    fn id(&self) -> Uuid {
        self.id
    }

    fn into_row(self) -> EntityRow {
        EntityRow::Invoice(self)
    }
}

// ============================================================================
// Shipping service entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipping {
    pub id: Uuid,
    pub order_id: Uuid,
    pub status: ShippingStatus,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    pub estimated_delivery: Option<NaiveDate>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Shipping {
    pub fn new(order_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id,
            status: ShippingStatus::Pending,
            carrier: None,
            tracking_number: None,
            estimated_delivery: None,
            shipped_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status`, stamping shipped/delivered instants on first entry.
    pub fn transition(&mut self, status: ShippingStatus) {
        let now = Utc::now();
        match status {
            ShippingStatus::Shipped if self.shipped_at.is_none() => self.shipped_at = Some(now),
            ShippingStatus::Delivered if self.delivered_at.is_none() => {
                self.delivered_at = Some(now)
            }
            _ => {}
        }
        self.status = status;
        self.updated_at = now;
    }
}

impl Entity for Shipping {
    const SCHEMA: &'static str = "shippings";
    const FAMILY: EventFamily = EventFamily::Shipping;

    fn id(&self) -> Uuid {
        self.id
    }

    fn into_row(self) -> EntityRow {
        EntityRow::Shipping(self)
    }
}

/// Append-only tracking entry for a shipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentTracking {
    pub id: Uuid,
    pub shipping_id: Uuid,
    pub location: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub notes: Option<String>,
}

impl ShipmentTracking {
    pub fn new(shipping_id: Uuid, location: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            shipping_id,
            location: location.into(),
            timestamp: Utc::now(),
            status: status.into(),
            notes: None,
        }
    }
}

impl Entity for ShipmentTracking {
    const SCHEMA: &'static str = "shipment_trackings";
    const FAMILY: EventFamily = EventFamily::Tracking;

    fn id(&self) -> Uuid {
        self.id
    }

    fn into_row(self) -> EntityRow {
        EntityRow::Tracking(self)
    }
}

/// A committed row of any entity, as handed to commit hooks.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRow {
    Payment(Payment),
    Invoice(Invoice),
    Transaction(PaymentTransaction),
    Shipping(Shipping),
    Tracking(ShipmentTracking),
}

impl EntityRow {
    pub fn schema(&self) -> &'static str {
        match self {
            EntityRow::Payment(_) => Payment::SCHEMA,
            EntityRow::Invoice(_) => Invoice::SCHEMA,
            EntityRow::Transaction(_) => PaymentTransaction::SCHEMA,
            EntityRow::Shipping(_) => Shipping::SCHEMA,
            EntityRow::Tracking(_) => ShipmentTracking::SCHEMA,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            EntityRow::Payment(row) => row.id,
            EntityRow::Invoice(row) => row.id,
            EntityRow::Transaction(row) => row.id,
            EntityRow::Shipping(row) => row.id,
            EntityRow::Tracking(row) => row.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_payment_projection_uses_wire_spellings() {
        let mut payment = Payment::new(
            Uuid::new_v4(),
            Decimal::from_str("42.00").unwrap(),
            PaymentMethod::PayPal,
        );
        payment.status = PaymentStatus::PartiallyRefunded;

        let data = payment.projection().unwrap();
        assert_eq!(data["method"], "PAY_PAL");
        assert_eq!(data["status"], "PARTIALLY_REFUNDED");
        assert_eq!(data["amount"], "42.00");
        assert_eq!(data["id"], payment.id.to_string());
    }

    #[test]
    fn test_projection_round_trips_to_entity() {
        let invoice = Invoice {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            payment_id: Uuid::new_v4(),
            invoice_number: "INV-20250101-0001".to_string(),
            issue_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2025, 1, 30).unwrap(),
        };

        let data = invoice.projection().unwrap();
        assert_eq!(data["due_date"], "2025-01-30");
        let parsed: Invoice = serde_json::from_value(Value::Object(data)).unwrap();
        assert_eq!(parsed, invoice);
    }

    #[test]
    fn test_project_rejects_non_objects() {
        assert!(project(&42, "number").is_err());
    }

    #[test]
    fn test_status_text_round_trip() {
        for status in ["PENDING", "OUT_FOR_DELIVERY", "RETURNED"] {
            assert_eq!(ShippingStatus::from_str(status).unwrap().as_str(), status);
        }
        assert!(PaymentStatus::from_str("LOST").is_err());
    }

    #[test]
    fn test_shipping_transition_stamps_dates_once() {
        let mut shipping = Shipping::new(Uuid::new_v4());
        shipping.transition(ShippingStatus::Shipped);
        let shipped_at = shipping.shipped_at;
        assert!(shipped_at.is_some());

        shipping.transition(ShippingStatus::InTransit);
        shipping.transition(ShippingStatus::Shipped);
        assert_eq!(shipping.shipped_at, shipped_at);
        assert!(shipping.delivered_at.is_none());

        shipping.transition(ShippingStatus::Delivered);
        assert!(shipping.delivered_at.is_some());
    }

    #[test]
    fn test_entity_row_reports_schema() {
        let tracking = ShipmentTracking::new(Uuid::new_v4(), "Memphis, TN", "IN_TRANSIT");
        let id = tracking.id;
        let row = tracking.into_row();
        assert_eq!(row.schema(), "shipment_trackings");
        assert_eq!(row.id(), id);
    }
}
