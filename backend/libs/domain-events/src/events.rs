//! Event envelope types.
//!
//! Every family shares one wire shape:
//!
//! ```json
//! {
//!   "type": "PAYMENT_STATUS_CHANGED",
//!   "payment_id": "11111111-1111-1111-1111-111111111111",
//!   "timestamp": 1735689600,
//!   "data": { "status": "COMPLETED", "old_status": "PENDING", "...": "..." }
//! }
//! ```
//!
//! The subject id field is named after the family (`payment_id`,
//! `invoice_id`, `transaction_id`, `shipping_id`, `tracking_id`). Tracking
//! envelopes also carry the parent `shipping_id`.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{EventError, EventResult};

/// Flat field-name to value map carried in `data`.
pub type EventData = Map<String, Value>;

// ============================================================================
// Families, kinds and discriminators
// ============================================================================

/// Entity family an event belongs to.
///
/// Declaration order is the order the topic router tries substrings in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventFamily {
    Payment,
    Invoice,
    Transaction,
    Shipping,
    Tracking,
}

impl EventFamily {
    pub const ALL: [EventFamily; 5] = [
        EventFamily::Payment,
        EventFamily::Invoice,
        EventFamily::Transaction,
        EventFamily::Shipping,
        EventFamily::Tracking,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventFamily::Payment => "payment",
            EventFamily::Invoice => "invoice",
            EventFamily::Transaction => "transaction",
            EventFamily::Shipping => "shipping",
            EventFamily::Tracking => "tracking",
        }
    }

    /// Envelope field holding the subject entity id.
    pub fn id_field(self) -> &'static str {
        match self {
            EventFamily::Payment => "payment_id",
            EventFamily::Invoice => "invoice_id",
            EventFamily::Transaction => "transaction_id",
            EventFamily::Shipping => "shipping_id",
            EventFamily::Tracking => "tracking_id",
        }
    }

    /// Kinds declared for this family, in topic-catalog order.
    pub fn kinds(self) -> &'static [EventKind] {
        match self {
            EventFamily::Payment => &[
                EventKind::Created,
                EventKind::Updated,
                EventKind::StatusChanged,
                EventKind::Deleted,
                EventKind::Confirmed,
                EventKind::Failed,
            ],
            EventFamily::Invoice => &[
                EventKind::Created,
                EventKind::Updated,
                EventKind::DueDateChanged,
                EventKind::Deleted,
            ],
            EventFamily::Transaction | EventFamily::Shipping => &[
                EventKind::Created,
                EventKind::Updated,
                EventKind::StatusChanged,
                EventKind::Deleted,
            ],
            EventFamily::Tracking => &[EventKind::Created, EventKind::Updated, EventKind::Deleted],
        }
    }
}

impl fmt::Display for EventFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventFamily {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        EventFamily::ALL
            .into_iter()
            .find(|family| family.as_str() == lowered)
            .ok_or_else(|| EventError::UnknownFamily(s.to_string()))
    }
}

/// Lifecycle step an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Created,
    Updated,
    StatusChanged,
    DueDateChanged,
    Deleted,
    Confirmed,
    Failed,
}

impl EventKind {
    /// Lowercase hyphenated form used in topic names and config keys.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::StatusChanged => "status-changed",
            EventKind::DueDateChanged => "due-date-changed",
            EventKind::Deleted => "deleted",
            EventKind::Confirmed => "confirmed",
            EventKind::Failed => "failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        [
            EventKind::Created,
            EventKind::Updated,
            EventKind::StatusChanged,
            EventKind::DueDateChanged,
            EventKind::Deleted,
            EventKind::Confirmed,
            EventKind::Failed,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == normalized)
        .ok_or_else(|| EventError::UnknownKind(s.to_string()))
    }
}

/// Event discriminator, serialized as the uppercase `type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    PaymentCreated,
    PaymentUpdated,
    PaymentStatusChanged,
    PaymentDeleted,
    PaymentConfirmed,
    PaymentFailed,
    InvoiceCreated,
    InvoiceUpdated,
    InvoiceDueDateChanged,
    InvoiceDeleted,
    TransactionCreated,
    TransactionUpdated,
    TransactionStatusChanged,
    TransactionDeleted,
    ShippingCreated,
    ShippingUpdated,
    ShippingStatusChanged,
    ShippingDeleted,
    TrackingCreated,
    TrackingUpdated,
    TrackingDeleted,
}

impl EventType {
    pub const ALL: [EventType; 21] = [
        EventType::PaymentCreated,
        EventType::PaymentUpdated,
        EventType::PaymentStatusChanged,
        EventType::PaymentDeleted,
        EventType::PaymentConfirmed,
        EventType::PaymentFailed,
        EventType::InvoiceCreated,
        EventType::InvoiceUpdated,
        EventType::InvoiceDueDateChanged,
        EventType::InvoiceDeleted,
        EventType::TransactionCreated,
        EventType::TransactionUpdated,
        EventType::TransactionStatusChanged,
        EventType::TransactionDeleted,
        EventType::ShippingCreated,
        EventType::ShippingUpdated,
        EventType::ShippingStatusChanged,
        EventType::ShippingDeleted,
        EventType::TrackingCreated,
        EventType::TrackingUpdated,
        EventType::TrackingDeleted,
    ];

    pub fn family(self) -> EventFamily {
        use EventType::*;
        match self {
            PaymentCreated | PaymentUpdated | PaymentStatusChanged | PaymentDeleted
            | PaymentConfirmed | PaymentFailed => EventFamily::Payment,
            InvoiceCreated | InvoiceUpdated | InvoiceDueDateChanged | InvoiceDeleted => {
                EventFamily::Invoice
            }
            TransactionCreated | TransactionUpdated | TransactionStatusChanged
            | TransactionDeleted => EventFamily::Transaction,
            ShippingCreated | ShippingUpdated | ShippingStatusChanged | ShippingDeleted => {
                EventFamily::Shipping
            }
            TrackingCreated | TrackingUpdated | TrackingDeleted => EventFamily::Tracking,
        }
    }

    pub fn kind(self) -> EventKind {
        use EventType::*;
        match self {
            PaymentCreated | InvoiceCreated | TransactionCreated | ShippingCreated
            | TrackingCreated => EventKind::Created,
            PaymentUpdated | InvoiceUpdated | TransactionUpdated | ShippingUpdated
            | TrackingUpdated => EventKind::Updated,
            PaymentStatusChanged | TransactionStatusChanged | ShippingStatusChanged => {
                EventKind::StatusChanged
            }
            InvoiceDueDateChanged => EventKind::DueDateChanged,
            PaymentDeleted | InvoiceDeleted | TransactionDeleted | ShippingDeleted
            | TrackingDeleted => EventKind::Deleted,
            PaymentConfirmed => EventKind::Confirmed,
            PaymentFailed => EventKind::Failed,
        }
    }

    /// Discriminator for a (family, kind) pair, if the pair is declared.
    pub fn of(family: EventFamily, kind: EventKind) -> Option<EventType> {
        EventType::ALL
            .into_iter()
            .find(|t| t.family() == family && t.kind() == kind)
    }

    pub fn as_str(self) -> &'static str {
        use EventType::*;
        match self {
            PaymentCreated => "PAYMENT_CREATED",
            PaymentUpdated => "PAYMENT_UPDATED",
            PaymentStatusChanged => "PAYMENT_STATUS_CHANGED",
            PaymentDeleted => "PAYMENT_DELETED",
            PaymentConfirmed => "PAYMENT_CONFIRMED",
            PaymentFailed => "PAYMENT_FAILED",
            InvoiceCreated => "INVOICE_CREATED",
            InvoiceUpdated => "INVOICE_UPDATED",
            InvoiceDueDateChanged => "INVOICE_DUE_DATE_CHANGED",
            InvoiceDeleted => "INVOICE_DELETED",
            TransactionCreated => "TRANSACTION_CREATED",
            TransactionUpdated => "TRANSACTION_UPDATED",
            TransactionStatusChanged => "TRANSACTION_STATUS_CHANGED",
            TransactionDeleted => "TRANSACTION_DELETED",
            ShippingCreated => "SHIPPING_CREATED",
            ShippingUpdated => "SHIPPING_UPDATED",
            ShippingStatusChanged => "SHIPPING_STATUS_CHANGED",
            ShippingDeleted => "SHIPPING_DELETED",
            TrackingCreated => "TRACKING_CREATED",
            TrackingUpdated => "TRACKING_UPDATED",
            TrackingDeleted => "TRACKING_DELETED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

fn ensure_family(event_type: EventType, expected: EventFamily) -> EventResult<()> {
    if event_type.family() == expected {
        Ok(())
    } else {
        Err(EventError::FamilyMismatch {
            event_type,
            expected,
        })
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// Behaviour shared by the five envelope types.
pub trait Envelope: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const FAMILY: EventFamily;

    fn event_type(&self) -> EventType;

    /// Primary entity id; also the message key.
    fn subject_id(&self) -> Uuid;

    fn timestamp(&self) -> i64;

    fn data(&self) -> &EventData;

    fn key(&self) -> String {
        self.subject_id().to_string()
    }

    fn encode(&self) -> EventResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse an envelope, rejecting discriminators of other families.
    fn decode(bytes: &[u8]) -> EventResult<Self> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        ensure_family(envelope.event_type(), Self::FAMILY)?;
        Ok(envelope)
    }
}

macro_rules! family_envelope {
    ($(#[$meta:meta])* $name:ident, $family:expr, $id_field:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            #[serde(rename = "type")]
            pub event_type: EventType,
            pub $id_field: Uuid,
            pub timestamp: i64,
            pub data: EventData,
        }

        impl $name {
            /// Stamp a new envelope with the current time.
            pub fn new(event_type: EventType, $id_field: Uuid, data: EventData) -> EventResult<Self> {
                ensure_family(event_type, $family)?;
                Ok(Self {
                    event_type,
                    $id_field,
                    timestamp: Utc::now().timestamp(),
                    data,
                })
            }
        }

        impl Envelope for $name {
            const FAMILY: EventFamily = $family;

            fn event_type(&self) -> EventType {
                self.event_type
            }

            fn subject_id(&self) -> Uuid {
                self.$id_field
            }

            fn timestamp(&self) -> i64 {
                self.timestamp
            }

            fn data(&self) -> &EventData {
                &self.data
            }
        }
    };
}

family_envelope!(
    /// Payment lifecycle and order-coordination events.
    PaymentEvent,
    EventFamily::Payment,
    payment_id
);
family_envelope!(InvoiceEvent, EventFamily::Invoice, invoice_id);
family_envelope!(TransactionEvent, EventFamily::Transaction, transaction_id);
family_envelope!(ShippingEvent, EventFamily::Shipping, shipping_id);

/// Shipment tracking events. Keyed by the tracking id, carrying the parent
/// shipping id alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub tracking_id: Uuid,
    pub shipping_id: Uuid,
    pub timestamp: i64,
    pub data: EventData,
}

impl TrackingEvent {
    pub fn new(
        event_type: EventType,
        tracking_id: Uuid,
        shipping_id: Uuid,
        data: EventData,
    ) -> EventResult<Self> {
        ensure_family(event_type, EventFamily::Tracking)?;
        Ok(Self {
            event_type,
            tracking_id,
            shipping_id,
            timestamp: Utc::now().timestamp(),
            data,
        })
    }
}

impl Envelope for TrackingEvent {
    const FAMILY: EventFamily = EventFamily::Tracking;

    fn event_type(&self) -> EventType {
        self.event_type
    }

    fn subject_id(&self) -> Uuid {
        self.tracking_id
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn data(&self) -> &EventData {
        &self.data
    }
}

// ============================================================================
// DomainEvent
// ============================================================================

/// Any decoded envelope, as handed to handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Payment(PaymentEvent),
    Invoice(InvoiceEvent),
    Transaction(TransactionEvent),
    Shipping(ShippingEvent),
    Tracking(TrackingEvent),
}

impl DomainEvent {
    /// Decode a message value as an envelope of the given family.
    pub fn decode(family: EventFamily, bytes: &[u8]) -> EventResult<Self> {
        Ok(match family {
            EventFamily::Payment => DomainEvent::Payment(PaymentEvent::decode(bytes)?),
            EventFamily::Invoice => DomainEvent::Invoice(InvoiceEvent::decode(bytes)?),
            EventFamily::Transaction => DomainEvent::Transaction(TransactionEvent::decode(bytes)?),
            EventFamily::Shipping => DomainEvent::Shipping(ShippingEvent::decode(bytes)?),
            EventFamily::Tracking => DomainEvent::Tracking(TrackingEvent::decode(bytes)?),
        })
    }

    pub fn event_type(&self) -> EventType {
        match self {
            DomainEvent::Payment(e) => e.event_type,
            DomainEvent::Invoice(e) => e.event_type,
            DomainEvent::Transaction(e) => e.event_type,
            DomainEvent::Shipping(e) => e.event_type,
            DomainEvent::Tracking(e) => e.event_type,
        }
    }

    pub fn family(&self) -> EventFamily {
        self.event_type().family()
    }

    pub fn subject_id(&self) -> Uuid {
        match self {
            DomainEvent::Payment(e) => e.payment_id,
            DomainEvent::Invoice(e) => e.invoice_id,
            DomainEvent::Transaction(e) => e.transaction_id,
            DomainEvent::Shipping(e) => e.shipping_id,
            DomainEvent::Tracking(e) => e.tracking_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            DomainEvent::Payment(e) => e.timestamp,
            DomainEvent::Invoice(e) => e.timestamp,
            DomainEvent::Transaction(e) => e.timestamp,
            DomainEvent::Shipping(e) => e.timestamp,
            DomainEvent::Tracking(e) => e.timestamp,
        }
    }

    pub fn data(&self) -> &EventData {
        match self {
            DomainEvent::Payment(e) => &e.data,
            DomainEvent::Invoice(e) => &e.data,
            DomainEvent::Transaction(e) => &e.data,
            DomainEvent::Shipping(e) => &e.data,
            DomainEvent::Tracking(e) => &e.data,
        }
    }

    /// String value of a `data` field, if present and textual.
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data().get(field).and_then(Value::as_str)
    }

    /// `data` field parsed as a UUID.
    pub fn data_uuid(&self, field: &str) -> Option<Uuid> {
        self.data_str(field).and_then(|s| Uuid::parse_str(s).ok())
    }
}

impl From<PaymentEvent> for DomainEvent {
    fn from(event: PaymentEvent) -> Self {
        DomainEvent::Payment(event)
    }
}

impl From<InvoiceEvent> for DomainEvent {
    fn from(event: InvoiceEvent) -> Self {
        DomainEvent::Invoice(event)
    }
}

impl From<TransactionEvent> for DomainEvent {
    fn from(event: TransactionEvent) -> Self {
        DomainEvent::Transaction(event)
    }
}

impl From<ShippingEvent> for DomainEvent {
    fn from(event: ShippingEvent) -> Self {
        DomainEvent::Shipping(event)
    }
}

impl From<TrackingEvent> for DomainEvent {
    fn from(event: TrackingEvent) -> Self {
        DomainEvent::Tracking(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> EventData {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_every_event_type_round_trips_through_family_and_kind() {
        for event_type in EventType::ALL {
            assert_eq!(
                EventType::of(event_type.family(), event_type.kind()),
                Some(event_type)
            );
            assert!(event_type.family().kinds().contains(&event_type.kind()));
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
    }

    #[test]
    fn test_tracking_has_no_status_changed_kind() {
        assert_eq!(
            EventType::of(EventFamily::Tracking, EventKind::StatusChanged),
            None
        );
        assert_eq!(
            EventType::of(EventFamily::Invoice, EventKind::StatusChanged),
            None
        );
    }

    #[test]
    fn test_serde_uses_uppercase_discriminator() {
        let value = serde_json::to_value(EventType::InvoiceDueDateChanged).unwrap();
        assert_eq!(value, json!("INVOICE_DUE_DATE_CHANGED"));
    }

    #[test]
    fn test_constructor_rejects_foreign_discriminator() {
        let err = PaymentEvent::new(EventType::ShippingCreated, Uuid::new_v4(), EventData::new())
            .unwrap_err();
        assert!(matches!(
            err,
            EventError::FamilyMismatch {
                expected: EventFamily::Payment,
                ..
            }
        ));
    }

    #[test]
    fn test_payment_envelope_wire_shape() {
        let id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let event = PaymentEvent::new(
            EventType::PaymentStatusChanged,
            id,
            data(json!({"status": "COMPLETED", "old_status": "PENDING"})),
        )
        .unwrap();

        let value: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "PAYMENT_STATUS_CHANGED");
        assert_eq!(value["payment_id"], "11111111-1111-1111-1111-111111111111");
        assert_eq!(value["data"]["old_status"], "PENDING");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
        assert_eq!(event.key(), "11111111-1111-1111-1111-111111111111");
    }

    #[test]
    fn test_tracking_envelope_carries_parent_shipping_id() {
        let tracking_id = Uuid::new_v4();
        let shipping_id = Uuid::new_v4();
        let event =
            TrackingEvent::new(EventType::TrackingCreated, tracking_id, shipping_id, EventData::new())
                .unwrap();

        let value: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(value["tracking_id"], tracking_id.to_string());
        assert_eq!(value["shipping_id"], shipping_id.to_string());
        assert_eq!(event.key(), tracking_id.to_string());
    }

    #[test]
    fn test_decode_rejects_foreign_discriminator() {
        let bytes = serde_json::to_vec(&json!({
            "type": "SHIPPING_CREATED",
            "payment_id": Uuid::new_v4(),
            "timestamp": 1,
            "data": {}
        }))
        .unwrap();

        assert!(PaymentEvent::decode(&bytes).is_err());
    }

    #[test]
    fn test_domain_event_decode_by_family() {
        let invoice_id = Uuid::new_v4();
        let event = InvoiceEvent::new(
            EventType::InvoiceDueDateChanged,
            invoice_id,
            data(json!({"due_date": "2025-02-28", "old_due_date": "2025-01-30"})),
        )
        .unwrap();

        let decoded = DomainEvent::decode(EventFamily::Invoice, &event.encode().unwrap()).unwrap();
        assert_eq!(decoded.event_type(), EventType::InvoiceDueDateChanged);
        assert_eq!(decoded.subject_id(), invoice_id);
        assert_eq!(decoded.data_str("old_due_date"), Some("2025-01-30"));
        assert_eq!(decoded, DomainEvent::Invoice(event));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(DomainEvent::decode(EventFamily::Payment, b"not json").is_err());
    }

    #[test]
    fn test_kind_parses_config_spellings() {
        assert_eq!("status_changed".parse::<EventKind>().unwrap(), EventKind::StatusChanged);
        assert_eq!("due-date-changed".parse::<EventKind>().unwrap(), EventKind::DueDateChanged);
        assert!("exploded".parse::<EventKind>().is_err());
    }
}
