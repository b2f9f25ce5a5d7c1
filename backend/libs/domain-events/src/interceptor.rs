//! Persistence-callback interceptor.
//!
//! Registers after-create / after-update / after-delete hooks for every
//! family under stable names (`payment:after_update`, ...). Each hook first
//! checks that the committed row belongs to its schema, then publishes:
//!
//! | Action | Events |
//! |---|---|
//! | after-create | `*_CREATED` |
//! | after-update | `*_UPDATED`, plus the change event when the tracked field changed |
//! | after-delete | `*_DELETED` |
//!
//! Tracked fields: payment `status`, invoice `due_date`, transaction
//! `status`, shipping `status`. Tracking entries have none.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::error::EventResult;
use crate::events::EventFamily;
use crate::models::{
    Entity, EntityRow, Invoice, Payment, PaymentStatus, PaymentTransaction, ShipmentTracking,
    Shipping, ShippingStatus,
};
use crate::persistence::{ChangeSet, CommitEvent, CommitHook, HookAction, HookRegistry};
use crate::publishers::{
    EventPublishers, InvoiceEventPublisher, PaymentEventPublisher, ShippingEventPublisher,
    TrackingEventPublisher, TransactionEventPublisher,
};

const ACTIONS: [HookAction; 3] = [
    HookAction::AfterCreate,
    HookAction::AfterUpdate,
    HookAction::AfterDelete,
];

/// Stable hook name, e.g. `invoice:after_update`.
pub fn hook_name(family: EventFamily, action: HookAction) -> String {
    format!("{}:{}", family.as_str(), action.as_str())
}

/// Wire every family's hooks onto `hooks`. Safe to call repeatedly.
pub fn register_interceptors(hooks: &HookRegistry, publishers: &EventPublishers) -> usize {
    let families: [(EventFamily, Arc<dyn CommitHook>); 5] = [
        (
            EventFamily::Payment,
            Arc::new(PaymentHook(publishers.payment.clone())),
        ),
        (
            EventFamily::Invoice,
            Arc::new(InvoiceHook(publishers.invoice.clone())),
        ),
        (
            EventFamily::Transaction,
            Arc::new(TransactionHook(publishers.transaction.clone())),
        ),
        (
            EventFamily::Shipping,
            Arc::new(ShippingHook(publishers.shipping.clone())),
        ),
        (
            EventFamily::Tracking,
            Arc::new(TrackingHook(publishers.tracking.clone())),
        ),
    ];

    let mut registered = 0;
    for (family, hook) in families {
        for action in ACTIONS {
            hooks.register(hook_name(family, action), action, hook.clone());
            registered += 1;
        }
    }
    debug!(hooks = registered, "Domain event interceptors registered");
    registered
}

/// Pre-change value of `field` when the update changed it.
fn previous<T: serde::de::DeserializeOwned>(
    changes: Option<&ChangeSet>,
    schema: &str,
    field: &str,
) -> Option<T> {
    let changes = changes?;
    if !changes.is_changed(field) {
        return None;
    }
    let value = changes.previous_if_changed(field);
    if value.is_none() {
        warn!(schema, field, "Pre-image value unreadable, skipping change event");
    }
    value
}

struct PaymentHook(PaymentEventPublisher);

#[async_trait]
impl CommitHook for PaymentHook {
    async fn on_commit(&self, event: &CommitEvent) -> EventResult<()> {
        if event.schema() != Payment::SCHEMA {
            return Ok(());
        }
        let EntityRow::Payment(payment) = &event.row else {
            return Ok(());
        };

        match event.action {
            HookAction::AfterCreate => {
                self.0.publish_created(payment).await?;
            }
            HookAction::AfterUpdate => {
                self.0.publish_updated(payment).await?;
                if let Some(old) =
                    previous::<PaymentStatus>(event.changes.as_ref(), Payment::SCHEMA, "status")
                {
                    self.0.publish_status_changed(payment, old).await?;
                }
            }
            HookAction::AfterDelete => {
                self.0.publish_deleted(payment).await?;
            }
        }
        Ok(())
    }
}

struct InvoiceHook(InvoiceEventPublisher);

#[async_trait]
impl CommitHook for InvoiceHook {
    async fn on_commit(&self, event: &CommitEvent) -> EventResult<()> {
        if event.schema() != Invoice::SCHEMA {
            return Ok(());
        }
        let EntityRow::Invoice(invoice) = &event.row else {
            return Ok(());
        };

        match event.action {
            HookAction::AfterCreate => {
                self.0.publish_created(invoice).await?;
            }
            HookAction::AfterUpdate => {
                self.0.publish_updated(invoice).await?;
                if let Some(old) =
                    previous::<NaiveDate>(event.changes.as_ref(), Invoice::SCHEMA, "due_date")
                {
                    self.0.publish_due_date_changed(invoice, old).await?;
                }
            }
            HookAction::AfterDelete => {
                self.0.publish_deleted(invoice).await?;
            }
        }
        Ok(())
    }
}

struct TransactionHook(TransactionEventPublisher);

#[async_trait]
impl CommitHook for TransactionHook {
    async fn on_commit(&self, event: &CommitEvent) -> EventResult<()> {
        if event.schema() != PaymentTransaction::SCHEMA {
            return Ok(());
        }
        let EntityRow::Transaction(transaction) = &event.row else {
            return Ok(());
        };

        match event.action {
            HookAction::AfterCreate => {
                self.0.publish_created(transaction).await?;
            }
            HookAction::AfterUpdate => {
                self.0.publish_updated(transaction).await?;
                if let Some(old) = previous::<String>(
                    event.changes.as_ref(),
                    PaymentTransaction::SCHEMA,
                    "status",
                ) {
                    self.0.publish_status_changed(transaction, &old).await?;
                }
            }
            HookAction::AfterDelete => {
                self.0.publish_deleted(transaction).await?;
            }
        }
        Ok(())
    }
}

struct ShippingHook(ShippingEventPublisher);

#[async_trait]
impl CommitHook for ShippingHook {
    async fn on_commit(&self, event: &CommitEvent) -> EventResult<()> {
        if event.schema() != Shipping::SCHEMA {
            return Ok(());
        }
        let EntityRow::Shipping(shipping) = &event.row else {
            return Ok(());
        };

        match event.action {
            HookAction::AfterCreate => {
                self.0.publish_created(shipping).await?;
            }
            HookAction::AfterUpdate => {
                self.0.publish_updated(shipping).await?;
                if let Some(old) =
                    previous::<ShippingStatus>(event.changes.as_ref(), Shipping::SCHEMA, "status")
                {
                    self.0.publish_status_changed(shipping, old).await?;
                }
            }
            HookAction::AfterDelete => {
                self.0.publish_deleted(shipping).await?;
            }
        }
        Ok(())
    }
}

struct TrackingHook(TrackingEventPublisher);

#[async_trait]
impl CommitHook for TrackingHook {
    async fn on_commit(&self, event: &CommitEvent) -> EventResult<()> {
        if event.schema() != ShipmentTracking::SCHEMA {
            return Ok(());
        }
        let EntityRow::Tracking(tracking) = &event.row else {
            return Ok(());
        };

        match event.action {
            HookAction::AfterCreate => self.0.publish_created(tracking).await.map(|_| ()),
            HookAction::AfterUpdate => self.0.publish_updated(tracking).await.map(|_| ()),
            HookAction::AfterDelete => self.0.publish_deleted(tracking).await.map(|_| ()),
        }
    }
}
