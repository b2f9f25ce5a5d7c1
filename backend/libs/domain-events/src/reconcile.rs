//! Downstream reconciliation for the commit/publish crash window.
//!
//! Publishing happens after the commit with no shared transaction, so a
//! crash between the two loses the event while the row survives. A
//! downstream consumer records every entity it has observed in
//! [`SeenEntities`]; [`Reconciler::republish_unseen`] then scans the store and
//! publishes `*_CREATED` again for rows the consumer never heard about.
//! Rows it has seen are left alone, so no duplicate create is emitted for
//! them.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{DomainEvent, EventFamily, EventType};
use crate::models::Entity;
use crate::publishers::LifecyclePublisher;
use crate::registry::HandlerResult;

/// Anything that can list the current rows of an entity.
#[async_trait]
pub trait SnapshotSource<E: Entity>: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<Vec<E>>;
}

/// Entity ids a consumer has observed, per family.
#[derive(Clone, Default)]
pub struct SeenEntities {
    inner: Arc<RwLock<HashSet<(EventFamily, Uuid)>>>,
}

impl SeenEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &DomainEvent) {
        self.inner.write().insert((event.family(), event.subject_id()));
    }

    pub fn contains(&self, family: EventFamily, id: Uuid) -> bool {
        self.inner.read().contains(&(family, id))
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Handler that records every event it is given.
    pub fn handler(&self) -> impl Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static {
        let seen = self.clone();
        move |event: &DomainEvent| {
            seen.record(event);
            Ok(())
        }
    }

    /// Discriminators worth recording: every lifecycle event of every
    /// family. Order-coordination events carry no entity snapshot.
    pub fn tracked_types() -> impl Iterator<Item = EventType> {
        EventType::ALL
            .into_iter()
            .filter(|t| !matches!(t, EventType::PaymentConfirmed | EventType::PaymentFailed))
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub republished: usize,
    pub failed: usize,
}

pub struct Reconciler<'a> {
    seen: &'a SeenEntities,
}

impl<'a> Reconciler<'a> {
    pub fn new(seen: &'a SeenEntities) -> Self {
        Self { seen }
    }

    /// Republish `*_CREATED` for every row of `E` the consumer has not seen.
    pub async fn republish_unseen<E, S, P>(&self, source: &S, publisher: &P) -> anyhow::Result<ReconcileReport>
    where
        E: Entity,
        S: SnapshotSource<E> + ?Sized,
        P: LifecyclePublisher<E> + ?Sized,
    {
        let rows = source.snapshot().await?;
        let mut report = ReconcileReport {
            scanned: rows.len(),
            ..ReconcileReport::default()
        };

        for row in rows {
            if self.seen.contains(E::FAMILY, row.id()) {
                continue;
            }
            match publisher.created(&row).await {
                Ok(()) => report.republished += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        schema = E::SCHEMA,
                        entity_id = %row.id(),
                        error = %e,
                        "Failed to republish unseen entity"
                    );
                }
            }
        }

        info!(
            schema = E::SCHEMA,
            scanned = report.scanned,
            republished = report.republished,
            failed = report.failed,
            "Reconciliation pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventData, ShippingEvent};

    #[test]
    fn test_seen_entities_are_scoped_by_family() {
        let seen = SeenEntities::new();
        let id = Uuid::new_v4();
        let event: DomainEvent = ShippingEvent::new(EventType::ShippingCreated, id, EventData::new())
            .unwrap()
            .into();

        (seen.handler())(&event).unwrap();
        assert!(seen.contains(EventFamily::Shipping, id));
        assert!(!seen.contains(EventFamily::Payment, id));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_tracked_types_skip_order_flow() {
        let tracked: Vec<EventType> = SeenEntities::tracked_types().collect();
        assert_eq!(tracked.len(), 19);
        assert!(!tracked.contains(&EventType::PaymentConfirmed));
    }
}
