//! Per-event-type handler lists.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::events::{DomainEvent, EventType};

pub type HandlerResult = anyhow::Result<()>;

/// Synchronous event handler. Long-running work belongs on a queue the
/// handler feeds, not in the handler itself.
pub type EventHandler = Arc<dyn Fn(&DomainEvent) -> HandlerResult + Send + Sync>;

/// Counts from one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

/// Discriminator to ordered, append-only handler list.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Vec<EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, event_type: EventType, handler: F)
    where
        F: Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn handlers_for(&self, event_type: EventType) -> &[EventHandler] {
        self.handlers
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.values().all(Vec::is_empty)
    }

    /// Run every handler for the event's type in registration order.
    pub fn dispatch(&self, event: &DomainEvent) -> DispatchReport {
        invoke_all(self.handlers_for(event.event_type()), event)
    }
}

/// Invoke handlers in order. A failing or panicking handler is logged and
/// does not stop the ones after it.
pub fn invoke_all(handlers: &[EventHandler], event: &DomainEvent) -> DispatchReport {
    let mut report = DispatchReport::default();

    for (index, handler) in handlers.iter().enumerate() {
        report.invoked += 1;
        match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                report.failed += 1;
                error!(
                    event_type = %event.event_type(),
                    entity_id = %event.subject_id(),
                    handler = index,
                    error = %e,
                    "Event handler failed"
                );
            }
            Err(payload) => {
                report.failed += 1;
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    event_type = %event.event_type(),
                    entity_id = %event.subject_id(),
                    handler = index,
                    panic = %reason,
                    "Event handler panicked"
                );
            }
        }
    }

    report
}
