//! # Domain Events
//!
//! Outbound domain-event pipeline shared by the payment and shipping
//! services. Every committed mutation of a tracked entity becomes a typed
//! event on a Kafka topic keyed by the entity id, and in-process consumers
//! can subscribe to those topics as a consumer group.
//!
//! ## Flow
//!
//! ```text
//! repository commit
//!   -> HookRegistry::fire            (persistence)
//!   -> interceptor hook              (created / updated / deleted / field change)
//!   -> family publisher              (projection + envelope + topic)
//!   -> AsyncProducer                 (bounded buffer, batching, retry)
//!   -> BrokerTransport               (Kafka or in-memory)
//!
//! GroupConsumer -> EventSubscriber -> TopicRouter -> DomainEvent::decode -> handlers
//! ```
//!
//! ## Delivery
//!
//! Once an event is in the producer buffer, delivery is at-least-once per
//! partition: transient broker errors are retried and consumers must be
//! idempotent. Events are published after the commit, outside the database
//! transaction, so a crash between commit and enqueue loses the event;
//! [`reconcile`] lets a downstream consumer detect and republish those rows.
//!
//! Per-entity order follows commit order. Writers hold the row's
//! [`CommitTicket`](persistence::CommitTicket) until the hooks return, the
//! key is the entity id and same-key sends are serialized.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use domain_events::{EventPipeline, EventType, HookRegistry, PipelineSettings};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = PipelineSettings::load("payment-service")?;
//! let hooks = Arc::new(HookRegistry::new());
//! let mut pipeline = EventPipeline::connect_kafka(settings, hooks.clone())?;
//!
//! pipeline.register_handler(EventType::PaymentConfirmed, |event| {
//!     tracing::info!(payment_id = %event.subject_id(), "order confirmed");
//!     Ok(())
//! })?;
//! pipeline.start().await?;
//!
//! pipeline.run_until(domain_events::shutdown_signal()).await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod error;
pub mod events;
pub mod interceptor;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod producer;
pub mod publishers;
pub mod reconcile;
pub mod registry;
pub mod settings;
pub mod subscriber;
pub mod topics;

#[cfg(test)]
mod test_support;

pub use broker::{BrokerTransport, GroupConsumer, MemoryBroker};
pub use error::{
    EventError, EventResult, PersistenceError, PipelineError, SubscriberError, TopicError,
    TransportError,
};
pub use events::{
    DomainEvent, Envelope, EventData, EventFamily, EventKind, EventType, InvoiceEvent,
    PaymentEvent, ShippingEvent, TrackingEvent, TransactionEvent,
};
pub use lifecycle::{shutdown_signal, EventPipeline};
pub use metrics::PipelineMetrics;
pub use models::{
    Entity, EntityRow, Invoice, Payment, PaymentMethod, PaymentStatus, PaymentTransaction,
    ShipmentTracking, Shipping, ShippingStatus,
};
pub use persistence::{ChangeSet, CommitEvent, CommitHook, HookAction, HookRegistry};
pub use producer::{AsyncProducer, Enqueue, OverflowPolicy, ProducerConfig};
pub use publishers::{EventPublishers, LifecyclePublisher, OrderFlowPublisher};
pub use reconcile::{Reconciler, SeenEntities, SnapshotSource};
pub use registry::{HandlerRegistry, HandlerResult};
pub use settings::PipelineSettings;
pub use subscriber::{EventSubscriber, SubscriberState, TopicRouter};
pub use topics::TopicCatalog;
