//! Pipeline assembly and shutdown.
//!
//! Startup order: catalog, producer, publishers, interceptor hooks on the
//! service's data-access layer, subscriber on the catalog subscription,
//! application handlers, `start`. Shutdown stops the subscriber first so no
//! handler runs against a closed producer, then flushes the producer within
//! its deadline. The caller closes its database pool afterwards.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::broker::{BrokerTransport, GroupConsumer, KafkaGroupConsumer, KafkaTransport};
use crate::error::{PipelineError, SubscriberError};
use crate::events::{DomainEvent, EventType};
use crate::interceptor::register_interceptors;
use crate::metrics::PipelineMetrics;
use crate::persistence::HookRegistry;
use crate::producer::AsyncProducer;
use crate::publishers::EventPublishers;
use crate::registry::HandlerResult;
use crate::settings::PipelineSettings;
use crate::subscriber::{EventSubscriber, SubscriberState, TopicRouter};
use crate::topics::TopicCatalog;

pub struct EventPipeline {
    catalog: TopicCatalog,
    producer: AsyncProducer,
    publishers: EventPublishers,
    hooks: Arc<HookRegistry>,
    subscriber: Option<EventSubscriber>,
    metrics: PipelineMetrics,
}

impl EventPipeline {
    /// Assemble the outbound half over `transport` and wire the interceptor
    /// onto `hooks`.
    pub fn new(
        settings: PipelineSettings,
        transport: Arc<dyn BrokerTransport>,
        hooks: Arc<HookRegistry>,
    ) -> Result<Self, PipelineError> {
        settings.catalog.validate()?;
        let metrics = PipelineMetrics::new(&settings.service);
        let producer = AsyncProducer::new(transport, settings.producer.clone(), metrics.clone());
        let publishers = EventPublishers::new(&producer, &settings.catalog)?;
        let registered = register_interceptors(&hooks, &publishers);

        info!(
            service = %settings.service,
            hooks = registered,
            subscriptions = settings.catalog.subscriptions().len(),
            "Domain event pipeline assembled"
        );

        Ok(Self {
            catalog: settings.catalog,
            producer,
            publishers,
            hooks,
            subscriber: None,
            metrics,
        })
    }

    /// Assemble against Kafka. The consumer is attached only when
    /// `kafka.consumer.enable` is on.
    pub fn connect_kafka(
        settings: PipelineSettings,
        hooks: Arc<HookRegistry>,
    ) -> Result<Self, PipelineError> {
        let transport = Arc::new(KafkaTransport::new(&settings.catalog, &settings.service)?);
        let consumer_enabled = settings.catalog.consumer_enabled();
        let consumer = if consumer_enabled {
            Some(Arc::new(KafkaGroupConsumer::new(&settings.catalog)?))
        } else {
            info!("Kafka consumer disabled by configuration");
            None
        };

        let pipeline = Self::new(settings, transport, hooks)?;
        Ok(match consumer {
            Some(consumer) => pipeline.with_consumer(consumer),
            None => pipeline,
        })
    }

    /// Attach a group member subscribed to the catalog subscription list.
    pub fn with_consumer(mut self, consumer: Arc<dyn GroupConsumer>) -> Self {
        self.subscriber = Some(EventSubscriber::new(
            consumer,
            self.catalog.subscriptions().to_vec(),
            TopicRouter::from_catalog(&self.catalog),
            self.metrics.clone(),
        ));
        self
    }

    pub fn catalog(&self) -> &TopicCatalog {
        &self.catalog
    }

    pub fn producer(&self) -> &AsyncProducer {
        &self.producer
    }

    pub fn publishers(&self) -> &EventPublishers {
        &self.publishers
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn subscriber_state(&self) -> Option<SubscriberState> {
        self.subscriber.as_ref().map(EventSubscriber::state)
    }

    /// Register an application handler on the subscriber.
    pub fn register_handler<F>(&mut self, event_type: EventType, handler: F) -> Result<(), SubscriberError>
    where
        F: Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static,
    {
        match self.subscriber.as_mut() {
            Some(subscriber) => subscriber.register_handler(event_type, handler),
            None => Err(SubscriberError::Disabled),
        }
    }

    /// Start consuming. A pipeline without a consumer starts trivially.
    pub async fn start(&mut self) -> Result<(), SubscriberError> {
        match self.subscriber.as_mut() {
            Some(subscriber) => subscriber.start().await,
            None => Ok(()),
        }
    }

    /// Stop consuming while keeping the producer open, so work queued by
    /// handlers can still publish.
    pub async fn stop_consuming(&mut self) {
        if let Some(mut subscriber) = self.subscriber.take() {
            subscriber.stop().await;
        }
    }

    /// Stop the subscriber, then flush and close the producer.
    pub async fn shutdown(mut self) -> usize {
        self.stop_consuming().await;
        let dropped = self.producer.close().await;
        if dropped > 0 {
            warn!(dropped, "Events dropped during shutdown");
        }
        info!("Domain event pipeline shut down");
        dropped
    }

    /// Wait for `signal`, then shut down.
    pub async fn run_until<F>(self, signal: F) -> usize
    where
        F: Future<Output = ()>,
    {
        signal.await;
        info!("Shutdown signal received");
        self.shutdown().await
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
