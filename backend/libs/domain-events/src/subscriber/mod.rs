//! Consumer group subscriber.
//!
//! ```text
//! Unstarted -> Joining -> Consuming <-> Rebalancing
//!                  \          |            /
//!                   +----> Stopping -> Stopped
//! ```
//!
//! `start` launches the poll loop and returns once the member first holds an
//! assignment. The loop routes each message by topic, decodes the envelope,
//! runs the handlers registered for its type and then marks the message
//! processed. Decode failures and handler failures are logged; the message
//! is still marked so the group does not stall on it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{GroupConsumer, GroupEvent, InboundMessage, Polled};
use crate::error::SubscriberError;
use crate::events::{DomainEvent, EventType};
use crate::metrics::PipelineMetrics;
use crate::registry::{HandlerRegistry, HandlerResult};

mod router;

pub use router::TopicRouter;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Unstarted,
    Joining,
    Consuming,
    Rebalancing,
    Stopping,
    Stopped,
}

pub struct EventSubscriber {
    consumer: Arc<dyn GroupConsumer>,
    topics: Vec<String>,
    router: TopicRouter,
    registry: HandlerRegistry,
    state: Arc<watch::Sender<SubscriberState>>,
    ready: Arc<watch::Sender<bool>>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    metrics: PipelineMetrics,
}

impl EventSubscriber {
    pub fn new(
        consumer: Arc<dyn GroupConsumer>,
        topics: Vec<String>,
        router: TopicRouter,
        metrics: PipelineMetrics,
    ) -> Self {
        let (state, _) = watch::channel(SubscriberState::Unstarted);
        let (ready, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            consumer,
            topics,
            router,
            registry: HandlerRegistry::new(),
            state: Arc::new(state),
            ready: Arc::new(ready),
            shutdown: Arc::new(shutdown),
            task: None,
            metrics,
        }
    }

    /// Append a handler for `event_type`. Only allowed before `start`.
    pub fn register_handler<F>(&mut self, event_type: EventType, handler: F) -> Result<(), SubscriberError>
    where
        F: Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static,
    {
        if self.state() != SubscriberState::Unstarted {
            return Err(SubscriberError::AlreadyStarted);
        }
        self.registry.register(event_type, handler);
        Ok(())
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Launch the poll loop and wait until the group is ready.
    pub async fn start(&mut self) -> Result<(), SubscriberError> {
        if self.state() != SubscriberState::Unstarted {
            return Err(SubscriberError::AlreadyStarted);
        }

        let poll_loop = PollLoop {
            consumer: self.consumer.clone(),
            topics: self.topics.clone(),
            router: self.router.clone(),
            registry: Arc::new(std::mem::take(&mut self.registry)),
            state: self.state.clone(),
            ready: self.ready.clone(),
            shutdown: self.shutdown.subscribe(),
            metrics: self.metrics.clone(),
        };

        self.state.send_replace(SubscriberState::Joining);
        info!(topics = ?self.topics, "Starting event subscriber");
        self.task = Some(tokio::spawn(poll_loop.run()));

        let mut ready = self.ready.subscribe();
        let mut state = self.state.subscribe();
        loop {
            if *ready.borrow_and_update() {
                return Ok(());
            }
            if matches!(
                *state.borrow_and_update(),
                SubscriberState::Stopping | SubscriberState::Stopped
            ) {
                return Err(SubscriberError::StoppedBeforeReady);
            }
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        return Err(SubscriberError::StoppedBeforeReady);
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(SubscriberError::StoppedBeforeReady);
                    }
                }
            }
        }
    }

    /// Signal the loop, let the in-flight message finish, then leave the
    /// group.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            self.state.send_replace(SubscriberState::Stopping);
            self.shutdown.send_replace(true);
            if let Err(e) = task.await {
                error!(error = %e, "Subscriber poll loop failed");
            }
            self.consumer.close().await;
        }
        self.state.send_replace(SubscriberState::Stopped);
        info!("Event subscriber stopped");
    }
}

/// Requests a stop from another task. The owner still calls
/// [`EventSubscriber::stop`] to wait for the loop and leave the group.
#[derive(Clone)]
pub struct StopHandle {
    state: Arc<watch::Sender<SubscriberState>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.state.send_replace(SubscriberState::Stopping);
        self.shutdown.send_replace(true);
    }
}

impl EventSubscriber {
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

struct PollLoop {
    consumer: Arc<dyn GroupConsumer>,
    topics: Vec<String>,
    router: TopicRouter,
    registry: Arc<HandlerRegistry>,
    state: Arc<watch::Sender<SubscriberState>>,
    ready: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
    metrics: PipelineMetrics,
}

impl PollLoop {
    async fn run(mut self) {
        if !self.join().await {
            info!("Subscriber stopped while joining");
            return;
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                polled = self.consumer.poll() => polled,
            };

            match polled {
                Ok(Polled::Message(message)) => {
                    backoff = INITIAL_BACKOFF;
                    self.process(&message);
                }
                Ok(Polled::Group(event)) => self.on_group_event(event),
                Err(SubscriberError::Closed) => {
                    warn!("Consumer closed underneath the subscriber");
                    break;
                }
                Err(e) => {
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "Consumer poll failed");
                    if !self.pause(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        debug!("Subscriber poll loop exited");
    }

    /// Subscribe, retrying with exponential backoff until it works or a stop
    /// is requested.
    async fn join(&mut self) -> bool {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *self.shutdown.borrow() {
                return false;
            }
            match self.consumer.subscribe(&self.topics) {
                Ok(()) => {
                    info!(topics = self.topics.len(), "Joined consumer group");
                    return true;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Failed to join consumer group, retrying"
                    );
                    if !self.pause(backoff).await {
                        return false;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Sleep unless a stop arrives first. Returns `false` on stop.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => false,
            _ = tokio::time::sleep(duration) => !*self.shutdown.borrow(),
        }
    }

    fn on_group_event(&self, event: GroupEvent) {
        match event {
            GroupEvent::Assigned(partitions) => {
                info!(partitions = partitions.len(), "Partitions assigned");
                self.state.send_replace(SubscriberState::Consuming);
                self.ready.send_if_modified(|ready| {
                    let first = !*ready;
                    *ready = true;
                    first
                });
            }
            GroupEvent::Revoked(partitions) => {
                info!(partitions = partitions.len(), "Partitions revoked, rebalancing");
                self.state.send_replace(SubscriberState::Rebalancing);
            }
            GroupEvent::RebalanceFailed(reason) => {
                warn!(reason = %reason, "Consumer group rebalance failed");
            }
        }
    }

    fn process(&self, message: &InboundMessage) {
        self.dispatch(message);
        if let Err(e) = self.consumer.mark_processed(message) {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Failed to mark message processed"
            );
        }
    }

    fn dispatch(&self, message: &InboundMessage) {
        let Some(family) = self.router.route(&message.topic) else {
            warn!(topic = %message.topic, "No entity route for topic, skipping message");
            return;
        };

        let Some(payload) = message.value.as_deref() else {
            debug!(topic = %message.topic, offset = message.offset, "Empty message payload, skipping");
            return;
        };

        match DomainEvent::decode(family, payload) {
            Ok(event) => {
                let report = self.registry.dispatch(&event);
                if report.failed > 0 {
                    self.metrics.handler_errors.inc_by(report.failed as u64);
                }
                debug!(
                    topic = %message.topic,
                    event_type = %event.event_type(),
                    entity_id = %event.subject_id(),
                    handlers = report.invoked,
                    "Dispatched event"
                );
            }
            Err(e) => {
                self.metrics.decode_errors.inc();
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    family = %family,
                    error = %e,
                    "Failed to decode event, skipping message"
                );
            }
        }
    }
}
