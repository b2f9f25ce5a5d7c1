//! Asynchronous, batching producer.
//!
//! `publish` returns as soon as the message sits in the bounded buffer. A
//! flush task drains the buffer in batches (10 messages or 500 ms, whichever
//! comes first) and hands each batch to the [`BrokerTransport`]:
//!
//! - messages sharing a key are sent one after another, so per-key order is
//!   kept across retries;
//! - different keys in the same batch are sent concurrently;
//! - transient failures are retried (3 retries, 100 ms apart);
//! - permanent failures go to a side channel drained by a logger task.
//!
//! Nothing about delivery is reported back to the caller.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerTransport, OutboundMessage};
use crate::error::TransportError;
use crate::metrics::PipelineMetrics;

/// What `publish` does when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for room.
    #[default]
    Block,
    /// Log, count and discard the message.
    Drop,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop" => Ok(OverflowPolicy::Drop),
            other => Err(format!("expected block or drop, got {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
    pub batch_size: usize,
    pub linger: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            overflow: OverflowPolicy::Block,
            batch_size: 10,
            linger: Duration::from_millis(500),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of handing a message to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    Dropped,
}

/// A message the broker would not take.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub topic: String,
    pub key: String,
    pub attempts: u32,
    pub error: TransportError,
}

struct ProducerInner {
    sender: Mutex<Option<mpsc::Sender<OutboundMessage>>>,
    overflow: OverflowPolicy,
    shutdown_timeout: Duration,
    pending: Arc<AtomicUsize>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    failure_task: Mutex<Option<JoinHandle<()>>>,
    metrics: PipelineMetrics,
}

/// Handle to the single long-lived producer. Cheap to clone.
#[derive(Clone)]
pub struct AsyncProducer {
    inner: Arc<ProducerInner>,
}

impl AsyncProducer {
    /// Spawn the flush and failure-logging tasks. Needs a Tokio runtime.
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        config: ProducerConfig,
        metrics: PipelineMetrics,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_capacity.max(1));
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let flusher = Flusher {
            transport,
            batch_size: config.batch_size.max(1),
            linger: config.linger,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            failures: failure_tx,
            pending: pending.clone(),
        };
        let flush_task = tokio::spawn(flusher.run(rx));
        let failure_task = tokio::spawn(log_failures(failure_rx, metrics.clone()));

        info!(
            buffer_capacity = config.buffer_capacity,
            overflow = ?config.overflow,
            batch_size = config.batch_size,
            linger_ms = config.linger.as_millis() as u64,
            "Domain event producer started"
        );

        Self {
            inner: Arc::new(ProducerInner {
                sender: Mutex::new(Some(tx)),
                overflow: config.overflow,
                shutdown_timeout: config.shutdown_timeout,
                pending,
                flush_task: Mutex::new(Some(flush_task)),
                failure_task: Mutex::new(Some(failure_task)),
                metrics,
            }),
        }
    }

    /// Put a message in the buffer. Returns once it is accepted or dropped.
    pub async fn publish(&self, topic: &str, key: &str, value: Vec<u8>) -> Enqueue {
        let sender = self.inner.sender.lock().clone();
        let Some(sender) = sender else {
            error!(topic = %topic, key = %key, "Producer is closed, dropping event");
            self.inner.metrics.dropped.inc();
            return Enqueue::Dropped;
        };

        let message = OutboundMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            value,
        };

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let accepted = match self.inner.overflow {
            OverflowPolicy::Block => sender.send(message).await.is_ok(),
            OverflowPolicy::Drop => match sender.try_send(message) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    error!(topic = %topic, key = %key, "Producer buffer full, dropping event");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            },
        };

        if accepted {
            self.inner.metrics.enqueued.inc();
            debug!(topic = %topic, key = %key, "Event enqueued");
            Enqueue::Accepted
        } else {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            self.inner.metrics.dropped.inc();
            Enqueue::Dropped
        }
    }

    /// Messages accepted but not yet delivered or given up on.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.inner.metrics
    }

    /// Stop accepting messages and flush what is buffered, waiting at most
    /// the configured shutdown timeout. Returns the number of messages
    /// dropped.
    pub async fn close(&self) -> usize {
        let deadline = self.inner.shutdown_timeout;
        self.close_within(deadline).await
    }

    pub async fn close_within(&self, deadline: Duration) -> usize {
        // Dropping the only long-lived sender lets the flush task drain and exit.
        drop(self.inner.sender.lock().take());

        let flush_task = self.inner.flush_task.lock().take();
        let Some(mut flush_task) = flush_task else {
            return 0;
        };

        let dropped = match tokio::time::timeout(deadline, &mut flush_task).await {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                error!(error = %e, "Producer flush task failed");
                self.inner.pending.swap(0, Ordering::SeqCst)
            }
            Err(_) => {
                flush_task.abort();
                self.inner.pending.swap(0, Ordering::SeqCst)
            }
        };

        if dropped > 0 {
            self.inner.metrics.dropped.inc_by(dropped as u64);
            error!(
                dropped,
                deadline_ms = deadline.as_millis() as u64,
                "Producer shutdown deadline elapsed, dropping undelivered events"
            );
        } else {
            info!("Domain event producer flushed and closed");
        }

        let failure_task = self.inner.failure_task.lock().take();
        if let Some(failure_task) = failure_task {
            let _ = failure_task.await;
        }

        dropped
    }
}

struct Flusher {
    transport: Arc<dyn BrokerTransport>,
    batch_size: usize,
    linger: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    failures: mpsc::UnboundedSender<DeliveryFailure>,
    pending: Arc<AtomicUsize>,
}

impl Flusher {
    async fn run(self, mut rx: mpsc::Receiver<OutboundMessage>) {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            let flush_at = Instant::now() + self.linger;

            while batch.len() < self.batch_size {
                match tokio::time::timeout_at(flush_at, rx.recv()).await {
                    Ok(Some(message)) => batch.push(message),
                    Ok(None) | Err(_) => break,
                }
            }

            self.deliver_batch(batch).await;
        }
        debug!("Producer buffer closed and drained");
    }

    async fn deliver_batch(&self, batch: Vec<OutboundMessage>) {
        let size = batch.len();

        // Group by key, keeping first-seen key order and per-key message order.
        let mut lanes: Vec<Vec<OutboundMessage>> = Vec::new();
        let mut lane_of: HashMap<String, usize> = HashMap::new();
        for message in batch {
            match lane_of.get(&message.key) {
                Some(&lane) => lanes[lane].push(message),
                None => {
                    lane_of.insert(message.key.clone(), lanes.len());
                    lanes.push(vec![message]);
                }
            }
        }

        join_all(lanes.into_iter().map(|lane| async move {
            for message in lane {
                self.deliver(message).await;
            }
        }))
        .await;

        debug!(size, "Flushed event batch");
    }

    async fn deliver(&self, message: OutboundMessage) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.transport.send(&message).await {
                Ok(()) => break,
                Err(err) if err.is_transient() && attempts <= self.max_retries => {
                    warn!(
                        topic = %message.topic,
                        key = %message.key,
                        attempt = attempts,
                        error = %err,
                        "Transient broker error, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(err) => {
                    let _ = self.failures.send(DeliveryFailure {
                        topic: message.topic.clone(),
                        key: message.key.clone(),
                        attempts,
                        error: err,
                    });
                    break;
                }
            }
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn log_failures(mut rx: mpsc::UnboundedReceiver<DeliveryFailure>, metrics: PipelineMetrics) {
    while let Some(failure) = rx.recv().await {
        metrics.delivery_failed.inc();
        error!(
            topic = %failure.topic,
            key = %failure.key,
            attempts = failure.attempts,
            error = %failure.error,
            "Event delivery failed, dropping event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use async_trait::async_trait;

    fn fast_config() -> ProducerConfig {
        ProducerConfig {
            linger: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(5),
            ..ProducerConfig::default()
        }
    }

    fn producer(broker: &MemoryBroker, config: ProducerConfig) -> AsyncProducer {
        AsyncProducer::new(
            Arc::new(broker.clone()),
            config,
            PipelineMetrics::new("producer-test"),
        )
    }

    #[test]
    fn test_overflow_policy_parses() {
        assert_eq!("drop".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Drop);
        assert_eq!(" Block ".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Block);
        assert!("spill".parse::<OverflowPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_publish_delivers_after_linger() {
        let broker = MemoryBroker::default();
        let producer = producer(&broker, fast_config());

        let outcome = producer.publish("payment-created", "key-1", b"{}".to_vec()).await;
        assert_eq!(outcome, Enqueue::Accepted);
        assert!(broker.wait_for_records(1, Duration::from_secs(2)).await);
        assert_eq!(broker.records()[0].key, "key-1");

        assert_eq!(producer.close().await, 0);
    }

    #[tokio::test]
    async fn test_same_key_order_preserved_through_transient_failures() {
        let broker = MemoryBroker::new(2);
        let producer = producer(&broker, fast_config());

        broker.fail_next(TransportError::Transient("not leader".into()));
        broker.fail_next(TransportError::Transient("not leader".into()));
        for i in 0..5 {
            producer
                .publish("payment-updated", "same", i.to_string().into_bytes())
                .await;
        }
        producer.close().await;

        let values: Vec<String> = broker
            .records()
            .into_iter()
            .map(|r| String::from_utf8(r.value).unwrap())
            .collect();
        assert_eq!(values, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_logged_and_producer_continues() {
        let broker = MemoryBroker::default();
        let producer = producer(&broker, fast_config());

        broker.fail_next(TransportError::Permanent("record too large".into()));
        producer.publish("t", "a", b"lost".to_vec()).await;
        producer.publish("t", "a", b"kept".to_vec()).await;
        producer.close().await;

        let records = broker.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, b"kept".to_vec());
        assert_eq!(producer.metrics().delivery_failed.get(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let broker = MemoryBroker::default();
        let producer = producer(&broker, fast_config());

        for _ in 0..4 {
            broker.fail_next(TransportError::Transient("timeout".into()));
        }
        producer.publish("t", "k", b"x".to_vec()).await;
        producer.close().await;

        // first send plus three retries
        assert_eq!(broker.send_attempts(), 4);
        assert!(broker.records().is_empty());
        assert_eq!(producer.metrics().delivery_failed.get(), 1);
    }

    struct StalledTransport;

    #[async_trait]
    impl BrokerTransport for StalledTransport {
        async fn send(&self, _message: &OutboundMessage) -> Result<(), TransportError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drop_policy_discards_when_buffer_full() {
        let config = ProducerConfig {
            buffer_capacity: 1,
            overflow: OverflowPolicy::Drop,
            batch_size: 1,
            ..fast_config()
        };
        let producer = AsyncProducer::new(
            Arc::new(StalledTransport),
            config,
            PipelineMetrics::new("producer-test"),
        );

        // First message is taken by the flush task and stalls there, the
        // second fills the buffer, the rest overflow.
        let mut outcomes = Vec::new();
        for i in 0..5 {
            outcomes.push(producer.publish("t", "k", vec![i]).await);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(outcomes.contains(&Enqueue::Dropped));
        assert_eq!(outcomes[0], Enqueue::Accepted);
        let dropped_on_publish = outcomes.iter().filter(|o| **o == Enqueue::Dropped).count();
        assert_eq!(producer.metrics().dropped.get(), dropped_on_publish as u64);

        let dropped_at_close = producer.close_within(Duration::from_millis(50)).await;
        assert_eq!(dropped_at_close, 5 - dropped_on_publish);
    }

    #[tokio::test]
    async fn test_publish_after_close_is_dropped() {
        let broker = MemoryBroker::default();
        let producer = producer(&broker, fast_config());
        producer.close().await;

        assert_eq!(
            producer.publish("t", "k", b"late".to_vec()).await,
            Enqueue::Dropped
        );
    }

    #[tokio::test]
    async fn test_full_batch_flushes_before_linger() {
        let broker = MemoryBroker::default();
        let config = ProducerConfig {
            linger: Duration::from_secs(60),
            ..fast_config()
        };
        let producer = producer(&broker, config);

        for i in 0..10 {
            producer
                .publish("t", &format!("key-{i}"), b"{}".to_vec())
                .await;
        }
        assert!(broker.wait_for_records(10, Duration::from_secs(2)).await);
        producer.close().await;
    }
}
