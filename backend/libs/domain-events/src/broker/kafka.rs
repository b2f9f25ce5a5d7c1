//! Kafka transport and consumer group member built on `rdkafka`.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::ClientConfig;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::{BrokerTransport, GroupConsumer, GroupEvent, InboundMessage, OutboundMessage, Polled};
use crate::error::{SubscriberError, TransportError};
use crate::topics::TopicCatalog;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Producer side
// ============================================================================

/// Leader-acknowledged, snappy-compressed Kafka producer.
///
/// Batching and retry are owned by [`crate::producer::AsyncProducer`]; the
/// client itself only lingers briefly so the per-key sequential sends of a
/// batch are not held back.
pub struct KafkaTransport {
    producer: FutureProducer,
}

impl KafkaTransport {
    pub fn new(catalog: &TopicCatalog, client_id: &str) -> Result<Self, TransportError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", catalog.bootstrap_servers())
            .set("client.id", client_id)
            .set("acks", "1")
            .set("compression.type", "snappy")
            .set("linger.ms", "5")
            .set("retries", "0")
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| TransportError::Permanent(format!("Failed to create Kafka producer: {}", e)))?;

        info!(
            brokers = %catalog.bootstrap_servers(),
            client_id = %client_id,
            "Kafka producer created"
        );

        Ok(Self { producer })
    }
}

#[async_trait]
impl BrokerTransport for KafkaTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.value);

        match self.producer.send(record, DELIVERY_TIMEOUT).await {
            Ok((partition, offset)) => {
                debug!(
                    topic = %message.topic,
                    key = %message.key,
                    partition,
                    offset,
                    "Message delivered"
                );
                Ok(())
            }
            Err((err, _)) => Err(classify(err)),
        }
    }
}

/// Split broker errors into retryable and terminal ones.
fn classify(err: KafkaError) -> TransportError {
    let transient = matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::NotEnoughReplicas
                | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
        )
    );

    if transient {
        TransportError::Transient(err.to_string())
    } else {
        TransportError::Permanent(err.to_string())
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// Forwards rebalance callbacks into the poll stream.
pub struct GroupContext {
    events: mpsc::UnboundedSender<GroupEvent>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let _ = self.events.send(GroupEvent::Revoked(partitions(tpl)));
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let _ = self.events.send(GroupEvent::Assigned(partitions(tpl)));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(err) => {
                let _ = self.events.send(GroupEvent::RebalanceFailed(err.to_string()));
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(error = %e, "Offset commit failed");
        }
    }
}

fn partitions(tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    tpl.elements()
        .iter()
        .map(|elem| (elem.topic().to_string(), elem.partition()))
        .collect()
}

/// Group member with round-robin assignment, earliest initial offset and
/// offsets stored only once a message has been processed.
pub struct KafkaGroupConsumer {
    consumer: StreamConsumer<GroupContext>,
    events: Mutex<mpsc::UnboundedReceiver<GroupEvent>>,
}

impl KafkaGroupConsumer {
    pub fn new(catalog: &TopicCatalog) -> Result<Self, SubscriberError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let consumer: StreamConsumer<GroupContext> = ClientConfig::new()
            .set("bootstrap.servers", catalog.bootstrap_servers())
            .set("group.id", catalog.group_id())
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "1000")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("partition.assignment.strategy", "roundrobin")
            .set("session.timeout.ms", "10000")
            .create_with_context(GroupContext { events: tx })?;

        info!(
            brokers = %catalog.bootstrap_servers(),
            group_id = %catalog.group_id(),
            "Kafka consumer created"
        );

        Ok(Self {
            consumer,
            events: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl GroupConsumer for KafkaGroupConsumer {
    fn subscribe(&self, topics: &[String]) -> Result<(), SubscriberError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        Ok(())
    }

    async fn poll(&self) -> Result<Polled, SubscriberError> {
        let mut events = self.events.lock().await;
        tokio::select! {
            biased;
            Some(event) = events.recv() => Ok(Polled::Group(event)),
            message = self.consumer.recv() => {
                let message = message?;
                Ok(Polled::Message(InboundMessage {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key: message.key().map(<[u8]>::to_vec),
                    value: message.payload().map(<[u8]>::to_vec),
                }))
            }
        }
    }

    fn mark_processed(&self, message: &InboundMessage) -> Result<(), SubscriberError> {
        // The stored offset is the next one to read.
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset + 1)?;
        Ok(())
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
        info!("Kafka consumer left the group");
    }
}
