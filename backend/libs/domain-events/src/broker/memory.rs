//! In-process broker.
//!
//! Keeps one global append log, partitions by key hash and tracks committed
//! offsets per (group, topic, partition). A fresh member of a group resumes
//! after the group's committed offsets; a member of a new group starts from
//! the oldest record.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{BrokerTransport, GroupConsumer, GroupEvent, InboundMessage, OutboundMessage, Polled};
use crate::error::{SubscriberError, TransportError};

/// A record as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    pub value: Vec<u8>,
}

impl StoredRecord {
    /// Parse the value as JSON.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.value)
    }

    fn to_inbound(&self) -> InboundMessage {
        InboundMessage {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            key: Some(self.key.clone().into_bytes()),
            value: Some(self.value.clone()),
        }
    }
}

#[derive(Default)]
struct LogState {
    records: Vec<StoredRecord>,
    next_offsets: HashMap<(String, i32), i64>,
    faults: VecDeque<TransportError>,
    committed: HashMap<(String, String, i32), i64>,
    sends: usize,
}

struct BrokerInner {
    partitions: i32,
    log: Mutex<LogState>,
    appended: Notify,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(3)
    }
}

impl MemoryBroker {
    pub fn new(partitions: i32) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                partitions: partitions.max(1),
                log: Mutex::new(LogState::default()),
                appended: Notify::new(),
            }),
        }
    }

    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as i32
    }

    /// Every record in append order.
    pub fn records(&self) -> Vec<StoredRecord> {
        self.inner.log.lock().records.clone()
    }

    pub fn records_on(&self, topic: &str) -> Vec<StoredRecord> {
        self.inner
            .log
            .lock()
            .records
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of send attempts seen, failed ones included.
    pub fn send_attempts(&self) -> usize {
        self.inner.log.lock().sends
    }

    /// Make the next send fail with `error`. Faults queue up in order.
    pub fn fail_next(&self, error: TransportError) {
        self.inner.log.lock().faults.push_back(error);
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .log
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// A new member of `group`.
    pub fn consumer(&self, group: impl Into<String>) -> MemoryGroupConsumer {
        MemoryGroupConsumer {
            broker: self.clone(),
            group: group.into(),
            state: Mutex::new(MemberState::default()),
        }
    }

    /// Wait until at least `count` records are stored.
    pub async fn wait_for_records(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.appended.notified();
                if self.inner.log.lock().records.len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let partition = self.partition_for(&message.key);
        {
            let mut log = self.inner.log.lock();
            log.sends += 1;
            if let Some(fault) = log.faults.pop_front() {
                return Err(fault);
            }
            let next = log
                .next_offsets
                .entry((message.topic.clone(), partition))
                .or_insert(0);
            let offset = *next;
            *next += 1;
            log.records.push(StoredRecord {
                topic: message.topic.clone(),
                partition,
                offset,
                key: message.key.clone(),
                value: message.value.clone(),
            });
        }
        self.inner.appended.notify_waiters();
        Ok(())
    }
}

#[derive(Default)]
struct MemberState {
    topics: Vec<String>,
    cursor: usize,
    pending: VecDeque<GroupEvent>,
    closed: bool,
}

/// Sole member of its group: every partition of every subscribed topic is
/// assigned to it.
pub struct MemoryGroupConsumer {
    broker: MemoryBroker,
    group: String,
    state: Mutex<MemberState>,
}

impl MemoryGroupConsumer {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Simulate a rebalance: revoke everything, then reassign it.
    pub fn trigger_rebalance(&self) {
        {
            let mut state = self.state.lock();
            let partitions = self.assignment(&state.topics);
            state.pending.push_back(GroupEvent::Revoked(partitions.clone()));
            state.pending.push_back(GroupEvent::Assigned(partitions));
        }
        self.broker.inner.appended.notify_waiters();
    }

    fn assignment(&self, topics: &[String]) -> Vec<(String, i32)> {
        topics
            .iter()
            .flat_map(|topic| (0..self.broker.inner.partitions).map(move |p| (topic.clone(), p)))
            .collect()
    }

    fn next(&self) -> Result<Option<Polled>, SubscriberError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SubscriberError::Closed);
        }
        if let Some(event) = state.pending.pop_front() {
            return Ok(Some(Polled::Group(event)));
        }
        if state.topics.is_empty() {
            return Ok(None);
        }

        let log = self.broker.inner.log.lock();
        while state.cursor < log.records.len() {
            let record = &log.records[state.cursor];
            state.cursor += 1;
            if !state.topics.contains(&record.topic) {
                continue;
            }
            let committed = log
                .committed
                .get(&(self.group.clone(), record.topic.clone(), record.partition))
                .copied()
                .unwrap_or(0);
            if record.offset < committed {
                continue;
            }
            return Ok(Some(Polled::Message(record.to_inbound())));
        }
        Ok(None)
    }
}

#[async_trait]
impl GroupConsumer for MemoryGroupConsumer {
    fn subscribe(&self, topics: &[String]) -> Result<(), SubscriberError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SubscriberError::Closed);
        }
        state.topics = topics.to_vec();
        state.cursor = 0;
        let partitions = self.assignment(topics);
        state.pending.push_back(GroupEvent::Assigned(partitions));
        Ok(())
    }

    async fn poll(&self) -> Result<Polled, SubscriberError> {
        loop {
            let notified = self.broker.inner.appended.notified();
            if let Some(polled) = self.next()? {
                return Ok(polled);
            }
            notified.await;
        }
    }

    fn mark_processed(&self, message: &InboundMessage) -> Result<(), SubscriberError> {
        let mut log = self.broker.inner.log.lock();
        let committed = log
            .committed
            .entry((self.group.clone(), message.topic.clone(), message.partition))
            .or_insert(0);
        *committed = (*committed).max(message.offset + 1);
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
        self.broker.inner.appended.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, key: &str, value: &str) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_same_key_lands_on_same_partition_in_order() {
        let broker = MemoryBroker::new(4);
        for i in 0..5 {
            broker
                .send(&message("payment-updated", "key-a", &i.to_string()))
                .await
                .unwrap();
        }

        let records = broker.records_on("payment-updated");
        let partition = broker.partition_for("key-a");
        assert!(records.iter().all(|r| r.partition == partition));
        let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_injected_fault_fails_one_send() {
        let broker = MemoryBroker::default();
        broker.fail_next(TransportError::Transient("leader election".into()));

        assert!(broker.send(&message("t", "k", "1")).await.is_err());
        assert!(broker.send(&message("t", "k", "2")).await.is_ok());
        assert_eq!(broker.records().len(), 1);
        assert_eq!(broker.send_attempts(), 2);
    }

    #[tokio::test]
    async fn test_consumer_sees_assignment_then_messages() {
        let broker = MemoryBroker::new(1);
        broker.send(&message("a", "k", "1")).await.unwrap();
        broker.send(&message("b", "k", "2")).await.unwrap();

        let consumer = broker.consumer("group");
        consumer.subscribe(&["a".to_string()]).unwrap();

        match consumer.poll().await.unwrap() {
            Polled::Group(GroupEvent::Assigned(partitions)) => {
                assert_eq!(partitions, vec![("a".to_string(), 0)])
            }
            other => panic!("expected assignment, got {other:?}"),
        }
        match consumer.poll().await.unwrap() {
            Polled::Message(m) => assert_eq!(m.value.as_deref(), Some(&b"1"[..])),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_new_member_resumes_after_committed_offset() {
        let broker = MemoryBroker::new(1);
        broker.send(&message("t", "k", "1")).await.unwrap();
        broker.send(&message("t", "k", "2")).await.unwrap();

        let first = broker.consumer("g");
        first.subscribe(&["t".to_string()]).unwrap();
        first.poll().await.unwrap();
        if let Polled::Message(m) = first.poll().await.unwrap() {
            first.mark_processed(&m).unwrap();
        }
        first.close().await;
        assert_eq!(broker.committed_offset("g", "t", 0), Some(1));

        let second = broker.consumer("g");
        second.subscribe(&["t".to_string()]).unwrap();
        second.poll().await.unwrap();
        match second.poll().await.unwrap() {
            Polled::Message(m) => assert_eq!(m.offset, 1),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let broker = MemoryBroker::new(1);
        let consumer = broker.consumer("g");
        consumer.subscribe(&["t".to_string()]).unwrap();
        consumer.poll().await.unwrap();

        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.send(&message("t", "k", "late")).await.unwrap();
        });

        let polled = tokio::time::timeout(Duration::from_secs(2), consumer.poll())
            .await
            .expect("poll should wake")
            .unwrap();
        assert!(matches!(polled, Polled::Message(_)));
    }

    #[tokio::test]
    async fn test_closed_consumer_errors() {
        let broker = MemoryBroker::default();
        let consumer = broker.consumer("g");
        consumer.close().await;
        assert!(matches!(consumer.poll().await, Err(SubscriberError::Closed)));
    }
}
