//! In-memory broker for tests and single-process runs.
//!
//! Behaves like a small Kafka cluster:
//! - Topics are partitioned append-only logs (auto-created on first send)
//! - Keyed records land on `hash(key) % partitions`, unkeyed ones round-robin
//! - Consumer groups keep committed offsets; a new member resumes from them
//! - Consumers block until a record is appended (no polling)
//!
//! Every member of a group is assigned every partition; there is no
//! rebalancing. Failure injection hooks let tests take the broker "down".

use super::broker::{
    Broker, BrokerConsumer, BrokerError, InboundRecord, MessageHeaders, OutboundRecord,
    PartitionOffset, RecordMetadata, SubscriptionRequest, TopicSpec,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};

type PartitionLog = Vec<Vec<InboundRecord>>;
/// group -> (topic, partition) -> next offset to read
type CommittedOffsets = HashMap<String, HashMap<(String, i32), i64>>;

struct Inner {
    default_partitions: usize,
    log: RwLock<HashMap<String, PartitionLog>>,
    committed: Mutex<CommittedOffsets>,
    groups: Mutex<BTreeSet<String>>,
    appended: watch::Sender<u64>,
    connected: AtomicBool,
    round_robin: AtomicU64,
    send_attempts: AtomicU64,
    fail_all: AtomicBool,
    fail_next: AtomicU32,
    failing_topics: Mutex<HashSet<String>>,
}

/// Shared in-memory cluster. Clones share the same logs.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Broker whose auto-created topics have a single partition
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Broker whose auto-created topics have `partitions` partitions
    pub fn with_partitions(partitions: usize) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                default_partitions: partitions.max(1),
                log: RwLock::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
                groups: Mutex::new(BTreeSet::new()),
                appended,
                connected: AtomicBool::new(false),
                round_robin: AtomicU64::new(0),
                send_attempts: AtomicU64::new(0),
                fail_all: AtomicBool::new(false),
                fail_next: AtomicU32::new(0),
                failing_topics: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// All records of `topic`, partition by partition in offset order
    pub async fn records(&self, topic: &str) -> Vec<InboundRecord> {
        self.inner
            .log
            .read()
            .await
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn record_count(&self, topic: &str) -> usize {
        self.inner
            .log
            .read()
            .await
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.log.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Append raw bytes, bypassing connection state and failure injection.
    /// Used to simulate foreign producers writing malformed records.
    pub async fn publish_raw(
        &self,
        topic: &str,
        key: Option<&str>,
        value: impl Into<Vec<u8>>,
    ) -> RecordMetadata {
        self.append(OutboundRecord {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            value: value.into(),
            headers: MessageHeaders::new(),
        })
        .await
    }

    /// Number of `send` calls that reached the broker, failed or not
    pub fn send_attempts(&self) -> u64 {
        self.inner.send_attempts.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Fail every send until [`heal`](Self::heal)
    pub fn fail_sends(&self) {
        self.inner.fail_all.store(true, Ordering::SeqCst);
    }

    /// Fail the next `count` sends
    pub fn fail_next_sends(&self, count: u32) {
        self.inner.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every send to `topic` until [`heal`](Self::heal)
    pub async fn fail_topic(&self, topic: &str) {
        self.inner
            .failing_topics
            .lock()
            .await
            .insert(topic.to_string());
    }

    /// Clear all injected failures
    pub async fn heal(&self) {
        self.inner.fail_all.store(false, Ordering::SeqCst);
        self.inner.fail_next.store(0, Ordering::SeqCst);
        self.inner.failing_topics.lock().await.clear();
    }

    async fn injected_failure(&self, topic: &str) -> bool {
        if self.inner.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        if self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return true;
        }
        self.inner.failing_topics.lock().await.contains(topic)
    }

    async fn append(&self, outbound: OutboundRecord) -> RecordMetadata {
        let metadata = {
            let mut log = self.inner.log.write().await;
            let partitions = log
                .entry(outbound.topic.clone())
                .or_insert_with(|| vec![Vec::new(); self.inner.default_partitions]);

            let partition = match &outbound.key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() % partitions.len() as u64) as usize
                }
                None => {
                    (self.inner.round_robin.fetch_add(1, Ordering::SeqCst)
                        % partitions.len() as u64) as usize
                }
            };

            let offset = partitions[partition].len() as i64;
            partitions[partition].push(InboundRecord {
                topic: outbound.topic,
                partition: partition as i32,
                offset,
                key: outbound.key,
                value: Some(outbound.value),
                headers: outbound.headers,
                timestamp_ms: Some(chrono::Utc::now().timestamp_millis()),
            });

            RecordMetadata {
                partition: partition as i32,
                offset,
            }
        };

        self.inner.appended.send_modify(|version| *version += 1);
        metadata
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, record: OutboundRecord) -> Result<RecordMetadata, BrokerError> {
        self.inner.send_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        if self.injected_failure(&record.topic).await {
            return Err(BrokerError::Unavailable(format!(
                "injected failure sending to '{}'",
                record.topic
            )));
        }

        Ok(self.append(record).await)
    }

    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        self.inner
            .groups
            .lock()
            .await
            .insert(request.group_id.clone());

        let mut positions = HashMap::new();
        {
            let log = self.inner.log.read().await;
            let committed = self.inner.committed.lock().await;
            let group_offsets = committed.get(&request.group_id);

            if let Some(partitions) = log.get(&request.topic) {
                for (partition, records) in partitions.iter().enumerate() {
                    let partition = partition as i32;
                    let start = group_offsets
                        .and_then(|offsets| offsets.get(&(request.topic.clone(), partition)))
                        .copied()
                        .unwrap_or(if request.from_beginning {
                            0
                        } else {
                            records.len() as i64
                        });
                    positions.insert(partition, start);
                }
            }
        }

        Ok(Box::new(InMemoryConsumer {
            broker: self.clone(),
            topic: request.topic.clone(),
            group_id: request.group_id.clone(),
            positions,
            cursor: 0,
            changes: self.inner.appended.subscribe(),
            closed: false,
        }))
    }

    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<Vec<String>, BrokerError> {
        let mut log = self.inner.log.write().await;
        let mut created = Vec::new();
        for spec in topics {
            if !log.contains_key(&spec.name) {
                let partitions = spec.num_partitions.max(1) as usize;
                log.insert(spec.name.clone(), vec![Vec::new(); partitions]);
                created.push(spec.name.clone());
            }
        }
        Ok(created)
    }

    async fn consumer_group_offsets(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<Vec<PartitionOffset>, BrokerError> {
        let log = self.inner.log.read().await;
        let committed = self.inner.committed.lock().await;
        let group_offsets = committed.get(group_id);

        let partitions = log
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;

        Ok(partitions
            .iter()
            .enumerate()
            .map(|(partition, records)| {
                let partition = partition as i32;
                let committed = group_offsets
                    .and_then(|offsets| offsets.get(&(topic.to_string(), partition)))
                    .copied();
                let high_watermark = records.len() as i64;
                PartitionOffset {
                    partition,
                    committed,
                    high_watermark,
                    lag: (high_watermark - committed.unwrap_or(0)).max(0),
                }
            })
            .collect())
    }

    async fn list_consumer_groups(&self) -> Result<Vec<String>, BrokerError> {
        Ok(self.inner.groups.lock().await.iter().cloned().collect())
    }
}

struct InMemoryConsumer {
    broker: InMemoryBroker,
    topic: String,
    group_id: String,
    /// partition -> next offset to deliver
    positions: HashMap<i32, i64>,
    /// Partition to look at first, rotated for fairness
    cursor: usize,
    changes: watch::Receiver<u64>,
    closed: bool,
}

impl InMemoryConsumer {
    async fn next_record(&mut self) -> Option<InboundRecord> {
        let log = self.broker.inner.log.read().await;
        let partitions = log.get(&self.topic)?;
        let count = partitions.len();

        for step in 0..count {
            let partition = (self.cursor + step) % count;
            // Partitions created after subscribing start at 0
            let position = self.positions.entry(partition as i32).or_insert(0);
            if let Some(record) = partitions[partition].get(*position as usize) {
                *position += 1;
                self.cursor = (partition + 1) % count;
                return Some(record.clone());
            }
        }
        None
    }
}

#[async_trait::async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn recv(&mut self) -> Result<InboundRecord, BrokerError> {
        loop {
            if self.closed {
                return Err(BrokerError::Closed);
            }

            // Mark the current version seen before scanning so an append
            // racing the scan still wakes us
            self.changes.borrow_and_update();
            if let Some(record) = self.next_record().await {
                return Ok(record);
            }

            self.changes
                .changed()
                .await
                .map_err(|_| BrokerError::Closed)?;
        }
    }

    async fn commit(&mut self, record: &InboundRecord) -> Result<(), BrokerError> {
        let mut committed = self.broker.inner.committed.lock().await;
        let next = committed
            .entry(self.group_id.clone())
            .or_default()
            .entry((record.topic.clone(), record.partition))
            .or_insert(0);
        *next = (*next).max(record.offset + 1);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(topic: &str, group_id: &str, from_beginning: bool) -> SubscriptionRequest {
        SubscriptionRequest {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            from_beginning,
            auto_commit: true,
            max_bytes_per_partition: 1_048_576,
            session_timeout: Duration::from_secs(30),
        }
    }

    fn record(topic: &str, key: &str, value: &str) -> OutboundRecord {
        OutboundRecord {
            topic: topic.to_string(),
            key: Some(key.to_string()),
            value: value.as_bytes().to_vec(),
            headers: MessageHeaders::new(),
        }
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let broker = InMemoryBroker::new();
        let result = broker.send(record("t", "k", "v")).await;
        assert!(matches!(result, Err(BrokerError::NotConnected)));
        assert_eq!(broker.send_attempts(), 1);
    }

    #[tokio::test]
    async fn test_same_key_same_partition() {
        let broker = InMemoryBroker::with_partitions(4);
        broker.connect().await.unwrap();

        let first = broker.send(record("t", "tenant-1", "a")).await.unwrap();
        let second = broker.send(record("t", "tenant-1", "b")).await.unwrap();

        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn test_latest_skips_existing_records() {
        let broker = InMemoryBroker::new();
        broker.publish_raw("t", None, "old").await;

        let mut consumer = broker.subscribe(&request("t", "g", false)).await.unwrap();
        broker.publish_raw("t", None, "new").await;

        let received = consumer.recv().await.unwrap();
        assert_eq!(received.value.as_deref(), Some(b"new".as_slice()));
    }

    #[tokio::test]
    async fn test_group_resumes_after_committed_offset() {
        let broker = InMemoryBroker::new();
        for value in ["a", "b", "c"] {
            broker.publish_raw("t", Some("k"), value).await;
        }

        let mut consumer = broker.subscribe(&request("t", "g", true)).await.unwrap();
        let first = consumer.recv().await.unwrap();
        consumer.commit(&first).await.unwrap();
        consumer.close().await.unwrap();

        let mut resumed = broker.subscribe(&request("t", "g", true)).await.unwrap();
        assert_eq!(resumed.recv().await.unwrap().offset, 1);

        let offsets = broker.consumer_group_offsets("g", "t").await.unwrap();
        assert_eq!(offsets[0].committed, Some(1));
        assert_eq!(offsets[0].lag, 2);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_append() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.subscribe(&request("t", "g", true)).await.unwrap();

        let waiter = tokio::spawn(async move { consumer.recv().await.map(|r| r.offset) });
        tokio::task::yield_now().await;
        broker.publish_raw("t", None, "x").await;

        let offset = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = InMemoryBroker::new();
        broker.connect().await.unwrap();

        broker.fail_next_sends(1);
        assert!(broker.send(record("t", "k", "a")).await.is_err());
        assert!(broker.send(record("t", "k", "b")).await.is_ok());

        broker.fail_topic("t.dlq").await;
        assert!(broker.send(record("t.dlq", "k", "c")).await.is_err());
        broker.heal().await;
        assert!(broker.send(record("t.dlq", "k", "c")).await.is_ok());
        assert_eq!(broker.send_attempts(), 4);
    }

    #[tokio::test]
    async fn test_create_topics_reports_only_new() {
        let broker = InMemoryBroker::new();
        let specs = [TopicSpec::new("a").partitions(2), TopicSpec::new("b")];

        assert_eq!(broker.create_topics(&specs).await.unwrap(), vec!["a", "b"]);
        assert!(broker.create_topics(&specs).await.unwrap().is_empty());
        assert!(matches!(
            broker.consumer_group_offsets("g", "missing").await,
            Err(BrokerError::UnknownTopic(_))
        ));
    }
}
