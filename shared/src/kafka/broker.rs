// ============================================================================
// Broker Transport Seam
// ============================================================================
//
// The bus client talks to the broker only through these traits:
// - `Broker`: producer connection, consumer factory, admin operations
// - `BrokerConsumer`: one group member subscribed to one topic
//
// Implementations:
// - `KafkaBroker` (rdkafka) for Kafka / Redpanda
// - `InMemoryBroker` for tests and single-process runs
//
// ============================================================================

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// String headers carried with every record
pub type MessageHeaders = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("transport not connected")]
    NotConnected,

    #[error("consumer closed")]
    Closed,

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("admin operation failed: {0}")]
    Admin(String),
}

/// Record handed to the transport for publishing
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: MessageHeaders,
}

/// Where the broker stored a published record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    pub partition: i32,
    pub offset: i64,
}

/// Record delivered to a consumer
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Option<Vec<u8>>,
    pub headers: MessageHeaders,
    /// Broker timestamp in milliseconds since epoch
    pub timestamp_ms: Option<i64>,
}

/// Fully resolved consumer settings for one subscription
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub topic: String,
    pub group_id: String,
    pub from_beginning: bool,
    pub auto_commit: bool,
    pub max_bytes_per_partition: u32,
    pub session_timeout: Duration,
}

/// Topic to create if absent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub num_partitions: i32,
    pub replication_factor: i32,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_partitions: 3,
            replication_factor: 1,
        }
    }

    pub fn partitions(mut self, num_partitions: i32) -> Self {
        self.num_partitions = num_partitions;
        self
    }

    pub fn replication(mut self, replication_factor: i32) -> Self {
        self.replication_factor = replication_factor;
        self
    }
}

/// Committed position and lag of a consumer group on one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOffset {
    pub partition: i32,
    /// Next offset the group will read (None = nothing committed yet)
    pub committed: Option<i64>,
    pub high_watermark: i64,
    pub lag: i64,
}

#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Establish the producer connection. Errors are fatal to startup.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Flush in-flight records and drop the producer connection
    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Publish one record and wait for the broker acknowledgment
    async fn send(&self, record: OutboundRecord) -> Result<RecordMetadata, BrokerError>;

    /// Join `request.group_id` and subscribe to `request.topic`
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;

    /// Create missing topics. Returns the names actually created.
    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<Vec<String>, BrokerError>;

    async fn consumer_group_offsets(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<Vec<PartitionOffset>, BrokerError>;

    async fn list_consumer_groups(&self) -> Result<Vec<String>, BrokerError>;
}

#[async_trait::async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Wait for the next record. Must be cancel-safe.
    async fn recv(&mut self) -> Result<InboundRecord, BrokerError>;

    /// Mark `record` (and everything before it in its partition) as processed
    async fn commit(&mut self, record: &InboundRecord) -> Result<(), BrokerError>;

    /// Leave the group
    async fn close(&mut self) -> Result<(), BrokerError>;
}
