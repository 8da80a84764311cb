// ============================================================================
// Kafka / Redpanda Transport
// ============================================================================
//
// `Broker` implementation on rdkafka:
// - FutureProducer for publishing (created on connect, flushed on disconnect)
// - StreamConsumer per subscription
// - AdminClient / BaseConsumer for topic creation and group inspection
//
// Offsets are stored explicitly after each processed record
// (`enable.auto.offset.store=false`), so a crash mid-handler redelivers the
// record instead of skipping it.
//
// ============================================================================

use super::broker::{
    Broker, BrokerConsumer, BrokerError, InboundRecord, MessageHeaders, OutboundRecord,
    PartitionOffset, RecordMetadata, SubscriptionRequest, TopicSpec,
};
use super::config::{create_client_config, create_producer_config};
use super::retry::execute_with_retry;
use courier_config::{KafkaConfig, RetryConfig};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct KafkaBroker {
    kafka: KafkaConfig,
    retry: RetryConfig,
    producer: RwLock<Option<FutureProducer>>,
}

impl KafkaBroker {
    pub fn new(kafka: KafkaConfig, retry: RetryConfig) -> Self {
        Self {
            kafka,
            retry,
            producer: RwLock::new(None),
        }
    }

    async fn producer(&self) -> Result<FutureProducer, BrokerError> {
        self.producer
            .read()
            .await
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    async fn blocking<T, F>(f: F) -> Result<T, BrokerError>
    where
        F: FnOnce() -> Result<T, BrokerError> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| BrokerError::Unavailable(format!("blocking task failed: {}", e)))?
    }
}

#[async_trait::async_trait]
impl Broker for KafkaBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        if self.producer.read().await.is_some() {
            return Ok(());
        }

        info!(
            brokers = %self.kafka.bootstrap_servers(),
            client_id = %self.kafka.client_id,
            "Connecting Kafka producer..."
        );

        let kafka = &self.kafka;
        let retry = &self.retry;
        let producer = execute_with_retry(retry, "kafka.connect", move || async move {
            let producer: FutureProducer = create_producer_config(kafka, retry).create()?;

            // Producer creation is lazy; metadata proves the cluster is reachable
            let probe = producer.clone();
            let timeout = kafka.request_timeout;
            Self::blocking(move || {
                probe
                    .client()
                    .fetch_metadata(None, timeout)
                    .map(|_| ())
                    .map_err(BrokerError::from)
            })
            .await?;

            Ok(producer)
        })
        .await?;

        *self.producer.write().await = Some(producer);
        info!("Kafka producer connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let Some(producer) = self.producer.write().await.take() else {
            return Ok(());
        };

        let flush_timeout = self.kafka.flush_timeout;
        info!(
            timeout_ms = flush_timeout.as_millis() as u64,
            "Flushing Kafka producer..."
        );
        Self::blocking(move || {
            producer
                .flush(Timeout::After(flush_timeout))
                .map_err(BrokerError::from)
        })
        .await?;
        info!("Kafka producer disconnected");
        Ok(())
    }

    async fn send(&self, outbound: OutboundRecord) -> Result<RecordMetadata, BrokerError> {
        let producer = self.producer().await?;

        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&outbound.topic)
            .payload(outbound.value.as_slice())
            .headers(to_owned_headers(&outbound.headers));
        if let Some(key) = outbound.key.as_deref() {
            record = record.key(key);
        }

        match producer
            .send(record, Timeout::After(self.kafka.request_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(RecordMetadata { partition, offset }),
            Err((kafka_err, _message)) => Err(BrokerError::Kafka(kafka_err)),
        }
    }

    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let session_ms = request.session_timeout.as_millis() as u64;
        let mut client_config = create_client_config(&self.kafka, &self.retry);
        let consumer: StreamConsumer = client_config
            .set("group.id", &request.group_id)
            // Offset management
            .set("enable.auto.commit", request.auto_commit.to_string())
            .set("enable.auto.offset.store", "false")
            .set(
                "auto.offset.reset",
                if request.from_beginning {
                    "earliest"
                } else {
                    "latest"
                },
            )
            // Allow broker to auto-create topic on first subscription
            .set("allow.auto.create.topics", "true")
            // Performance
            .set(
                "max.partition.fetch.bytes",
                request.max_bytes_per_partition.to_string(),
            )
            // Session management
            .set("session.timeout.ms", session_ms.to_string())
            .set("heartbeat.interval.ms", (session_ms / 10).max(100).to_string())
            .create()?;

        consumer.subscribe(&[request.topic.as_str()])?;

        info!(
            topic = %request.topic,
            group_id = %request.group_id,
            from_beginning = request.from_beginning,
            "Kafka consumer subscribed"
        );

        Ok(Box::new(KafkaConsumer {
            consumer,
            auto_commit: request.auto_commit,
        }))
    }

    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<Vec<String>, BrokerError> {
        if topics.is_empty() {
            return Ok(Vec::new());
        }

        let admin: AdminClient<DefaultClientContext> =
            create_client_config(&self.kafka, &self.retry).create()?;
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|spec| {
                NewTopic::new(
                    &spec.name,
                    spec.num_partitions,
                    TopicReplication::Fixed(spec.replication_factor),
                )
            })
            .collect();
        let options = AdminOptions::new().operation_timeout(Some(self.kafka.request_timeout));

        let mut created = Vec::new();
        for result in admin.create_topics(new_topics.iter(), &options).await? {
            match result {
                Ok(name) => {
                    info!(topic = %name, "Topic created");
                    created.push(name);
                }
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "Topic already exists");
                }
                Err((name, code)) => {
                    return Err(BrokerError::Admin(format!(
                        "failed to create topic '{}': {}",
                        name, code
                    )));
                }
            }
        }
        Ok(created)
    }

    async fn consumer_group_offsets(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<Vec<PartitionOffset>, BrokerError> {
        let mut client_config = create_client_config(&self.kafka, &self.retry);
        client_config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false");
        let topic = topic.to_string();
        let timeout = self.kafka.request_timeout;

        Self::blocking(move || {
            let consumer: BaseConsumer = client_config.create()?;
            let metadata = consumer.fetch_metadata(Some(&topic), timeout)?;
            let partitions: Vec<i32> = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic)
                .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                .collect();
            if partitions.is_empty() {
                return Err(BrokerError::UnknownTopic(topic));
            }

            let mut tpl = TopicPartitionList::new();
            for partition in &partitions {
                tpl.add_partition(&topic, *partition);
            }
            let committed = consumer.committed_offsets(tpl, timeout)?;

            let mut offsets = Vec::with_capacity(partitions.len());
            for partition in partitions {
                let committed_offset = committed
                    .find_partition(&topic, partition)
                    .and_then(|elem| match elem.offset() {
                        Offset::Offset(offset) => Some(offset),
                        _ => None,
                    });
                let (low, high) = consumer.fetch_watermarks(&topic, partition, timeout)?;
                offsets.push(PartitionOffset {
                    partition,
                    committed: committed_offset,
                    high_watermark: high,
                    lag: (high - committed_offset.unwrap_or(low)).max(0),
                });
            }
            Ok(offsets)
        })
        .await
    }

    async fn list_consumer_groups(&self) -> Result<Vec<String>, BrokerError> {
        let client_config = create_client_config(&self.kafka, &self.retry);
        let timeout = self.kafka.request_timeout;

        Self::blocking(move || {
            let consumer: BaseConsumer = client_config.create()?;
            let groups = consumer.fetch_group_list(None, timeout)?;
            Ok(groups
                .groups()
                .iter()
                .map(|group| group.name().to_string())
                .collect())
        })
        .await
    }
}

/// One consumer group member reading one topic
struct KafkaConsumer {
    consumer: StreamConsumer,
    auto_commit: bool,
}

#[async_trait::async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn recv(&mut self) -> Result<InboundRecord, BrokerError> {
        let message = self.consumer.recv().await?;
        Ok(InboundRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            value: message.payload().map(<[u8]>::to_vec),
            headers: message.headers().map(read_headers).unwrap_or_default(),
            timestamp_ms: message.timestamp().to_millis(),
        })
    }

    async fn commit(&mut self, record: &InboundRecord) -> Result<(), BrokerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )?;

        if self.auto_commit {
            // Picked up by the next auto-commit interval
            self.consumer.store_offsets(&tpl)?;
        } else {
            self.consumer.commit(&tpl, CommitMode::Async)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.auto_commit {
            if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
                // Nothing consumed yet is reported as an error by librdkafka
                warn!(error = %e, "Final offset commit failed");
            }
        }
        self.consumer.unsubscribe();
        Ok(())
    }
}

fn to_owned_headers(headers: &MessageHeaders) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}

fn read_headers<H: Headers>(headers: &H) -> MessageHeaders {
    headers
        .iter()
        .map(|header| {
            (
                header.key.to_string(),
                header
                    .value
                    .map(|value| String::from_utf8_lossy(value).into_owned())
                    .unwrap_or_default(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_survive_rdkafka_conversion() {
        let mut headers = MessageHeaders::new();
        headers.insert("error-message".to_string(), "boom".to_string());
        headers.insert("original-topic".to_string(), "tenant-events".to_string());

        let owned = to_owned_headers(&headers);
        assert_eq!(owned.count(), 2);
        assert_eq!(read_headers(&owned), headers);
    }

    #[tokio::test]
    async fn test_send_before_connect_is_rejected() {
        let config = courier_config::BusConfig::for_service("test-service");
        let broker = KafkaBroker::new(config.kafka, config.retry);

        let result = broker
            .send(OutboundRecord {
                topic: "tenant-events".to_string(),
                key: None,
                value: b"{}".to_vec(),
                headers: MessageHeaders::new(),
            })
            .await;
        assert!(matches!(result, Err(BrokerError::NotConnected)));
    }
}
