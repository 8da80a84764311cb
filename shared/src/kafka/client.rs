use super::broker::{
    Broker, InboundRecord, MessageHeaders, OutboundRecord, PartitionOffset, TopicSpec,
};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
use super::consumer::{spawn_subscription, MessageHandler, SubscribeOptions, Subscription, SubscriptionRegistry};
use super::dlq::DeadLetterRouter;
use super::transport::KafkaBroker;
use crate::error::{BusError, ConsumeFailure};
use courier_config::BusConfig;
use courier_metrics::{
    CIRCUIT_BREAKER_STATE, PRODUCE_FAILURE, PRODUCE_LATENCY, PRODUCE_REJECTED, PRODUCE_SUCCESS,
};
use courier_types::EventEnvelope;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Per-call produce settings
#[derive(Debug, Clone, Default)]
pub struct ProduceOptions {
    /// Partition key (defaults to the envelope id)
    pub key: Option<String>,
    pub headers: MessageHeaders,
}

impl ProduceOptions {
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            headers: MessageHeaders::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Broker acknowledgment of a produced event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceReceipt {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Id of the transmitted envelope (generated when the caller left it empty)
    pub event_id: String,
}

/// Event bus client for one service
///
/// This client provides:
/// - Envelope normalization (id, time, source) before every produce
/// - Circuit breaker protection on the produce path (shared by all calls)
/// - Managed subscriptions with retries and dead-lettering
/// - Topic and consumer group administration
pub struct MessageBusClient {
    config: BusConfig,
    broker: Arc<dyn Broker>,
    circuit_breaker: CircuitBreaker,
    dlq: DeadLetterRouter,
    subscriptions: Arc<SubscriptionRegistry>,
    connected: AtomicBool,
}

impl MessageBusClient {
    /// Create a client over any transport
    pub fn new(config: BusConfig, broker: Arc<dyn Broker>) -> Self {
        let circuit_breaker = CircuitBreaker::with_config(config.circuit_breaker.clone())
            .on_open(|| CIRCUIT_BREAKER_STATE.set(CircuitState::Open.as_gauge()))
            .on_half_open(|| CIRCUIT_BREAKER_STATE.set(CircuitState::HalfOpen.as_gauge()))
            .on_close(|| CIRCUIT_BREAKER_STATE.set(CircuitState::Closed.as_gauge()));
        let dlq = DeadLetterRouter::new(Arc::clone(&broker), &config);

        Self {
            config,
            broker,
            circuit_breaker,
            dlq,
            subscriptions: Arc::new(SubscriptionRegistry::default()),
            connected: AtomicBool::new(false),
        }
    }

    /// Create a client backed by Kafka / Redpanda
    pub fn kafka(config: BusConfig) -> Self {
        let broker = Arc::new(KafkaBroker::new(config.kafka.clone(), config.retry.clone()));
        Self::new(config, broker)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// Passed through for schema-aware collaborators; never enforced
    pub fn schema_registry_url(&self) -> Option<&str> {
        self.config.kafka.schema_registry_url.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Underlying transport, for raw consumers that bypass envelope parsing
    /// (e.g. DLQ inspection)
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Connect the producer. Fails if the broker stays unreachable through
    /// the transport retry policy.
    pub async fn start(&self) -> Result<(), BusError> {
        if self.is_connected() {
            return Ok(());
        }
        self.broker.connect().await.map_err(BusError::Connect)?;
        self.connected.store(true, Ordering::SeqCst);
        CIRCUIT_BREAKER_STATE.set(self.circuit_state().as_gauge());
        info!(
            service = %self.config.service_name,
            dlq_enabled = self.config.dlq_enabled,
            "Message bus client started"
        );
        Ok(())
    }

    /// Stop every subscription (waiting for in-flight handlers), then
    /// flush and disconnect the producer.
    pub async fn stop(&self) -> Result<(), BusError> {
        self.subscriptions.stop_all().await;
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.disconnect().await?;
        info!(service = %self.config.service_name, "Message bus client stopped");
        Ok(())
    }

    /// Publish one event
    ///
    /// Missing `id`, `time` and `source` are filled in first. The record key
    /// is `options.key`, or the envelope id.
    ///
    /// # Returns
    /// * `Err(BusError::CircuitOpen)` - circuit open, broker not contacted
    /// * `Err(BusError::Transport)` - broker rejected or timed out
    pub async fn produce(
        &self,
        topic: &str,
        mut envelope: EventEnvelope,
        options: ProduceOptions,
    ) -> Result<ProduceReceipt, BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }

        envelope.normalize(&self.config.service_name);
        envelope.validate()?;
        let value = serde_json::to_vec(&envelope)?;
        let key = options.key.unwrap_or_else(|| envelope.id.clone());

        let record = OutboundRecord {
            topic: topic.to_string(),
            key: Some(key),
            value,
            headers: options.headers,
        };

        let start = std::time::Instant::now();
        match self.circuit_breaker.call(self.broker.send(record)).await {
            Ok(metadata) => {
                let latency = start.elapsed();
                PRODUCE_SUCCESS.with_label_values(&[topic]).inc();
                PRODUCE_LATENCY.observe(latency.as_secs_f64());

                info!(
                    topic = %topic,
                    partition = metadata.partition,
                    offset = metadata.offset,
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    latency_ms = latency.as_millis() as u64,
                    "Event produced"
                );

                Ok(ProduceReceipt {
                    topic: topic.to_string(),
                    partition: metadata.partition,
                    offset: metadata.offset,
                    event_id: envelope.id,
                })
            }
            Err(CircuitBreakerError::Open { retry_in }) => {
                PRODUCE_REJECTED.with_label_values(&[topic]).inc();
                warn!(
                    topic = %topic,
                    event_id = %envelope.id,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Produce rejected - circuit breaker open"
                );
                Err(BusError::CircuitOpen { retry_in })
            }
            Err(CircuitBreakerError::Inner(e)) => {
                PRODUCE_FAILURE.with_label_values(&[topic]).inc();
                error!(
                    topic = %topic,
                    event_id = %envelope.id,
                    latency_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                    "Failed to produce event"
                );
                Err(BusError::Transport(e))
            }
        }
    }

    /// Publish events in order, stopping at the first failure
    pub async fn produce_batch(
        &self,
        topic: &str,
        envelopes: Vec<EventEnvelope>,
        options: ProduceOptions,
    ) -> Result<Vec<ProduceReceipt>, BusError> {
        let mut receipts = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            receipts.push(self.produce(topic, envelope, options.clone()).await?);
        }
        Ok(receipts)
    }

    /// Start consuming `topic` with `handler`
    ///
    /// The group id is `options.group_id`, else the configured group, else
    /// `{service}-{topic}-group`.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        topic: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Subscription, BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }

        let request = options.resolve(topic, &self.config.consumer, || {
            self.config.default_group_id(topic)
        });
        let consumer = self.broker.subscribe(&request).await?;

        info!(
            topic = %request.topic,
            group_id = %request.group_id,
            from_beginning = request.from_beginning,
            auto_commit = request.auto_commit,
            "Subscribed"
        );

        Ok(spawn_subscription(
            &self.subscriptions,
            consumer,
            Arc::new(handler),
            self.dlq.clone(),
            request.topic,
            request.group_id,
        )
        .await)
    }

    /// Number of subscriptions still running
    pub async fn active_subscriptions(&self) -> usize {
        self.subscriptions.len().await
    }

    /// Dead-letter a record manually. Returns whether it was published.
    pub async fn send_to_dlq(
        &self,
        record: &InboundRecord,
        envelope: Option<EventEnvelope>,
        failure: &ConsumeFailure,
    ) -> bool {
        self.dlq.route(record, envelope, failure).await
    }

    /// Create missing topics. Returns the names actually created.
    pub async fn create_topics(&self, topics: &[TopicSpec]) -> Result<Vec<String>, BusError> {
        Ok(self.broker.create_topics(topics).await?)
    }

    /// Create `{topic}.dlq` for each topic, mirroring partition settings
    pub async fn ensure_dead_letter_topics(
        &self,
        topics: &[TopicSpec],
    ) -> Result<Vec<String>, BusError> {
        let dlq_topics: Vec<TopicSpec> = topics
            .iter()
            .map(|spec| TopicSpec {
                name: BusConfig::dlq_topic(&spec.name),
                ..spec.clone()
            })
            .collect();
        self.create_topics(&dlq_topics).await
    }

    pub async fn consumer_group_offsets(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<Vec<PartitionOffset>, BusError> {
        Ok(self.broker.consumer_group_offsets(group_id, topic).await?)
    }

    pub async fn list_consumer_groups(&self) -> Result<Vec<String>, BusError> {
        Ok(self.broker.list_consumer_groups().await?)
    }
}
