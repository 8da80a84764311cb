// ============================================================================
// Event Store
// ============================================================================
//
// Append-only event log on a single topic, replayable from the beginning.
//
// Partition key: "{tenantId}-{type}" (or "{type}" for tenant-less events),
// so every event of one type for one tenant stays in order.
//
// Unlike `produce`, envelopes are stored as given: `id`, `type` and `time`
// must already be set.
//
// ============================================================================

use crate::error::BusError;
use crate::kafka::{
    MessageBusClient, MessageHandler, ProduceOptions, ProduceReceipt, SubscribeOptions,
    Subscription, TopicSpec,
};
use courier_types::EventEnvelope;
use std::sync::Arc;
use tracing::info;

pub struct EventStore {
    client: Arc<MessageBusClient>,
    topic: String,
}

impl EventStore {
    /// Event store on the configured topic (`EVENT_STORE_TOPIC`)
    pub fn new(client: Arc<MessageBusClient>) -> Self {
        let topic = client.config().event_store.topic.clone();
        Self { client, topic }
    }

    pub fn with_topic(client: Arc<MessageBusClient>, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_key(envelope: &EventEnvelope) -> String {
        match &envelope.tenant_id {
            Some(tenant_id) => format!("{}-{}", tenant_id, envelope.event_type),
            None => envelope.event_type.clone(),
        }
    }

    /// Append one event to the log
    pub async fn save_event(&self, envelope: &EventEnvelope) -> Result<ProduceReceipt, BusError> {
        envelope.validate_stored()?;
        let key = Self::partition_key(envelope);
        self.client
            .produce(&self.topic, envelope.clone(), ProduceOptions::keyed(key))
            .await
    }

    /// Consume the log, replaying from the beginning unless
    /// `options.from_beginning` says otherwise
    pub async fn subscribe<H: MessageHandler>(
        &self,
        handler: H,
        mut options: SubscribeOptions,
    ) -> Result<Subscription, BusError> {
        options.from_beginning.get_or_insert(true);
        self.client.subscribe(&self.topic, handler, options).await
    }

    /// Create the log topic with the configured partitioning
    pub async fn ensure_topic(&self) -> Result<bool, BusError> {
        let settings = &self.client.config().event_store;
        let created = self
            .client
            .create_topics(&[TopicSpec::new(&self.topic)
                .partitions(settings.num_partitions)
                .replication(settings.replication_factor)])
            .await?;
        if !created.is_empty() {
            info!(topic = %self.topic, "Event store topic created");
        }
        Ok(!created.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::{Broker, InMemoryBroker};
    use courier_config::BusConfig;
    use courier_types::EnvelopeError;

    fn event(event_type: &str) -> EventEnvelope {
        EventEnvelope::from_value(event_type, serde_json::json!({}))
            .with_id("evt-1")
            .with_time(chrono::Utc::now())
    }

    #[test]
    fn test_partition_key() {
        assert_eq!(
            EventStore::partition_key(&event("tenant.created").with_tenant("t1")),
            "t1-tenant.created"
        );
        assert_eq!(
            EventStore::partition_key(&event("tenant.created")),
            "tenant.created"
        );
    }

    #[tokio::test]
    async fn test_save_event_does_not_fill_missing_time() {
        let broker = InMemoryBroker::new();
        let client = Arc::new(MessageBusClient::new(
            BusConfig::for_service("svc"),
            Arc::new(broker.clone()),
        ));
        client.start().await.unwrap();
        let store = EventStore::new(client);

        let mut envelope = event("tenant.created");
        envelope.time = None;

        let result = store.save_event(&envelope).await;
        assert!(matches!(
            result,
            Err(BusError::InvalidEnvelope(EnvelopeError::MissingField("time")))
        ));
        assert_eq!(broker.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_ensure_topic_uses_configured_partitions() {
        let broker = InMemoryBroker::new();
        let mut config = BusConfig::for_service("svc");
        config.event_store.topic = "ledger".to_string();
        config.event_store.num_partitions = 4;
        let store = EventStore::new(Arc::new(MessageBusClient::new(
            config,
            Arc::new(broker.clone()),
        )));

        assert!(store.ensure_topic().await.unwrap());
        assert!(!store.ensure_topic().await.unwrap());
        let offsets = broker.consumer_group_offsets("g", "ledger").await.unwrap();
        assert_eq!(offsets.len(), 4);
    }
}
