// ============================================================================
// Courier Config - Centralized configuration for event bus clients
// ============================================================================
//
// Every service embedding the bus client loads a `BusConfig`, either from
// environment variables (`BusConfig::from_env`) or programmatically
// (`BusConfig::for_service`) in tests and tools.
//
// ============================================================================

mod circuit_breaker;
mod consumer;
mod event_store;
mod kafka;
mod retry;

pub use circuit_breaker::CircuitBreakerConfig;
pub use consumer::ConsumerConfig;
pub use event_store::EventStoreConfig;
pub use kafka::KafkaConfig;
pub use retry::RetryConfig;

use anyhow::Result;

/// Suffix appended to a topic name to derive its dead-letter topic
pub const DLQ_TOPIC_SUFFIX: &str = ".dlq";

/// Main configuration for one bus client instance
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Logical name of the embedding service.
    /// Used as default envelope `source` and in derived consumer group ids.
    pub service_name: String,
    /// Whether failed messages are forwarded to `<topic>.dlq`
    pub dlq_enabled: bool,
    /// Tracing filter directive (e.g. "info,courier_shared=debug")
    pub rust_log: String,

    // Sub-configurations
    pub kafka: KafkaConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub consumer: ConsumerConfig,
    pub event_store: EventStoreConfig,
}

impl BusConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let service_name =
            std::env::var("SERVICE_NAME").unwrap_or_else(|_| "courier-service".to_string());
        if service_name.trim().is_empty() {
            anyhow::bail!("SERVICE_NAME must not be empty");
        }

        let config = Self {
            kafka: KafkaConfig::from_env(&service_name),
            service_name,
            dlq_enabled: std::env::var("KAFKA_DLQ_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            retry: RetryConfig::from_env(),
            circuit_breaker: CircuitBreakerConfig::from_env(),
            consumer: ConsumerConfig::from_env(),
            event_store: EventStoreConfig::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Configuration with defaults for the named service.
    ///
    /// Does not read the environment.
    pub fn for_service(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self {
            kafka: KafkaConfig::with_client_id(&service_name),
            service_name,
            dlq_enabled: true,
            rust_log: "info".to_string(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            consumer: ConsumerConfig::default(),
            event_store: EventStoreConfig::default(),
        }
    }

    /// Reject configurations the client cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.is_empty() {
            anyhow::bail!("KAFKA_BROKERS must list at least one broker");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("CIRCUIT_BREAKER_FAILURE_THRESHOLD must be greater than zero");
        }
        if self.retry.retries == 0 {
            anyhow::bail!("KAFKA_RETRY_RETRIES must be at least 1 (the producer is idempotent)");
        }
        if self.retry.factor < 1.0 {
            anyhow::bail!("KAFKA_RETRY_FACTOR must be >= 1.0");
        }
        if self.event_store.topic.trim().is_empty() {
            anyhow::bail!("EVENT_STORE_TOPIC must not be empty");
        }
        Ok(())
    }

    /// Dead-letter topic for `topic`
    pub fn dlq_topic(topic: &str) -> String {
        format!("{}{}", topic, DLQ_TOPIC_SUFFIX)
    }

    /// Default consumer group for a topic consumed by this service
    pub fn default_group_id(&self, topic: &str) -> String {
        format!("{}-{}-group", self.service_name, topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "SERVICE_NAME",
            "KAFKA_BROKERS",
            "KAFKA_CLIENT_ID",
            "KAFKA_DLQ_ENABLED",
            "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
            "CIRCUIT_BREAKER_RESET_TIMEOUT_MS",
            "KAFKA_CONSUMER_FROM_BEGINNING",
            "KAFKA_RETRY_RETRIES",
            "EVENT_STORE_TOPIC",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = BusConfig::from_env().unwrap();

        assert_eq!(config.service_name, "courier-service");
        assert_eq!(config.kafka.brokers, vec!["localhost:9092".to_string()]);
        assert_eq!(config.kafka.client_id, "courier-service");
        assert!(config.dlq_enabled);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.event_store.topic, "event-store");
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("SERVICE_NAME", "billing");
        std::env::set_var("KAFKA_BROKERS", "kafka1:9092, kafka2:9092");
        std::env::set_var("KAFKA_DLQ_ENABLED", "false");
        std::env::set_var("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "3");
        std::env::set_var("CIRCUIT_BREAKER_RESET_TIMEOUT_MS", "1500");
        std::env::set_var("KAFKA_CONSUMER_FROM_BEGINNING", "true");

        let config = BusConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.service_name, "billing");
        assert_eq!(config.kafka.client_id, "billing");
        assert_eq!(
            config.kafka.brokers,
            vec!["kafka1:9092".to_string(), "kafka2:9092".to_string()]
        );
        assert!(!config.dlq_enabled);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(
            config.circuit_breaker.reset_timeout,
            std::time::Duration::from_millis(1500)
        );
        assert!(config.consumer.from_beginning);
    }

    #[test]
    #[serial]
    fn test_zero_retries_rejected() {
        clear_env();
        std::env::set_var("KAFKA_RETRY_RETRIES", "0");
        let result = BusConfig::from_env();
        clear_env();

        assert!(result.is_err());

        let mut config = BusConfig::for_service("svc");
        config.retry.retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_zero_threshold_rejected() {
        clear_env();
        std::env::set_var("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "0");
        let result = BusConfig::from_env();
        clear_env();

        assert!(result.is_err());
    }

    #[test]
    fn test_derived_names() {
        let config = BusConfig::for_service("notifications");
        assert_eq!(BusConfig::dlq_topic("orders"), "orders.dlq");
        assert_eq!(
            config.default_group_id("tenant-events"),
            "notifications-tenant-events-group"
        );
    }
}
