// ============================================================================
// Kafka Connection Configuration
// ============================================================================

use std::time::Duration;

/// Broker connection settings passed through to the transport
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Bootstrap brokers (from comma-separated KAFKA_BROKERS)
    pub brokers: Vec<String>,
    /// Client identifier reported to the broker (defaults to the service name)
    pub client_id: String,
    /// SSL/TLS enabled
    pub ssl_enabled: bool,
    /// SASL mechanism (e.g., "SCRAM-SHA-256", "PLAIN")
    pub sasl_mechanism: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Path to CA certificate file (for self-signed certificates)
    pub ssl_ca_location: Option<String>,
    /// Broker request timeout
    pub request_timeout: Duration,
    /// Schema registry endpoint. Carried for collaborators, never enforced.
    pub schema_registry_url: Option<String>,
    /// How long `stop()` waits for in-flight produce requests
    pub flush_timeout: Duration,
}

impl KafkaConfig {
    pub(crate) fn from_env(service_name: &str) -> Self {
        Self {
            brokers: parse_brokers(
                &std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string()),
            ),
            client_id: std::env::var("KAFKA_CLIENT_ID")
                .unwrap_or_else(|_| service_name.to_string()),
            ssl_enabled: std::env::var("KAFKA_SSL_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            sasl_mechanism: std::env::var("KAFKA_SASL_MECHANISM").ok(),
            sasl_username: std::env::var("KAFKA_SASL_USERNAME").ok(),
            sasl_password: std::env::var("KAFKA_SASL_PASSWORD").ok(),
            ssl_ca_location: std::env::var("KAFKA_SSL_CA_LOCATION").ok(),
            request_timeout: Duration::from_millis(
                std::env::var("KAFKA_REQUEST_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30_000),
            ),
            schema_registry_url: std::env::var("KAFKA_SCHEMA_REGISTRY_URL").ok(),
            flush_timeout: Duration::from_millis(
                std::env::var("KAFKA_FLUSH_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5_000),
            ),
        }
    }

    pub(crate) fn with_client_id(client_id: &str) -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: client_id.to_string(),
            ssl_enabled: false,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            request_timeout: Duration::from_secs(30),
            schema_registry_url: None,
            flush_timeout: Duration::from_secs(5),
        }
    }

    /// Brokers joined for librdkafka's `bootstrap.servers`
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

fn parse_brokers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|broker| !broker.is_empty())
        .map(str::to_string)
        .collect()
}
