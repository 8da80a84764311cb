use courier_config::{KafkaConfig, RetryConfig};
use rdkafka::config::ClientConfig;
use tracing::info;

/// Creates a new `rdkafka::config::ClientConfig` from the bus `KafkaConfig`.
///
/// Producers, consumers and admin clients all start from this so they reach
/// the cluster the same way. It handles:
/// - Bootstrap servers and client id
/// - SSL/TLS if `ssl_enabled` is true
/// - SASL authentication if mechanism, username and password are all provided
/// - Reconnect backoff taken from the transport `RetryConfig`
pub fn create_client_config(config: &KafkaConfig, retry: &RetryConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("client.id", &config.client_id)
        .set(
            "retry.backoff.ms",
            retry.initial_retry_time.as_millis().to_string(),
        )
        .set(
            "reconnect.backoff.ms",
            retry.initial_retry_time.as_millis().to_string(),
        )
        .set(
            "reconnect.backoff.max.ms",
            retry.max_retry_time.as_millis().to_string(),
        );

    // Default to plaintext if SSL is not explicitly enabled and no SASL.
    client_config.set("security.protocol", "plaintext");

    if config.ssl_enabled {
        info!("Enabling SSL/TLS for Kafka connection");
        client_config.set("security.protocol", "ssl");
    }

    if let Some(ca_location) = &config.ssl_ca_location {
        client_config.set("ssl.ca.location", ca_location);
    }

    if let (Some(mechanism), Some(username), Some(password)) = (
        &config.sasl_mechanism,
        &config.sasl_username,
        &config.sasl_password,
    ) {
        info!(sasl_mechanism = %mechanism, "Configuring SASL authentication");
        client_config
            .set("sasl.mechanism", mechanism)
            .set("sasl.username", username)
            .set("sasl.password", password);

        if config.ssl_enabled {
            client_config.set("security.protocol", "sasl_ssl");
        } else {
            client_config.set("security.protocol", "sasl_plaintext");
        }
    }

    client_config
}

/// Producer settings layered over [`create_client_config`]
pub fn create_producer_config(config: &KafkaConfig, retry: &RetryConfig) -> ClientConfig {
    let mut client_config = create_client_config(config, retry);
    client_config
        .set(
            "request.timeout.ms",
            config.request_timeout.as_millis().to_string(),
        )
        .set(
            "message.timeout.ms",
            config.request_timeout.as_millis().to_string(),
        )
        // librdkafka refuses idempotence with zero retries
        .set("message.send.max.retries", retry.retries.max(1).to_string())
        .set("retry.backoff.max.ms", retry.max_retry_time.as_millis().to_string())
        .set("acks", "all")
        .set("enable.idempotence", "true");
    client_config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn kafka() -> KafkaConfig {
        courier_config::BusConfig::for_service("billing-service").kafka
    }

    #[test]
    fn test_plaintext_by_default() {
        let cfg = create_client_config(&kafka(), &RetryConfig::default());
        assert_eq!(cfg.get("security.protocol"), Some("plaintext"));
        assert_eq!(cfg.get("client.id"), Some("billing-service"));
        assert_eq!(cfg.get("reconnect.backoff.ms"), Some("300"));
    }

    #[test]
    fn test_sasl_over_ssl() {
        let mut kafka = kafka();
        kafka.ssl_enabled = true;
        kafka.sasl_mechanism = Some("SCRAM-SHA-256".into());
        kafka.sasl_username = Some("bus".into());
        kafka.sasl_password = Some("secret".into());

        let cfg = create_client_config(&kafka, &RetryConfig::default());
        assert_eq!(cfg.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(cfg.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
    }

    #[test]
    fn test_producer_maps_retry_policy() {
        let retry = RetryConfig {
            initial_retry_time: Duration::from_millis(250),
            retries: 4,
            max_retry_time: Duration::from_secs(10),
            factor: 2.0,
        };
        let cfg = create_producer_config(&kafka(), &retry);
        assert_eq!(cfg.get("message.send.max.retries"), Some("4"));
        assert_eq!(cfg.get("retry.backoff.ms"), Some("250"));
        assert_eq!(cfg.get("retry.backoff.max.ms"), Some("10000"));
    }

    #[test]
    fn test_idempotent_producer_keeps_at_least_one_retry() {
        let retry = RetryConfig {
            retries: 0,
            ..RetryConfig::default()
        };
        let cfg = create_producer_config(&kafka(), &retry);
        assert_eq!(cfg.get("enable.idempotence"), Some("true"));
        assert_eq!(cfg.get("message.send.max.retries"), Some("1"));
    }
}
