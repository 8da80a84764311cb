// ============================================================================
// Consumer Defaults
// ============================================================================
//
// Service-wide defaults for subscriptions. Individual `subscribe` calls can
// override any of these.
//
// ============================================================================

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Explicit consumer group (None = "{service}-{topic}-group")
    pub group_id: Option<String>,
    /// Let the transport commit stored offsets periodically
    pub auto_commit: bool,
    /// Start from the earliest offset when the group has no committed offset
    pub from_beginning: bool,
    /// Max bytes fetched per partition per request
    pub max_bytes_per_partition: u32,
    /// Group session timeout
    pub session_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: None,
            auto_commit: true,
            from_beginning: false,
            max_bytes_per_partition: 1_048_576, // 1MB
            session_timeout: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    pub(crate) fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            group_id: std::env::var("KAFKA_CONSUMER_GROUP")
                .ok()
                .filter(|group| !group.is_empty()),
            auto_commit: std::env::var("KAFKA_CONSUMER_AUTO_COMMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.auto_commit),
            from_beginning: std::env::var("KAFKA_CONSUMER_FROM_BEGINNING")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.from_beginning),
            max_bytes_per_partition: std::env::var("KAFKA_CONSUMER_MAX_BYTES_PER_PARTITION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_bytes_per_partition),
            session_timeout: std::env::var("KAFKA_CONSUMER_SESSION_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.session_timeout),
        }
    }
}
