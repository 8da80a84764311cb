// ============================================================================
// Event Store Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct EventStoreConfig {
    /// Append-only topic holding the event log
    pub topic: String,
    /// Partitions used when the client creates the topic
    pub num_partitions: i32,
    /// Replication factor used when the client creates the topic
    pub replication_factor: i32,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            topic: "event-store".to_string(),
            num_partitions: 6,
            replication_factor: 1,
        }
    }
}

impl EventStoreConfig {
    pub(crate) fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            topic: std::env::var("EVENT_STORE_TOPIC").unwrap_or(defaults.topic),
            num_partitions: std::env::var("EVENT_STORE_PARTITIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.num_partitions),
            replication_factor: std::env::var("EVENT_STORE_REPLICATION_FACTOR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.replication_factor),
        }
    }
}
