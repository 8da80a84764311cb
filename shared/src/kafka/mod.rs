// Kafka module for the event bus
//
// Producer with circuit breaker, managed consumers with retry and
// dead-lettering, and topic/group administration. The broker itself sits
// behind the `Broker` trait: `KafkaBroker` in production, `InMemoryBroker`
// for tests.

pub mod broker;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod memory;
pub mod retry;
pub mod transport;

// Re-export commonly used types
pub use broker::{
    Broker, BrokerConsumer, BrokerError, InboundRecord, MessageHeaders, OutboundRecord,
    PartitionOffset, RecordMetadata, SubscriptionRequest, TopicSpec,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitSnapshot, CircuitState};
pub use client::{MessageBusClient, ProduceOptions, ProduceReceipt};
pub use config::{create_client_config, create_producer_config};
pub use consumer::{MessageHandler, ReceivedEvent, SubscribeOptions, Subscription};
pub use dlq::{DeadLetterError, DeadLetterMessage, FailureKind};
pub use memory::InMemoryBroker;
pub use transport::KafkaBroker;
