//! Resilient event bus client.
//!
//! - [`kafka::MessageBusClient`]: produce with circuit breaker, managed
//!   subscriptions with retry and dead-lettering, topic administration
//! - [`event_store::EventStore`]: append-only replayable event log
//! - [`lifecycle::ServiceBus`]: start/stop wiring for a service

pub mod error;
pub mod event_store;
pub mod kafka;
pub mod lifecycle;

pub use error::{BusError, ConsumeFailure};
pub use event_store::EventStore;
pub use kafka::{
    InMemoryBroker, KafkaBroker, MessageBusClient, MessageHandler, ProduceOptions,
    ProduceReceipt, ReceivedEvent, SubscribeOptions, Subscription, TopicSpec,
};
pub use lifecycle::{shutdown_signal, ServiceBus};

pub use courier_config as config;
pub use courier_types as types;
