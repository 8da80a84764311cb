// ============================================================================
// Service Lifecycle
// ============================================================================
//
// `ServiceBus` wires one service's bus client and event store together:
//
//   let bus = ServiceBus::kafka(BusConfig::from_env()?);
//   bus.start(&[TopicSpec::new("tenant-events")]).await?;
//   ... subscribe / produce ...
//   shutdown_signal().await;
//   bus.stop().await?;
//
// ============================================================================

use crate::error::BusError;
use crate::event_store::EventStore;
use crate::kafka::{Broker, MessageBusClient, TopicSpec};
use courier_config::BusConfig;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ServiceBus {
    pub client: Arc<MessageBusClient>,
    pub event_store: EventStore,
}

impl ServiceBus {
    pub fn new(config: BusConfig, broker: Arc<dyn Broker>) -> Self {
        Self::from_client(Arc::new(MessageBusClient::new(config, broker)))
    }

    pub fn kafka(config: BusConfig) -> Self {
        Self::from_client(Arc::new(MessageBusClient::kafka(config)))
    }

    fn from_client(client: Arc<MessageBusClient>) -> Self {
        let event_store = EventStore::new(Arc::clone(&client));
        Self {
            client,
            event_store,
        }
    }

    /// Connect, then make sure `topics`, their DLQ topics and the event store
    /// topic exist. Connection failure is fatal; topic creation failure is
    /// logged (the cluster may auto-create or forbid admin calls).
    pub async fn start(&self, topics: &[TopicSpec]) -> Result<(), BusError> {
        self.client.start().await?;

        if let Err(e) = self.client.create_topics(topics).await {
            warn!(error = %e, "Failed to create topics");
        }
        if let Err(e) = self.client.ensure_dead_letter_topics(topics).await {
            warn!(error = %e, "Failed to create dead-letter topics");
        }
        if let Err(e) = self.event_store.ensure_topic().await {
            warn!(
                topic = %self.event_store.topic(),
                error = %e,
                "Failed to create event store topic"
            );
        }

        info!(
            service = %self.client.service_name(),
            topics = topics.len(),
            "Service bus started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), BusError> {
        info!(service = %self.client.service_name(), "Service bus stopping...");
        self.client.stop().await
    }
}

/// Resolves on SIGTERM or Ctrl-C
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, initiating graceful shutdown...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("SIGINT received, initiating graceful shutdown...");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler, waiting for Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
                info!("Ctrl-C received, initiating graceful shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, initiating graceful shutdown...");
    }
}
