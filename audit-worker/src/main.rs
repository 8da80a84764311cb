// ============================================================================
// Audit Worker
// ============================================================================
//
// Reference consumer for the event bus.
//
// Flow:
// 1. Connect, create the family topics, their DLQ topics and the event store
// 2. Replay the event store from the beginning into a tenant directory
// 3. Follow the tenant-events topic to keep the directory current
// 4. Watch every `{topic}.dlq` and log poison messages
// 5. Serve /health, /tenants and /metrics until SIGTERM/Ctrl-C
//
// Env:
// - AUDIT_WORKER_BIND_ADDRESS (default 0.0.0.0:8090)
// - everything BusConfig::from_env reads
//
// ============================================================================

mod directory;
mod dlq_watch;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use courier_config::BusConfig;
use courier_metrics::gather_metrics;
use courier_shared::kafka::SubscriptionRequest;
use courier_shared::{shutdown_signal, ReceivedEvent, ServiceBus, SubscribeOptions, TopicSpec};
use courier_types::topics;
use directory::TenantDirectory;
use serde_json::json;
use std::env;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    bus: Arc<ServiceBus>,
    directory: Arc<TenantDirectory>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = BusConfig::from_env().context("Invalid bus configuration")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.rust_log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Audit Worker Starting ===");
    info!("Service: {}", config.service_name);
    info!("Kafka Brokers: {}", config.kafka.bootstrap_servers());
    info!("Event Store Topic: {}", config.event_store.topic);
    info!("DLQ Enabled: {}", config.dlq_enabled);

    let bind_address =
        env::var("AUDIT_WORKER_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8090".to_string());
    let dlq_group = format!("{}-dlq-watch", config.service_name);
    let consumer_defaults = config.consumer.clone();

    let bus = Arc::new(ServiceBus::kafka(config));
    let family_topics: Vec<TopicSpec> = topics::ALL.iter().copied().map(TopicSpec::new).collect();
    bus.start(&family_topics)
        .await
        .context("Failed to start service bus")?;

    let directory = Arc::new(TenantDirectory::default());

    follow_into_directory(&bus, &directory).await?;

    let (stop_watchers, stop_rx) = watch::channel(false);
    let mut watchers = Vec::new();
    for topic in topics::ALL {
        let request = SubscriptionRequest {
            topic: BusConfig::dlq_topic(topic),
            group_id: dlq_group.clone(),
            from_beginning: true,
            auto_commit: consumer_defaults.auto_commit,
            max_bytes_per_partition: consumer_defaults.max_bytes_per_partition,
            session_timeout: consumer_defaults.session_timeout,
        };
        match dlq_watch::spawn(Arc::clone(bus.client.broker()), request, stop_rx.clone()).await {
            Ok(handle) => watchers.push(handle),
            Err(e) => error!(topic = %topic, error = %e, "Failed to watch DLQ topic"),
        }
    }

    let state = AppState {
        bus: Arc::clone(&bus),
        directory,
    };
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/tenants", get(list_tenants))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Audit Worker listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = stop_watchers.send(true);
    for watcher in watchers {
        if let Err(e) = watcher.await {
            error!(error = %e, "DLQ watcher ended abnormally");
        }
    }
    bus.stop().await?;

    info!("=== Audit Worker Stopped ===");
    Ok(())
}

/// Consumer group for this process's read model subscriptions.
///
/// The directory lives in memory, so every start must replay the event
/// store from offset 0; a stable group would resume from its last commit.
fn rebuild_group_id(service_name: &str) -> String {
    format!("{}-directory-{}", service_name, Uuid::new_v4())
}

/// Replay the event store into `directory`, then follow live tenant events
async fn follow_into_directory(bus: &ServiceBus, directory: &Arc<TenantDirectory>) -> Result<()> {
    let group_id = rebuild_group_id(bus.client.service_name());
    info!(group_id = %group_id, "Rebuilding tenant directory");

    bus.event_store
        .subscribe(
            apply_to(directory),
            SubscribeOptions::new()
                .group_id(group_id.clone())
                .from_beginning(true),
        )
        .await
        .context("Failed to subscribe to the event store")?;
    bus.client
        .subscribe(
            topics::TENANT_EVENTS,
            apply_to(directory),
            SubscribeOptions::new().group_id(group_id).from_beginning(false),
        )
        .await
        .with_context(|| format!("Failed to subscribe to {}", topics::TENANT_EVENTS))?;
    Ok(())
}

fn apply_to(
    directory: &Arc<TenantDirectory>,
) -> impl Fn(ReceivedEvent) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>
       + Send
       + Sync
       + 'static {
    let directory = Arc::clone(directory);
    move |received: ReceivedEvent| {
        let directory = Arc::clone(&directory);
        Box::pin(async move { directory.apply(&received.event).await })
    }
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let client = &state.bus.client;
    let status = if client.is_connected() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "ok" } else { "disconnected" },
            "service": client.service_name(),
            "circuitBreaker": client.circuit_state().to_string(),
            "subscriptions": client.active_subscriptions().await,
            "tenants": state.directory.len().await,
        })),
    )
}

async fn list_tenants(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.directory.snapshot().await)
}

async fn metrics() -> Response {
    match gather_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to gather metrics: {}", e),
        )
            .into_response(),
    }
}
