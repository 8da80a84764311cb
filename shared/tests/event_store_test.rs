// ============================================================================
// Event Store Integration Tests
// ============================================================================
//
// Replay and partitioning of the event store over `InMemoryBroker`, plus an
// optional smoke test against a real cluster.
//
// Run the Kafka test with:
//   KAFKA_BROKERS=localhost:9092 cargo test -p courier-shared --test event_store_test -- --ignored
//
// ============================================================================

use courier_shared::config::BusConfig;
use courier_shared::types::payloads::{TenantCreated, TenantSuspended};
use courier_shared::types::{topics, DomainEvent, EventEnvelope};
use courier_shared::{
    EventStore, InMemoryBroker, MessageBusClient, ReceivedEvent, ServiceBus, SubscribeOptions,
    TopicSpec,
};
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn tenant_created(tenant_id: &str) -> EventEnvelope {
    DomainEvent::TenantCreated(TenantCreated {
        tenant_id: tenant_id.to_string(),
        name: format!("Tenant {}", tenant_id),
        plan: "starter".to_string(),
        owner_email: None,
    })
    .into_envelope()
    .unwrap()
    .with_id(format!("created-{}", tenant_id))
    .with_source("tenant-service")
    .with_tenant(tenant_id)
    .with_time(chrono::Utc::now())
}

fn collector() -> (
    Arc<Mutex<Vec<ReceivedEvent>>>,
    impl Fn(ReceivedEvent) -> std::future::Ready<anyhow::Result<()>> + Send + Sync + 'static,
) {
    let seen: Arc<Mutex<Vec<ReceivedEvent>>> = Arc::default();
    let sink = seen.clone();
    let handler = move |received: ReceivedEvent| {
        sink.lock().unwrap().push(received);
        std::future::ready(Ok(()))
    };
    (seen, handler)
}

async fn wait_for_len(seen: &Mutex<Vec<ReceivedEvent>>, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while seen.lock().unwrap().len() < count {
        assert!(Instant::now() < deadline, "timed out waiting for {} events", count);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Replay
// ============================================================================

#[tokio::test]
async fn test_late_subscriber_replays_full_history() {
    let broker = InMemoryBroker::new();
    let bus = ServiceBus::new(BusConfig::for_service("tenant-service"), Arc::new(broker.clone()));
    bus.start(&[TopicSpec::new(topics::TENANT_EVENTS)]).await.unwrap();

    for tenant in ["t1", "t2", "t3"] {
        bus.event_store.save_event(&tenant_created(tenant)).await.unwrap();
    }

    let (seen, handler) = collector();
    let subscription = bus
        .event_store
        .subscribe(handler, SubscribeOptions::new().group_id("directory-rebuild"))
        .await
        .unwrap();

    wait_for_len(&seen, 3).await;
    let ids: Vec<String> = seen.lock().unwrap().iter().map(|r| r.event.id.clone()).collect();
    assert_eq!(ids.len(), 3);
    for tenant in ["t1", "t2", "t3"] {
        assert!(ids.contains(&format!("created-{}", tenant)));
    }

    subscription.unsubscribe().await;
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn test_replay_can_be_disabled() {
    let broker = InMemoryBroker::new();
    let bus = ServiceBus::new(BusConfig::for_service("tenant-service"), Arc::new(broker.clone()));
    bus.start(&[]).await.unwrap();

    bus.event_store.save_event(&tenant_created("old")).await.unwrap();

    let (seen, handler) = collector();
    bus.event_store
        .subscribe(handler, SubscribeOptions::new().from_beginning(false))
        .await
        .unwrap();

    bus.event_store.save_event(&tenant_created("new")).await.unwrap();
    wait_for_len(&seen, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].event.id, "created-new");

    drop(seen);
    bus.stop().await.unwrap();
}

// ============================================================================
// Partitioning
// ============================================================================

#[tokio::test]
async fn test_tenant_events_keep_order_on_one_partition() {
    let broker = InMemoryBroker::with_partitions(4);
    let client = Arc::new(MessageBusClient::new(
        BusConfig::for_service("tenant-service"),
        Arc::new(broker.clone()),
    ));
    client.start().await.unwrap();
    let store = EventStore::with_topic(Arc::clone(&client), "tenant-log");

    let suspended = |n: u32| {
        DomainEvent::TenantSuspended(TenantSuspended {
            tenant_id: "t1".to_string(),
            reason: format!("reason-{}", n),
        })
        .into_envelope()
        .unwrap()
        .with_id(format!("s-{}", n))
        .with_tenant("t1")
        .with_time(chrono::Utc::now())
    };
    for n in 0..10 {
        store.save_event(&suspended(n)).await.unwrap();
    }

    let records = broker.records("tenant-log").await;
    assert_eq!(records.len(), 10);
    let partition = records[0].partition;
    assert!(records.iter().all(|r| r.partition == partition));
    assert!(records
        .iter()
        .all(|r| r.key.as_deref() == Some("t1-tenant.suspended")));

    let ids: Vec<String> = records
        .iter()
        .map(|r| {
            serde_json::from_slice::<EventEnvelope>(r.value.as_deref().unwrap())
                .unwrap()
                .id
        })
        .collect();
    let expected: Vec<String> = (0..10).map(|n| format!("s-{}", n)).collect();
    assert_eq!(ids, expected);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_system_event_keyed_by_type() {
    let broker = InMemoryBroker::new();
    let client = Arc::new(MessageBusClient::new(
        BusConfig::for_service("billing-service"),
        Arc::new(broker.clone()),
    ));
    client.start().await.unwrap();
    let store = EventStore::new(Arc::clone(&client));

    let envelope = EventEnvelope::from_value("billing.rates_refreshed", serde_json::json!({}))
        .with_id("sys-1")
        .with_time(chrono::Utc::now());
    let receipt = store.save_event(&envelope).await.unwrap();

    assert_eq!(receipt.topic, "event-store");
    assert_eq!(receipt.event_id, "sys-1");
    let record = &broker.records("event-store").await[0];
    assert_eq!(record.key.as_deref(), Some("billing.rates_refreshed"));

    client.stop().await.unwrap();
}

// ============================================================================
// Real cluster
// ============================================================================

#[tokio::test]
#[ignore]
#[serial]
async fn test_kafka_event_store_roundtrip() {
    let Ok(brokers) = std::env::var("KAFKA_BROKERS") else {
        eprintln!("KAFKA_BROKERS not set, skipping");
        return;
    };

    let mut config = BusConfig::for_service("courier-it");
    config.kafka.brokers = brokers.split(',').map(str::to_string).collect();
    config.event_store.topic = format!("courier-it-{}", chrono::Utc::now().timestamp_millis());
    config.event_store.num_partitions = 1;

    let bus = ServiceBus::kafka(config);
    bus.start(&[]).await.unwrap();

    bus.event_store.save_event(&tenant_created("kafka")).await.unwrap();

    let (seen, handler) = collector();
    bus.event_store
        .subscribe(handler, SubscribeOptions::new().group_id("courier-it-replay"))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(60);
    while seen.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "no event replayed from Kafka");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(seen.lock().unwrap()[0].event.id, "created-kafka");

    bus.stop().await.unwrap();
}
