// ============================================================================
// Subscription Consumer Loop
// ============================================================================
//
// One task per subscription:
//
//   recv -> parse -> validate -> handler (retry x3) -> commit
//                 \-> DLQ (parse)    \-> DLQ (exhausted)
//
// - Records are processed one at a time per subscription, in delivery order
// - The offset is committed only after the record is handled or dead-lettered
// - Stop is observed only between records: an in-flight handler (and its
//   retries) always completes before the task exits
//
// ============================================================================

use super::broker::{BrokerConsumer, BrokerError, InboundRecord, MessageHeaders};
use super::dlq::DeadLetterRouter;
use super::retry::{handler_backoff, MAX_HANDLER_RETRIES};
use crate::error::ConsumeFailure;
use courier_config::ConsumerConfig;
use courier_metrics::{CONSUME_SUCCESS, HANDLER_RETRIES};
use courier_types::{DomainEvent, EnvelopeError, EventEnvelope};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay after a transport error before receiving again
const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A validated event delivered to a handler, with its broker coordinates
#[derive(Debug, Clone)]
pub struct ReceivedEvent {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub headers: MessageHeaders,
    pub event: EventEnvelope,
}

impl ReceivedEvent {
    /// Decode into a known domain event (None for unregistered types)
    pub fn domain_event(&self) -> Result<Option<DomainEvent>, EnvelopeError> {
        DomainEvent::from_envelope(&self.event)
    }
}

/// Application callback for consumed events
///
/// Returning an error (or panicking) triggers the retry policy.
/// Closures `Fn(ReceivedEvent) -> impl Future<Output = anyhow::Result<()>>`
/// implement this trait.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, received: &ReceivedEvent) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ReceivedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, received: &ReceivedEvent) -> anyhow::Result<()> {
        (self)(received.clone()).await
    }
}

/// Per-subscription overrides of [`ConsumerConfig`]
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub group_id: Option<String>,
    pub from_beginning: Option<bool>,
    pub auto_commit: Option<bool>,
    pub max_bytes_per_partition: Option<u32>,
    pub session_timeout: Option<Duration>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn from_beginning(mut self, from_beginning: bool) -> Self {
        self.from_beginning = Some(from_beginning);
        self
    }

    pub fn auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = Some(auto_commit);
        self
    }

    pub fn max_bytes_per_partition(mut self, max_bytes: u32) -> Self {
        self.max_bytes_per_partition = Some(max_bytes);
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    pub(crate) fn resolve(
        self,
        topic: &str,
        defaults: &ConsumerConfig,
        default_group: impl FnOnce() -> String,
    ) -> super::broker::SubscriptionRequest {
        super::broker::SubscriptionRequest {
            topic: topic.to_string(),
            group_id: self
                .group_id
                .or_else(|| defaults.group_id.clone())
                .unwrap_or_else(default_group),
            from_beginning: self.from_beginning.unwrap_or(defaults.from_beginning),
            auto_commit: self.auto_commit.unwrap_or(defaults.auto_commit),
            max_bytes_per_partition: self
                .max_bytes_per_partition
                .unwrap_or(defaults.max_bytes_per_partition),
            session_timeout: self.session_timeout.unwrap_or(defaults.session_timeout),
        }
    }
}

// ============================================================================
// Subscription tracking
// ============================================================================

struct RunningSubscription {
    topic: String,
    group_id: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningSubscription {
    async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(
                topic = %self.topic,
                group_id = %self.group_id,
                error = %e,
                "Consumer task ended abnormally"
            );
        }
    }
}

/// Subscriptions started by one client
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_id: AtomicU64,
    running: Mutex<HashMap<u64, RunningSubscription>>,
}

impl SubscriptionRegistry {
    async fn insert(&self, subscription: RunningSubscription) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.running.lock().await.insert(id, subscription);
        id
    }

    async fn stop(&self, id: u64) -> bool {
        // Removed before waiting so the lock is not held across the shutdown
        let subscription = self.running.lock().await.remove(&id);
        match subscription {
            Some(subscription) => {
                subscription.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub(crate) async fn stop_all(&self) {
        let subscriptions: Vec<RunningSubscription> =
            self.running.lock().await.drain().map(|(_, s)| s).collect();
        for subscription in subscriptions {
            subscription.shutdown().await;
        }
    }

    pub(crate) async fn len(&self) -> usize {
        self.running.lock().await.len()
    }

    async fn contains(&self, id: u64) -> bool {
        self.running.lock().await.contains_key(&id)
    }
}

/// Handle to a running subscription
///
/// Dropping the handle does not stop the consumer; call
/// [`unsubscribe`](Self::unsubscribe) or stop the client.
pub struct Subscription {
    id: u64,
    topic: String,
    group_id: String,
    registry: Arc<SubscriptionRegistry>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub async fn is_active(&self) -> bool {
        self.registry.contains(self.id).await
    }

    /// Stop consuming. Waits for the in-flight record to finish.
    pub async fn unsubscribe(self) {
        if self.registry.stop(self.id).await {
            info!(topic = %self.topic, group_id = %self.group_id, "Unsubscribed");
        }
    }
}

/// Spawn the consumer task and register it
pub(crate) async fn spawn_subscription(
    registry: &Arc<SubscriptionRegistry>,
    consumer: Box<dyn BrokerConsumer>,
    handler: Arc<dyn MessageHandler>,
    dlq: DeadLetterRouter,
    topic: String,
    group_id: String,
) -> Subscription {
    let (stop, stop_rx) = watch::channel(false);
    let consumer_loop = ConsumerLoop {
        consumer,
        handler,
        dlq,
        topic: topic.clone(),
        group_id: group_id.clone(),
        stop: stop_rx,
    };
    let task = tokio::spawn(consumer_loop.run());

    let id = registry
        .insert(RunningSubscription {
            topic: topic.clone(),
            group_id: group_id.clone(),
            stop,
            task,
        })
        .await;

    Subscription {
        id,
        topic,
        group_id,
        registry: Arc::clone(registry),
    }
}

// ============================================================================
// Consumer loop
// ============================================================================

struct ConsumerLoop {
    consumer: Box<dyn BrokerConsumer>,
    handler: Arc<dyn MessageHandler>,
    dlq: DeadLetterRouter,
    topic: String,
    group_id: String,
    stop: watch::Receiver<bool>,
}

impl ConsumerLoop {
    async fn run(mut self) {
        info!(topic = %self.topic, group_id = %self.group_id, "Consumer started");

        loop {
            if *self.stop.borrow() {
                break;
            }

            let received = tokio::select! {
                biased;
                changed = self.stop.changed() => {
                    // Sender dropped means the owning client is gone
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                    continue;
                }
                received = self.consumer.recv() => received,
            };

            match received {
                Ok(record) => self.process(record).await,
                Err(BrokerError::Closed) => break,
                Err(e) => {
                    error!(
                        topic = %self.topic,
                        group_id = %self.group_id,
                        error = %e,
                        "Consumer receive failed"
                    );
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                }
            }
        }

        if let Err(e) = self.consumer.close().await {
            warn!(topic = %self.topic, error = %e, "Consumer close failed");
        }
        info!(topic = %self.topic, group_id = %self.group_id, "Consumer stopped");
    }

    async fn process(&mut self, record: InboundRecord) {
        match parse_envelope(&record) {
            Ok(event) => self.dispatch(&record, event).await,
            Err(reason) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %reason,
                    "Unparseable message"
                );
                self.dlq
                    .route(&record, None, &ConsumeFailure::Parse(reason))
                    .await;
            }
        }

        if let Err(e) = self.consumer.commit(&record).await {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Offset commit failed"
            );
        }
    }

    async fn dispatch(&self, record: &InboundRecord, event: EventEnvelope) {
        let received = ReceivedEvent {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            headers: record.headers.clone(),
            event,
        };

        let mut retries = 0;
        loop {
            match self.invoke(&received).await {
                Ok(()) => {
                    CONSUME_SUCCESS.with_label_values(&[&record.topic]).inc();
                    debug!(
                        topic = %record.topic,
                        offset = record.offset,
                        event_id = %received.event.id,
                        event_type = %received.event.event_type,
                        attempts = retries + 1,
                        "Message handled"
                    );
                    return;
                }
                Err(error) if retries >= MAX_HANDLER_RETRIES => {
                    error!(
                        topic = %record.topic,
                        offset = record.offset,
                        event_id = %received.event.id,
                        attempts = retries + 1,
                        error = %format!("{:#}", error),
                        "Handler failed, retries exhausted"
                    );
                    let failure = ConsumeFailure::Handler {
                        attempts: retries + 1,
                        error,
                    };
                    self.dlq.route(record, Some(received.event), &failure).await;
                    return;
                }
                Err(error) => {
                    retries += 1;
                    let backoff = handler_backoff(retries);
                    HANDLER_RETRIES.with_label_values(&[&record.topic]).inc();
                    warn!(
                        topic = %record.topic,
                        offset = record.offset,
                        event_id = %received.event.id,
                        retry = retries,
                        max_retries = MAX_HANDLER_RETRIES,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %format!("{:#}", error),
                        "Handler failed, will retry"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Run the handler once, turning a panic into an error
    async fn invoke(&self, received: &ReceivedEvent) -> anyhow::Result<()> {
        match AssertUnwindSafe(self.handler.handle(received))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(anyhow::anyhow!("handler panicked: {}", message))
            }
        }
    }
}

/// Decode and validate a record body
fn parse_envelope(record: &InboundRecord) -> Result<EventEnvelope, String> {
    let value = record
        .value
        .as_deref()
        .ok_or_else(|| "message has no payload".to_string())?;
    let envelope: EventEnvelope =
        serde_json::from_slice(value).map_err(|e| format!("invalid JSON envelope: {}", e))?;
    envelope.validate().map_err(|e| e.to_string())?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: Option<&str>) -> InboundRecord {
        InboundRecord {
            topic: "user-events".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            value: value.map(|v| v.as_bytes().to_vec()),
            headers: MessageHeaders::new(),
            timestamp_ms: None,
        }
    }

    #[test]
    fn test_parse_rejects_missing_payload() {
        let err = parse_envelope(&record(None)).unwrap_err();
        assert!(err.contains("no payload"));
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        let err = parse_envelope(&record(Some("{not json"))).unwrap_err();
        assert!(err.contains("invalid JSON"));
    }

    #[test]
    fn test_parse_requires_source() {
        let body = r#"{"id":"e1","type":"user.created","time":"2024-05-01T12:00:00Z","data":{}}"#;
        let err = parse_envelope(&record(Some(body))).unwrap_err();
        assert!(err.contains("source"));
    }

    #[test]
    fn test_parse_accepts_complete_envelope() {
        let body = r#"{"id":"e1","type":"user.created","source":"user-service",
                       "time":"2024-05-01T12:00:00Z","data":{"userId":"u1"}}"#;
        let envelope = parse_envelope(&record(Some(body))).unwrap();
        assert_eq!(envelope.id, "e1");
        assert_eq!(envelope.data["userId"], "u1");
    }

    #[test]
    fn test_consumer_loop_is_spawnable() {
        fn assert_send<T: Send>(_: &T) {}
        fn check(consumer_loop: ConsumerLoop) {
            let run = consumer_loop.run();
            assert_send(&run);
        }
        let _ = check;
    }

    #[test]
    fn test_options_override_config() {
        let defaults = ConsumerConfig::default();
        let request = SubscribeOptions::new()
            .from_beginning(true)
            .auto_commit(false)
            .resolve("user-events", &defaults, || "svc-user-events-group".to_string());

        assert_eq!(request.group_id, "svc-user-events-group");
        assert!(request.from_beginning);
        assert!(!request.auto_commit);
        assert_eq!(request.max_bytes_per_partition, defaults.max_bytes_per_partition);

        let explicit = SubscribeOptions::new()
            .group_id("audit")
            .resolve("user-events", &defaults, || unreachable!());
        assert_eq!(explicit.group_id, "audit");
    }
}
