// ============================================================================
// DLQ Watcher
// ============================================================================
//
// Reads `{topic}.dlq` records raw (not through the envelope-parsing
// consumer loop, which would dead-letter unparseable dead letters again)
// and logs each poison message with its provenance.
//
// ============================================================================

use courier_shared::kafka::{
    Broker, BrokerError, DeadLetterMessage, InboundRecord, SubscriptionRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub async fn spawn(
    broker: Arc<dyn Broker>,
    request: SubscriptionRequest,
    mut stop: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, BrokerError> {
    let mut consumer = broker.subscribe(&request).await?;
    info!(dlq_topic = %request.topic, group_id = %request.group_id, "Watching dead letters");

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                biased;
                _ = stop.changed() => break,
                received = consumer.recv() => received,
            };

            match received {
                Ok(record) => {
                    report(&record);
                    if let Err(e) = consumer.commit(&record).await {
                        warn!(dlq_topic = %record.topic, error = %e, "DLQ offset commit failed");
                    }
                }
                Err(BrokerError::Closed) => break,
                Err(e) => {
                    error!(dlq_topic = %request.topic, error = %e, "DLQ receive failed");
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                }
            }
        }

        if let Err(e) = consumer.close().await {
            warn!(dlq_topic = %request.topic, error = %e, "DLQ consumer close failed");
        }
    }))
}

fn report(record: &InboundRecord) {
    let letter = record
        .value
        .as_deref()
        .map(serde_json::from_slice::<DeadLetterMessage>);

    match letter {
        Some(Ok(letter)) => warn!(
            original_topic = %letter.original_topic,
            original_partition = letter.original_partition,
            original_offset = letter.original_offset,
            failure_kind = letter.failure_kind.as_str(),
            attempts = letter.attempts,
            event_id = letter.envelope.as_ref().map(|e| e.id.as_str()).unwrap_or("-"),
            processing_service = %letter.processing_service,
            error = %letter.error.message,
            "Poison message"
        ),
        Some(Err(e)) => warn!(
            dlq_topic = %record.topic,
            offset = record.offset,
            error = %e,
            "Unreadable dead letter"
        ),
        None => warn!(dlq_topic = %record.topic, offset = record.offset, "Empty dead letter"),
    }
}
