// ============================================================================
// Dead Letter Queue (DLQ)
// ============================================================================
//
// Keeps a poison message from blocking its partition forever.
//
// A record is dead-lettered when:
// - its body is not a valid envelope (no handler retries)
// - the handler still fails after MAX_HANDLER_RETRIES retries
//
// Kafka DLQ topic: {topic}.dlq (e.g., "tenant-events.dlq")
// DLQ record: original envelope fields + error + provenance
// DLQ headers: original headers + error-message, error-time,
//              original-topic, processing-service
//
// DLQ publishing goes straight to the transport (not through the circuit
// breaker) and never fails the consumer: errors are logged and counted.
//
// ============================================================================

use super::broker::{Broker, InboundRecord, MessageHeaders, OutboundRecord};
use crate::error::ConsumeFailure;
use chrono::{DateTime, Utc};
use courier_config::BusConfig;
use courier_metrics::{DLQ_PUBLISH_FAILURE, DLQ_ROUTED};
use courier_types::EventEnvelope;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

pub const HEADER_ERROR_MESSAGE: &str = "error-message";
pub const HEADER_ERROR_TIME: &str = "error-time";
pub const HEADER_ORIGINAL_TOPIC: &str = "original-topic";
pub const HEADER_PROCESSING_SERVICE: &str = "processing-service";

/// Why a record was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Body could not be parsed or validated as an envelope
    Parse,
    /// Handler failed after all retries
    Handler,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Parse => "parse",
            FailureKind::Handler => "handler",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterError {
    pub message: String,
    /// Full error chain, when one is available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub time: DateTime<Utc>,
}

/// A record that failed processing and was moved to the DLQ
///
/// Serializes as the original envelope's fields with the failure metadata
/// alongside, so DLQ tooling can read it as an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// Original envelope (absent when the body did not parse)
    #[serde(flatten)]
    pub envelope: Option<EventEnvelope>,
    /// Original body as text (only when the body did not parse)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<String>,
    pub error: DeadLetterError,
    pub processing_service: String,
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    /// Handler invocations made before giving up (0 for parse failures)
    pub attempts: u32,
    pub failure_kind: FailureKind,
}

impl DeadLetterMessage {
    pub fn new(
        record: &InboundRecord,
        envelope: Option<EventEnvelope>,
        failure: &ConsumeFailure,
        processing_service: &str,
    ) -> Self {
        let raw_value = match envelope {
            Some(_) => None,
            None => record
                .value
                .as_deref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
        };

        Self {
            envelope,
            raw_value,
            error: DeadLetterError {
                message: failure.to_string(),
                stack: failure.chain(),
                time: Utc::now(),
            },
            processing_service: processing_service.to_string(),
            original_topic: record.topic.clone(),
            original_partition: record.partition,
            original_offset: record.offset,
            attempts: failure.attempts(),
            failure_kind: failure.kind(),
        }
    }

    /// Original headers plus the failure headers
    pub fn headers(&self, original: &MessageHeaders) -> MessageHeaders {
        let mut headers = original.clone();
        headers.insert(HEADER_ERROR_MESSAGE.to_string(), self.error.message.clone());
        headers.insert(HEADER_ERROR_TIME.to_string(), self.error.time.to_rfc3339());
        headers.insert(HEADER_ORIGINAL_TOPIC.to_string(), self.original_topic.clone());
        headers.insert(
            HEADER_PROCESSING_SERVICE.to_string(),
            self.processing_service.clone(),
        );
        headers
    }
}

/// Publishes dead letters for one client
#[derive(Clone)]
pub(crate) struct DeadLetterRouter {
    broker: Arc<dyn Broker>,
    service_name: String,
    enabled: bool,
}

impl DeadLetterRouter {
    pub(crate) fn new(broker: Arc<dyn Broker>, config: &BusConfig) -> Self {
        Self {
            broker,
            service_name: config.service_name.clone(),
            enabled: config.dlq_enabled,
        }
    }

    /// Route `record` to `{topic}.dlq`. Returns whether a dead letter was
    /// published. Never fails.
    pub(crate) async fn route(
        &self,
        record: &InboundRecord,
        envelope: Option<EventEnvelope>,
        failure: &ConsumeFailure,
    ) -> bool {
        let kind = failure.kind();
        if !self.enabled {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                reason = kind.as_str(),
                error = %failure,
                "DLQ disabled - dropping failed message"
            );
            return false;
        }

        let dlq_topic = BusConfig::dlq_topic(&record.topic);
        let letter = DeadLetterMessage::new(record, envelope, failure, &self.service_name);
        let headers = letter.headers(&record.headers);

        let value = match serde_json::to_vec(&letter) {
            Ok(value) => value,
            Err(e) => {
                error!(topic = %dlq_topic, error = %e, "Failed to serialize dead letter");
                DLQ_PUBLISH_FAILURE.with_label_values(&[&record.topic]).inc();
                return false;
            }
        };

        let outbound = OutboundRecord {
            topic: dlq_topic.clone(),
            key: record.key.clone(),
            value,
            headers,
        };

        match self.broker.send(outbound).await {
            Ok(metadata) => {
                DLQ_ROUTED
                    .with_label_values(&[&record.topic, kind.as_str()])
                    .inc();
                warn!(
                    topic = %record.topic,
                    dlq_topic = %dlq_topic,
                    partition = record.partition,
                    offset = record.offset,
                    dlq_partition = metadata.partition,
                    dlq_offset = metadata.offset,
                    reason = kind.as_str(),
                    attempts = failure.attempts(),
                    "Message moved to DLQ"
                );
                true
            }
            Err(e) => {
                DLQ_PUBLISH_FAILURE.with_label_values(&[&record.topic]).inc();
                error!(
                    topic = %record.topic,
                    dlq_topic = %dlq_topic,
                    offset = record.offset,
                    error = %e,
                    "Failed to publish to DLQ - message dropped"
                );
                false
            }
        }
    }
}
