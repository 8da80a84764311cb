// ============================================================================
// Event Envelope
// ============================================================================
//
// Serialized as camelCase JSON:
//
//   {"id":"…","type":"tenant.created","source":"tenant-service",
//    "time":"2024-05-01T12:00:00Z","dataVersion":"1.0",
//    "dataContentType":"application/json","tenantId":"t1","data":{…}}
//
// `id`, `source` and `time` may be absent on the producer side; the bus
// client fills them before transmission (`normalize`). Anything read back
// from the broker must pass `validate`.
//
// ============================================================================

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_DATA_VERSION: &str = "1.0";
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope field `{0}` is required")]
    MissingField(&'static str),

    #[error("invalid payload for event type `{event_type}`: {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Globally unique event id (UUID v4)
    #[serde(default)]
    pub id: String,

    /// Dotted event type, e.g. "tenant.created"
    #[serde(rename = "type")]
    pub event_type: String,

    /// Emitting service
    #[serde(default)]
    pub source: String,

    /// Emission timestamp (RFC 3339, UTC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,

    #[serde(default = "default_data_version")]
    pub data_version: String,

    #[serde(default = "default_content_type")]
    pub data_content_type: String,

    /// Absent for system-wide events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Actor that triggered the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Typed payload, opaque to the transport
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_data_version() -> String {
    DEFAULT_DATA_VERSION.to_string()
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

impl EventEnvelope {
    /// Create an envelope with only a type and payload.
    ///
    /// `id`, `source` and `time` are left empty for the producer to fill.
    pub fn new<T: Serialize>(event_type: impl Into<String>, data: &T) -> serde_json::Result<Self> {
        Ok(Self::from_value(event_type, serde_json::to_value(data)?))
    }

    /// Same as [`EventEnvelope::new`] with an already-encoded payload
    pub fn from_value(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            event_type: event_type.into(),
            source: String::new(),
            time: None,
            data_version: default_data_version(),
            data_content_type: default_content_type(),
            tenant_id: None,
            correlation_id: None,
            causation_id: None,
            user_id: None,
            data,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_data_version(mut self, data_version: impl Into<String>) -> Self {
        self.data_version = data_version.into();
        self
    }

    /// Link this envelope into `parent`'s causal chain.
    ///
    /// The correlation id is inherited (or started from the parent id) and
    /// the causation id points at the parent.
    pub fn caused_by(mut self, parent: &EventEnvelope) -> Self {
        let correlation = parent
            .correlation_id
            .clone()
            .unwrap_or_else(|| parent.id.clone());
        self.correlation_id = Some(correlation);
        self.causation_id = Some(parent.id.clone());
        if self.tenant_id.is_none() {
            self.tenant_id = parent.tenant_id.clone();
        }
        self
    }

    /// Fill `id`, `time` and `source` when they are missing
    pub fn normalize(&mut self, default_source: &str) {
        if self.id.trim().is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.time.is_none() {
            self.time = Some(Utc::now());
        }
        if self.source.trim().is_empty() {
            self.source = default_source.to_string();
        }
    }

    /// Check the fields every transmitted envelope must carry
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        self.validate_stored()?;
        if self.source.trim().is_empty() {
            return Err(EnvelopeError::MissingField("source"));
        }
        Ok(())
    }

    /// Check `id`, `type` and `time` only (no `source`)
    pub fn validate_stored(&self) -> Result<(), EnvelopeError> {
        if self.id.trim().is_empty() {
            return Err(EnvelopeError::MissingField("id"));
        }
        if self.event_type.trim().is_empty() {
            return Err(EnvelopeError::MissingField("type"));
        }
        if self.time.is_none() {
            return Err(EnvelopeError::MissingField("time"));
        }
        Ok(())
    }

    /// Decode the payload into `T`
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.data.clone()).map_err(|source| EnvelopeError::InvalidPayload {
            event_type: self.event_type.clone(),
            source,
        })
    }
}
