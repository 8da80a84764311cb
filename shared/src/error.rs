use crate::kafka::broker::BrokerError;
use crate::kafka::dlq::FailureKind;
use courier_types::EnvelopeError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the bus client
#[derive(Debug, Error)]
pub enum BusError {
    /// Circuit breaker is open; the broker was not contacted
    #[error("circuit breaker is OPEN - produce rejected (retry in {retry_in:?})")]
    CircuitOpen { retry_in: Duration },

    #[error("transport error: {0}")]
    Transport(#[from] BrokerError),

    #[error("failed to connect to broker: {0}")]
    Connect(#[source] BrokerError),

    #[error("client is not connected - call start() first")]
    NotConnected,

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// Whether the same call may succeed later without changes
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::CircuitOpen { .. } | BusError::Transport(_) | BusError::Connect(_)
        )
    }
}

/// Why a consumed record could not be processed
#[derive(Debug, Error)]
pub enum ConsumeFailure {
    #[error("failed to parse message: {0}")]
    Parse(String),

    #[error("handler failed after {attempts} attempts: {error:#}")]
    Handler { attempts: u32, error: anyhow::Error },
}

impl ConsumeFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConsumeFailure::Parse(_) => FailureKind::Parse,
            ConsumeFailure::Handler { .. } => FailureKind::Handler,
        }
    }

    /// Handler invocations made (0 when the record never reached a handler)
    pub fn attempts(&self) -> u32 {
        match self {
            ConsumeFailure::Parse(_) => 0,
            ConsumeFailure::Handler { attempts, .. } => *attempts,
        }
    }

    /// Full error chain of a handler failure
    pub fn chain(&self) -> Option<String> {
        match self {
            ConsumeFailure::Parse(_) => None,
            ConsumeFailure::Handler { error, .. } => Some(format!("{:?}", error)),
        }
    }
}
