// ============================================================================
// Circuit Breaker Configuration
// ============================================================================

use std::time::Duration;

/// Thresholds for the produce-side circuit breaker
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit (default: 5)
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call (default: 30s)
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            failure_threshold: std::env::var("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            reset_timeout: Duration::from_millis(
                std::env::var("CIRCUIT_BREAKER_RESET_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30_000),
            ),
        }
    }
}
