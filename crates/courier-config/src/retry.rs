// ============================================================================
// Transport Retry Configuration
// ============================================================================
//
// Retry policy for the underlying broker connection (connect and request
// retries). Independent from the fixed per-message handler retry loop.
//
// ============================================================================

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_retry_time: Duration,
    /// Maximum number of retries
    pub retries: u32,
    /// Upper bound for a single retry delay
    pub max_retry_time: Duration,
    /// Multiplier applied to the delay after each retry
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_retry_time: Duration::from_millis(300),
            retries: 8,
            max_retry_time: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    pub(crate) fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            initial_retry_time: std::env::var("KAFKA_RETRY_INITIAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_retry_time),
            retries: std::env::var("KAFKA_RETRY_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retries),
            max_retry_time: std::env::var("KAFKA_RETRY_MAX_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_retry_time),
            factor: std::env::var("KAFKA_RETRY_FACTOR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.factor),
        }
    }

    /// Delay before retry number `retry` (1-based), capped at `max_retry_time`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.initial_retry_time.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_retry_time.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
