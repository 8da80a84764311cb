// ============================================================================
// Retry Logic
// ============================================================================
//
// Two retry loops live here:
// - handler retries: a failing message handler is re-invoked with
//   exponential backoff (200ms, 400ms, 800ms) before dead-lettering
// - transport retries: broker connection attempts follow the configured
//   RetryConfig backoff
//
// ============================================================================

use super::broker::BrokerError;
use courier_config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Handler retries after the first failed invocation (4 invocations total)
pub const MAX_HANDLER_RETRIES: u32 = 3;

/// Base of the handler backoff
pub const HANDLER_BACKOFF_BASE_MS: u64 = 100;

/// Delay before handler retry number `attempt` (1-based): 2^attempt * 100ms
pub fn handler_backoff(attempt: u32) -> Duration {
    Duration::from_millis(HANDLER_BACKOFF_BASE_MS.saturating_mul(2_u64.saturating_pow(attempt)))
}

/// Execute a broker operation with the configured transport retry policy
///
/// Makes `1 + retry.retries` attempts, sleeping `retry.delay_for(n)` between
/// them. The last error is returned once attempts are exhausted.
pub async fn execute_with_retry<F, Fut, T>(
    retry: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let max_attempts = retry.retries.saturating_add(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        operation = operation_name,
                        attempt = attempt,
                        "Broker operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(
                    operation = operation_name,
                    attempts = attempt,
                    error = %e,
                    "Broker operation failed, retries exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                let backoff = retry.delay_for(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Broker operation failed, will retry"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_handler_backoff_doubles() {
        assert_eq!(handler_backoff(1), Duration::from_millis(200));
        assert_eq!(handler_backoff(2), Duration::from_millis(400));
        assert_eq!(handler_backoff(3), Duration::from_millis(800));

        let total: Duration = (1..=MAX_HANDLER_RETRIES).map(handler_backoff).sum();
        assert_eq!(total, Duration::from_millis(1_400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_retry_recovers() {
        let retry = RetryConfig {
            initial_retry_time: Duration::from_millis(100),
            retries: 3,
            max_retry_time: Duration::from_secs(1),
            factor: 2.0,
        };
        let calls = &AtomicU32::new(0);

        let result = execute_with_retry(&retry, "connect", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BrokerError::Unavailable("down".into()))
            } else {
                Ok(5)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_retry_gives_up() {
        let retry = RetryConfig {
            initial_retry_time: Duration::from_millis(10),
            retries: 2,
            max_retry_time: Duration::from_millis(50),
            factor: 2.0,
        };
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = execute_with_retry(&retry, "connect", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::Unavailable("down".into()))
        })
        .await;

        assert!(matches!(result, Err(BrokerError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
