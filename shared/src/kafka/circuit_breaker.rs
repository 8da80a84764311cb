// ============================================================================
// Circuit Breaker for the Bus Producer
// ============================================================================
//
// Stops a slow or unavailable broker from stalling every produce call.
//
// States:
// - CLOSED: Normal operation, calls go through
// - OPEN: Too many failures, reject immediately without touching the broker
// - HALF_OPEN: Reset timeout elapsed, exactly one trial call is let through
//
// Transitions:
// - CLOSED -> OPEN: failure_count reaches failure_threshold
// - OPEN -> HALF_OPEN: first call at or after next_attempt_at
// - HALF_OPEN -> CLOSED: trial call succeeds (failure_count reset)
// - HALF_OPEN -> OPEN: trial call fails (next_attempt_at pushed out again)
//
// The state lock is held only while deciding and recording; never while the
// protected operation runs. Transition hooks fire after the lock is released.
//
// ============================================================================

use courier_config::CircuitBreakerConfig;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit Breaker error types
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open (too many failures), call rejected without executing
    #[error("Circuit breaker is OPEN - call rejected (retry in {retry_in:?})")]
    Open { retry_in: Duration },

    /// Underlying operation failed
    #[error("Operation failed: {0}")]
    Inner(#[source] E),
}

/// Circuit Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Too many failures, rejecting calls
    Open,
    /// A single trial call is probing the broker
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 = closed, 1 = half-open, 2 = open
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Point-in-time view of the breaker (for monitoring/debugging)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Earliest instant a trial call is allowed (only set while not CLOSED)
    pub next_attempt_at: Option<Instant>,
}

type TransitionHook = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    state: CircuitState,
    failure_count: u32,
    next_attempt_at: Option<Instant>,
    trial_in_flight: bool,
}

/// How a call was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

/// Circuit Breaker implementation
///
/// Shared by every produce call of one client. Cheap to call concurrently.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    on_open: Option<TransitionHook>,
    on_half_open: Option<TransitionHook>,
    on_close: Option<TransitionHook>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a new circuit breaker with custom configuration
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                next_attempt_at: None,
                trial_in_flight: false,
            }),
            on_open: None,
            on_half_open: None,
            on_close: None,
        }
    }

    pub fn on_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    pub fn on_half_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_half_open = Some(Arc::new(hook));
        self
    }

    pub fn on_close(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// # Returns
    /// * `Ok(T)` - Operation succeeded
    /// * `Err(CircuitBreakerError::Open)` - Circuit is open, operation not executed
    /// * `Err(CircuitBreakerError::Inner(E))` - Operation failed
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: permit == Permit::Trial,
        };

        let result = operation.await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(permit),
            Err(_) => self.record_failure(permit),
        }

        result.map_err(CircuitBreakerError::Inner)
    }

    fn acquire<E>(&self) -> Result<Permit, CircuitBreakerError<E>> {
        let now = Instant::now();
        let permit = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => Permit::Normal,
                CircuitState::Open => {
                    let next_attempt_at = inner.next_attempt_at.unwrap_or(now);
                    if now < next_attempt_at {
                        let retry_in = next_attempt_at - now;
                        tracing::warn!(
                            retry_in_ms = retry_in.as_millis() as u64,
                            failures = inner.failure_count,
                            "Circuit breaker OPEN - rejecting call"
                        );
                        return Err(CircuitBreakerError::Open { retry_in });
                    }
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Permit::Trial
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        tracing::debug!("Circuit breaker HALF_OPEN - trial in flight, rejecting call");
                        return Err(CircuitBreakerError::Open {
                            retry_in: Duration::ZERO,
                        });
                    }
                    inner.trial_in_flight = true;
                    Permit::Trial
                }
            }
        };

        if permit == Permit::Trial {
            tracing::info!("Circuit breaker attempting recovery (half-open state)");
            self.notify(CircuitState::HalfOpen);
        }
        Ok(permit)
    }

    fn record_success(&self, permit: Permit) {
        let closed = {
            let mut inner = self.lock();
            match permit {
                Permit::Trial => {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.next_attempt_at = None;
                    inner.trial_in_flight = false;
                    true
                }
                Permit::Normal => {
                    // A call admitted before the circuit opened cannot close it
                    if inner.state == CircuitState::Closed {
                        inner.failure_count = 0;
                    }
                    false
                }
            }
        };

        if closed {
            tracing::info!("Circuit breaker CLOSED - broker recovered");
            self.notify(CircuitState::Closed);
        }
    }

    fn record_failure(&self, permit: Permit) {
        let opened = {
            let mut inner = self.lock();
            inner.failure_count = inner.failure_count.saturating_add(1);
            let failures = inner.failure_count;

            let open = match permit {
                Permit::Trial => true,
                Permit::Normal => {
                    inner.state == CircuitState::Closed
                        && failures >= self.config.failure_threshold
                }
            };

            if open {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                inner.next_attempt_at = Some(Instant::now() + self.config.reset_timeout);
                tracing::error!(
                    failures = failures,
                    threshold = self.config.failure_threshold,
                    reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                    "Circuit breaker OPENED - too many failures"
                );
            } else {
                tracing::warn!(
                    failures = failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker failure recorded"
                );
            }
            open
        };

        if opened {
            self.notify(CircuitState::Open);
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            next_attempt_at: inner.next_attempt_at,
        }
    }

    /// Force circuit to close (for manual recovery)
    pub fn reset(&self) {
        let was = {
            let mut inner = self.lock();
            let was = inner.state;
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.next_attempt_at = None;
            inner.trial_in_flight = false;
            was
        };

        tracing::info!("Circuit breaker manually CLOSED");
        if was != CircuitState::Closed {
            self.notify(CircuitState::Closed);
        }
    }

    fn notify(&self, entered: CircuitState) {
        let hook = match entered {
            CircuitState::Open => &self.on_open,
            CircuitState::HalfOpen => &self.on_half_open,
            CircuitState::Closed => &self.on_close,
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the half-open trial slot if the caller drops the call future
/// before the operation finishes.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(failure_threshold: u32, reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            reset_timeout: Duration::from_millis(reset_ms),
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<i32, CircuitBreakerError<anyhow::Error>> {
        cb.call(async { Err::<i32, _>(anyhow::anyhow!("simulated failure")) })
            .await
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_on_success() {
        let cb = CircuitBreaker::new();
        let counter = Arc::new(AtomicU32::new(0));

        let result = cb
            .call(async {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok::<_, anyhow::Error>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let cb = CircuitBreaker::with_config(config(3, 30_000));
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            let result = cb
                .call(async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err::<i32, _>(anyhow::anyhow!("simulated failure"))
                })
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::Inner(_))));
        }

        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 3);

        // Next call is rejected without executing
        let result = cb
            .call(async {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok::<_, anyhow::Error>(42)
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::with_config(config(3, 30_000));

        assert!(fail(&cb).await.is_err());
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.failure_count(), 2);

        cb.call(async { Ok::<_, anyhow::Error>(()) }).await.unwrap();
        assert_eq!(cb.failure_count(), 0);

        assert!(fail(&cb).await.is_err());
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejection_reports_remaining_wait() {
        let cb = CircuitBreaker::with_config(config(1, 1_000));
        assert!(fail(&cb).await.is_err());

        tokio::time::advance(Duration::from_millis(400)).await;

        match fail(&cb).await {
            Err(CircuitBreakerError::Open { retry_in }) => {
                assert_eq!(retry_in, Duration::from_millis(600));
            }
            other => panic!("expected open rejection, got {:?}", other.map_err(|e| e.to_string())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes_circuit() {
        let cb = CircuitBreaker::with_config(config(2, 1_000));
        assert!(fail(&cb).await.is_err());
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;

        let result = cb.call(async { Ok::<_, anyhow::Error>(7) }).await;
        assert_eq!(result.unwrap(), 7);

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.next_attempt_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timeout() {
        let cb = CircuitBreaker::with_config(config(1, 1_000));
        assert!(fail(&cb).await.is_err());

        tokio::time::advance(Duration::from_millis(1_500)).await;
        let trial_started = Instant::now();
        assert!(matches!(fail(&cb).await, Err(CircuitBreakerError::Inner(_))));

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(
            snapshot.next_attempt_at,
            Some(trial_started + Duration::from_millis(1_000))
        );
        assert!(matches!(fail(&cb).await, Err(CircuitBreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_a_single_trial() {
        let cb = Arc::new(CircuitBreaker::with_config(config(1, 100)));
        assert!(fail(&cb).await.is_err());
        tokio::time::advance(Duration::from_millis(100)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.call(async move {
                    let _ = release_rx.await;
                    Ok::<_, anyhow::Error>(())
                })
                .await
                .is_ok()
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let concurrent = cb.call(async { Ok::<_, anyhow::Error>(()) }).await;
        assert!(matches!(concurrent, Err(CircuitBreakerError::Open { .. })));

        release_tx.send(()).unwrap();
        assert!(trial.await.unwrap());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_transition_hooks_fire_in_order() {
        let opened = Arc::new(AtomicU32::new(0));
        let half_opened = Arc::new(AtomicU32::new(0));
        let closed = Arc::new(AtomicU32::new(0));

        let cb = {
            let (o, h, c) = (opened.clone(), half_opened.clone(), closed.clone());
            CircuitBreaker::with_config(config(1, 0))
                .on_open(move || {
                    o.fetch_add(1, Ordering::SeqCst);
                })
                .on_half_open(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                })
                .on_close(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
        };

        assert!(fail(&cb).await.is_err());
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        cb.call(async { Ok::<_, anyhow::Error>(()) }).await.unwrap();
        assert_eq!(half_opened.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_forces_closed() {
        let cb = CircuitBreaker::with_config(config(1, 60_000));
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.call(async { Ok::<_, anyhow::Error>(()) }).await.is_ok());
    }

    #[test]
    fn test_gauge_encoding() {
        assert_eq!(CircuitState::Closed.as_gauge(), 0.0);
        assert_eq!(CircuitState::HalfOpen.as_gauge(), 1.0);
        assert_eq!(CircuitState::Open.as_gauge(), 2.0);
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }
}
