//! Three-state circuit breaker shared across calls to one protected operation.
//!
//! ```text
//! Closed --(N consecutive failures)--> Open
//! Open --(recovery_timeout elapsed, next call)--> HalfOpen
//! HalfOpen --(probe succeeds)--> Closed
//! HalfOpen --(probe fails)--> Open (timer reset)
//! ```
//!
//! While open, and while half-open with the probe budget spent, calls fail
//! fast with [`CircuitError::Open`] without invoking the wrapped operation.
//! Time is read from `tokio::time::Instant` so a paused test clock drives
//! recovery deterministically.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed.
    pub recovery_timeout: Duration,
    /// Calls allowed through while half-open.
    pub half_open_budget: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_budget: 1,
        }
    }
}

impl From<&conductor_types::config::EngineConfig> for CircuitBreakerConfig {
    fn from(config: &conductor_types::config::EngineConfig) -> Self {
        Self {
            failure_threshold: config.circuit_failure_threshold,
            recovery_timeout: Duration::from_secs(config.circuit_recovery_timeout_secs),
            half_open_budget: config.circuit_half_open_budget,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Internal breaker state.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward the threshold.
    Closed { consecutive_failures: u32 },
    /// Failing fast until `recovery_timeout` has elapsed since `opened_at`.
    Open { opened_at: Instant },
    /// Probing: up to `remaining_probes` more calls may pass.
    HalfOpen { remaining_probes: u32 },
}

/// Externally visible state, without timing detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CircuitError
// ---------------------------------------------------------------------------

/// Result of a call routed through a breaker.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The call was not attempted.
    #[error("circuit breaker is open")]
    Open,

    /// The call was attempted and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open)
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

/// A circuit breaker safe to share (behind `Arc`) across concurrent callers.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let config = CircuitBreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            half_open_budget: config.half_open_budget.max(1),
            ..config
        };
        Self {
            config,
            state: Mutex::new(CircuitState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        // A poisoned lock still holds a valid state value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state kind. Reading never moves Open to HalfOpen.
    pub fn status(&self) -> CircuitStatus {
        match &*self.lock() {
            CircuitState::Closed { .. } => CircuitStatus::Closed,
            CircuitState::Open { .. } => CircuitStatus::Open,
            CircuitState::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().clone()
    }

    /// Consecutive failures recorded while closed. Zero in any other state.
    pub fn failure_count(&self) -> u32 {
        match &*self.lock() {
            CircuitState::Closed {
                consecutive_failures,
            } => *consecutive_failures,
            _ => 0,
        }
    }

    /// Ask permission to make a call. Returns false when the call must fail fast.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        match &mut *state {
            CircuitState::Closed { .. } => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() > self.config.recovery_timeout {
                    tracing::info!("circuit breaker half-open, allowing probe");
                    *state = CircuitState::HalfOpen {
                        remaining_probes: self.config.half_open_budget - 1,
                    };
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen { remaining_probes } => {
                if *remaining_probes > 0 {
                    *remaining_probes -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.lock();
        match &*state {
            CircuitState::Closed { .. } => {
                *state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
            }
            CircuitState::HalfOpen { .. } => {
                tracing::info!("circuit breaker closed after successful probe");
                *state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut state = self.lock();
        match &*state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let count = consecutive_failures + 1;
                if count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = count,
                        recovery_secs = self.config.recovery_timeout.as_secs_f64(),
                        "circuit breaker opened"
                    );
                    *state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                } else {
                    *state = CircuitState::Closed {
                        consecutive_failures: count,
                    };
                }
            }
            CircuitState::HalfOpen { .. } => {
                tracing::warn!("circuit breaker probe failed, reopening");
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
            }
            CircuitState::Open { .. } => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
            }
        }
    }

    /// Run `operation` under the breaker.
    pub async fn call<T, E, Fut>(
        &self,
        operation: impl FnOnce() -> Fut,
    ) -> Result<T, CircuitError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            tracing::debug!("circuit breaker open, failing fast");
            return Err(CircuitError::Open);
        }
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(recovery_secs),
            half_open_budget: 1,
        })
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CircuitError<&'static str>> {
        cb.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down")
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<u32, CircuitError<&'static str>> {
        cb.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = breaker(3, 30);
        let calls = AtomicU32::new(0);

        for i in 1..=3 {
            let err = fail(&cb, &calls).await.unwrap_err();
            assert!(matches!(err, CircuitError::Inner("down")));
            if i < 3 {
                assert_eq!(cb.status(), CircuitStatus::Closed);
                assert_eq!(cb.failure_count(), i);
            }
        }
        assert_eq!(cb.status(), CircuitStatus::Open);
        assert_eq!(cb.failure_count(), 0);

        let err = fail(&cb, &calls).await.unwrap_err();
        assert!(err.is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3, "4th call must not invoke the operation");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 30);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.failure_count(), 2);
        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.failure_count(), 0);
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_probe_success_closes() {
        let cb = breaker(2, 10);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.status(), CircuitStatus::Open);

        // Exactly at the timeout the circuit is still open.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(fail(&cb, &calls).await.unwrap_err().is_open());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(succeed(&cb, &calls).await.unwrap(), 1);
        assert_eq!(cb.status(), CircuitStatus::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_probe_failure_reopens_and_resets_timer() {
        let cb = breaker(1, 5);
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(matches!(fail(&cb, &calls).await, Err(CircuitError::Inner(_))));
        assert_eq!(cb.status(), CircuitStatus::Open);

        // Timer restarted at the probe failure.
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(fail(&cb, &calls).await.unwrap_err().is_open());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(succeed(&cb, &calls).await.is_ok());
        assert_eq!(cb.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_budget_limits_probes() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(1),
            half_open_budget: 2,
        });
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(cb.try_acquire());
        assert_eq!(cb.status(), CircuitStatus::HalfOpen);
        assert!(cb.try_acquire());
        assert!(!cb.try_acquire(), "third probe exceeds the budget");
    }

    #[test]
    fn test_late_success_while_open_is_ignored() {
        let cb = breaker(1, 60);
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.status(), CircuitStatus::Open);
    }

    #[test]
    fn test_config_from_engine_config() {
        let engine = conductor_types::config::EngineConfig::default();
        let config = CircuitBreakerConfig::from(&engine);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout, Duration::from_secs(60));
        assert_eq!(config.half_open_budget, 1);
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let cb = breaker(0, 1);
        assert_eq!(cb.config().failure_threshold, 1);
    }
}
