//! Bounded exponential-backoff retry.
//!
//! `RetryPolicy` is stateless: it holds only configuration, and every call to
//! [`RetryPolicy::execute`] runs an independent attempt loop. The delay before
//! retry `k` (1-based) is `initial_delay * backoff_factor^(k-1)`, multiplied by
//! a uniform random factor in `[1 - jitter, 1 + jitter]` so concurrent callers
//! do not retry in lockstep.
//!
//! Exhaustion is reported as [`RetryError::Exhausted`] carrying the last
//! underlying error. A successful attempt that yields an "empty" value is
//! returned as `Ok`, never confused with failure.

use std::future::Future;
use std::time::Duration;

use conductor_types::workflow::RetryConfig;
use rand::Rng;

/// Upper bound on any single backoff delay.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// RetryError
// ---------------------------------------------------------------------------

/// Failure of a retried operation.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed; `last` is the final attempt's error.
    #[error("all {attempts} attempt(s) failed: {last}")]
    Exhausted { attempts: u32, last: E },

    /// An attempt failed with an error the caller marked as not retryable.
    #[error("attempt {attempt} failed with a non-retryable error: {error}")]
    Aborted { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
        }
    }

    /// The underlying error of the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded retry with exponential backoff and jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_factor: f64,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Build a policy, clamping values into their valid ranges:
    /// `max_attempts >= 1`, `backoff_factor >= 1`, `jitter` in `[0, 1)`.
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_factor: f64, jitter: f64) -> Self {
        let backoff_factor = if backoff_factor.is_finite() {
            backoff_factor.max(1.0)
        } else {
            1.0
        };
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 0.999)
        } else {
            0.0
        };
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_factor,
            jitter,
        }
    }

    /// Convert a document-level [`RetryConfig`] (delay in seconds).
    pub fn from_config(config: &RetryConfig) -> Self {
        let initial_delay =
            Duration::try_from_secs_f64(config.delay.max(0.0)).unwrap_or(MAX_BACKOFF_DELAY);
        Self::new(
            config.max_attempts,
            initial_delay,
            config.backoff_factor,
            config.jitter,
        )
    }

    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0, 0.0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Un-jittered delay before retry `k` (1-based): `initial * factor^(k-1)`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_BACKOFF_DELAY)
            .min(MAX_BACKOFF_DELAY)
    }

    /// Inclusive bounds of the jittered delay before retry `k`.
    pub fn delay_bounds(&self, retry: u32) -> (Duration, Duration) {
        let base = self.base_delay(retry);
        (base.mul_f64(1.0 - self.jitter), base.mul_f64(1.0 + self.jitter))
    }

    /// Jittered delay before retry `k`, drawn from `rng`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let multiplier = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(multiplier)
    }

    /// Run `operation` until it succeeds or `max_attempts` is reached.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_if(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but stops early with
    /// [`RetryError::Aborted`] when `should_retry` rejects an error.
    pub async fn execute_if<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !should_retry(&error) {
                tracing::warn!(attempt, error = %error, "attempt failed with non-retryable error");
                return Err(RetryError::Aborted { attempt, error });
            }

            if attempt >= self.max_attempts {
                tracing::error!(
                    attempts = attempt,
                    error = %error,
                    "all attempts failed"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            // ThreadRng is !Send, so it must not live across the await below.
            let delay = self.jittered_delay(attempt, &mut rand::thread_rng());
            tracing::warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
