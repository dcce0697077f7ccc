//! Runs one step end-to-end: device lock, timeout, circuit breaker, retry.
//!
//! A `StepJob` owns everything it needs, so it can run inline in the
//! dispatch loop or on a spawned worker. It never touches the `Workflow`;
//! the outcome comes back as a `StepReport` that the dispatch loop applies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::action::{ActionKind, ActionOutput, ActionRegistry, CapabilityError, Params, Variables};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::resilience::retry::{RetryError, RetryPolicy};

use super::expression::ConditionError;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Why a step failed. Recorded on the step as its `error` text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    /// Unknown action, malformed step or parameters. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The capability ran and kept failing.
    #[error("capability failed after {attempts} attempt(s): {message}")]
    Capability { attempts: u32, message: String },

    /// The workflow's breaker is open; the capability was not invoked.
    #[error("circuit breaker open: step not attempted")]
    CircuitOpen,

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("condition error: {0}")]
    Condition(#[from] ConditionError),
}

impl StepError {
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Validation(_) => "validation",
            StepError::Capability { .. } => "capability",
            StepError::CircuitOpen => "circuit_open",
            StepError::Timeout(_) => "timeout",
            StepError::Condition(_) => "condition",
        }
    }
}

impl From<CircuitError<RetryError<CapabilityError>>> for StepError {
    fn from(err: CircuitError<RetryError<CapabilityError>>) -> Self {
        match err {
            CircuitError::Open => StepError::CircuitOpen,
            CircuitError::Inner(RetryError::Aborted { error, .. }) => match error {
                CapabilityError::InvalidParams(msg) => StepError::Validation(msg),
                other => StepError::Capability {
                    attempts: 1,
                    message: other.to_string(),
                },
            },
            CircuitError::Inner(RetryError::Exhausted { attempts, last }) => {
                StepError::Capability {
                    attempts,
                    message: last.to_string(),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StepJob / StepReport
// ---------------------------------------------------------------------------

/// Outcome of one step execution.
#[derive(Debug)]
pub struct StepReport {
    /// Position of the step in the workflow.
    pub index: usize,
    pub result: Result<ActionOutput, StepError>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// A fully prepared step, ready to run anywhere.
pub struct StepJob {
    pub index: usize,
    pub step_id: String,
    pub kind: ActionKind,
    /// Parameters with `${name}` references already resolved.
    pub params: Params,
    /// Variable snapshot taken at dispatch.
    pub variables: Variables,
    pub retry: RetryPolicy,
    /// `None` when timeouts are disabled for this step.
    pub timeout: Option<Duration>,
    /// Hold the engine-wide device lock for the whole execution.
    pub exclusive_device: bool,
    pub registry: Arc<ActionRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub device_lock: Arc<Mutex<()>>,
}

impl StepJob {
    pub async fn run(self) -> StepReport {
        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();
        let attempts = AtomicU32::new(0);

        let _device = if self.exclusive_device {
            tracing::trace!(step_id = %self.step_id, "waiting for device lock");
            Some(self.device_lock.lock().await)
        } else {
            None
        };

        let protected = self.breaker.call(|| {
            self.retry.execute_if(
                |attempt| {
                    attempts.store(attempt, Ordering::SeqCst);
                    tracing::debug!(step_id = %self.step_id, action = %self.kind, attempt, "invoking action");
                    self.registry.invoke(self.kind, &self.params, &self.variables)
                },
                CapabilityError::is_retryable,
            )
        });

        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, protected).await {
                Ok(outcome) => outcome.map_err(StepError::from),
                Err(_elapsed) => {
                    // The breaker never saw the dropped call complete.
                    self.breaker.record_failure();
                    Err(StepError::Timeout(limit))
                }
            },
            None => protected.await.map_err(StepError::from),
        };

        let attempts = attempts.load(Ordering::SeqCst);
        match &result {
            Ok(_) => tracing::debug!(step_id = %self.step_id, attempts, "step succeeded"),
            Err(e) => tracing::warn!(step_id = %self.step_id, attempts, error = %e, "step failed"),
        }

        StepReport {
            index: self.index,
            result,
            attempts,
            started_at,
            ended_at: Utc::now(),
            elapsed: clock.elapsed(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    use crate::action::capability::capability_fn;
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitStatus};

    fn job(registry: ActionRegistry, kind: ActionKind, retry: RetryPolicy) -> StepJob {
        StepJob {
            index: 0,
            step_id: "s".into(),
            kind,
            params: Params::new(),
            variables: Variables::new(),
            retry,
            timeout: None,
            exclusive_device: false,
            registry: Arc::new(registry),
            breaker: Arc::new(CircuitBreaker::default()),
            device_lock: Arc::new(Mutex::new(())),
        }
    }

    fn failing(counter: Arc<AtomicU32>, error: CapabilityError) -> ActionRegistry {
        ActionRegistry::builder()
            .register(
                ActionKind::ClickText,
                capability_fn(move |_p: Params, _v: Variables| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let error = error.clone();
                    async move { Err(error) }
                }),
            )
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_capability_failure_retried_then_reported() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = failing(calls.clone(), CapabilityError::Failed("no match".into()));
        let retry = RetryPolicy::new(3, Duration::from_millis(100), 1.5, 0.0);
        let report = job(registry, ActionKind::ClickText, retry).run().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.attempts, 3);
        assert_eq!(
            report.result.unwrap_err(),
            StepError::Capability {
                attempts: 3,
                message: "no match".into()
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_params_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = failing(calls.clone(), CapabilityError::InvalidParams("x missing".into()));
        let report = job(registry, ActionKind::ClickText, RetryPolicy::default()).run().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.result.unwrap_err(), StepError::Validation("x missing".into()));
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = failing(calls.clone(), CapabilityError::Failed("down".into()));
        let mut job = job(registry, ActionKind::ClickText, RetryPolicy::no_retry());
        job.breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            half_open_budget: 1,
        }));
        job.breaker.record_failure();

        let report = job.run().await;
        assert_eq!(report.result.unwrap_err(), StepError::CircuitOpen);
        assert_eq!(report.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_whole_retry_loop() {
        let mut job = job(ActionRegistry::default(), ActionKind::Wait, RetryPolicy::default());
        job.params = Params::from([("seconds".to_string(), json!(30))]);
        job.timeout = Some(Duration::from_secs(5));
        let breaker = job.breaker.clone();

        let report = job.run().await;
        assert_eq!(report.result.unwrap_err(), StepError::Timeout(Duration::from_secs(5)));
        assert_eq!(report.attempts, 1);
        assert_eq!(breaker.failure_count(), 1);
        assert_eq!(breaker.status(), CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_success_carries_output() {
        let mut job = job(ActionRegistry::default(), ActionKind::SetVariable, RetryPolicy::default());
        job.params = Params::from([
            ("name".to_string(), json!("greeting")),
            ("value".to_string(), json!("hi")),
        ]);
        let report = job.run().await;
        let output = report.result.unwrap();
        assert_eq!(output.value, Value::from("hi"));
        assert_eq!(report.attempts, 1);
        assert!(report.ended_at >= report.started_at);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(StepError::CircuitOpen.kind(), "circuit_open");
        assert_eq!(StepError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert!(StepError::CircuitOpen.to_string().contains("not attempted"));
    }
}
