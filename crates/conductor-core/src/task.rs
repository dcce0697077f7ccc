//! Composable units of work.
//!
//! A [`Task`] executes against a variable context and reports a
//! [`TaskOutcome`]. [`ConditionalTask`] and [`RetryableTask`] wrap other
//! tasks; [`CapabilityTask`] is the leaf that calls into the action registry.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_types::workflow::StepStatus;
use serde_json::Value;

use crate::action::{ActionKind, ActionRegistry, Params, Variables};
use crate::resilience::retry::RetryPolicy;
use crate::workflow::context::resolve_action_params;
use crate::workflow::expression::{ConditionError, Expression};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failure,
    /// Asks an enclosing [`RetryableTask`] for another attempt. Anywhere else
    /// it is treated as a failure.
    Retry,
    /// The task decided not to run.
    Skip,
}

impl TaskOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskOutcome::Success => "success",
            TaskOutcome::Failure => "failure",
            TaskOutcome::Retry => "retry",
            TaskOutcome::Skip => "skip",
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, context: &Variables) -> impl Future<Output = TaskOutcome> + Send;
}

/// Object-safe version of [`Task`] with boxed futures.
pub trait TaskDyn: Send + Sync {
    fn name_dyn(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        context: &'a Variables,
    ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>>;
}

impl<T: Task> TaskDyn for T {
    fn name_dyn(&self) -> &str {
        self.name()
    }

    fn execute_boxed<'a>(
        &'a self,
        context: &'a Variables,
    ) -> Pin<Box<dyn Future<Output = TaskOutcome> + Send + 'a>> {
        Box::pin(self.execute(context))
    }
}

/// Type-erased task, used wherever tasks nest.
pub struct BoxTask {
    inner: Box<dyn TaskDyn>,
}

impl fmt::Debug for BoxTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxTask").field("name", &self.inner.name_dyn()).finish()
    }
}

impl BoxTask {
    pub fn new<T: Task + 'static>(task: T) -> Self {
        Self {
            inner: Box::new(task),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name_dyn()
    }

    pub async fn execute(&self, context: &Variables) -> TaskOutcome {
        self.inner.execute_boxed(context).await
    }
}

// ---------------------------------------------------------------------------
// CapabilityTask
// ---------------------------------------------------------------------------

/// What a [`CapabilityTask`] recorded about its last execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRecord {
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Invokes one action. Succeeds when the call returns, fails when it errors.
pub struct CapabilityTask {
    name: String,
    kind: ActionKind,
    params: Params,
    registry: Arc<ActionRegistry>,
    record: Mutex<TaskRecord>,
}

impl CapabilityTask {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<ActionRegistry>,
        kind: ActionKind,
        params: Params,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            params,
            registry,
            record: Mutex::new(TaskRecord::default()),
        }
    }

    pub fn record(&self) -> TaskRecord {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut TaskRecord)) {
        f(&mut self.record.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl Task for CapabilityTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &Variables) -> TaskOutcome {
        self.update(|r| {
            *r = TaskRecord {
                status: StepStatus::Running,
                started_at: Some(Utc::now()),
                ..TaskRecord::default()
            };
        });

        let params = resolve_action_params(self.kind, &self.params, context);
        match self.registry.invoke(self.kind, &params, context).await {
            Ok(output) => {
                self.update(|r| {
                    r.status = StepStatus::Completed;
                    r.result = Some(output.value);
                    r.completed_at = Some(Utc::now());
                });
                TaskOutcome::Success
            }
            Err(e) => {
                tracing::error!(task = %self.name, action = %self.kind, error = %e, "task failed");
                self.update(|r| {
                    r.status = StepStatus::Failed;
                    r.error = Some(e.to_string());
                    r.completed_at = Some(Utc::now());
                });
                TaskOutcome::Failure
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ConditionalTask
// ---------------------------------------------------------------------------

type Predicate = Box<dyn Fn(&Variables) -> bool + Send + Sync>;

enum Condition {
    Expression(Expression),
    Predicate(Predicate),
}

/// Runs `true_task` when the condition holds, otherwise `false_task`, or
/// reports `Skip` when there is no false branch.
pub struct ConditionalTask {
    name: String,
    condition: Condition,
    true_task: BoxTask,
    false_task: Option<BoxTask>,
}

impl ConditionalTask {
    /// Condition written in the restricted expression language, parsed up
    /// front.
    pub fn new(
        name: impl Into<String>,
        condition: &str,
        true_task: BoxTask,
    ) -> Result<Self, ConditionError> {
        Ok(Self {
            name: name.into(),
            condition: Condition::Expression(Expression::parse(condition)?),
            true_task,
            false_task: None,
        })
    }

    pub fn with_predicate(
        name: impl Into<String>,
        predicate: impl Fn(&Variables) -> bool + Send + Sync + 'static,
        true_task: BoxTask,
    ) -> Self {
        Self {
            name: name.into(),
            condition: Condition::Predicate(Box::new(predicate)),
            true_task,
            false_task: None,
        }
    }

    pub fn otherwise(mut self, false_task: BoxTask) -> Self {
        self.false_task = Some(false_task);
        self
    }
}

impl Task for ConditionalTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &Variables) -> TaskOutcome {
        let holds = match &self.condition {
            Condition::Expression(expr) => match expr.evaluate_bool(context) {
                Ok(b) => b,
                Err(e) => {
                    tracing::error!(task = %self.name, error = %e, "condition evaluation failed");
                    return TaskOutcome::Failure;
                }
            },
            Condition::Predicate(p) => p(context),
        };

        tracing::debug!(task = %self.name, condition = holds, "condition evaluated");
        match (holds, &self.false_task) {
            (true, _) => self.true_task.execute(context).await,
            (false, Some(task)) => task.execute(context).await,
            (false, None) => TaskOutcome::Skip,
        }
    }
}

// ---------------------------------------------------------------------------
// RetryableTask
// ---------------------------------------------------------------------------

/// An attempt that did not succeed.
#[derive(Debug)]
struct Unsuccessful(TaskOutcome);

impl fmt::Display for Unsuccessful {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt ended with {}", self.0)
    }
}

/// Runs the inner task up to `max_retries + 1` times, sleeping with
/// exponential backoff between attempts.
///
/// `Skip` is returned as-is and is not retried.
pub struct RetryableTask {
    name: String,
    inner: BoxTask,
    max_retries: u32,
    policy: RetryPolicy,
    attempts: AtomicU32,
}

impl RetryableTask {
    pub fn new(
        name: impl Into<String>,
        inner: BoxTask,
        max_retries: u32,
        retry_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self {
            name: name.into(),
            inner,
            max_retries,
            policy: RetryPolicy::new(max_retries.saturating_add(1), retry_delay, backoff_factor, 0.0),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Attempts made by the most recent execution.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Task for RetryableTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &Variables) -> TaskOutcome {
        self.attempts.store(0, Ordering::SeqCst);
        let result = self
            .policy
            .execute(|attempt| {
                self.attempts.store(attempt, Ordering::SeqCst);
                tracing::info!(
                    task = %self.name,
                    attempt,
                    of = self.max_retries.saturating_add(1),
                    "executing task"
                );
                async move {
                    match self.inner.execute(context).await {
                        outcome @ (TaskOutcome::Success | TaskOutcome::Skip) => Ok(outcome),
                        other => Err(Unsuccessful(other)),
                    }
                }
            })
            .await;

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(task = %self.name, attempts = e.attempts(), "task failed after retries");
                TaskOutcome::Failure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::action::capability::capability_fn;
    use crate::action::{ActionOutput, CapabilityError};

    /// Reports the queued outcomes in order, then repeats the last one.
    struct Scripted {
        outcomes: Mutex<Vec<TaskOutcome>>,
        runs: AtomicU32,
    }

    impl Scripted {
        fn new(outcomes: &[TaskOutcome]) -> Arc<Self> {
            let mut queued = outcomes.to_vec();
            queued.reverse();
            Arc::new(Self {
                outcomes: Mutex::new(queued),
                runs: AtomicU32::new(0),
            })
        }
    }

    impl Task for Arc<Scripted> {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, _context: &Variables) -> TaskOutcome {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let mut queued = self.outcomes.lock().unwrap();
            if queued.len() > 1 {
                queued.pop().unwrap()
            } else {
                queued[0]
            }
        }
    }

    fn registry() -> Arc<ActionRegistry> {
        Arc::new(
            ActionRegistry::builder()
                .register(
                    ActionKind::TypeText,
                    capability_fn(|p: Params, _v: Variables| async move {
                        match p.get("text").and_then(Value::as_str) {
                            Some("fail") => Err(CapabilityError::Failed("keyboard jammed".into())),
                            _ => Ok(ActionOutput::value(p.get("text").cloned().unwrap_or(Value::Null))),
                        }
                    }),
                )
                .build(),
        )
    }

    fn typing(text: &str) -> CapabilityTask {
        CapabilityTask::new(
            "type",
            registry(),
            ActionKind::TypeText,
            Params::from([("text".to_string(), json!(text))]),
        )
    }

    #[tokio::test]
    async fn test_capability_task_records_result() {
        let task = typing("hello ${user}");
        let vars = Variables::from([("user".to_string(), json!("ada"))]);
        assert_eq!(task.execute(&vars).await, TaskOutcome::Success);

        let record = task.record();
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.result, Some(json!("hello ada")));
        assert!(record.started_at.is_some() && record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_capability_task_failure_records_error() {
        let task = typing("fail");
        assert_eq!(task.execute(&Variables::new()).await, TaskOutcome::Failure);
        let record = task.record();
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("keyboard jammed"));
    }

    #[tokio::test]
    async fn test_conditional_picks_branch_or_skips() {
        let vars = Variables::from([("count".to_string(), json!(5))]);

        let big = ConditionalTask::new("check", "count > 3", BoxTask::new(typing("big"))).unwrap();
        assert_eq!(big.execute(&vars).await, TaskOutcome::Success);

        let never = ConditionalTask::new("check", "count > 10", BoxTask::new(typing("big"))).unwrap();
        assert_eq!(never.execute(&vars).await, TaskOutcome::Skip);

        let fallback = ConditionalTask::new("check", "count > 10", BoxTask::new(typing("big")))
            .unwrap()
            .otherwise(BoxTask::new(typing("fail")));
        assert_eq!(fallback.execute(&vars).await, TaskOutcome::Failure);
    }

    #[tokio::test]
    async fn test_conditional_rejects_unsafe_expression_and_unknown_names() {
        assert!(ConditionalTask::new("bad", "__import__('os').system('x')", BoxTask::new(typing("x"))).is_err());

        let task = ConditionalTask::new("missing", "nope == 1", BoxTask::new(typing("x"))).unwrap();
        assert_eq!(task.execute(&Variables::new()).await, TaskOutcome::Failure);
    }

    #[tokio::test]
    async fn test_conditional_with_predicate() {
        let task = ConditionalTask::with_predicate(
            "has-user",
            |vars: &Variables| vars.contains_key("user"),
            BoxTask::new(typing("hi")),
        );
        assert_eq!(task.execute(&Variables::new()).await, TaskOutcome::Skip);
        let vars = Variables::from([("user".to_string(), json!("ada"))]);
        assert_eq!(task.execute(&vars).await, TaskOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_succeeds_after_failures() {
        let inner = Scripted::new(&[TaskOutcome::Failure, TaskOutcome::Retry, TaskOutcome::Success]);
        let task = RetryableTask::new("r", BoxTask::new(inner.clone()), 3, Duration::from_secs(1), 2.0);

        let start = tokio::time::Instant::now();
        assert_eq!(task.execute(&Variables::new()).await, TaskOutcome::Success);
        assert_eq!(task.attempts(), 3);
        assert_eq!(inner.runs.load(Ordering::SeqCst), 3);
        // 1s then 2s between attempts.
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_exhausts() {
        let inner = Scripted::new(&[TaskOutcome::Failure]);
        let task = RetryableTask::new("r", BoxTask::new(inner.clone()), 2, Duration::from_millis(10), 1.5);
        assert_eq!(task.execute(&Variables::new()).await, TaskOutcome::Failure);
        assert_eq!(task.attempts(), 3);
        assert_eq!(inner.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retryable_passes_skip_through() {
        let inner = Scripted::new(&[TaskOutcome::Skip]);
        let task = RetryableTask::new("r", BoxTask::new(inner.clone()), 5, Duration::from_secs(1), 2.0);
        assert_eq!(task.execute(&Variables::new()).await, TaskOutcome::Skip);
        assert_eq!(task.attempts(), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let inner = Scripted::new(&[TaskOutcome::Failure]);
        let task = RetryableTask::new("r", BoxTask::new(inner.clone()), 0, Duration::from_secs(1), 2.0);
        assert_eq!(task.execute(&Variables::new()).await, TaskOutcome::Failure);
        assert_eq!(inner.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_box_task_keeps_name() {
        let boxed = BoxTask::new(typing("x"));
        assert_eq!(boxed.name(), "type");
        assert_eq!(TaskOutcome::Retry.to_string(), "retry");
    }
}
