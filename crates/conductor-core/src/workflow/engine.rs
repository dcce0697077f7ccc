//! Workflow engine: drives a workflow's steps to a terminal status.
//!
//! # Execution flow
//!
//! 1. Reset every step that did not complete, so a document can be re-run.
//!    Mark the workflow `Running` and persist it.
//! 2. For each step in declaration order (completed steps are skipped):
//!    - drain finished worker reports and halt on any unhandled failure;
//!    - stop if the run was cancelled;
//!    - resolve the action, evaluate the condition, interpolate parameters;
//!    - run the step on a worker when `max_concurrent_steps > 1` (waiting for
//!      a free slot first), otherwise run it inline and wait.
//! 3. Join outstanding workers and apply their reports.
//! 4. Completed when every step succeeded (skipped counts), cancelled when
//!    cancellation stopped dispatch, failed otherwise. Persist, then run the
//!    `on_success` / `on_failure` hook.
//!
//! Workers never touch the `Workflow`. They send `StepReport`s over a channel
//! and the dispatch loop applies them, so the document has a single writer.
//! Every state transition is persisted before the loop moves on.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conductor_types::config::EngineConfig;
use conductor_types::error::{DocumentError, StoreError};
use conductor_types::workflow::{DocumentFormat, Step, StepStatus, Workflow, WorkflowStatus};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::action::registry::{error_handler_params, hook_params};
use crate::action::{ActionKind, ActionRegistry, CapabilityError, Params};
use crate::monitor::{LogLevel, MonitorHandle};
use crate::repository::workflow::WorkflowStore;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStatus};
use crate::resilience::retry::RetryPolicy;

use super::context::resolve_action_params;
use super::expression::evaluate_condition;
use super::step_runner::{StepError, StepJob, StepReport};

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

/// Engine-internal failures. Step failures are reported through
/// [`ExecutionReport`], never through this type.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to persist workflow: {0}")]
    Persistence(#[from] StoreError),

    #[error("workflow {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Per-step result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Terminal status of a run and what each step did.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub steps: Vec<StepOutcome>,
    /// Error of the first failed step in declaration order.
    pub error: Option<String>,
}

impl ExecutionReport {
    fn from_workflow(workflow: &Workflow) -> Self {
        let error = match workflow.status {
            WorkflowStatus::Cancelled => Some("workflow cancelled".to_string()),
            _ => workflow.first_failed_step().and_then(|s| s.error.clone()),
        };
        Self {
            workflow_id: workflow.id,
            status: workflow.status,
            steps: workflow
                .steps
                .iter()
                .map(|s| StepOutcome {
                    step_id: s.id.clone(),
                    status: s.status,
                    result: s.result.clone(),
                    error: s.error.clone(),
                    attempts: s.attempts,
                })
                .collect(),
            error,
        }
    }

    pub fn outcome(&self, step_id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// Removes a workflow from the running set however the run ends.
struct RunningGuard<'a> {
    running: &'a DashMap<Uuid, CancellationToken>,
    id: Uuid,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

enum Prepared {
    Run(StepJob),
    Skip,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Drives workflows stored in `S`.
pub struct WorkflowEngine<S: WorkflowStore> {
    store: S,
    registry: Arc<ActionRegistry>,
    monitor: MonitorHandle,
    config: EngineConfig,
    /// One breaker per workflow id, shared by all of its steps and runs.
    breakers: DashMap<Uuid, Arc<CircuitBreaker>>,
    /// Cancellation tokens of running workflows, keyed by workflow id.
    running: DashMap<Uuid, CancellationToken>,
    /// Serializes device-exclusive actions across workers.
    device_lock: Arc<Mutex<()>>,
}

impl<S: WorkflowStore> WorkflowEngine<S> {
    pub fn new(
        store: S,
        registry: Arc<ActionRegistry>,
        monitor: MonitorHandle,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            monitor,
            config,
            breakers: DashMap::new(),
            running: DashMap::new(),
            device_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Document management
    // -----------------------------------------------------------------------

    /// A step carrying the configured default retry policy and timeout.
    pub fn new_step(&self, id: impl Into<String>, action: impl Into<String>) -> Step {
        Step::new(id, action)
            .with_retry(self.config.default_retry.clone())
            .with_timeout(self.config.default_step_timeout_secs)
    }

    /// Create and persist an empty pending workflow.
    pub async fn create_workflow(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Workflow, EngineError> {
        let mut workflow = Workflow::new(name);
        workflow.description = description.map(str::to_string);
        workflow.validate()?;
        self.store.save(&workflow).await?;
        tracing::info!(workflow_id = %workflow.id, name, "created workflow");
        Ok(workflow)
    }

    /// Parse, validate and store a workflow document as pending.
    pub async fn submit(&self, text: &str, format: DocumentFormat) -> Result<Uuid, EngineError> {
        let mut workflow = Workflow::from_document(text, format)?;
        workflow.validate()?;
        workflow.status = WorkflowStatus::Pending;
        self.store.save(&workflow).await?;
        tracing::info!(workflow_id = %workflow.id, name = %workflow.name, "submitted workflow");
        Ok(workflow.id)
    }

    /// Persist a workflow as-is.
    pub async fn save(&self, workflow: &Workflow) -> Result<(), EngineError> {
        self.store.save(workflow).await.map_err(EngineError::from)
    }

    pub async fn load(&self, id: &Uuid) -> Result<Workflow, EngineError> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// The most recently created workflow with this name.
    pub async fn load_by_name(&self, name: &str) -> Result<Workflow, EngineError> {
        self.store
            .list(None)
            .await?
            .into_iter()
            .filter(|w| w.name == name)
            .max_by_key(|w| w.created_at)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    pub async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>, EngineError> {
        self.store.list(status).await.map_err(EngineError::from)
    }

    /// Delete a stored workflow. Running workflows cannot be deleted.
    pub async fn delete(&self, id: &Uuid) -> Result<bool, EngineError> {
        if self.running.contains_key(id) {
            return Err(EngineError::AlreadyRunning(*id));
        }
        self.breakers.remove(id);
        self.store.delete(id).await.map_err(EngineError::from)
    }

    // -----------------------------------------------------------------------
    // Run control
    // -----------------------------------------------------------------------

    pub fn is_running(&self, id: &Uuid) -> bool {
        self.running.contains_key(id)
    }

    /// Request cooperative cancellation. Returns `false` if the workflow is
    /// not running.
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.running.get(id) {
            Some(token) => {
                tracing::info!(workflow_id = %id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// The breaker guarding a workflow's steps, created on first use.
    pub fn breaker_for(&self, id: &Uuid) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(*id)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from(&self.config)))
            })
            .clone()
    }

    pub fn circuit_status(&self, id: &Uuid) -> Option<CircuitStatus> {
        self.breakers.get(id).map(|b| b.status())
    }

    pub async fn execute_by_id(&self, id: &Uuid) -> Result<ExecutionReport, EngineError> {
        if self.is_running(id) {
            return Err(EngineError::AlreadyRunning(*id));
        }
        let mut workflow = self.load(id).await?;
        self.execute(&mut workflow).await
    }

    pub async fn execute_by_name(&self, name: &str) -> Result<ExecutionReport, EngineError> {
        let mut workflow = self.load_by_name(name).await?;
        self.execute(&mut workflow).await
    }

    /// Run `workflow` to a terminal status.
    ///
    /// Step failures end up in the returned report; `Err` means the engine
    /// itself failed (persistence, concurrent run of the same id).
    pub async fn execute(&self, workflow: &mut Workflow) -> Result<ExecutionReport, EngineError> {
        let token = CancellationToken::new();
        match self.running.entry(workflow.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyRunning(workflow.id)),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        let _guard = RunningGuard {
            running: &self.running,
            id: workflow.id,
        };

        self.run(workflow, &token).await
    }

    // -----------------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------------

    async fn run(
        &self,
        workflow: &mut Workflow,
        token: &CancellationToken,
    ) -> Result<ExecutionReport, EngineError> {
        let run_clock = tokio::time::Instant::now();
        let workflow_id = workflow.id;

        for step in workflow.steps.iter_mut().filter(|s| s.status != StepStatus::Completed) {
            step.reset();
        }
        workflow.status = WorkflowStatus::Running;
        workflow.started_at = Some(Utc::now());
        workflow.completed_at = None;
        self.persist(workflow).await?;

        tracing::info!(
            workflow_id = %workflow_id,
            name = %workflow.name,
            steps = workflow.steps.len(),
            max_concurrent = workflow.max_concurrent_steps,
            "starting workflow execution"
        );
        self.monitor.log(
            &format!("Workflow started: {}", workflow.name),
            LogLevel::Info,
            &json!({ "workflow_id": workflow_id.to_string(), "steps": workflow.steps.len() }),
        );
        self.monitor.count("workflow.started", &[("workflow", workflow.name.as_str())]);

        let breaker = self.breaker_for(&workflow_id);
        let max_concurrent = workflow.max_concurrent_steps.max(1) as usize;
        let (tx, mut rx) = mpsc::unbounded_channel::<StepReport>();
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut handled: HashSet<usize> = HashSet::new();
        let mut cancelled = false;

        for index in 0..workflow.steps.len() {
            if max_concurrent > 1 {
                while workers.len() >= max_concurrent {
                    if let Some(Err(e)) = workers.join_next().await {
                        tracing::error!(workflow_id = %workflow_id, error = %e, "step worker terminated");
                    }
                }
            }
            while let Ok(report) = rx.try_recv() {
                self.apply_report(workflow, report, &mut handled).await?;
            }
            if let Some(failed) = unhandled_failure(workflow, &handled) {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    step_id = %workflow.steps[failed].id,
                    "step failed without a handler, halting"
                );
                break;
            }
            if token.is_cancelled() {
                tracing::info!(workflow_id = %workflow_id, "workflow cancelled, stopping dispatch");
                cancelled = true;
                break;
            }

            if workflow.steps[index].status == StepStatus::Completed {
                tracing::debug!(step_id = %workflow.steps[index].id, "skipping completed step");
                continue;
            }
            workflow.current_step_index = index;

            let job = match self.prepare(workflow, index, &breaker) {
                Ok(Prepared::Run(job)) => job,
                Ok(Prepared::Skip) => {
                    let now = Utc::now();
                    let step = &mut workflow.steps[index];
                    tracing::debug!(step_id = %step.id, "condition false, skipping step");
                    step.status = StepStatus::Skipped;
                    step.start_time = Some(now);
                    step.end_time = Some(now);
                    self.monitor.count("step.skipped", &[("action", step.action.as_str())]);
                    self.persist(workflow).await?;
                    continue;
                }
                Err(error) => {
                    let now = Utc::now();
                    let report = StepReport {
                        index,
                        result: Err(error),
                        attempts: 0,
                        started_at: now,
                        ended_at: now,
                        elapsed: Duration::ZERO,
                    };
                    self.apply_report(workflow, report, &mut handled).await?;
                    continue;
                }
            };

            let step = &mut workflow.steps[index];
            step.status = StepStatus::Running;
            step.start_time = Some(Utc::now());
            tracing::debug!(step_id = %step.id, action = %step.action, index, "dispatching step");
            self.persist(workflow).await?;

            if max_concurrent > 1 {
                let tx = tx.clone();
                workers.spawn(async move {
                    let report = job.run().await;
                    // The receiver only goes away when the run is abandoned.
                    let _ = tx.send(report);
                });
            } else {
                let report = job.run().await;
                self.apply_report(workflow, report, &mut handled).await?;
            }
        }

        drop(tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(workflow_id = %workflow_id, error = %e, "step worker terminated");
            }
        }
        while let Ok(report) = rx.try_recv() {
            self.apply_report(workflow, report, &mut handled).await?;
        }

        let now = Utc::now();
        for step in workflow.steps.iter_mut().filter(|s| s.status == StepStatus::Running) {
            step.status = StepStatus::Failed;
            step.error = Some("step worker terminated unexpectedly".to_string());
            step.end_time = Some(now);
        }

        workflow.status = if cancelled {
            WorkflowStatus::Cancelled
        } else if workflow.steps.iter().all(|s| s.status.is_success()) {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        workflow.completed_at = Some(now);
        self.persist(workflow).await?;

        let report = ExecutionReport::from_workflow(workflow);
        self.finish(workflow, &report, run_clock.elapsed()).await;
        Ok(report)
    }

    /// Validate a step and build its job, or decide to skip it.
    fn prepare(
        &self,
        workflow: &Workflow,
        index: usize,
        breaker: &Arc<CircuitBreaker>,
    ) -> Result<Prepared, StepError> {
        let step = &workflow.steps[index];
        let kind = self.registry.resolve(&step.action)?;
        step.retry_config
            .validate()
            .map_err(|reason| StepError::Validation(format!("retry_config: {reason}")))?;

        if let Some(condition) = &step.condition {
            if !evaluate_condition(condition, &workflow.variables)? {
                return Ok(Prepared::Skip);
            }
        }

        let params = resolve_action_params(kind, &step.params, &workflow.variables);
        let timeout = (self.config.enforce_step_timeouts && step.timeout > 0)
            .then(|| Duration::from_secs(step.timeout));

        Ok(Prepared::Run(StepJob {
            index,
            step_id: step.id.clone(),
            kind,
            exclusive_device: self.registry.requires_device(kind, &params),
            params,
            variables: workflow.variables.clone(),
            retry: RetryPolicy::from_config(&step.retry_config),
            timeout,
            registry: Arc::clone(&self.registry),
            breaker: Arc::clone(breaker),
            device_lock: Arc::clone(&self.device_lock),
        }))
    }

    /// Record a step outcome on the document, persist, and run the step's
    /// error handler if it failed.
    async fn apply_report(
        &self,
        workflow: &mut Workflow,
        report: StepReport,
        handled: &mut HashSet<usize>,
    ) -> Result<(), EngineError> {
        let index = report.index;
        let step = &mut workflow.steps[index];
        if step.start_time.is_none() {
            step.start_time = Some(report.started_at);
        }
        step.end_time = Some(report.ended_at);
        step.attempts = report.attempts;

        let tags = [("action", step.action.as_str())];
        self.monitor.time("step.duration", report.elapsed, &tags);

        let failure = match report.result {
            Ok(output) => {
                step.status = StepStatus::Completed;
                step.result = Some(output.value);
                step.error = None;
                self.monitor.count("step.completed", &tags);
                tracing::info!(step_id = %step.id, attempts = report.attempts, "step completed");
                for (name, value) in output.variable_updates {
                    workflow.variables.insert(name, value);
                }
                None
            }
            Err(error) => {
                step.status = StepStatus::Failed;
                step.result = None;
                step.error = Some(error.to_string());
                self.monitor
                    .count("step.failed", &[("action", step.action.as_str()), ("reason", error.kind())]);
                tracing::warn!(step_id = %step.id, error = %error, "step failed");
                Some(error)
            }
        };
        self.persist(workflow).await?;

        let Some(error) = failure else {
            return Ok(());
        };
        let step = &workflow.steps[index];
        let Some(handler) = step.error_handler.clone() else {
            return Ok(());
        };

        let params = error_handler_params(&step.id, &error.to_string());
        let step_id = step.id.clone();
        match self.invoke_hook(&handler, &params, workflow).await {
            Ok(updates) => {
                tracing::info!(step_id = %step_id, handler = %handler, "error handler succeeded");
                handled.insert(index);
                if !updates.is_empty() {
                    workflow.variables.extend(updates);
                    self.persist(workflow).await?;
                }
            }
            Err(e) => {
                tracing::warn!(step_id = %step_id, handler = %handler, error = %e, "error handler failed");
            }
        }
        Ok(())
    }

    /// Invoke a handler or hook action by name, holding the device lock when
    /// it needs the device. Returns its variable updates.
    async fn invoke_hook(
        &self,
        action: &str,
        params: &Params,
        workflow: &Workflow,
    ) -> Result<Vec<(String, Value)>, CapabilityError> {
        let needs_device = action
            .parse::<ActionKind>()
            .map(|kind| self.registry.requires_device(kind, params))
            .unwrap_or(false);
        let _device = if needs_device {
            Some(self.device_lock.lock().await)
        } else {
            None
        };
        self.registry
            .invoke_named(action, params, &workflow.variables)
            .await
            .map(|out| out.variable_updates)
    }

    /// Terminal monitoring and completion hooks. Nothing here can change the
    /// terminal status.
    async fn finish(&self, workflow: &Workflow, report: &ExecutionReport, elapsed: Duration) {
        let tags = [("workflow", workflow.name.as_str())];
        let (counter, level) = match workflow.status {
            WorkflowStatus::Completed => ("workflow.completed", LogLevel::Info),
            WorkflowStatus::Cancelled => ("workflow.cancelled", LogLevel::Warning),
            _ => ("workflow.failed", LogLevel::Error),
        };
        self.monitor.count(counter, &tags);
        self.monitor.time("workflow.duration", elapsed, &tags);
        self.monitor.log(
            &format!("Workflow {}: {}", workflow.status, workflow.name),
            level,
            &json!({
                "workflow_id": workflow.id.to_string(),
                "error": report.error,
            }),
        );
        tracing::info!(
            workflow_id = %workflow.id,
            status = %workflow.status,
            elapsed_ms = elapsed.as_millis() as u64,
            "workflow finished"
        );

        let hook = match workflow.status {
            WorkflowStatus::Completed => workflow.on_success.as_deref(),
            _ => workflow.on_failure.as_deref(),
        };
        if let Some(hook) = hook {
            let params = hook_params(&workflow.id, &workflow.name, workflow.status.as_str());
            if let Err(e) = self.invoke_hook(hook, &params, workflow).await {
                tracing::warn!(workflow_id = %workflow.id, hook, error = %e, "completion hook failed");
            }
        }
    }

    async fn persist(&self, workflow: &Workflow) -> Result<(), EngineError> {
        self.store.save(workflow).await.map_err(|e| {
            tracing::error!(workflow_id = %workflow.id, error = %e, "failed to persist workflow");
            EngineError::Persistence(e)
        })
    }
}

/// Index of the first failed step (declaration order) whose failure was not
/// handled by an error handler.
fn unhandled_failure(workflow: &Workflow, handled: &HashSet<usize>) -> Option<usize> {
    workflow
        .steps
        .iter()
        .enumerate()
        .find(|(i, s)| s.status == StepStatus::Failed && !handled.contains(i))
        .map(|(i, _)| i)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use conductor_types::workflow::RetryConfig;

    use crate::action::capability::capability_fn;
    use crate::action::{ActionOutput, Variables};
    use crate::monitor::tests::RecordingMonitor;
    use crate::repository::workflow::{InMemoryWorkflowStore, StoreLocation};

    /// Test collaborator driven by its parameters:
    /// `delay_ms` sleeps first, `fail` fails with that message, `value` is returned.
    fn scripted(params: Params) -> impl std::future::Future<Output = Result<ActionOutput, CapabilityError>> {
        async move {
            if let Some(ms) = params.get("delay_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if let Some(msg) = params.get("fail").and_then(Value::as_str) {
                return Err(CapabilityError::Failed(msg.to_string()));
            }
            Ok(ActionOutput::value(params.get("value").cloned().unwrap_or(json!("ok"))))
        }
    }

    fn registry() -> ActionRegistry {
        ActionRegistry::builder()
            .register(ActionKind::OpenBrowser, capability_fn(|p: Params, _v: Variables| scripted(p)))
            .register(ActionKind::ClickText, capability_fn(|p: Params, _v: Variables| scripted(p)))
            .register(ActionKind::TakeScreenshot, capability_fn(|p: Params, _v: Variables| scripted(p)))
            .register_concurrent(ActionKind::FindText, capability_fn(|p: Params, _v: Variables| scripted(p)))
            .build()
    }

    fn engine_with(registry: ActionRegistry, config: EngineConfig) -> WorkflowEngine<InMemoryWorkflowStore> {
        WorkflowEngine::new(
            InMemoryWorkflowStore::new(),
            Arc::new(registry),
            MonitorHandle::default(),
            config,
        )
    }

    fn engine() -> WorkflowEngine<InMemoryWorkflowStore> {
        engine_with(registry(), EngineConfig::default())
    }

    fn step(id: &str, action: &str) -> Step {
        Step::new(id, action).with_retry(RetryConfig::once())
    }

    fn failing(id: &str, action: &str, message: &str) -> Step {
        step(id, action).with_param("fail", message)
    }

    fn statuses(report: &ExecutionReport) -> Vec<StepStatus> {
        report.steps.iter().map(|s| s.status).collect()
    }

    #[tokio::test]
    async fn test_happy_path_completes_all_steps() {
        let engine = engine();
        let mut wf = Workflow::new("happy")
            .with_step(step("open_target", "open_browser").with_param("value", "opened"))
            .with_step(step("perform_action", "click_text"))
            .with_step(step("capture_result", "take_screenshot"));

        let report = engine.execute(&mut wf).await.unwrap();

        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.current_step_index, 2);
        assert!(wf.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert!(wf.steps.iter().all(|s| s.end_time.is_some() && s.start_time.is_some()));
        assert_eq!(wf.steps[0].result, Some(json!("opened")));
        assert!(wf.started_at.is_some() && wf.completed_at.is_some());
        assert_eq!(report.error, None);

        let stored = engine.load(&wf.id).await.unwrap();
        assert_eq!(stored, wf);
        assert_eq!(
            engine.store().location_of(&wf.id).await,
            Some(StoreLocation::Completed)
        );
    }

    #[tokio::test]
    async fn test_halt_on_failure_leaves_later_steps_pending() {
        let engine = engine();
        let mut wf = Workflow::new("halt")
            .with_step(step("a", "open_browser"))
            .with_step(failing("b", "click_text", "button not found"))
            .with_step(step("c", "take_screenshot"));

        let report = engine.execute(&mut wf).await.unwrap();

        assert_eq!(
            statuses(&report),
            vec![StepStatus::Completed, StepStatus::Failed, StepStatus::Pending]
        );
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(wf.steps[1].error.as_deref().unwrap().contains("button not found"));
        assert_eq!(wf.steps[2].start_time, None);
        assert_eq!(wf.current_step_index, 1);
        assert_eq!(
            engine.store().location_of(&wf.id).await,
            Some(StoreLocation::Failed)
        );
    }

    #[tokio::test]
    async fn test_zero_steps_complete_immediately() {
        let engine = engine();
        let mut wf = Workflow::new("empty");
        let report = engine.execute(&mut wf).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert!(report.steps.is_empty());
    }

    #[tokio::test]
    async fn test_empty_and_unknown_actions_fail_validation() {
        let engine = engine();
        for action in ["", "teleport", "detect_ui"] {
            let mut wf = Workflow::new("invalid")
                .with_step(step("bad", action))
                .with_step(step("after", "open_browser"));
            let report = engine.execute(&mut wf).await.unwrap();

            assert_eq!(report.status, WorkflowStatus::Failed, "action {action:?}");
            assert_eq!(wf.steps[0].status, StepStatus::Failed);
            assert_eq!(wf.steps[0].attempts, 0);
            assert!(wf.steps[0].error.as_deref().unwrap().starts_with("validation error"));
            assert_eq!(wf.steps[1].status, StepStatus::Pending);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_retries_then_records_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let registry = ActionRegistry::builder()
            .register(
                ActionKind::ClickText,
                capability_fn(move |_p: Params, _v: Variables| {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(CapabilityError::Failed(format!("miss {n}")))
                        } else {
                            Ok(ActionOutput::value(n))
                        }
                    }
                }),
            )
            .build();
        let engine = engine_with(registry, EngineConfig::default());
        let mut wf = Workflow::new("retry").with_step(Step::new("click", "click_text"));

        let report = engine.execute(&mut wf).await.unwrap();

        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.outcome("click").unwrap().attempts, 3);
        assert_eq!(wf.steps[0].result, Some(json!(3)));
    }

    #[tokio::test]
    async fn test_false_condition_skips_and_counts_as_success() {
        let engine = engine();
        let mut wf = Workflow::new("cond")
            .with_variable("logged_in", true)
            .with_step(step("login", "click_text").with_condition("not logged_in"))
            .with_step(step("next", "open_browser").with_condition("${logged_in} == true"));

        let report = engine.execute(&mut wf).await.unwrap();

        assert_eq!(statuses(&report), vec![StepStatus::Skipped, StepStatus::Completed]);
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert!(wf.steps[0].start_time.is_some() && wf.steps[0].end_time.is_some());
    }

    #[tokio::test]
    async fn test_condition_error_fails_step() {
        let engine = engine();
        let mut wf = Workflow::new("cond-err").with_step(step("a", "open_browser").with_condition("missing > 1"));
        let report = engine.execute(&mut wf).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(wf.steps[0].error.as_deref().unwrap().contains("unknown variable 'missing'"));
    }

    #[tokio::test]
    async fn test_set_variable_feeds_later_interpolation() {
        let engine = engine();
        let mut wf = Workflow::new("vars")
            .with_step(
                step("remember", "set_variable")
                    .with_param("name", "target")
                    .with_param("value", "https://example.com"),
            )
            .with_step(step("go", "open_browser").with_param("value", "visit ${target}"));

        let report = engine.execute(&mut wf).await.unwrap();

        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(wf.variables["target"], json!("https://example.com"));
        assert_eq!(wf.steps[1].result, Some(json!("visit https://example.com")));
        // Parameters on the document keep their references.
        assert_eq!(wf.steps[1].params["value"], json!("visit ${target}"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_enforced() {
        let engine = engine();
        let mut wf = Workflow::new("slow").with_step(
            step("slow", "click_text")
                .with_param("delay_ms", 10_000)
                .with_timeout(2),
        );
        let report = engine.execute(&mut wf).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(wf.steps[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_can_be_disabled() {
        let config = EngineConfig {
            enforce_step_timeouts: false,
            ..EngineConfig::default()
        };
        let engine = engine_with(registry(), config);
        let mut wf = Workflow::new("slow-ok").with_step(
            step("slow", "click_text")
                .with_param("delay_ms", 10_000)
                .with_timeout(2),
        );
        let report = engine.execute(&mut wf).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_error_handler_lets_run_continue() {
        let engine = engine();
        let mut wf = Workflow::new("handled")
            .with_step(failing("a", "click_text", "boom").with_error_handler("set_variable"))
            .with_step(step("b", "open_browser"));

        let report = engine.execute(&mut wf).await.unwrap();

        // The handler ran (set_variable without a name fails), so the run halts.
        assert_eq!(statuses(&report), vec![StepStatus::Failed, StepStatus::Pending]);

        let mut wf = Workflow::new("handled")
            .with_step(failing("a", "click_text", "boom").with_error_handler("log"))
            .with_step(step("b", "open_browser"));
        let report = engine.execute(&mut wf).await.unwrap();

        assert_eq!(statuses(&report), vec![StepStatus::Failed, StepStatus::Completed]);
        // A handled failure still fails the workflow.
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_halt_follows_declaration_order() {
        let engine = engine();
        let mut wf = Workflow::new("concurrent")
            .with_max_concurrent_steps(2)
            .with_step(step("a", "find_text").with_param("delay_ms", 200))
            .with_step(failing("b", "find_text", "b broke").with_param("delay_ms", 50))
            .with_step(step("c", "find_text").with_param("delay_ms", 100))
            .with_step(step("d", "find_text"));

        let report = engine.execute(&mut wf).await.unwrap();

        // c waits for a free slot; b's failure arrives first and halts
        // dispatch. a was already in flight and is joined before finalizing.
        assert_eq!(
            statuses(&report),
            vec![
                StepStatus::Completed,
                StepStatus::Failed,
                StepStatus::Pending,
                StepStatus::Pending
            ]
        );
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(wf.current_step_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_report_first_declared() {
        let engine = engine();
        let mut wf = Workflow::new("both-fail")
            .with_max_concurrent_steps(2)
            .with_step(failing("a", "find_text", "a broke").with_param("delay_ms", 200))
            .with_step(failing("b", "find_text", "b broke").with_param("delay_ms", 10));

        let report = engine.execute(&mut wf).await.unwrap();

        assert_eq!(report.status, WorkflowStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("a broke"));
        assert_eq!(wf.first_failed_step().unwrap().id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_actions_never_overlap() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());
        let registry = ActionRegistry::builder()
            .register(
                ActionKind::PressKey,
                capability_fn(move |_p: Params, _v: Variables| {
                    let (f, p) = (f.clone(), p.clone());
                    async move {
                        let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                        p.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        f.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, CapabilityError>(ActionOutput::default())
                    }
                }),
            )
            .build();
        let engine = engine_with(registry, EngineConfig::default());
        let mut wf = Workflow::new("device")
            .with_max_concurrent_steps(3)
            .with_step(step("k1", "press_key"))
            .with_step(step("k2", "press_key"))
            .with_step(step("k3", "press_key"));

        let report = engine.execute(&mut wf).await.unwrap();

        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_dispatch() {
        let engine = Arc::new(engine());
        let mut wf = Workflow::new("cancel")
            .with_step(step("w1", "wait").with_param("seconds", 5))
            .with_step(step("w2", "wait").with_param("seconds", 5));
        let id = wf.id;

        let runner = {
            let engine = Arc::clone(&engine);
            async move {
                let report = engine.execute(&mut wf).await;
                (report, wf)
            }
        };
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(engine.cancel(&id));
        };
        let ((report, wf), ()) = tokio::join!(runner, canceller);
        let report = report.unwrap();

        assert_eq!(report.status, WorkflowStatus::Cancelled);
        assert_eq!(wf.steps[0].status, StepStatus::Completed);
        assert_eq!(wf.steps[1].status, StepStatus::Pending);
        assert!(!engine.is_running(&id));
        assert!(!engine.cancel(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_execution_of_running_workflow_is_rejected() {
        let engine = engine();
        let mut first = Workflow::new("single").with_step(step("w", "wait").with_param("seconds", 1));
        let mut second = first.clone();

        let (a, b) = tokio::join!(engine.execute(&mut first), async {
            tokio::task::yield_now().await;
            engine.execute(&mut second).await
        });

        assert_eq!(a.unwrap().status, WorkflowStatus::Completed);
        assert!(matches!(b, Err(EngineError::AlreadyRunning(id)) if id == first.id));
    }

    #[tokio::test]
    async fn test_workflow_breaker_opens_across_steps() {
        let config = EngineConfig {
            circuit_failure_threshold: 2,
            ..EngineConfig::default()
        };
        let engine = engine_with(registry(), config);
        let mut wf = Workflow::new("breaker")
            .with_step(failing("a", "click_text", "locked").with_error_handler("log"))
            .with_step(failing("b", "click_text", "locked").with_error_handler("log"))
            .with_step(step("c", "click_text").with_error_handler("log"));

        let report = engine.execute(&mut wf).await.unwrap();

        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(engine.circuit_status(&wf.id), Some(CircuitStatus::Open));
        assert_eq!(wf.steps[2].status, StepStatus::Failed);
        assert_eq!(wf.steps[2].attempts, 0);
        assert!(wf.steps[2].error.as_deref().unwrap().contains("circuit breaker open"));
    }

    #[tokio::test]
    async fn test_rerun_skips_completed_steps() {
        let engine = engine();
        let mut wf = Workflow::new("rerun")
            .with_step(step("a", "open_browser"))
            .with_step(failing("b", "click_text", "first time"))
            .with_step(step("c", "take_screenshot"));
        let first = engine.execute(&mut wf).await.unwrap();
        assert_eq!(
            statuses(&first),
            vec![StepStatus::Completed, StepStatus::Failed, StepStatus::Pending]
        );
        let first_end = wf.steps[0].end_time;

        wf.steps[1].params.remove("fail");
        engine.save(&wf).await.unwrap();
        let report = engine.execute_by_id(&wf.id).await.unwrap();

        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(
            statuses(&report),
            vec![StepStatus::Completed, StepStatus::Completed, StepStatus::Completed]
        );
        assert_eq!(report.error, None);
        let stored = engine.load(&wf.id).await.unwrap();
        assert_eq!(stored.steps[0].end_time, first_end);
        assert_eq!(stored.steps[1].error, None);
        assert_eq!(stored.steps[1].attempts, 1);
        assert_eq!(
            engine.store().location_of(&wf.id).await,
            Some(StoreLocation::Completed)
        );
    }

    #[tokio::test]
    async fn test_if_condition_compares_string_variables() {
        let engine = engine();
        let mut wf = Workflow::new("branching")
            .with_variable("user", "bob")
            .with_variable("note", "1 == 1 or true")
            .with_step(
                step("greet", "if_condition")
                    .with_param("condition", "${user} == 'bob'")
                    .with_param("then_action", "set_variable")
                    .with_param("then_params", json!({"name": "greeting", "value": "hi ${user}"})),
            )
            .with_step(
                step("guard", "if_condition")
                    .with_param("condition", "${note} == 'x'")
                    .with_param("then_action", "set_variable")
                    .with_param("then_params", json!({"name": "branch", "value": "then"}))
                    .with_param("else_action", "set_variable")
                    .with_param("else_params", json!({"name": "branch", "value": "else"})),
            );

        let report = engine.execute(&mut wf).await.unwrap();

        assert_eq!(report.status, WorkflowStatus::Completed, "{:?}", report.error);
        assert_eq!(wf.variables["greeting"], json!("hi bob"));
        // Variable text is compared as a value, never parsed as an expression.
        assert_eq!(wf.variables["branch"], json!("else"));
        assert_eq!(wf.steps[1].result, Some(json!({"condition": false, "result": "else"})));
    }

    #[tokio::test]
    async fn test_completion_hooks_follow_terminal_status() {
        let recorder = Arc::new(RecordingMonitor::default());
        let registry = ActionRegistry::builder()
            .register(ActionKind::ClickText, capability_fn(|p: Params, _v: Variables| scripted(p)))
            .monitor(MonitorHandle::from_arc(recorder.clone()))
            .build();
        let engine = engine_with(registry, EngineConfig::default());

        let mut wf = Workflow::new("hooks").with_step(step("a", "wait").with_param("seconds", 0));
        wf.on_success = Some("log".into());
        wf.on_failure = Some("log".into());
        let report = engine.execute(&mut wf).await.unwrap();
        assert_eq!(report.status, WorkflowStatus::Completed);
        assert_eq!(recorder.events(), vec!["log:info:workflow 'hooks' completed".to_string()]);

        let mut wf = Workflow::new("hooks").with_step(failing("a", "click_text", "x"));
        wf.on_success = Some("log".into());
        wf.on_failure = Some("teleport".into());
        let report = engine.execute(&mut wf).await.unwrap();

        // A broken hook is logged and never changes the terminal status.
        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(engine.load(&wf.id).await.unwrap().status, WorkflowStatus::Failed);
        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_receives_run_events() {
        let recorder = Arc::new(RecordingMonitor::default());
        let engine = WorkflowEngine::new(
            InMemoryWorkflowStore::new(),
            Arc::new(registry()),
            MonitorHandle::from_arc(recorder.clone()),
            EngineConfig::default(),
        );
        let mut wf = Workflow::new("observed")
            .with_step(step("a", "open_browser"))
            .with_step(failing("b", "click_text", "nope"));
        engine.execute(&mut wf).await.unwrap();

        let events = recorder.events();
        for expected in [
            "log:info:Workflow started: observed",
            "counter:workflow.started",
            "counter:step.completed",
            "counter:step.failed",
            "timer:step.duration",
            "counter:workflow.failed",
            "timer:workflow.duration",
            "log:error:Workflow failed: observed",
        ] {
            assert!(events.iter().any(|e| e == expected), "missing {expected} in {events:?}");
        }
    }

    #[tokio::test]
    async fn test_degraded_monitor_does_not_fail_run() {
        let engine = WorkflowEngine::new(
            InMemoryWorkflowStore::new(),
            Arc::new(registry()),
            MonitorHandle::new(crate::monitor::tests::BrokenMonitor),
            EngineConfig::default(),
        );
        let mut wf = Workflow::new("quiet").with_step(step("a", "open_browser"));
        assert_eq!(engine.execute(&mut wf).await.unwrap().status, WorkflowStatus::Completed);
    }

    /// A store whose disk is full.
    struct FullDisk;

    impl WorkflowStore for FullDisk {
        async fn save(&self, _: &Workflow) -> Result<(), StoreError> {
            Err(StoreError::Io("no space left on device".into()))
        }
        async fn load(&self, _: &Uuid) -> Result<Option<Workflow>, StoreError> {
            Ok(None)
        }
        async fn list(&self, _: Option<WorkflowStatus>) -> Result<Vec<Workflow>, StoreError> {
            Ok(Vec::new())
        }
        async fn delete(&self, _: &Uuid) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_is_an_engine_error() {
        let engine = WorkflowEngine::new(
            FullDisk,
            Arc::new(registry()),
            MonitorHandle::default(),
            EngineConfig::default(),
        );
        let mut wf = Workflow::new("doomed").with_step(step("a", "open_browser"));
        let err = engine.execute(&mut wf).await.unwrap_err();
        assert!(matches!(err, EngineError::Persistence(StoreError::Io(_))));
        assert!(!engine.is_running(&wf.id));
    }

    #[tokio::test]
    async fn test_document_management() {
        let engine = engine();
        let created = engine.create_workflow("nightly", Some("nightly scrape")).await.unwrap();
        assert_eq!(engine.load(&created.id).await.unwrap().description(), "nightly scrape");

        let yaml = r#"
name: nightly
steps:
  - id: open
    action: open_browser
    params:
      value: hi
"#;
        let id = engine.submit(yaml, DocumentFormat::Yaml).await.unwrap();
        let latest = engine.load_by_name("nightly").await.unwrap();
        assert_eq!(latest.id, id);

        let report = engine.execute_by_name("nightly").await.unwrap();
        assert_eq!(report.workflow_id, id);
        assert_eq!(engine.list(Some(WorkflowStatus::Completed)).await.unwrap().len(), 1);
        assert_eq!(engine.list(Some(WorkflowStatus::Pending)).await.unwrap().len(), 1);

        assert!(engine.delete(&id).await.unwrap());
        assert!(matches!(engine.load(&id).await, Err(EngineError::NotFound(_))));
        assert!(matches!(
            engine.execute_by_name("nobody").await,
            Err(EngineError::NotFound(_))
        ));

        let dup = "name: dup\nsteps:\n  - {id: a, action: wait}\n  - {id: a, action: wait}\n";
        assert!(matches!(
            engine.submit(dup, DocumentFormat::Yaml).await,
            Err(EngineError::Document(DocumentError::Invalid(_)))
        ));
    }

    #[test]
    fn test_new_step_uses_configured_defaults() {
        let config = EngineConfig {
            default_step_timeout_secs: 15,
            default_retry: RetryConfig {
                max_attempts: 7,
                ..RetryConfig::default()
            },
            ..EngineConfig::default()
        };
        let engine = engine_with(registry(), config);
        let step = engine.new_step("s", "wait");
        assert_eq!(step.timeout, 15);
        assert_eq!(step.retry_config.max_attempts, 7);
    }
}
