//! Workflow domain types for Conductor.
//!
//! `Workflow` and `Step` are pure data: everything the engine needs to drive
//! a run and everything an operator needs to inspect one. The same structs
//! are the persisted document (YAML or JSON), so a workflow can be written
//! mid-execution and read back without consulting engine memory.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DocumentError;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl WorkflowStatus {
    /// Whether the workflow has reached a final status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown workflow status: '{other}'")),
        }
    }
}

/// Execution status of a single step.
///
/// Transitions are monotonic: `Pending -> Running -> {Completed | Failed | Skipped}`.
/// A pending step may also go straight to `Skipped` or `Failed` when it is
/// rejected before dispatch (false condition, validation failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether the step counts toward a successful workflow.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Whether moving from `self` to `next` respects the step lifecycle.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Skipped | Self::Failed) => true,
            (Self::Running, n) => n.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Retry configuration
// ---------------------------------------------------------------------------

/// Per-step retry configuration as it appears in the document.
///
/// `delay` is the initial inter-attempt delay in seconds; it grows by
/// `backoff_factor` after every failed attempt and is perturbed by a uniform
/// multiplier in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay")]
    pub delay: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay() -> f64 {
    1.0
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: default_delay(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// A configuration that runs the operation exactly once.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Check the numeric bounds: `max_attempts >= 1`, `backoff_factor >= 1`,
    /// `delay >= 0`, `jitter` in `[0, 1)`.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be >= 1".to_string());
        }
        if !self.delay.is_finite() || self.delay < 0.0 {
            return Err(format!("delay must be a non-negative number, got {}", self.delay));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(format!(
                "backoff_factor must be >= 1, got {}",
                self.backoff_factor
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(format!("jitter must be in [0, 1), got {}", self.jitter));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Default advisory timeout for a step, in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 60;

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn new_step_id() -> String {
    Uuid::now_v7().to_string()
}

/// Deserialize a field that is present in the document as `Some`, even when
/// its value is `null`. Absent fields fall back to `None` via `#[serde(default)]`,
/// which keeps "returned null" distinct from "no result recorded".
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// One declarative action within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the workflow.
    #[serde(default = "new_step_id")]
    pub id: String,
    /// Action name, resolved through the action registry at dispatch.
    pub action: String,
    /// Action parameters. String values may reference variables as `${name}`.
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Timeout in seconds. Zero disables the timeout.
    #[serde(default = "default_step_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub retry_config: RetryConfig,
    /// Optional boolean expression over workflow variables.
    #[serde(default)]
    pub condition: Option<String>,
    /// Optional action invoked when this step fails.
    #[serde(default)]
    pub error_handler: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Number of capability attempts made by the last execution.
    #[serde(default)]
    pub attempts: u32,
}

impl Step {
    /// Create a pending step with default timeout and retry configuration.
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            params: HashMap::new(),
            description: None,
            timeout: DEFAULT_STEP_TIMEOUT_SECS,
            retry_config: RetryConfig::default(),
            condition: None,
            error_handler: None,
            status: StepStatus::Pending,
            result: None,
            error: None,
            start_time: None,
            end_time: None,
            attempts: 0,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_retry(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = timeout_secs;
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_error_handler(mut self, handler: impl Into<String>) -> Self {
        self.error_handler = Some(handler.into());
        self
    }

    /// Human-readable description, defaulting to `Execute <action>`.
    pub fn description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("Execute {}", self.action))
    }

    /// Clear runtime fields so the step can be dispatched again.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.result = None;
        self.error = None;
        self.start_time = None;
        self.end_time = None;
        self.attempts = 0;
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

fn default_max_concurrent_steps() -> u32 {
    1
}

/// An ordered, persisted collection of steps plus shared variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Shared variable context read by conditions and interpolation.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Action invoked once after the workflow completes.
    #[serde(default)]
    pub on_success: Option<String>,
    /// Action invoked once after the workflow fails.
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: u32,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Index of the last dispatched step.
    #[serde(default)]
    pub current_step_index: usize,
}

impl Workflow {
    /// Create an empty pending workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
            variables: HashMap::new(),
            on_success: None,
            on_failure: None,
            max_concurrent_steps: default_max_concurrent_steps(),
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            current_step_index: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_max_concurrent_steps(mut self, max: u32) -> Self {
        self.max_concurrent_steps = max;
        self
    }

    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Human-readable description, defaulting to `Workflow: <name>`.
    pub fn description(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| format!("Workflow: {}", self.name))
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The first step in declaration order that ended `Failed`.
    pub fn first_failed_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    // -----------------------------------------------------------------------
    // Document conversion
    // -----------------------------------------------------------------------

    pub fn to_yaml(&self) -> Result<String, DocumentError> {
        serde_yaml_ng::to_string(self).map_err(|e| DocumentError::Serialize(e.to_string()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, DocumentError> {
        serde_yaml_ng::from_str(yaml).map_err(|e| DocumentError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, DocumentError> {
        serde_json::to_string_pretty(self).map_err(|e| DocumentError::Serialize(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        serde_json::from_str(json).map_err(|e| DocumentError::Parse(e.to_string()))
    }

    pub fn to_document(&self, format: DocumentFormat) -> Result<String, DocumentError> {
        match format {
            DocumentFormat::Yaml => self.to_yaml(),
            DocumentFormat::Json => self.to_json(),
        }
    }

    pub fn from_document(text: &str, format: DocumentFormat) -> Result<Self, DocumentError> {
        match format {
            DocumentFormat::Yaml => Self::from_yaml(text),
            DocumentFormat::Json => Self::from_json(text),
        }
    }

    /// Read a document, choosing the format from the file extension.
    pub fn load_from_file(path: &Path) -> Result<Self, DocumentError> {
        let format = DocumentFormat::from_path(path)?;
        let text = std::fs::read_to_string(path)?;
        Self::from_document(&text, format)
    }

    /// Write a document, choosing the format from the file extension.
    pub fn save_to_file(&self, path: &Path) -> Result<(), DocumentError> {
        let format = DocumentFormat::from_path(path)?;
        let text = self.to_document(format)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Structural checks run before a document is accepted.
    ///
    /// Action names are not resolved here; unknown actions fail at dispatch.
    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.name.trim().is_empty() {
            return Err(DocumentError::Invalid("workflow name must not be empty".into()));
        }
        if self.max_concurrent_steps == 0 {
            return Err(DocumentError::Invalid(
                "max_concurrent_steps must be >= 1".into(),
            ));
        }

        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(DocumentError::Invalid(format!(
                    "step at index {index} has an empty id"
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(DocumentError::Invalid(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            step.retry_config.validate().map_err(|reason| {
                DocumentError::Invalid(format!("step '{}': {reason}", step.id))
            })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DocumentFormat
// ---------------------------------------------------------------------------

/// Textual encoding of a workflow document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// Pick the format from a `.yaml`, `.yml` or `.json` extension.
    pub fn from_path(path: &Path) -> Result<Self, DocumentError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "yaml" | "yml" => Ok(DocumentFormat::Yaml),
            "json" => Ok(DocumentFormat::Json),
            _ => Err(DocumentError::UnsupportedFormat(path.display().to_string())),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DocumentFormat::Yaml => "yaml",
            DocumentFormat::Json => "json",
        }
    }
}

impl FromStr for DocumentFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(DocumentFormat::Yaml),
            "json" => Ok(DocumentFormat::Json),
            other => Err(format!("unknown document format '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
