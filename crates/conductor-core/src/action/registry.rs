//! Action registry: maps `ActionKind` to collaborator capabilities.
//!
//! Built-in control-flow actions are always present and cannot be replaced.
//! The registry is immutable once built and shared via `Arc` between the
//! engine and its workers.

use std::collections::{HashMap, HashSet};

use futures_util::future::BoxFuture;
use serde_json::{json, Value};

use super::builtin;
use super::capability::{ActionOutput, BoxCapability, Capability, CapabilityError};
use super::{ActionKind, Params, Variables};
use crate::monitor::MonitorHandle;
use crate::workflow::step_runner::StepError;

/// Bound on nested delegation when inspecting `if_condition` / `loop` params.
const MAX_DELEGATION_DEPTH: usize = 8;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects capabilities before the registry is frozen.
#[derive(Default)]
pub struct ActionRegistryBuilder {
    capabilities: HashMap<ActionKind, BoxCapability>,
    concurrent: HashSet<ActionKind>,
    monitor: Option<MonitorHandle>,
}

impl ActionRegistryBuilder {
    /// Register a collaborator for `kind`, replacing any previous one.
    ///
    /// Registrations for built-in kinds are ignored.
    pub fn register<C: Capability + 'static>(mut self, kind: ActionKind, capability: C) -> Self {
        if kind.is_builtin() {
            tracing::warn!(action = %kind, "ignoring registration for built-in action");
            return self;
        }
        self.concurrent.remove(&kind);
        self.capabilities.insert(kind, BoxCapability::new(capability));
        self
    }

    /// Register a collaborator that is safe to invoke concurrently, so its
    /// calls skip the engine-wide device lock.
    pub fn register_concurrent<C: Capability + 'static>(self, kind: ActionKind, capability: C) -> Self {
        let mut builder = self.register(kind, capability);
        if !kind.is_builtin() {
            builder.concurrent.insert(kind);
        }
        builder
    }

    /// Sink used by the `log` built-in. Defaults to `TracingMonitor`.
    pub fn monitor(mut self, monitor: MonitorHandle) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn build(self) -> ActionRegistry {
        ActionRegistry {
            capabilities: self.capabilities,
            concurrent: self.concurrent,
            monitor: self.monitor.unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

pub struct ActionRegistry {
    capabilities: HashMap<ActionKind, BoxCapability>,
    concurrent: HashSet<ActionKind>,
    monitor: MonitorHandle,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("registered", &self.registered())
            .finish()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ActionRegistry {
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder::default()
    }

    pub fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    /// Whether `kind` can be invoked.
    pub fn is_available(&self, kind: ActionKind) -> bool {
        kind.is_builtin() || self.capabilities.contains_key(&kind)
    }

    /// Every invocable kind, in declaration order.
    pub fn registered(&self) -> Vec<ActionKind> {
        ActionKind::ALL
            .into_iter()
            .filter(|k| self.is_available(*k))
            .collect()
    }

    /// Resolve a step's `action` string.
    ///
    /// Empty, unknown, and unregistered names are validation failures.
    pub fn resolve(&self, action: &str) -> Result<ActionKind, StepError> {
        if action.trim().is_empty() {
            return Err(StepError::Validation("step action must not be empty".into()));
        }
        let kind = action
            .parse::<ActionKind>()
            .map_err(|e| StepError::Validation(e.to_string()))?;
        if !self.is_available(kind) {
            return Err(StepError::Validation(format!(
                "no capability registered for action '{kind}'"
            )));
        }
        Ok(kind)
    }

    /// Whether running `kind` with `params` touches the exclusive device,
    /// directly or through a delegated action.
    pub fn requires_device(&self, kind: ActionKind, params: &Params) -> bool {
        self.requires_device_at(kind, params, 0)
    }

    fn requires_device_at(&self, kind: ActionKind, params: &Params, depth: usize) -> bool {
        if kind.requires_device() {
            return !self.concurrent.contains(&kind);
        }
        if depth >= MAX_DELEGATION_DEPTH {
            // Unknown nesting: assume the worst.
            return true;
        }
        builtin::delegated_actions(kind, params)
            .into_iter()
            .any(|(name, nested)| match name.parse::<ActionKind>() {
                Ok(inner) => self.requires_device_at(inner, &nested, depth + 1),
                Err(_) => false,
            })
    }

    /// Invoke `kind`. Built-ins run in place; everything else goes to the
    /// registered collaborator.
    pub fn invoke<'a>(
        &'a self,
        kind: ActionKind,
        params: &'a Params,
        variables: &'a Variables,
    ) -> BoxFuture<'a, Result<ActionOutput, CapabilityError>> {
        Box::pin(async move {
            match kind {
                ActionKind::Wait => builtin::wait(params).await,
                ActionKind::SetVariable => builtin::set_variable(params),
                ActionKind::Log => builtin::log(self, params),
                ActionKind::IfCondition => builtin::if_condition(self, params, variables).await,
                ActionKind::Loop => builtin::run_loop(self, params, variables).await,
                _ => match self.capabilities.get(&kind) {
                    Some(capability) => capability.invoke(params, variables).await,
                    None => Err(CapabilityError::InvalidParams(format!(
                        "no capability registered for action '{kind}'"
                    ))),
                },
            }
        })
    }

    /// Invoke a hook or error handler referenced by name.
    pub async fn invoke_named(
        &self,
        action: &str,
        params: &Params,
        variables: &Variables,
    ) -> Result<ActionOutput, CapabilityError> {
        let kind = self
            .resolve(action)
            .map_err(|e| CapabilityError::InvalidParams(e.to_string()))?;
        self.invoke(kind, params, variables).await
    }
}

/// Parameters passed to an `error_handler`.
///
/// `message` makes `log` usable as a handler without extra parameters.
pub fn error_handler_params(step_id: &str, error: &str) -> Params {
    Params::from([
        ("step_id".to_string(), json!(step_id)),
        ("error".to_string(), json!(error)),
        ("message".to_string(), json!(format!("step '{step_id}' failed: {error}"))),
    ])
}

/// Parameters passed to `on_success` / `on_failure` hooks.
pub fn hook_params(workflow_id: &uuid::Uuid, workflow_name: &str, status: &str) -> Params {
    Params::from([
        ("workflow_id".to_string(), Value::String(workflow_id.to_string())),
        ("workflow_name".to_string(), json!(workflow_name)),
        ("status".to_string(), json!(status)),
        ("message".to_string(), json!(format!("workflow '{workflow_name}' {status}"))),
    ])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
