//! Capability trait and its object-safe wrapper.
//!
//! Follows the blanket-impl pattern used for type-erased async traits:
//! 1. `Capability` uses RPITIT for its async method
//! 2. `CapabilityDyn` is the object-safe mirror with boxed futures, blanket-
//!    implemented for every `Capability`
//! 3. `BoxCapability` wraps `Box<dyn CapabilityDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::{Params, Variables};

// ---------------------------------------------------------------------------
// ActionOutput / CapabilityError
// ---------------------------------------------------------------------------

/// What an action produced.
///
/// `variable_updates` are applied to the workflow by the dispatch loop; an
/// action never writes workflow state itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    pub value: Value,
    pub variable_updates: Vec<(String, Value)>,
}

impl ActionOutput {
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            variable_updates: Vec::new(),
        }
    }

    pub fn with_update(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variable_updates.push((name.into(), value.into()));
        self
    }
}

/// Failure reported by a capability.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    /// The operation ran and failed.
    #[error("{0}")]
    Failed(String),

    /// The parameters can never succeed; retrying is pointless.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The collaborator is temporarily unreachable.
    #[error("capability unavailable: {0}")]
    Unavailable(String),
}

impl CapabilityError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CapabilityError::InvalidParams(_))
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// An external operation invoked by name with parameters.
///
/// Implementations must be safe to share across workers. Device access is
/// serialized by the engine, not by the capability.
pub trait Capability: Send + Sync {
    fn invoke(
        &self,
        params: &Params,
        variables: &Variables,
    ) -> impl Future<Output = Result<ActionOutput, CapabilityError>> + Send;
}

/// Object-safe version of [`Capability`] with boxed futures.
pub trait CapabilityDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        params: &'a Params,
        variables: &'a Variables,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutput, CapabilityError>> + Send + 'a>>;
}

impl<T: Capability> CapabilityDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        params: &'a Params,
        variables: &'a Variables,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutput, CapabilityError>> + Send + 'a>> {
        Box::pin(self.invoke(params, variables))
    }
}

/// Type-erased capability for storage in the registry.
pub struct BoxCapability {
    inner: Box<dyn CapabilityDyn>,
}

impl std::fmt::Debug for BoxCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCapability").finish_non_exhaustive()
    }
}

impl BoxCapability {
    pub fn new<T: Capability + 'static>(capability: T) -> Self {
        Self {
            inner: Box::new(capability),
        }
    }

    pub async fn invoke(
        &self,
        params: &Params,
        variables: &Variables,
    ) -> Result<ActionOutput, CapabilityError> {
        self.inner.invoke_boxed(params, variables).await
    }
}

// ---------------------------------------------------------------------------
// FnCapability
// ---------------------------------------------------------------------------

/// A capability backed by a closure over owned copies of its inputs.
pub struct FnCapability<F> {
    f: F,
}

/// Build a capability from `Fn(Params, Variables) -> Future`.
pub fn capability_fn<F, Fut>(f: F) -> FnCapability<F>
where
    F: Fn(Params, Variables) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionOutput, CapabilityError>> + Send,
{
    FnCapability { f }
}

impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(Params, Variables) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionOutput, CapabilityError>> + Send,
{
    fn invoke(
        &self,
        params: &Params,
        variables: &Variables,
    ) -> impl Future<Output = Result<ActionOutput, CapabilityError>> + Send {
        (self.f)(params.clone(), variables.clone())
    }
}
