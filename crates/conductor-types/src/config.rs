//! Engine configuration types for Conductor.
//!
//! `EngineConfig` represents the top-level `config.toml` that tunes the
//! workflow-level circuit breaker, step timeouts, and the retry policy
//! applied to steps that do not declare their own.

use serde::{Deserialize, Serialize};

use crate::workflow::{RetryConfig, DEFAULT_STEP_TIMEOUT_SECS};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.conductor/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consecutive step failures before a workflow's breaker opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// Seconds an open breaker waits before letting a probe through.
    #[serde(default = "default_circuit_recovery_timeout_secs")]
    pub circuit_recovery_timeout_secs: u64,

    /// Calls allowed through while half-open.
    #[serde(default = "default_circuit_half_open_budget")]
    pub circuit_half_open_budget: u32,

    /// Timeout applied by document defaults, in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// When false, step timeouts are recorded but not enforced.
    #[serde(default = "default_true")]
    pub enforce_step_timeouts: bool,

    /// Retry policy for steps created programmatically without one.
    #[serde(default)]
    pub default_retry: RetryConfig,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_recovery_timeout_secs() -> u64 {
    60
}

fn default_circuit_half_open_budget() -> u32 {
    1
}

fn default_step_timeout_secs() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_recovery_timeout_secs: default_circuit_recovery_timeout_secs(),
            circuit_half_open_budget: default_circuit_half_open_budget(),
            default_step_timeout_secs: default_step_timeout_secs(),
            enforce_step_timeouts: default_true(),
            default_retry: RetryConfig::default(),
        }
    }
}
