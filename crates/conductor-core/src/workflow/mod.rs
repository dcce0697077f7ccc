//! Workflow execution: condition evaluation, interpolation, step running, and
//! the engine that drives a workflow to a terminal status.
//!
//! - `expression` -- restricted evaluator for step conditions
//! - `context` -- `${name}` interpolation of step parameters
//! - `step_runner` -- one step end-to-end under timeout, breaker and retry
//! - `engine` -- dispatch loop, persistence, concurrency, hooks

pub mod context;
pub mod engine;
pub mod expression;
pub mod step_runner;
