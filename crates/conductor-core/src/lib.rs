//! Workflow orchestration core for Conductor.
//!
//! This crate owns the resilience layer (retry with backoff, circuit breaker),
//! the action registry that maps step actions onto capabilities supplied by
//! external collaborators, and the engine that drives a workflow's steps to a
//! terminal status. It depends only on `conductor-types` -- never on
//! `conductor-infra` or any filesystem-backed store.

pub mod action;
pub mod monitor;
pub mod repository;
pub mod resilience;
pub mod task;
pub mod workflow;
