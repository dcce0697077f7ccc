//! Shared domain types for Conductor.
//!
//! This crate contains the workflow document model (Workflow, Step, their
//! statuses and retry configuration) and the engine configuration shared by
//! every other crate.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod workflow;
