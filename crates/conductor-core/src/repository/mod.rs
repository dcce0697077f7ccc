//! Storage ports.
//!
//! The engine persists workflow documents through [`workflow::WorkflowStore`];
//! conductor-infra provides the file-backed implementation.

pub mod workflow;
