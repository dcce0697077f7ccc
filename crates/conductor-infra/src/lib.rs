//! Infrastructure layer for Conductor.
//!
//! Contains the filesystem implementation of the `WorkflowStore` trait from
//! `conductor-core`, the `config.toml` loader, and data directory resolution.

pub mod config;
pub mod filesystem;
pub mod store;
