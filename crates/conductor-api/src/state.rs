//! Application state wiring the engine together.
//!
//! The engine is generic over its store; AppState pins it to the
//! file-backed store under the data directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use conductor_core::monitor::MonitorHandle;
use conductor_core::workflow::engine::WorkflowEngine;
use conductor_infra::config::load_engine_config;
use conductor_infra::filesystem::{resolve_data_dir, workflows_dir};
use conductor_infra::store::FileWorkflowStore;

use crate::demo;

/// Engine pinned to the infra store.
pub type Engine = WorkflowEngine<FileWorkflowStore>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize from the resolved data directory.
    pub async fn init() -> anyhow::Result<Self> {
        Self::at(&resolve_data_dir()).await
    }

    /// Initialize rooted at `data_dir`, creating it if needed.
    pub async fn at(data_dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(data_dir).await;
        let monitor = MonitorHandle::default();
        let registry = demo::registry(monitor.clone());
        let store = FileWorkflowStore::new(workflows_dir(data_dir));

        tracing::debug!(data_dir = %data_dir.display(), "engine initialized");
        Ok(Self {
            engine: Arc::new(WorkflowEngine::new(store, Arc::new(registry), monitor, config)),
            data_dir: data_dir.to_path_buf(),
        })
    }
}
