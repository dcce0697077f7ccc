//! File-backed workflow store.
//!
//! Layout under the root directory:
//!
//! ```text
//! active/{id}.yaml       pending, running, paused
//! completed/{id}.yaml
//! failed/{id}.yaml       failed, cancelled
//! ```
//!
//! Writes go to a temporary file that is renamed into place, so a crash never
//! leaves a truncated document behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use conductor_core::repository::workflow::{StoreLocation, WorkflowStore};
use conductor_types::error::StoreError;
use conductor_types::workflow::{Workflow, WorkflowStatus};
use uuid::Uuid;

const EXTENSION: &str = "yaml";

fn io_error(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {err}", path.display()))
}

/// Stores one YAML document per workflow on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileWorkflowStore {
    root: PathBuf,
}

impl FileWorkflowStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/{location}/{id}.yaml`.
    pub fn document_path(&self, location: StoreLocation, id: &Uuid) -> PathBuf {
        self.root
            .join(location.dir_name())
            .join(format!("{id}.{EXTENSION}"))
    }

    /// Location currently holding `id`, if any.
    pub async fn location_of(&self, id: &Uuid) -> Option<StoreLocation> {
        for location in StoreLocation::ALL {
            if tokio::fs::try_exists(self.document_path(location, id))
                .await
                .unwrap_or(false)
            {
                return Some(location);
            }
        }
        None
    }

    async fn read_document(path: &Path) -> Result<Option<Workflow>, StoreError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(Workflow::from_yaml(&content)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }

    async fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error(path, err)),
        }
    }
}

impl WorkflowStore for FileWorkflowStore {
    async fn save(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let target = StoreLocation::for_status(workflow.status);
        let path = self.document_path(target, &workflow.id);
        let content = workflow.to_yaml()?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;

        for stale in StoreLocation::ALL.into_iter().filter(|l| *l != target) {
            if Self::remove_if_exists(&self.document_path(stale, &workflow.id)).await? {
                tracing::debug!(
                    workflow_id = %workflow.id,
                    from = stale.dir_name(),
                    to = target.dir_name(),
                    "moved workflow document"
                );
            }
        }
        Ok(())
    }

    async fn load(&self, id: &Uuid) -> Result<Option<Workflow>, StoreError> {
        for location in StoreLocation::ALL {
            if let Some(workflow) = Self::read_document(&self.document_path(location, id)).await? {
                return Ok(Some(workflow));
            }
        }
        Ok(None)
    }

    async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>, StoreError> {
        let mut workflows = Vec::new();

        for location in StoreLocation::ALL {
            if let Some(status) = status {
                if StoreLocation::for_status(status) != location {
                    continue;
                }
            }
            let dir = self.root.join(location.dir_name());
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(io_error(&dir, err)),
            };

            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                    continue;
                }
                match Self::read_document(&path).await {
                    Ok(Some(workflow)) => workflows.push(workflow),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "skipping unreadable workflow document");
                    }
                }
            }
        }

        if let Some(status) = status {
            workflows.retain(|w| w.status == status);
        }
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workflows)
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, StoreError> {
        let mut deleted = false;
        for location in StoreLocation::ALL {
            deleted |= Self::remove_if_exists(&self.document_path(location, id)).await?;
        }
        Ok(deleted)
    }
}
