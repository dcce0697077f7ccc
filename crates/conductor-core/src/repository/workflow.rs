//! Workflow store trait definition.
//!
//! One document per workflow, kept in exactly one of three locations
//! (`active`, `completed`, `failed`) chosen by its status. Saving a workflow
//! whose status moved it to another location removes the stale copy.

use std::collections::HashMap;

use conductor_types::error::StoreError;
use conductor_types::workflow::{Workflow, WorkflowStatus};
use tokio::sync::RwLock;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StoreLocation
// ---------------------------------------------------------------------------

/// Logical location of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreLocation {
    Active,
    Completed,
    Failed,
}

impl StoreLocation {
    pub const ALL: [StoreLocation; 3] = [
        StoreLocation::Active,
        StoreLocation::Completed,
        StoreLocation::Failed,
    ];

    /// Cancelled workflows are filed with failed ones.
    pub fn for_status(status: WorkflowStatus) -> Self {
        match status {
            WorkflowStatus::Completed => StoreLocation::Completed,
            WorkflowStatus::Failed | WorkflowStatus::Cancelled => StoreLocation::Failed,
            WorkflowStatus::Pending | WorkflowStatus::Running | WorkflowStatus::Paused => {
                StoreLocation::Active
            }
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            StoreLocation::Active => "active",
            StoreLocation::Completed => "completed",
            StoreLocation::Failed => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

/// Durable storage for workflow documents.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    /// Write the document into the location matching its status.
    fn save(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Load a workflow by id from whichever location holds it.
    fn load(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, StoreError>> + Send;

    /// List workflows, newest `created_at` first, optionally filtered by status.
    fn list(
        &self,
        status: Option<WorkflowStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, StoreError>> + Send;

    /// Delete a workflow from every location. Returns `true` if it existed.
    fn delete(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// InMemoryWorkflowStore
// ---------------------------------------------------------------------------

/// Volatile store for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    documents: RwLock<HashMap<Uuid, (StoreLocation, Workflow)>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where a workflow is currently filed.
    pub async fn location_of(&self, id: &Uuid) -> Option<StoreLocation> {
        self.documents.read().await.get(id).map(|(loc, _)| *loc)
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    async fn save(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let location = StoreLocation::for_status(workflow.status);
        self.documents
            .write()
            .await
            .insert(workflow.id, (location, workflow.clone()));
        Ok(())
    }

    async fn load(&self, id: &Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.documents.read().await.get(id).map(|(_, wf)| wf.clone()))
    }

    async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>, StoreError> {
        let mut workflows: Vec<Workflow> = self
            .documents
            .read()
            .await
            .values()
            .filter(|(_, wf)| status.is_none_or(|s| wf.status == s))
            .map(|(_, wf)| wf.clone())
            .collect();
        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(workflows)
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, StoreError> {
        Ok(self.documents.write().await.remove(id).is_some())
    }
}
