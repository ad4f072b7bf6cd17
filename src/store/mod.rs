//! Metadata store
//!
//! Persisted workflow and task rows. A master writes every change before
//! acknowledging it, so a master taking over an instance can rebuild the
//! state machines from these rows alone.

pub mod file;
pub mod memory;

pub use file::FileMetadataStore;
pub use memory::InMemoryMetadataStore;

use crate::model::{TaskInstance, WorkflowInstance};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt row {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Failed to encode row: {0}")]
    Encode(String),
}

#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or replace a workflow row
    async fn save_workflow(&self, workflow: &WorkflowInstance) -> Result<(), StoreError>;

    /// Insert or replace a task row
    async fn save_task(&self, task: &TaskInstance) -> Result<(), StoreError>;

    async fn load_workflow(&self, workflow_instance_id: &str) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Task rows of one workflow, oldest first
    async fn load_tasks(&self, workflow_instance_id: &str) -> Result<Vec<TaskInstance>, StoreError>;

    /// Workflows not in a final state (PAUSE included)
    async fn list_unfinished_workflows(&self) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// Most recently submitted instance of a definition
    async fn latest_workflow_by_definition(
        &self,
        definition_code: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError>;
}

/// Order rows by submission, ties broken by id so the order is stable
pub(crate) fn sort_tasks(tasks: &mut [TaskInstance]) {
    tasks.sort_by(|a, b| a.submit_time.cmp(&b.submit_time).then_with(|| a.id.cmp(&b.id)));
}

pub(crate) fn latest_of<'a>(
    workflows: impl Iterator<Item = &'a WorkflowInstance>,
    definition_code: &str,
) -> Option<WorkflowInstance> {
    workflows
        .filter(|wf| wf.definition_code == definition_code)
        .max_by(|a, b| a.submit_time.cmp(&b.submit_time).then_with(|| a.id.cmp(&b.id)))
        .cloned()
}
