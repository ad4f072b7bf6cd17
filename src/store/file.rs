use std::path::{Path, PathBuf};

use tokio::fs;

use super::{latest_of, sort_tasks, MetadataStore, StoreError};
use crate::model::{TaskInstance, WorkflowInstance};

/// Filesystem-based metadata store.
///
/// Rows are stored as JSON documents:
/// ```text
/// {root}/
/// └── <workflow instance id>/
///     ├── workflow.json
///     └── tasks/
///         └── <task instance id>.json
/// ```
/// Every write goes to a temporary file first and is renamed into place.
pub struct FileMetadataStore {
    root: PathBuf,
}

impl FileMetadataStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workflow_dir(&self, workflow_instance_id: &str) -> PathBuf {
        self.root.join(workflow_instance_id)
    }

    async fn write_json<T: serde::Serialize>(path: &Path, row: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(row).map_err(|e| StoreError::Encode(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    async fn all_workflows(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut workflows = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(workflow) = Self::read_json::<WorkflowInstance>(&path.join("workflow.json")).await? {
                workflows.push(workflow);
            }
        }
        Ok(workflows)
    }
}

#[async_trait::async_trait]
impl MetadataStore for FileMetadataStore {
    async fn save_workflow(&self, workflow: &WorkflowInstance) -> Result<(), StoreError> {
        let dir = self.workflow_dir(&workflow.id);
        fs::create_dir_all(dir.join("tasks")).await?;
        Self::write_json(&dir.join("workflow.json"), workflow).await
    }

    async fn save_task(&self, task: &TaskInstance) -> Result<(), StoreError> {
        let dir = self.workflow_dir(&task.workflow_instance_id).join("tasks");
        fs::create_dir_all(&dir).await?;
        Self::write_json(&dir.join(format!("{}.json", task.id)), task).await
    }

    async fn load_workflow(&self, workflow_instance_id: &str) -> Result<Option<WorkflowInstance>, StoreError> {
        Self::read_json(&self.workflow_dir(workflow_instance_id).join("workflow.json")).await
    }

    async fn load_tasks(&self, workflow_instance_id: &str) -> Result<Vec<TaskInstance>, StoreError> {
        let dir = self.workflow_dir(workflow_instance_id).join("tasks");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(task) = Self::read_json::<TaskInstance>(&path).await? {
                tasks.push(task);
            }
        }
        sort_tasks(&mut tasks);
        Ok(tasks)
    }

    async fn list_unfinished_workflows(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
        Ok(self
            .all_workflows()
            .await?
            .into_iter()
            .filter(|wf| !wf.state.is_terminal())
            .collect())
    }

    async fn latest_workflow_by_definition(
        &self,
        definition_code: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let workflows = self.all_workflows().await?;
        Ok(latest_of(workflows.iter(), definition_code))
    }
}
