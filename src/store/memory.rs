//! In-memory metadata store, shared between masters in tests

use super::{latest_of, sort_tasks, MetadataStore, StoreError};
use crate::model::{TaskInstance, WorkflowInstance};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Rows {
    workflows: HashMap<String, WorkflowInstance>,
    /// workflow id → task id → row
    tasks: HashMap<String, HashMap<String, TaskInstance>>,
}

#[derive(Clone, Default)]
pub struct InMemoryMetadataStore {
    rows: Arc<RwLock<Rows>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of task rows saved for a workflow
    pub async fn task_count(&self, workflow_instance_id: &str) -> usize {
        self.rows
            .read()
            .await
            .tasks
            .get(workflow_instance_id)
            .map(|tasks| tasks.len())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn save_workflow(&self, workflow: &WorkflowInstance) -> Result<(), StoreError> {
        self.rows
            .write()
            .await
            .workflows
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn save_task(&self, task: &TaskInstance) -> Result<(), StoreError> {
        self.rows
            .write()
            .await
            .tasks
            .entry(task.workflow_instance_id.clone())
            .or_default()
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_workflow(&self, workflow_instance_id: &str) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.rows.read().await.workflows.get(workflow_instance_id).cloned())
    }

    async fn load_tasks(&self, workflow_instance_id: &str) -> Result<Vec<TaskInstance>, StoreError> {
        let mut tasks: Vec<TaskInstance> = self
            .rows
            .read()
            .await
            .tasks
            .get(workflow_instance_id)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default();
        sort_tasks(&mut tasks);
        Ok(tasks)
    }

    async fn list_unfinished_workflows(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .workflows
            .values()
            .filter(|wf| !wf.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn latest_workflow_by_definition(
        &self,
        definition_code: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(latest_of(self.rows.read().await.workflows.values(), definition_code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskType, WorkflowState};

    #[tokio::test]
    async fn test_save_replaces_rows() {
        let store = InMemoryMetadataStore::new();
        let mut wf = WorkflowInstance::new("etl", 1, HashMap::new());
        store.save_workflow(&wf).await.unwrap();

        wf.state = WorkflowState::Running;
        store.save_workflow(&wf).await.unwrap();
        assert_eq!(
            store.load_workflow(&wf.id).await.unwrap().unwrap().state,
            WorkflowState::Running
        );

        let task = TaskInstance::new(&wf.id, "a", TaskType::shell());
        store.save_task(&task).await.unwrap();
        store.save_task(&task).await.unwrap();
        assert_eq!(store.task_count(&wf.id).await, 1);
    }

    #[tokio::test]
    async fn test_unfinished_and_latest() {
        let store = InMemoryMetadataStore::new();
        let mut done = WorkflowInstance::new("etl", 1, HashMap::new());
        done.state = WorkflowState::Success;
        done.submit_time = 10;
        let mut paused = WorkflowInstance::new("etl", 1, HashMap::new());
        paused.state = WorkflowState::Pause;
        paused.submit_time = 20;
        store.save_workflow(&done).await.unwrap();
        store.save_workflow(&paused).await.unwrap();

        let unfinished = store.list_unfinished_workflows().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, paused.id);

        let latest = store.latest_workflow_by_definition("etl").await.unwrap().unwrap();
        assert_eq!(latest.id, paused.id);
        assert!(store.latest_workflow_by_definition("other").await.unwrap().is_none());
    }
}
