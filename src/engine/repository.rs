//! In-memory directory of the workflow instances this master owns
//!
//! Entries are inserted when a loop is spawned and removed when it finalizes
//! or loses ownership. Everything else reads snapshots.

use crate::engine::event::LifecycleEvent;
use crate::model::{TaskInstance, WorkflowInstance};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

/// Point-in-time copy of one instance's rows
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSnapshot {
    pub workflow: WorkflowInstance,
    /// All task instances, oldest first
    pub tasks: Vec<TaskInstance>,
}

impl InstanceSnapshot {
    /// Latest task instance of a node
    pub fn latest(&self, node_code: &str) -> Option<&TaskInstance> {
        self.tasks.iter().rev().find(|task| task.node_code == node_code)
    }

    pub fn task(&self, task_instance_id: &str) -> Option<&TaskInstance> {
        self.tasks.iter().find(|task| task.id == task_instance_id)
    }
}

#[derive(Clone)]
pub struct WorkflowHandle {
    events: mpsc::UnboundedSender<LifecycleEvent>,
    snapshot: watch::Receiver<InstanceSnapshot>,
}

impl WorkflowHandle {
    pub fn new(
        events: mpsc::UnboundedSender<LifecycleEvent>,
        snapshot: watch::Receiver<InstanceSnapshot>,
    ) -> Self {
        Self { events, snapshot }
    }

    /// Enqueue an event; hands it back if the loop has exited
    pub fn send(&self, event: LifecycleEvent) -> Result<(), LifecycleEvent> {
        self.events.send(event).map_err(|e| e.0)
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        self.snapshot.borrow().clone()
    }
}

#[derive(Clone, Default)]
pub struct WorkflowRepository {
    instances: Arc<RwLock<HashMap<String, WorkflowHandle>>>,
}

impl WorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle; false if the instance is already present
    pub async fn insert(&self, workflow_instance_id: &str, handle: WorkflowHandle) -> bool {
        let mut instances = self.instances.write().await;
        if instances.contains_key(workflow_instance_id) {
            return false;
        }
        instances.insert(workflow_instance_id.to_string(), handle);
        true
    }

    pub async fn remove(&self, workflow_instance_id: &str) {
        self.instances.write().await.remove(workflow_instance_id);
    }

    pub async fn get(&self, workflow_instance_id: &str) -> Option<WorkflowHandle> {
        self.instances.read().await.get(workflow_instance_id).cloned()
    }

    pub async fn contains(&self, workflow_instance_id: &str) -> bool {
        self.instances.read().await.contains_key(workflow_instance_id)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.instances.read().await.keys().cloned().collect()
    }

    pub async fn handles(&self) -> Vec<WorkflowHandle> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }
}
