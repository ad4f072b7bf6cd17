//! Runtime instances of workflows and tasks
//!
//! These are also the persisted rows: everything the engine needs to rebuild
//! its in-memory state machines after a master restart lives here.

use crate::model::definition::TaskType;
use crate::model::state::{TaskState, WorkflowState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Link from a child workflow instance to the SUB_WORKFLOW task that started it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub workflow_instance_id: String,
    pub task_instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub definition_code: String,
    pub definition_version: u32,
    pub state: WorkflowState,
    /// Master currently owning this instance
    pub host: Option<String>,
    pub submit_time: u64,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    /// Variable pool: global params plus outputs of finished tasks
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub parent: Option<ParentLink>,
    /// Node codes cancelled by a pause, re-created on resume
    #[serde(default)]
    pub paused_nodes: Vec<String>,
}

impl WorkflowInstance {
    pub fn new(definition_code: &str, definition_version: u32, variables: HashMap<String, String>) -> Self {
        Self {
            id: new_instance_id(),
            definition_code: definition_code.to_string(),
            definition_version,
            state: WorkflowState::Submitted,
            host: None,
            submit_time: now_millis(),
            start_time: None,
            end_time: None,
            variables,
            parent: None,
            paused_nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: String,
    pub workflow_instance_id: String,
    pub node_code: String,
    pub task_type: TaskType,
    pub state: TaskState,
    /// Every state this instance has been in, oldest first
    pub history: Vec<TaskState>,
    /// Worker executing the current attempt; `None` for logic tasks
    pub host: Option<String>,
    pub retry_count: u32,
    /// Branch chosen by a CONDITIONS/SWITCH task
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub output_vars: HashMap<String, String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Child instance started by a SUB_WORKFLOW task
    #[serde(default)]
    pub sub_workflow_instance_id: Option<String>,
    pub submit_time: u64,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
}

impl TaskInstance {
    pub fn new(workflow_instance_id: &str, node_code: &str, task_type: TaskType) -> Self {
        Self {
            id: new_instance_id(),
            workflow_instance_id: workflow_instance_id.to_string(),
            node_code: node_code.to_string(),
            task_type,
            state: TaskState::Submitted,
            history: vec![TaskState::Submitted],
            host: None,
            retry_count: 0,
            branch: None,
            output_vars: HashMap::new(),
            message: None,
            sub_workflow_instance_id: None,
            submit_time: now_millis(),
            start_time: None,
            end_time: None,
        }
    }

    /// 1-based attempt number of the current execution
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_instance_starts_submitted() {
        let task = TaskInstance::new("wf-1", "extract", TaskType::shell());
        assert_eq!(task.state, TaskState::Submitted);
        assert_eq!(task.history, vec![TaskState::Submitted]);
        assert_eq!(task.attempt(), 1);
        assert!(task.host.is_none());
    }

    #[test]
    fn test_workflow_instance_row_roundtrips_through_json() {
        let mut vars = HashMap::new();
        vars.insert("date".to_string(), "2024-01-01".to_string());
        let wf = WorkflowInstance::new("etl", 3, vars);
        let json = serde_json::to_string(&wf).unwrap();
        let back: WorkflowInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wf);
        assert_eq!(back.state, WorkflowState::Submitted);
    }
}
