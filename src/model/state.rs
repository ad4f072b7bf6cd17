//! Lifecycle states of workflow and task instances

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one task instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Submitted,
    Dispatched,
    Running,
    Retry,
    Success,
    Failure,
    Killed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failure | TaskState::Killed | TaskState::Skipped
        )
    }

    /// Whether work for this task may be executing somewhere
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskState::Dispatched | TaskState::Running)
    }

    /// Legal edges of the task state machine
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Submitted, Dispatched | Running | Retry | Skipped | Killed | Failure) => true,
            (Dispatched, Running | Success | Failure | Retry | Killed) => true,
            (Running, Success | Failure | Retry | Killed) => true,
            (Retry, Submitted | Killed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Submitted => "SUBMITTED",
            TaskState::Dispatched => "DISPATCHED",
            TaskState::Running => "RUNNING",
            TaskState::Retry => "RETRY",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Killed => "KILLED",
            TaskState::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

/// State of one workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Submitted,
    Running,
    Pause,
    Success,
    Failure,
    Stop,
}

impl WorkflowState {
    /// Final states; PAUSE is not final because it can resume
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Success | WorkflowState::Failure | WorkflowState::Stop
        )
    }

    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, next),
            (Submitted, Running) | (Running, Success | Failure | Stop | Pause) | (Pause, Running | Stop)
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Submitted => "SUBMITTED",
            WorkflowState::Running => "RUNNING",
            WorkflowState::Pause => "PAUSE",
            WorkflowState::Success => "SUCCESS",
            WorkflowState::Failure => "FAILURE",
            WorkflowState::Stop => "STOP",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TASK_STATES: [TaskState; 8] = [
        TaskState::Submitted,
        TaskState::Dispatched,
        TaskState::Running,
        TaskState::Retry,
        TaskState::Success,
        TaskState::Failure,
        TaskState::Killed,
        TaskState::Skipped,
    ];

    #[test]
    fn test_terminal_task_states_have_no_exits() {
        for from in ALL_TASK_STATES.iter().filter(|s| s.is_terminal()) {
            for to in ALL_TASK_STATES {
                assert!(!from.can_transition_to(to), "{} -> {} must be illegal", from, to);
            }
        }
    }

    #[test]
    fn test_retry_loops_back_to_submitted_only() {
        assert!(TaskState::Running.can_transition_to(TaskState::Retry));
        assert!(TaskState::Retry.can_transition_to(TaskState::Submitted));
        assert!(!TaskState::Retry.can_transition_to(TaskState::Running));
        assert!(!TaskState::Retry.can_transition_to(TaskState::Success));
    }

    #[test]
    fn test_skip_only_from_submitted() {
        assert!(TaskState::Submitted.can_transition_to(TaskState::Skipped));
        assert!(!TaskState::Running.can_transition_to(TaskState::Skipped));
        assert!(!TaskState::Dispatched.can_transition_to(TaskState::Skipped));
    }

    #[test]
    fn test_workflow_transitions() {
        assert!(WorkflowState::Submitted.can_transition_to(WorkflowState::Running));
        assert!(!WorkflowState::Submitted.can_transition_to(WorkflowState::Pause));
        assert!(WorkflowState::Running.can_transition_to(WorkflowState::Pause));
        assert!(WorkflowState::Pause.can_transition_to(WorkflowState::Running));
        assert!(WorkflowState::Pause.can_transition_to(WorkflowState::Stop));
        assert!(!WorkflowState::Pause.can_transition_to(WorkflowState::Success));
        assert!(!WorkflowState::Success.can_transition_to(WorkflowState::Running));
        assert!(!WorkflowState::Stop.can_transition_to(WorkflowState::Running));
        assert!(!WorkflowState::Pause.is_terminal());
    }

    #[test]
    fn test_state_serializes_screaming_case() {
        assert_eq!(serde_json::to_string(&TaskState::Submitted).unwrap(), "\"SUBMITTED\"");
        assert_eq!(serde_json::to_string(&WorkflowState::Pause).unwrap(), "\"PAUSE\"");
    }
}
