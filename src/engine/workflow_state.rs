//! Workflow instance state machine

use crate::engine::error::EngineError;
use crate::model::{now_millis, WorkflowInstance, WorkflowState};

fn transition(workflow: &mut WorkflowInstance, next: WorkflowState) -> Result<(), EngineError> {
    if !workflow.state.can_transition_to(next) {
        return Err(EngineError::invalid_transition("workflow", workflow.state, next));
    }
    workflow.state = next;
    if next.is_terminal() {
        workflow.end_time = Some(now_millis());
    }
    Ok(())
}

/// SUBMITTED → RUNNING
pub fn start(workflow: &mut WorkflowInstance) -> Result<(), EngineError> {
    transition(workflow, WorkflowState::Running)?;
    workflow.start_time = Some(now_millis());
    Ok(())
}

/// RUNNING → PAUSE, remembering the nodes whose tasks were cancelled
pub fn pause(workflow: &mut WorkflowInstance, cancelled_nodes: Vec<String>) -> Result<(), EngineError> {
    transition(workflow, WorkflowState::Pause)?;
    for node in cancelled_nodes {
        if !workflow.paused_nodes.contains(&node) {
            workflow.paused_nodes.push(node);
        }
    }
    Ok(())
}

/// PAUSE → RUNNING; returns the nodes to re-create
pub fn resume(workflow: &mut WorkflowInstance) -> Result<Vec<String>, EngineError> {
    transition(workflow, WorkflowState::Running)?;
    Ok(std::mem::take(&mut workflow.paused_nodes))
}

/// RUNNING → STOP; an operator stop of a paused instance is refused
pub fn stop(workflow: &mut WorkflowInstance) -> Result<(), EngineError> {
    if workflow.state != WorkflowState::Running {
        return Err(EngineError::invalid_transition("workflow", workflow.state, WorkflowState::Stop));
    }
    transition(workflow, WorkflowState::Stop)
}

/// RUNNING | PAUSE → STOP, for a sub-workflow whose parent gave up on it
pub fn abort(workflow: &mut WorkflowInstance) -> Result<(), EngineError> {
    transition(workflow, WorkflowState::Stop)?;
    workflow.paused_nodes.clear();
    Ok(())
}

/// RUNNING → SUCCESS | FAILURE
pub fn finish(workflow: &mut WorkflowInstance, outcome: WorkflowState) -> Result<(), EngineError> {
    match outcome {
        WorkflowState::Success | WorkflowState::Failure | WorkflowState::Stop => transition(workflow, outcome),
        other => Err(EngineError::invalid_transition("workflow", workflow.state, other)),
    }
}
