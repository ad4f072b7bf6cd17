//! Topology advancement
//!
//! Pure decisions over a DAG and the latest task instance of each node. The
//! event loop owns the instances and applies what these functions decide.

use crate::model::{DagGraph, Edge, EdgeCondition, JoinKind, TaskInstance, TaskState, WorkflowState};
use std::collections::HashMap;

/// Latest task instance per node code
pub type LatestTasks<'a> = HashMap<&'a str, &'a TaskInstance>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Some predecessor has not finished
    NotReady,
    /// Create a task instance and dispatch it
    Eligible,
    /// Create a task instance and skip it
    Skip,
}

fn edge_holds(edge: &Edge, upstream: &TaskInstance) -> bool {
    match &edge.condition {
        EdgeCondition::Success => upstream.state == TaskState::Success,
        EdgeCondition::Failure => upstream.state == TaskState::Failure,
        EdgeCondition::Always => upstream.state.is_terminal(),
        EdgeCondition::Branch(branch) => {
            upstream.state == TaskState::Success && upstream.branch.as_deref() == Some(branch.as_str())
        }
    }
}

/// Decide what to do with a node that has no task instance yet
pub fn evaluate(dag: &DagGraph, node: &str, latest: &LatestTasks<'_>) -> Readiness {
    let incoming = dag.incoming(node);
    if incoming.is_empty() {
        return Readiness::Eligible;
    }

    for predecessor in dag.predecessors(node) {
        match latest.get(predecessor) {
            Some(task) if task.state.is_terminal() => {}
            _ => return Readiness::NotReady,
        }
    }

    let mut and_holds = true;
    let mut or_seen = false;
    let mut or_holds = false;
    for edge in incoming {
        // All predecessors are present and terminal at this point
        let Some(upstream) = latest.get(edge.from.as_str()) else {
            return Readiness::NotReady;
        };
        let holds = edge_holds(edge, upstream);
        match edge.join {
            JoinKind::And => and_holds &= holds,
            JoinKind::Or => {
                or_seen = true;
                or_holds |= holds;
            }
        }
    }

    if and_holds && (!or_seen || or_holds) {
        Readiness::Eligible
    } else {
        Readiness::Skip
    }
}

/// Uninstantiated nodes that can be decided now, in topological order
pub fn decidable_nodes(dag: &DagGraph, latest: &LatestTasks<'_>) -> Vec<(String, Readiness)> {
    dag.topological_order()
        .iter()
        .filter(|code| !latest.contains_key(code.as_str()))
        .filter_map(|code| match evaluate(dag, code, latest) {
            Readiness::NotReady => None,
            readiness => Some((code.clone(), readiness)),
        })
        .collect()
}

/// Direct successors of `node` without a task instance
pub fn uninstantiated_successors<'a>(dag: &'a DagGraph, node: &str, latest: &LatestTasks<'_>) -> Vec<&'a str> {
    dag.successors(node)
        .iter()
        .map(String::as_str)
        .filter(|code| !latest.contains_key(code))
        .collect()
}

/// Whether the workflow has nothing left to run
///
/// `halted` is set once the `end` failure strategy stopped instantiation.
pub fn is_complete(dag: &DagGraph, latest: &LatestTasks<'_>, halted: bool) -> bool {
    if latest.values().any(|task| !task.state.is_terminal()) {
        return false;
    }
    halted || decidable_nodes(dag, latest).is_empty()
}

/// Worst outcome over the latest instances of all nodes
pub fn final_state(latest: &LatestTasks<'_>) -> WorkflowState {
    let failed = latest
        .values()
        .any(|task| matches!(task.state, TaskState::Failure | TaskState::Killed));
    if failed {
        WorkflowState::Failure
    } else {
        WorkflowState::Success
    }
}

/// Whether a terminal task trips the `end` failure strategy
pub fn is_failed_outcome(state: TaskState) -> bool {
    matches!(state, TaskState::Failure | TaskState::Killed)
}
