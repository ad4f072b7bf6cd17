//! Validated DAG view of a workflow definition
//!
//! Rules enforced before an instance is created:
//! 1. At least one task, unique task codes.
//! 2. Every edge references existing tasks and is not a self-loop.
//! 3. Branch conditions only leave CONDITIONS/SWITCH tasks.
//! 4. The graph is acyclic (Kahn's algorithm must visit every node).

use crate::model::definition::{Edge, EdgeCondition, TaskDefinition, WorkflowDefinition};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Workflow {code} has no tasks")]
    EmptyWorkflow { code: String },

    #[error("Task code {0} is defined more than once")]
    DuplicateTaskCode(String),

    #[error("Edge {side} endpoint references unknown task {code}")]
    UnknownTaskReference { code: String, side: &'static str },

    #[error("Task {0} has an edge to itself")]
    SelfLoop(String),

    #[error("Edge {from} -> {to} has a branch condition but {from} is not a branching task")]
    InvalidBranchEdge { from: String, to: String },

    #[error("Workflow contains a cycle through tasks {0:?}")]
    CycleDetected(Vec<String>),

    #[error("Workflow definition {code} v{version} not found")]
    NotFound { code: String, version: u32 },
}

/// DAG built from a validated definition
#[derive(Debug, Clone)]
pub struct DagGraph {
    definition: Arc<WorkflowDefinition>,
    index: HashMap<String, usize>,
    incoming: HashMap<String, Vec<Edge>>,
    successors: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl DagGraph {
    /// Validate `definition` and build its graph
    pub fn build(definition: Arc<WorkflowDefinition>) -> Result<Self, DefinitionError> {
        if definition.tasks.is_empty() {
            return Err(DefinitionError::EmptyWorkflow {
                code: definition.code.clone(),
            });
        }

        let mut index = HashMap::new();
        for (i, task) in definition.tasks.iter().enumerate() {
            if index.insert(task.code.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateTaskCode(task.code.clone()));
            }
        }

        let mut incoming: HashMap<String, Vec<Edge>> = HashMap::new();
        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for task in &definition.tasks {
            incoming.entry(task.code.clone()).or_default();
            successors.entry(task.code.clone()).or_default();
            in_degree.insert(task.code.as_str(), 0);
        }

        let mut seen_edges = HashSet::new();
        for edge in &definition.edges {
            let Some(&from_idx) = index.get(&edge.from) else {
                return Err(DefinitionError::UnknownTaskReference {
                    code: edge.from.clone(),
                    side: "from",
                });
            };
            if !index.contains_key(&edge.to) {
                return Err(DefinitionError::UnknownTaskReference {
                    code: edge.to.clone(),
                    side: "to",
                });
            }
            if edge.from == edge.to {
                return Err(DefinitionError::SelfLoop(edge.from.clone()));
            }
            if matches!(edge.condition, EdgeCondition::Branch(_))
                && !definition.tasks[from_idx].task_type.is_branching()
            {
                return Err(DefinitionError::InvalidBranchEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }

            if let Some(list) = incoming.get_mut(&edge.to) {
                list.push(edge.clone());
            }
            if seen_edges.insert((edge.from.as_str(), edge.to.as_str())) {
                if let Some(list) = successors.get_mut(&edge.from) {
                    list.push(edge.to.clone());
                }
                if let Some(degree) = in_degree.get_mut(edge.to.as_str()) {
                    *degree += 1;
                }
            }
        }

        // Kahn's algorithm, seeded in definition order so the result is stable
        let mut queue: VecDeque<&str> = definition
            .tasks
            .iter()
            .map(|t| t.code.as_str())
            .filter(|code| in_degree.get(code) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(definition.tasks.len());
        while let Some(code) = queue.pop_front() {
            order.push(code.to_string());
            for next in successors.get(code).map(Vec::as_slice).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(next.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next.as_str());
                    }
                }
            }
        }

        if order.len() != definition.tasks.len() {
            let visited: HashSet<&String> = order.iter().collect();
            let mut involved: Vec<String> = definition
                .tasks
                .iter()
                .map(|t| t.code.clone())
                .filter(|code| !visited.contains(code))
                .collect();
            involved.sort();
            return Err(DefinitionError::CycleDetected(involved));
        }

        Ok(Self {
            definition,
            index,
            incoming,
            successors,
            order,
        })
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn task(&self, code: &str) -> Option<&TaskDefinition> {
        self.index.get(code).map(|&i| &self.definition.tasks[i])
    }

    pub fn contains(&self, code: &str) -> bool {
        self.index.contains_key(code)
    }

    /// Nodes without incoming edges, in definition order
    pub fn roots(&self) -> Vec<&str> {
        self.definition
            .tasks
            .iter()
            .map(|t| t.code.as_str())
            .filter(|code| self.incoming.get(*code).map_or(true, Vec::is_empty))
            .collect()
    }

    pub fn incoming(&self, code: &str) -> &[Edge] {
        self.incoming.get(code).map(Vec::as_slice).unwrap_or_default()
    }

    /// Distinct upstream node codes
    pub fn predecessors(&self, code: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.incoming(code)
            .iter()
            .map(|e| e.from.as_str())
            .filter(|from| seen.insert(*from))
            .collect()
    }

    pub fn successors(&self, code: &str) -> &[String] {
        self.successors.get(code).map(Vec::as_slice).unwrap_or_default()
    }

    /// Topological order of all nodes
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
