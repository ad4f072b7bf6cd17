//! Data model shared by master, worker and store

pub mod dag;
pub mod definition;
pub mod instance;
pub mod state;

pub use dag::{DagGraph, DefinitionError};
pub use definition::{
    Backoff, Edge, EdgeCondition, FailureStrategy, JoinKind, RetryPolicy, TaskDefinition, TaskType,
    WorkflowDefinition,
};
pub use instance::{now_millis, ParentLink, TaskInstance, WorkflowInstance};
pub use state::{TaskState, WorkflowState};
