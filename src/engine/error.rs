//! Errors raised by the master-side engine

use crate::model::DefinitionError;
use crate::registry::RegistryError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid {entity} transition {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Master {host} does not own workflow instance {workflow_instance_id}")]
    NotOwner {
        workflow_instance_id: String,
        host: String,
    },

    #[error("Workflow instance {0} not found")]
    WorkflowNotFound(String),

    #[error("Task instance {0} not found")]
    TaskNotFound(String),

    #[error("Definition {code} v{version} is already registered with different content")]
    DefinitionConflict { code: String, version: u32 },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Workflow instance {0} did not finish in time")]
    Timeout(String),

    #[error("Workflow loop for {0} has stopped")]
    LoopClosed(String),

    #[error("Master is shut down")]
    ShutDown,
}

impl EngineError {
    pub fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        EngineError::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
