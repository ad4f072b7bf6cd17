//! Task dispatch
//!
//! Routes a runnable task either to an in-master logic executor or to a
//! remote worker chosen by the host manager and a selection policy.

pub mod dispatcher;
pub mod expression;
pub mod host_manager;
pub mod logic;
pub mod selector;

pub use dispatcher::{DispatchOutcome, TaskDispatcher, TaskKind};
pub use host_manager::{HostManager, WorkerHeartbeat, WorkerHost};
pub use logic::{
    ChildLauncher, LogicContext, LogicOutcome, LogicTaskExecutor, LogicTaskRegistry,
};
pub use selector::{selector_for, HostSelector, LowestLoadSelector, RoundRobinSelector};

use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No live worker serves group {group}")]
    NoSuitableWorker { group: String },

    #[error("Dispatch failed after {attempts} attempts: {last_error}")]
    SendFailed { attempts: u32, last_error: String },

    #[error("Worker {host} is busy")]
    Busy { host: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Failure of a task executor itself, as opposed to a failed task
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid params for {task_type}: {reason}")]
    InvalidParams { task_type: String, reason: String },

    #[error("Failed to spawn task process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to launch sub-workflow: {0}")]
    Launch(String),
}

impl ExecutorError {
    pub fn invalid_params(task_type: &str, reason: impl std::fmt::Display) -> Self {
        ExecutorError::InvalidParams {
            task_type: task_type.to_string(),
            reason: reason.to_string(),
        }
    }
}
