//! dagrun: distributed DAG workflow execution
//!
//! Masters own workflow instances through registry locks and drive each one
//! from a single event loop. Workers execute remote tasks on a bounded pool
//! and report back with at-least-once delivery.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod event_bus;
pub mod logging;
pub mod model;
pub mod node;
pub mod registry;
pub mod store;
pub mod transport;
pub mod worker;

pub use config::{CoordinatorConfig, MasterConfig, WorkerConfig};
pub use engine::{EngineError, EngineEvent, MasterRuntime};
pub use model::{
    Edge, FailureStrategy, RetryPolicy, TaskDefinition, TaskState, TaskType, WorkflowDefinition, WorkflowState,
};
pub use node::{MasterNode, NodeError, WorkerNode};
pub use worker::{TaskExecutorRegistry, WorkerRuntime};
