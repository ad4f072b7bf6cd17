//! Master-side engine
//!
//! State machines, topology advancement and the per-instance event loop,
//! assembled by `MasterRuntime`.

pub mod catalog;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod master;
pub mod ownership;
pub mod repository;
pub mod task_state;
pub mod topology;
pub mod workflow_state;

pub use catalog::DefinitionCatalog;
pub use error::EngineError;
pub use event::{AckHandle, ControlReply, EngineEvent, LifecycleEvent};
pub use master::{MasterMessageHandler, MasterRuntime, Route};
pub use ownership::WorkflowOwnership;
pub use repository::{InstanceSnapshot, WorkflowHandle, WorkflowRepository};
