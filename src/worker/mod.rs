//! Worker side: execution runtime, task executors and reliable delivery

pub mod delivery;
pub mod executor;
pub mod inflight;
pub mod pool;
pub mod runtime;
pub mod shell;

pub use delivery::{DeliveryTarget, ReliableEventSender};
pub use executor::{
    ExecutionContext, ExecutionResult, TaskExecutor, TaskExecutorFactory, TaskExecutorRegistry,
};
pub use inflight::{InflightEntry, InflightStore};
pub use pool::{DedupCache, WorkerPool};
pub use runtime::{WorkerMessageHandler, WorkerRuntime};
pub use shell::{ShellTaskExecutor, ShellTaskFactory};
