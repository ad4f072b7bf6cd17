//! Task-type plugins executed on workers

use crate::dispatch::ExecutorError;
use crate::model::TaskType;
use crate::transport::{DispatchRequest, TaskOutcome};
use crate::worker::shell::ShellTaskFactory;
use slog::Logger;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ExecutionContext {
    pub request: DispatchRequest,
    pub worker_host: String,
    pub logger: Logger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub outcome: TaskOutcome,
    pub output_vars: HashMap<String, String>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

impl ExecutionResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Failure,
            output_vars: HashMap::new(),
            exit_code: None,
            message: Some(message.into()),
        }
    }

    pub fn killed() -> Self {
        Self {
            outcome: TaskOutcome::Killed,
            output_vars: HashMap::new(),
            exit_code: None,
            message: Some("killed".to_string()),
        }
    }
}

/// One execution of one attempt
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError>;

    /// Request termination; `execute` returns `Killed` once honoured
    fn kill(&self);
}

pub trait TaskExecutorFactory: Send + Sync {
    fn create(&self, request: &DispatchRequest) -> Result<Arc<dyn TaskExecutor>, ExecutorError>;
}

/// Lookup table of executor factories by type tag
pub struct TaskExecutorRegistry {
    factories: HashMap<String, Arc<dyn TaskExecutorFactory>>,
}

impl TaskExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the shell executor
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(TaskType::SHELL, Arc::new(ShellTaskFactory));
        registry
    }

    pub fn register(&mut self, tag: &str, factory: Arc<dyn TaskExecutorFactory>) {
        self.factories.insert(TaskType::new(tag).as_str().to_string(), factory);
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.factories.contains_key(task_type.as_str())
    }

    /// `None` when no factory is registered for the request's type
    pub fn create(&self, request: &DispatchRequest) -> Option<Result<Arc<dyn TaskExecutor>, ExecutorError>> {
        self.factories
            .get(request.task_type.as_str())
            .map(|factory| factory.create(request))
    }
}

impl Default for TaskExecutorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
