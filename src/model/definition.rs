//! Workflow and task definitions (immutable DAG templates)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Type tag of a task node
///
/// The tag is looked up in the executor tables: a tag with a registered logic
/// executor runs inside the master, every other tag is dispatched to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TaskType(String);

impl From<String> for TaskType {
    fn from(tag: String) -> Self {
        Self::new(tag)
    }
}

impl From<TaskType> for String {
    fn from(task_type: TaskType) -> Self {
        task_type.0
    }
}

impl TaskType {
    pub const SHELL: &'static str = "SHELL";
    pub const CONDITIONS: &'static str = "CONDITIONS";
    pub const SWITCH: &'static str = "SWITCH";
    pub const DEPENDENT: &'static str = "DEPENDENT";
    pub const SUB_WORKFLOW: &'static str = "SUB_WORKFLOW";
    pub const BLOCKING: &'static str = "BLOCKING";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into().to_ascii_uppercase())
    }

    pub fn shell() -> Self {
        Self::new(Self::SHELL)
    }

    pub fn conditions() -> Self {
        Self::new(Self::CONDITIONS)
    }

    pub fn switch() -> Self {
        Self::new(Self::SWITCH)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Types whose outgoing edges may carry branch conditions
    pub fn is_branching(&self) -> bool {
        self.0 == Self::CONDITIONS || self.0 == Self::SWITCH
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Interval growth between retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Exponential { multiplier: f64, max_interval_ms: u64 },
}

/// Retry policy of a task definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Base delay before a retry
    pub interval_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            interval_ms: 1000,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn fixed(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval_ms: interval.as_millis() as u64,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_retries: u32, interval: Duration, multiplier: f64, max_interval: Duration) -> Self {
        Self {
            max_retries,
            interval_ms: interval.as_millis() as u64,
            backoff: Backoff::Exponential {
                multiplier,
                max_interval_ms: max_interval.as_millis() as u64,
            },
        }
    }

    /// Whether another attempt is allowed after `retry_count` retries
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before retry number `retry_number` (1-based)
    pub fn delay_for(&self, retry_number: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed => Duration::from_millis(self.interval_ms),
            Backoff::Exponential {
                multiplier,
                max_interval_ms,
            } => {
                let exponent = retry_number.saturating_sub(1) as i32;
                let delay = self.interval_ms as f64 * multiplier.powi(exponent);
                let capped = delay.min(*max_interval_ms as f64).max(0.0);
                Duration::from_millis(capped as u64)
            }
        }
    }
}

/// Static description of one DAG node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub code: String,
    #[serde(default)]
    pub name: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_worker_group")]
    pub worker_group: String,
}

pub fn default_worker_group() -> String {
    "default".to_string()
}

impl TaskDefinition {
    pub fn new(code: impl Into<String>, task_type: TaskType) -> Self {
        let code = code.into();
        Self {
            name: code.clone(),
            code,
            task_type,
            params: serde_json::Value::Null,
            timeout_ms: None,
            retry: RetryPolicy::default(),
            worker_group: default_worker_group(),
        }
    }

    /// A SHELL task running `command`
    pub fn shell(code: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(code, TaskType::shell()).with_params(serde_json::json!({ "command": command.into() }))
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_worker_group(mut self, group: impl Into<String>) -> Self {
        self.worker_group = group.into();
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Condition an edge places on its upstream node
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Upstream finished with SUCCESS
    #[default]
    Success,
    /// Upstream finished with FAILURE
    Failure,
    /// Upstream reached any terminal state
    Always,
    /// Upstream branching task succeeded and selected this branch
    Branch(String),
}

/// How an edge combines with the other incoming edges of its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: EdgeCondition,
    #[serde(default)]
    pub join: JoinKind,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Success,
            join: JoinKind::And,
        }
    }

    pub fn branch(from: impl Into<String>, to: impl Into<String>, branch: impl Into<String>) -> Self {
        Self::new(from, to).with_condition(EdgeCondition::Branch(branch.into()))
    }

    pub fn with_condition(mut self, condition: EdgeCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn or_join(mut self) -> Self {
        self.join = JoinKind::Or;
        self
    }
}

/// Workflow-level reaction to a task failing terminally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Stop creating new tasks; fail once in-flight tasks settle
    #[default]
    End,
    /// Keep advancing around the failed branch
    Continue,
}

/// Immutable DAG template, referenced by (code, version)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub code: String,
    pub version: u32,
    #[serde(default)]
    pub name: String,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    /// Initial variable pool of every instance
    #[serde(default)]
    pub global_params: HashMap<String, String>,
}

impl WorkflowDefinition {
    pub fn new(code: impl Into<String>, version: u32) -> Self {
        let code = code.into();
        Self {
            name: code.clone(),
            code,
            version,
            tasks: Vec::new(),
            edges: Vec::new(),
            failure_strategy: FailureStrategy::End,
            global_params: HashMap::new(),
        }
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }

    pub fn with_global_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.global_params.insert(key.into(), value.into());
        self
    }

    pub fn task(&self, code: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.code == code)
    }
}
