//! Logic tasks: evaluated inside the owning master's loop
//!
//! Each executor looks at a copy of the instance state and returns a
//! `LogicOutcome`; the loop applies it. `Pending` and `Launched` outcomes
//! are re-evaluated on a `LogicRecheck` event.

use crate::dispatch::expression::{evaluate_condition, Dependence};
use crate::dispatch::ExecutorError;
use crate::engine::EngineError;
use crate::model::{ParentLink, TaskDefinition, TaskInstance, TaskState, TaskType, WorkflowInstance, WorkflowState};
use crate::store::MetadataStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const BRANCH_SUCCESS: &str = "success";
pub const BRANCH_FAILURE: &str = "failure";

const DEFAULT_CHECK_INTERVAL_MS: u64 = 1000;

/// Starts child workflow instances for SUB_WORKFLOW tasks
#[async_trait::async_trait]
pub trait ChildLauncher: Send + Sync {
    async fn launch_child(
        &self,
        definition_code: &str,
        version: Option<u32>,
        variables: HashMap<String, String>,
        parent: ParentLink,
    ) -> Result<String, EngineError>;
}

pub struct LogicContext {
    pub workflow: WorkflowInstance,
    pub task: TaskInstance,
    pub definition: TaskDefinition,
    /// Latest state of every instantiated node of the workflow
    pub node_states: HashMap<String, TaskState>,
    pub store: Arc<dyn MetadataStore>,
    pub launcher: Arc<dyn ChildLauncher>,
}

impl LogicContext {
    fn params<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ExecutorError> {
        serde_json::from_value(self.definition.params.clone())
            .map_err(|e| ExecutorError::invalid_params(self.task.task_type.as_str(), e))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogicOutcome {
    Success {
        branch: Option<String>,
        vars: HashMap<String, String>,
    },
    Failure {
        message: String,
    },
    /// Evaluate again after `recheck`
    Pending {
        recheck: Duration,
    },
    /// A child instance was started; evaluate again when it finishes
    Launched {
        child_workflow_instance_id: String,
        recheck: Duration,
    },
    /// Succeed the task and pause the workflow
    Block {
        message: String,
    },
}

impl LogicOutcome {
    fn branch(branch: &str) -> Self {
        LogicOutcome::Success {
            branch: Some(branch.to_string()),
            vars: HashMap::new(),
        }
    }

    fn pass() -> Self {
        LogicOutcome::Success {
            branch: None,
            vars: HashMap::new(),
        }
    }
}

#[async_trait::async_trait]
pub trait LogicTaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &LogicContext) -> Result<LogicOutcome, ExecutorError>;
}

/// Lookup table of logic executors by type tag
pub struct LogicTaskRegistry {
    executors: HashMap<String, Arc<dyn LogicTaskExecutor>>,
}

impl LogicTaskRegistry {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// CONDITIONS, SWITCH, DEPENDENT, SUB_WORKFLOW and BLOCKING
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(TaskType::CONDITIONS, Arc::new(ConditionsTask));
        registry.register(TaskType::SWITCH, Arc::new(SwitchTask));
        registry.register(TaskType::DEPENDENT, Arc::new(DependentTask));
        registry.register(TaskType::SUB_WORKFLOW, Arc::new(SubWorkflowTask));
        registry.register(TaskType::BLOCKING, Arc::new(BlockingTask));
        registry
    }

    pub fn register(&mut self, tag: &str, executor: Arc<dyn LogicTaskExecutor>) {
        self.executors.insert(TaskType::new(tag).as_str().to_string(), executor);
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn LogicTaskExecutor>> {
        self.executors.get(task_type.as_str()).cloned()
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.executors.contains_key(task_type.as_str())
    }
}

impl Default for LogicTaskRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[derive(Debug, Deserialize)]
struct ConditionsParams {
    #[serde(default)]
    dependence: Dependence,
}

/// Picks branch `success` or `failure` from a dependence list
pub struct ConditionsTask;

#[async_trait::async_trait]
impl LogicTaskExecutor for ConditionsTask {
    async fn execute(&self, ctx: &LogicContext) -> Result<LogicOutcome, ExecutorError> {
        let params: ConditionsParams = ctx.params()?;
        let branch = if params.dependence.evaluate(&ctx.node_states) {
            BRANCH_SUCCESS
        } else {
            BRANCH_FAILURE
        };
        Ok(LogicOutcome::branch(branch))
    }
}

#[derive(Debug, Deserialize)]
struct SwitchCase {
    condition: String,
    branch: String,
}

#[derive(Debug, Deserialize)]
struct SwitchParams {
    #[serde(default)]
    cases: Vec<SwitchCase>,
    #[serde(default)]
    default: Option<String>,
}

/// First matching case wins, then `default`
pub struct SwitchTask;

#[async_trait::async_trait]
impl LogicTaskExecutor for SwitchTask {
    async fn execute(&self, ctx: &LogicContext) -> Result<LogicOutcome, ExecutorError> {
        let params: SwitchParams = ctx.params()?;
        let matched = params
            .cases
            .iter()
            .find(|case| evaluate_condition(&case.condition, &ctx.workflow.variables))
            .map(|case| case.branch.clone())
            .or(params.default);
        Ok(match matched {
            Some(branch) => LogicOutcome::branch(&branch),
            None => LogicOutcome::Failure {
                message: "no switch case matched and no default branch".to_string(),
            },
        })
    }
}

#[derive(Debug, Deserialize)]
struct DependentItem {
    workflow: String,
}

#[derive(Debug, Deserialize)]
struct DependentParams {
    #[serde(default)]
    dependencies: Vec<DependentItem>,
    #[serde(default)]
    check_interval_ms: Option<u64>,
}

/// Waits on the latest instance of other workflow definitions
pub struct DependentTask;

#[async_trait::async_trait]
impl LogicTaskExecutor for DependentTask {
    async fn execute(&self, ctx: &LogicContext) -> Result<LogicOutcome, ExecutorError> {
        let params: DependentParams = ctx.params()?;
        let recheck = Duration::from_millis(params.check_interval_ms.unwrap_or(DEFAULT_CHECK_INTERVAL_MS));

        let mut waiting = false;
        for dep in &params.dependencies {
            match ctx.store.latest_workflow_by_definition(&dep.workflow).await? {
                Some(wf) if wf.state == WorkflowState::Success => {}
                Some(wf) if wf.state.is_terminal() => {
                    return Ok(LogicOutcome::Failure {
                        message: format!("dependency {} finished {}", dep.workflow, wf.state),
                    });
                }
                _ => waiting = true,
            }
        }

        Ok(if waiting {
            LogicOutcome::Pending { recheck }
        } else {
            LogicOutcome::pass()
        })
    }
}

#[derive(Debug, Deserialize)]
struct SubWorkflowParams {
    workflow: String,
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    check_interval_ms: Option<u64>,
}

/// Runs a child instance and mirrors its outcome
pub struct SubWorkflowTask;

#[async_trait::async_trait]
impl LogicTaskExecutor for SubWorkflowTask {
    async fn execute(&self, ctx: &LogicContext) -> Result<LogicOutcome, ExecutorError> {
        let params: SubWorkflowParams = ctx.params()?;
        let recheck = Duration::from_millis(params.check_interval_ms.unwrap_or(5 * DEFAULT_CHECK_INTERVAL_MS));

        let Some(child_id) = ctx.task.sub_workflow_instance_id.as_deref() else {
            let parent = ParentLink {
                workflow_instance_id: ctx.workflow.id.clone(),
                task_instance_id: ctx.task.id.clone(),
            };
            let child = ctx
                .launcher
                .launch_child(&params.workflow, params.version, ctx.workflow.variables.clone(), parent)
                .await
                .map_err(|e| ExecutorError::Launch(e.to_string()))?;
            return Ok(LogicOutcome::Launched {
                child_workflow_instance_id: child,
                recheck,
            });
        };

        Ok(match ctx.store.load_workflow(child_id).await? {
            Some(child) => sub_workflow_outcome(child.state, child.variables, recheck),
            None => LogicOutcome::Failure {
                message: format!("sub-workflow instance {} not found", child_id),
            },
        })
    }
}

/// Map a child's state to the outcome of its SUB_WORKFLOW task
pub fn sub_workflow_outcome(
    state: WorkflowState,
    variables: HashMap<String, String>,
    recheck: Duration,
) -> LogicOutcome {
    match state {
        WorkflowState::Success => LogicOutcome::Success {
            branch: None,
            vars: variables,
        },
        WorkflowState::Failure | WorkflowState::Stop => LogicOutcome::Failure {
            message: format!("sub-workflow finished {}", state),
        },
        _ => LogicOutcome::Pending { recheck },
    }
}

fn default_block_when() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct BlockingParams {
    #[serde(default)]
    dependence: Dependence,
    #[serde(default = "default_block_when")]
    block_when: bool,
}

/// Pauses the workflow when its dependence list evaluates to `block_when`
pub struct BlockingTask;

#[async_trait::async_trait]
impl LogicTaskExecutor for BlockingTask {
    async fn execute(&self, ctx: &LogicContext) -> Result<LogicOutcome, ExecutorError> {
        let params: BlockingParams = ctx.params()?;
        if params.dependence.evaluate(&ctx.node_states) == params.block_when {
            Ok(LogicOutcome::Block {
                message: format!("blocking node {} paused the workflow", ctx.task.node_code),
            })
        } else {
            Ok(LogicOutcome::pass())
        }
    }
}
