//! SHELL task type: `params.command` run through `sh -c`
//!
//! Stdout lines containing `${setValue(key=value)}` become output variables.

use crate::dispatch::expression::substitute;
use crate::dispatch::ExecutorError;
use crate::transport::{DispatchRequest, TaskOutcome};
use crate::worker::executor::{ExecutionContext, ExecutionResult, TaskExecutor, TaskExecutorFactory};
use serde::Deserialize;
use slog::{debug, info};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;

const SET_VALUE_OPEN: &str = "${setValue(";
const SET_VALUE_CLOSE: &str = ")}";

#[derive(Debug, Clone, Deserialize)]
pub struct ShellParams {
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub struct ShellTaskFactory;

impl TaskExecutorFactory for ShellTaskFactory {
    fn create(&self, request: &DispatchRequest) -> Result<Arc<dyn TaskExecutor>, ExecutorError> {
        let params: ShellParams = serde_json::from_value(request.params.clone())
            .map_err(|e| ExecutorError::invalid_params(request.task_type.as_str(), e))?;
        Ok(Arc::new(ShellTaskExecutor::new(params)))
    }
}

pub struct ShellTaskExecutor {
    params: ShellParams,
    kill: Notify,
}

impl ShellTaskExecutor {
    pub fn new(params: ShellParams) -> Self {
        Self {
            params,
            kill: Notify::new(),
        }
    }
}

/// Extract every `${setValue(k=v)}` marker from one output line
pub fn parse_set_values(line: &str, vars: &mut HashMap<String, String>) {
    let mut rest = line;
    while let Some(start) = rest.find(SET_VALUE_OPEN) {
        let after = &rest[start + SET_VALUE_OPEN.len()..];
        let Some(end) = after.find(SET_VALUE_CLOSE) else {
            return;
        };
        if let Some((key, value)) = after[..end].split_once('=') {
            vars.insert(key.trim().to_string(), value.trim().to_string());
        }
        rest = &after[end + SET_VALUE_CLOSE.len()..];
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: R) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut out = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        out.push(line);
    }
    out
}

#[async_trait::async_trait]
impl TaskExecutor for ShellTaskExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let command = substitute(&self.params.command, &ctx.request.variables);
        debug!(ctx.logger, "Spawning shell task";
            "task_instance_id" => &ctx.request.task_instance_id,
            "command" => &command
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .envs(&self.params.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().map(|out| tokio::spawn(collect_lines(out)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(collect_lines(err)));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = self.kill.notified() => {
                let _ = child.kill().await;
                info!(ctx.logger, "Shell task killed";
                    "task_instance_id" => &ctx.request.task_instance_id
                );
                return Ok(ExecutionResult::killed());
            }
        };

        let mut output_vars = HashMap::new();
        if let Some(handle) = stdout {
            for line in handle.await.unwrap_or_default() {
                parse_set_values(&line, &mut output_vars);
            }
        }
        let stderr_tail = match stderr {
            Some(handle) => handle.await.unwrap_or_default().pop(),
            None => None,
        };

        let outcome = if status.success() {
            TaskOutcome::Success
        } else {
            TaskOutcome::Failure
        };
        let message = match outcome {
            TaskOutcome::Success => None,
            _ => Some(match stderr_tail {
                Some(line) => format!("exit status {}: {}", status, line),
                None => format!("exit status {}", status),
            }),
        };
        Ok(ExecutionResult {
            outcome,
            output_vars,
            exit_code: status.code(),
            message,
        })
    }

    fn kill(&self) {
        // Stores a permit if execute has not reached its select yet
        self.kill.notify_one();
    }
}
