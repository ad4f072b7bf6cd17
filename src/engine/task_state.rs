//! Task instance state machine
//!
//! All functions mutate a `TaskInstance` in place and keep its history and
//! timestamps consistent. Terminal states are sticky: applying any state to a
//! terminal task is reported as `Ignored` and changes nothing.

use crate::engine::error::EngineError;
use crate::model::{now_millis, RetryPolicy, TaskInstance, TaskState};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored,
}

/// What happened to a task after a recoverable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Moved to RETRY; resubmit after `delay`
    Retry { delay: Duration },
    /// Retries exhausted; moved to FAILURE
    Failed,
    /// Task was already terminal
    Ignored,
}

pub fn apply(task: &mut TaskInstance, next: TaskState) -> Result<Transition, EngineError> {
    if task.state.is_terminal() || task.state == next {
        return Ok(Transition::Ignored);
    }
    if !task.state.can_transition_to(next) {
        return Err(EngineError::invalid_transition("task", task.state, next));
    }

    task.state = next;
    task.history.push(next);
    let now = now_millis();
    if next == TaskState::Running && task.start_time.is_none() {
        task.start_time = Some(now);
    }
    if next.is_terminal() {
        task.end_time = Some(now);
    }
    Ok(Transition::Applied)
}

/// Route a recoverable failure through the retry policy
pub fn fail_recoverable(
    task: &mut TaskInstance,
    policy: &RetryPolicy,
    reason: impl Into<String>,
) -> Result<Recovery, EngineError> {
    if task.state.is_terminal() {
        return Ok(Recovery::Ignored);
    }
    task.message = Some(reason.into());

    if policy.allows_retry(task.retry_count) {
        apply(task, TaskState::Retry)?;
        Ok(Recovery::Retry {
            delay: policy.delay_for(task.retry_count + 1),
        })
    } else {
        apply(task, TaskState::Failure)?;
        Ok(Recovery::Failed)
    }
}

/// RETRY → SUBMITTED for the next attempt
pub fn resubmit(task: &mut TaskInstance) -> Result<(), EngineError> {
    if task.state != TaskState::Retry {
        return Err(EngineError::invalid_transition("task", task.state, TaskState::Submitted));
    }
    apply(task, TaskState::Submitted)?;
    task.retry_count += 1;
    task.host = None;
    task.start_time = None;
    task.output_vars.clear();
    Ok(())
}

/// External cancellation; a no-op on terminal tasks
pub fn kill(task: &mut TaskInstance, reason: &str) -> Result<Transition, EngineError> {
    let outcome = apply(task, TaskState::Killed)?;
    if outcome == Transition::Applied {
        task.message = Some(reason.to_string());
    }
    Ok(outcome)
}
