//! Events consumed by a workflow instance's loop, and events it publishes

use crate::dispatch::DispatchError;
use crate::engine::error::EngineError;
use crate::model::{TaskInstance, TaskState, WorkflowState};
use crate::transport::{CorrelationKey, RejectReason, ResultEvent, RunningEvent, WireMessage};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::oneshot;

/// Deferred reply to a worker event; answered once the loop applied it
pub struct AckHandle {
    key: CorrelationKey,
    reply: Option<oneshot::Sender<WireMessage>>,
}

impl AckHandle {
    pub fn new(key: CorrelationKey) -> (Self, oneshot::Receiver<WireMessage>) {
        let (tx, rx) = oneshot::channel();
        (Self { key, reply: Some(tx) }, rx)
    }

    pub fn ack(mut self) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(WireMessage::ack(self.key.clone()));
        }
    }

    pub fn reject(mut self, reason: RejectReason) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(WireMessage::reject(Some(self.key.clone()), reason));
        }
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle").field("key", &self.key).finish()
    }
}

pub type ControlReply = oneshot::Sender<Result<(), EngineError>>;

/// Tagged input of the per-instance interpreter loop
#[derive(Debug)]
pub enum LifecycleEvent {
    WorkflowStart,
    TaskDispatch {
        task_instance_id: String,
    },
    TaskDispatchCompleted {
        task_instance_id: String,
        attempt: u32,
        outcome: Result<String, DispatchError>,
    },
    TaskRunning {
        event: RunningEvent,
        ack: AckHandle,
    },
    TaskResult {
        event: ResultEvent,
        ack: AckHandle,
    },
    TaskTimeout {
        task_instance_id: String,
        attempt: u32,
    },
    TaskRetryDue {
        task_instance_id: String,
        attempt: u32,
    },
    LogicRecheck {
        task_instance_id: String,
        attempt: u32,
    },
    SubWorkflowFinished {
        task_instance_id: String,
        child_workflow_instance_id: String,
        state: WorkflowState,
        variables: HashMap<String, String>,
    },
    TopologyTransitionOnTaskFinish {
        node_code: String,
    },
    Pause {
        reply: ControlReply,
    },
    Resume {
        reply: ControlReply,
    },
    Stop {
        reply: ControlReply,
    },
    KillTask {
        task_instance_id: String,
        reply: ControlReply,
    },
    WorkerLost {
        host: String,
    },
    /// The parent's SUB_WORKFLOW task was cancelled or timed out
    ParentCancelled,
    WorkflowFinalize,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::WorkflowStart => "workflow_start",
            LifecycleEvent::TaskDispatch { .. } => "task_dispatch",
            LifecycleEvent::TaskDispatchCompleted { .. } => "task_dispatch_completed",
            LifecycleEvent::TaskRunning { .. } => "task_running",
            LifecycleEvent::TaskResult { .. } => "task_result",
            LifecycleEvent::TaskTimeout { .. } => "task_timeout",
            LifecycleEvent::TaskRetryDue { .. } => "task_retry_due",
            LifecycleEvent::LogicRecheck { .. } => "logic_recheck",
            LifecycleEvent::SubWorkflowFinished { .. } => "sub_workflow_finished",
            LifecycleEvent::TopologyTransitionOnTaskFinish { .. } => "topology_transition",
            LifecycleEvent::Pause { .. } => "pause",
            LifecycleEvent::Resume { .. } => "resume",
            LifecycleEvent::Stop { .. } => "stop",
            LifecycleEvent::KillTask { .. } => "kill_task",
            LifecycleEvent::WorkerLost { .. } => "worker_lost",
            LifecycleEvent::ParentCancelled => "parent_cancelled",
            LifecycleEvent::WorkflowFinalize => "workflow_finalize",
        }
    }

    /// Answer whatever the sender is waiting on with a not-owner refusal
    pub fn refuse(self, host: &str, workflow_instance_id: &str) {
        let not_owner = || EngineError::NotOwner {
            workflow_instance_id: workflow_instance_id.to_string(),
            host: host.to_string(),
        };
        match self {
            LifecycleEvent::TaskRunning { ack, .. } | LifecycleEvent::TaskResult { ack, .. } => {
                ack.reject(RejectReason::NotOwner)
            }
            LifecycleEvent::Pause { reply }
            | LifecycleEvent::Resume { reply }
            | LifecycleEvent::Stop { reply }
            | LifecycleEvent::KillTask { reply, .. } => {
                let _ = reply.send(Err(not_owner()));
            }
            _ => {}
        }
    }
}

/// Notifications published on the master's event bus
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    WorkflowStateChanged {
        workflow_instance_id: String,
        state: WorkflowState,
    },
    TaskStateChanged {
        workflow_instance_id: String,
        task_instance_id: String,
        node_code: String,
        attempt: u32,
        state: TaskState,
    },
    WorkflowFinished {
        workflow_instance_id: String,
        state: WorkflowState,
    },
    /// An at-least-once event was given up after its delivery ceiling
    DeliveryAlert {
        key: CorrelationKey,
        target: String,
        attempts: u32,
    },
}

impl EngineEvent {
    pub fn task_changed(task: &TaskInstance) -> Self {
        EngineEvent::TaskStateChanged {
            workflow_instance_id: task.workflow_instance_id.clone(),
            task_instance_id: task.id.clone(),
            node_code: task.node_code.clone(),
            attempt: task.attempt(),
            state: task.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EventType;

    #[tokio::test]
    async fn test_ack_handle_replies_once() {
        let key = CorrelationKey::new("t1", 1, EventType::Result);
        let (handle, rx) = AckHandle::new(key.clone());
        handle.ack();
        assert!(rx.await.unwrap().acknowledges(&key));
    }

    #[tokio::test]
    async fn test_refuse_rejects_with_not_owner() {
        let key = CorrelationKey::new("t1", 1, EventType::Running);
        let (ack, rx) = AckHandle::new(key);
        let event = LifecycleEvent::TaskRunning {
            event: RunningEvent {
                workflow_instance_id: "wf".to_string(),
                task_instance_id: "t1".to_string(),
                attempt: 1,
                worker_host: "w1".to_string(),
                start_time: 0,
            },
            ack,
        };
        event.refuse("m1", "wf");
        match rx.await.unwrap() {
            WireMessage::Reject(reject) => assert_eq!(reject.reason, RejectReason::NotOwner),
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_handle_closes_channel() {
        let (handle, rx) = AckHandle::new(CorrelationKey::new("t1", 1, EventType::Result));
        drop(handle);
        assert!(rx.await.is_err());
    }
}
