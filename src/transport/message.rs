//! Wire messages exchanged between masters and workers
//!
//! Every frame is an `Envelope` (sender host + one `WireMessage`) encoded as
//! JSON. Messages that take part in the ack/retry protocol carry a
//! `CorrelationKey` of (task instance id, attempt, event type).

use crate::model::{TaskState, TaskType};
use crate::transport::errors::TransportError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Dispatch,
    Running,
    Result,
    Kill,
}

/// Deduplication and acknowledgement key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub task_instance_id: String,
    pub attempt: u32,
    pub event_type: EventType,
}

impl CorrelationKey {
    pub fn new(task_instance_id: &str, attempt: u32, event_type: EventType) -> Self {
        Self {
            task_instance_id: task_instance_id.to_string(),
            attempt,
            event_type,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}/{:?}", self.task_instance_id, self.attempt, self.event_type)
    }
}

/// Master → worker: execute one attempt of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub workflow_instance_id: String,
    pub task_instance_id: String,
    pub attempt: u32,
    pub task_code: String,
    pub task_type: TaskType,
    pub params: serde_json::Value,
    /// Snapshot of the workflow variable pool
    pub variables: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
    pub master_host: String,
}

impl DispatchRequest {
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(&self.task_instance_id, self.attempt, EventType::Dispatch)
    }
}

/// Worker → master: the attempt started executing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningEvent {
    pub workflow_instance_id: String,
    pub task_instance_id: String,
    pub attempt: u32,
    pub worker_host: String,
    pub start_time: u64,
}

impl RunningEvent {
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(&self.task_instance_id, self.attempt, EventType::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Success,
    Failure,
    Killed,
}

/// Worker → master: the attempt finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub workflow_instance_id: String,
    pub task_instance_id: String,
    pub attempt: u32,
    pub worker_host: String,
    pub outcome: TaskOutcome,
    pub output_vars: HashMap<String, String>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub end_time: u64,
}

impl ResultEvent {
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(&self.task_instance_id, self.attempt, EventType::Result)
    }
}

/// Master → worker: cancel an attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillRequest {
    pub workflow_instance_id: String,
    pub task_instance_id: String,
    pub attempt: u32,
    pub master_host: String,
}

impl KillRequest {
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(&self.task_instance_id, self.attempt, EventType::Kill)
    }
}

/// Worker → master: ask for the authoritative state of a task (after restart)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateQuery {
    pub workflow_instance_id: String,
    pub task_instance_id: String,
    pub attempt: u32,
    pub worker_host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateReply {
    pub task_instance_id: String,
    /// `None` when the master has no record of the task
    pub state: Option<TaskState>,
    pub attempt: Option<u32>,
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub key: CorrelationKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Worker pool is full
    Busy,
    /// Receiver does not own the workflow instance
    NotOwner,
    /// The request made no sense to the receiver
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub key: Option<CorrelationKey>,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum WireMessage {
    Dispatch(DispatchRequest),
    Running(RunningEvent),
    Result(ResultEvent),
    Kill(KillRequest),
    StateQuery(TaskStateQuery),
    StateReply(TaskStateReply),
    Ack(Ack),
    Reject(Reject),
}

impl WireMessage {
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        match self {
            WireMessage::Dispatch(m) => Some(m.key()),
            WireMessage::Running(m) => Some(m.key()),
            WireMessage::Result(m) => Some(m.key()),
            WireMessage::Kill(m) => Some(m.key()),
            WireMessage::Ack(m) => Some(m.key.clone()),
            WireMessage::Reject(m) => m.key.clone(),
            WireMessage::StateQuery(_) | WireMessage::StateReply(_) => None,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Dispatch(_) => "dispatch",
            WireMessage::Running(_) => "running",
            WireMessage::Result(_) => "result",
            WireMessage::Kill(_) => "kill",
            WireMessage::StateQuery(_) => "state_query",
            WireMessage::StateReply(_) => "state_reply",
            WireMessage::Ack(_) => "ack",
            WireMessage::Reject(_) => "reject",
        }
    }

    pub fn ack(key: CorrelationKey) -> Self {
        WireMessage::Ack(Ack { key })
    }

    pub fn reject(key: Option<CorrelationKey>, reason: RejectReason) -> Self {
        WireMessage::Reject(Reject { key, reason })
    }

    /// Whether this reply acknowledges `key`
    pub fn acknowledges(&self, key: &CorrelationKey) -> bool {
        matches!(self, WireMessage::Ack(ack) if &ack.key == key)
    }
}

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Host name of the sender
    pub from: String,
    pub message: WireMessage,
}

impl Envelope {
    pub fn new(from: impl Into<String>, message: WireMessage) -> Self {
        Self {
            from: from.into(),
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::SerializationError {
            reason: e.to_string(),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::DeserializationError {
            reason: e.to_string(),
        })
    }
}
