//! In-process server (Layer 0)
//!
//! Routes frames between hosts living in the same process without network
//! I/O. Frames still go through JSON encoding so the wire format is
//! exercised. Addresses are unreachable on demand to simulate partitions.

use crate::transport::errors::TransportError;
use crate::transport::message::{Envelope, WireMessage};
use crate::transport::transport::{MessageHandler, MessageSender};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

const ADDRESS_PREFIX: &str = "inproc://";

/// In-process address of a host
pub fn in_process_address(host: &str) -> String {
    format!("{}{}", ADDRESS_PREFIX, host)
}

/// In-process server that routes frames between registered handlers
pub struct InProcessServer {
    /// Registry of host → handler
    nodes: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,

    /// Hosts whose inbound traffic is dropped
    unreachable: Mutex<HashSet<String>>,
}

impl InProcessServer {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
        }
    }

    pub async fn register_node(&self, host: &str, handler: Arc<dyn MessageHandler>) {
        self.nodes.lock().await.insert(host.to_string(), handler);
    }

    pub async fn unregister_node(&self, host: &str) {
        self.nodes.lock().await.remove(host);
    }

    /// Drop (or restore) all traffic towards `host`
    pub async fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut set = self.unreachable.lock().await;
        if unreachable {
            set.insert(host.to_string());
        } else {
            set.remove(host);
        }
    }

    /// Deliver a frame to a host and return its reply
    pub async fn send_to_node(&self, host: &str, envelope: Envelope) -> Result<WireMessage, TransportError> {
        if self.unreachable.lock().await.contains(host) {
            return Err(TransportError::SendFailed {
                address: in_process_address(host),
                reason: "host unreachable".to_string(),
            });
        }

        let handler = {
            let nodes = self.nodes.lock().await;
            nodes.get(host).cloned()
        };
        let Some(handler) = handler else {
            return Err(TransportError::Unreachable {
                address: in_process_address(host),
            });
        };

        let frame = envelope.encode()?;
        let reply = handler.handle(Envelope::decode(&frame)?).await?;
        let reply_frame = serde_json::to_vec(&reply).map_err(|e| TransportError::SerializationError {
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&reply_frame).map_err(|e| TransportError::DeserializationError {
            reason: e.to_string(),
        })
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.lock().await.len()
    }
}

impl Default for InProcessServer {
    fn default() -> Self {
        Self::new()
    }
}

/// MessageSender implementation for InProcessServer
pub struct InProcessMessageSender {
    server: Arc<InProcessServer>,
}

impl InProcessMessageSender {
    pub fn new(server: Arc<InProcessServer>) -> Self {
        Self { server }
    }

    /// Parse the host name from an `inproc://<host>` address
    fn parse_host(address: &str) -> Result<&str, TransportError> {
        match address.strip_prefix(ADDRESS_PREFIX) {
            Some(host) if !host.is_empty() => Ok(host),
            _ => Err(TransportError::SerializationError {
                reason: format!(
                    "Invalid in-process address '{}', expected format '{}<host>'",
                    address, ADDRESS_PREFIX
                ),
            }),
        }
    }
}

#[async_trait::async_trait]
impl MessageSender for InProcessMessageSender {
    async fn send(&self, address: &str, envelope: Envelope) -> Result<WireMessage, TransportError> {
        let host = Self::parse_host(address)?;
        self.server.send_to_node(host, envelope).await
    }
}
