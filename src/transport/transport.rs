//! Protocol-agnostic transport layer (Layer 1)
//!
//! Provides request/response messaging between hosts without tying callers
//! to a specific protocol (HTTP or in-process).

use crate::transport::errors::TransportError;
use crate::transport::message::{Envelope, WireMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Protocol-specific message sender
///
/// Implemented by each server layer (HTTP, in-process) to deliver one frame
/// and return the peer's reply.
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    /// Send a frame to the peer at `address` and wait for its reply
    async fn send(&self, address: &str, envelope: Envelope) -> Result<WireMessage, TransportError>;
}

/// Receiving side of the transport: dispatches an inbound frame by message type
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<WireMessage, TransportError>;
}

/// Transport layer trait (Layer 1)
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Host name of this process; used as the envelope sender
    fn local_host(&self) -> &str;

    /// Send a message to a peer host and return its reply
    async fn send_message(
        &self,
        target_host: &str,
        message: WireMessage,
    ) -> Result<WireMessage, TransportError>;

    async fn add_peer(&self, host: &str, address: String);

    async fn remove_peer(&self, host: &str);

    async fn list_peers(&self) -> Vec<String>;

    async fn get_peer_address(&self, host: &str) -> Option<String>;
}

/// Concrete implementation of the transport layer
///
/// Maintains the peer directory (host → address) and delegates the actual
/// send to the protocol-specific `MessageSender`.
pub struct TransportLayer {
    local_host: String,

    /// Peer directory: host → protocol-specific address
    peers: Arc<Mutex<HashMap<String, String>>>,

    message_sender: Arc<dyn MessageSender>,
}

impl TransportLayer {
    pub fn new(local_host: impl Into<String>, message_sender: Arc<dyn MessageSender>) -> Self {
        Self {
            local_host: local_host.into(),
            peers: Arc::new(Mutex::new(HashMap::new())),
            message_sender,
        }
    }
}

#[async_trait::async_trait]
impl Transport for TransportLayer {
    fn local_host(&self) -> &str {
        &self.local_host
    }

    async fn send_message(
        &self,
        target_host: &str,
        message: WireMessage,
    ) -> Result<WireMessage, TransportError> {
        let address = {
            let peers = self.peers.lock().await;
            peers.get(target_host).cloned()
        };

        match address {
            Some(addr) => {
                let envelope = Envelope::new(self.local_host.clone(), message);
                self.message_sender.send(&addr, envelope).await
            }
            None => Err(TransportError::PeerNotFound {
                host: target_host.to_string(),
            }),
        }
    }

    async fn add_peer(&self, host: &str, address: String) {
        self.peers.lock().await.insert(host.to_string(), address);
    }

    async fn remove_peer(&self, host: &str) {
        self.peers.lock().await.remove(host);
    }

    async fn list_peers(&self) -> Vec<String> {
        self.peers.lock().await.keys().cloned().collect()
    }

    async fn get_peer_address(&self, host: &str) -> Option<String> {
        self.peers.lock().await.get(host).cloned()
    }
}
