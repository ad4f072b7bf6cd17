//! Error types for the messaging transport

use thiserror::Error;

/// Errors that can occur during transport operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Peer host not found in the peer directory
    #[error("Peer {host} not found in peer directory")]
    PeerNotFound { host: String },

    /// The peer could not be reached or did not answer
    #[error("Failed to send message to {address}: {reason}")]
    SendFailed { address: String, reason: String },

    /// No handler is registered at the address
    #[error("No handler listening at {address}")]
    Unreachable { address: String },

    /// Failed to serialize a frame
    #[error("Failed to serialize message: {reason}")]
    SerializationError { reason: String },

    /// Failed to deserialize a frame
    #[error("Failed to deserialize message: {reason}")]
    DeserializationError { reason: String },

    /// The receiving handler failed
    #[error("Handler error: {0}")]
    Handler(String),
}
