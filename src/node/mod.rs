//! Process assembly
//!
//! A node wires the registry session, HTTP transport, metadata store and
//! runtime of one master or worker process, and owns its background tasks.

pub mod api;
pub mod master;
pub mod worker;

pub use api::control_routes;
pub use master::MasterNode;
pub use worker::WorkerNode;

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::registry::RegistryError;
use crate::store::StoreError;
use crate::transport::TransportError;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid listen address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Invalid definition file {path}: {reason}")]
    DefinitionFile { path: String, reason: String },
}

pub(crate) fn parse_listen_address(address: &str) -> Result<SocketAddr, NodeError> {
    address.parse().map_err(|e: std::net::AddrParseError| NodeError::InvalidAddress {
        address: address.to_string(),
        reason: e.to_string(),
    })
}
