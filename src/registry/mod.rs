//! Registry client (coordination service collaborator)
//!
//! The engine uses the registry for two things only: master ownership of
//! workflow instances (distributed locks) and liveness of masters and workers
//! (ephemeral nodes plus children watches).

pub mod memory;
pub mod remote;

pub use memory::{InMemoryCoordinator, InMemoryRegistryClient};
pub use remote::{HttpRegistryClient, RegistryService};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Root under which masters register their ephemeral node
pub const MASTERS_PATH: &str = "/dagrun/masters";

/// Root under which workers register their ephemeral node
pub const WORKERS_PATH: &str = "/dagrun/workers";

/// Root for workflow ownership locks
pub const WORKFLOW_LOCKS_PATH: &str = "/dagrun/locks/workflows";

/// Lock path guarding ownership of one workflow instance
pub fn workflow_lock_path(workflow_instance_id: &str) -> String {
    format!("{}/{}", WORKFLOW_LOCKS_PATH, workflow_instance_id)
}

/// Ephemeral node path of a master host
pub fn master_path(host: &str) -> String {
    format!("{}/{}", MASTERS_PATH, host)
}

/// Ephemeral node path of a worker host
pub fn worker_path(host: &str) -> String {
    format!("{}/{}", WORKERS_PATH, host)
}

/// Payload of a master's ephemeral node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterPresence {
    /// Address workers send RUNNING/RESULT frames to
    pub address: String,
}

/// Errors returned by a registry client
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryError {
    /// The client's session is no longer valid; locks and ephemeral nodes are gone
    #[error("Registry session {session_id} expired")]
    SessionExpired { session_id: String },

    /// The coordination service could not be reached
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// The caller tried to release a lock it does not hold
    #[error("Lock {path} is not held by this session")]
    LockNotHeld { path: String },
}

/// Change notification for the children of a watched path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A child was created or its payload was updated
    ChildUpserted {
        parent: String,
        name: String,
        payload: String,
    },

    /// A child was removed (explicitly or by session expiry)
    ChildRemoved { parent: String, name: String },
}

/// Registry client consumed by masters and workers
///
/// Every operation is scoped to the client's session: locks and ephemeral
/// nodes disappear when the session ends.
#[async_trait::async_trait]
pub trait RegistryClient: Send + Sync {
    /// Identifier of this client's session
    fn session_id(&self) -> &str;

    /// Host name this session acts for; recorded as the holder of acquired locks
    fn identity(&self) -> &str;

    /// Try to acquire a lock; `false` means another session holds it.
    /// Acquiring a lock already held by this session succeeds.
    async fn acquire_lock(&self, path: &str) -> Result<bool, RegistryError>;

    /// Release a lock held by this session
    async fn release_lock(&self, path: &str) -> Result<(), RegistryError>;

    /// Identity of the session currently holding the lock
    async fn lock_holder(&self, path: &str) -> Result<Option<String>, RegistryError>;

    /// Whether this very session holds the lock. Another session acting for
    /// the same identity does not count.
    async fn holds_lock(&self, path: &str) -> Result<bool, RegistryError>;

    /// Create or update an ephemeral node owned by this session
    async fn register_ephemeral(&self, path: &str, payload: String) -> Result<(), RegistryError>;

    /// Remove a node owned by this session
    async fn unregister(&self, path: &str) -> Result<(), RegistryError>;

    /// Read a node's payload
    async fn get(&self, path: &str) -> Result<Option<String>, RegistryError>;

    /// List the direct children of a path as (name, payload)
    async fn children(&self, path: &str) -> Result<Vec<(String, String)>, RegistryError>;

    /// Subscribe to changes of the direct children of a path
    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<broadcast::Receiver<RegistryEvent>, RegistryError>;
}
