//! In-memory coordination service
//!
//! `InMemoryCoordinator` plays the role of the consistent coordination
//! service; each process (or test participant) opens its own session through
//! `InMemoryRegistryClient`. Expiring a session drops its locks and ephemeral
//! nodes and notifies watchers, which is how tests simulate a crashed node.

use super::{RegistryClient, RegistryError, RegistryEvent};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

#[derive(Debug, Clone)]
struct NodeEntry {
    payload: String,
    owner_session: String,
}

#[derive(Debug, Clone)]
struct LockEntry {
    session_id: String,
    identity: String,
}

#[derive(Default)]
struct CoordinatorState {
    nodes: BTreeMap<String, NodeEntry>,
    locks: HashMap<String, LockEntry>,
    sessions: HashSet<String>,
}

/// Shared in-memory coordination service
pub struct InMemoryCoordinator {
    state: Mutex<CoordinatorState>,
    watchers: Mutex<HashMap<String, broadcast::Sender<RegistryEvent>>>,
}

fn split_path(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => (String::new(), path.to_string()),
    }
}

impl InMemoryCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CoordinatorState::default()),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Open a new session acting for `identity`
    pub async fn connect(self: &Arc<Self>, identity: &str) -> InMemoryRegistryClient {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.state.lock().await.sessions.insert(session_id.clone());
        InMemoryRegistryClient {
            coordinator: self.clone(),
            session_id,
            identity: identity.to_string(),
        }
    }

    /// Expire a session: its locks are released and its ephemeral nodes removed
    pub async fn expire_session(&self, session_id: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            state.sessions.remove(session_id);
            state.locks.retain(|_, lock| lock.session_id != session_id);
            let owned: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, node)| node.owner_session == session_id)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &owned {
                state.nodes.remove(path);
            }
            owned
        };

        for path in removed {
            let (parent, name) = split_path(&path);
            self.notify(&parent, RegistryEvent::ChildRemoved { parent: parent.clone(), name })
                .await;
        }
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    async fn notify(&self, parent: &str, event: RegistryEvent) {
        let watchers = self.watchers.lock().await;
        if let Some(tx) = watchers.get(parent) {
            let _ = tx.send(event);
        }
    }

    async fn ensure_session(&self, session_id: &str) -> Result<(), RegistryError> {
        if self.state.lock().await.sessions.contains(session_id) {
            Ok(())
        } else {
            Err(RegistryError::SessionExpired {
                session_id: session_id.to_string(),
            })
        }
    }
}

/// One session against an `InMemoryCoordinator`
#[derive(Clone)]
pub struct InMemoryRegistryClient {
    coordinator: Arc<InMemoryCoordinator>,
    session_id: String,
    identity: String,
}

impl InMemoryRegistryClient {
    /// The coordinator this session belongs to
    pub fn coordinator(&self) -> Arc<InMemoryCoordinator> {
        self.coordinator.clone()
    }
}

#[async_trait::async_trait]
impl RegistryClient for InMemoryRegistryClient {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn acquire_lock(&self, path: &str) -> Result<bool, RegistryError> {
        let mut state = self.coordinator.state.lock().await;
        if !state.sessions.contains(&self.session_id) {
            return Err(RegistryError::SessionExpired {
                session_id: self.session_id.clone(),
            });
        }

        match state.locks.get(path) {
            Some(lock) => Ok(lock.session_id == self.session_id),
            None => {
                state.locks.insert(
                    path.to_string(),
                    LockEntry {
                        session_id: self.session_id.clone(),
                        identity: self.identity.clone(),
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, path: &str) -> Result<(), RegistryError> {
        let mut state = self.coordinator.state.lock().await;
        if !state.sessions.contains(&self.session_id) {
            return Err(RegistryError::SessionExpired {
                session_id: self.session_id.clone(),
            });
        }

        match state.locks.get(path) {
            Some(lock) if lock.session_id == self.session_id => {
                state.locks.remove(path);
                Ok(())
            }
            _ => Err(RegistryError::LockNotHeld {
                path: path.to_string(),
            }),
        }
    }

    async fn lock_holder(&self, path: &str) -> Result<Option<String>, RegistryError> {
        self.coordinator.ensure_session(&self.session_id).await?;
        let state = self.coordinator.state.lock().await;
        Ok(state.locks.get(path).map(|lock| lock.identity.clone()))
    }

    async fn holds_lock(&self, path: &str) -> Result<bool, RegistryError> {
        self.coordinator.ensure_session(&self.session_id).await?;
        let state = self.coordinator.state.lock().await;
        Ok(state
            .locks
            .get(path)
            .map_or(false, |lock| lock.session_id == self.session_id))
    }

    async fn register_ephemeral(&self, path: &str, payload: String) -> Result<(), RegistryError> {
        {
            let mut state = self.coordinator.state.lock().await;
            if !state.sessions.contains(&self.session_id) {
                return Err(RegistryError::SessionExpired {
                    session_id: self.session_id.clone(),
                });
            }
            state.nodes.insert(
                path.to_string(),
                NodeEntry {
                    payload: payload.clone(),
                    owner_session: self.session_id.clone(),
                },
            );
        }

        let (parent, name) = split_path(path);
        self.coordinator
            .notify(
                &parent,
                RegistryEvent::ChildUpserted {
                    parent: parent.clone(),
                    name,
                    payload,
                },
            )
            .await;
        Ok(())
    }

    async fn unregister(&self, path: &str) -> Result<(), RegistryError> {
        let removed = {
            let mut state = self.coordinator.state.lock().await;
            if !state.sessions.contains(&self.session_id) {
                return Err(RegistryError::SessionExpired {
                    session_id: self.session_id.clone(),
                });
            }
            match state.nodes.get(path) {
                Some(node) if node.owner_session == self.session_id => {
                    state.nodes.remove(path);
                    true
                }
                _ => false,
            }
        };

        if removed {
            let (parent, name) = split_path(path);
            self.coordinator
                .notify(&parent, RegistryEvent::ChildRemoved { parent: parent.clone(), name })
                .await;
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<String>, RegistryError> {
        self.coordinator.ensure_session(&self.session_id).await?;
        let state = self.coordinator.state.lock().await;
        Ok(state.nodes.get(path).map(|node| node.payload.clone()))
    }

    async fn children(&self, path: &str) -> Result<Vec<(String, String)>, RegistryError> {
        self.coordinator.ensure_session(&self.session_id).await?;
        let state = self.coordinator.state.lock().await;
        Ok(state
            .nodes
            .iter()
            .filter_map(|(node_path, node)| {
                let (parent, name) = split_path(node_path);
                (parent == path).then(|| (name, node.payload.clone()))
            })
            .collect())
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<broadcast::Receiver<RegistryEvent>, RegistryError> {
        self.coordinator.ensure_session(&self.session_id).await?;
        let mut watchers = self.coordinator.watchers.lock().await;
        let tx = watchers
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(256).0);
        Ok(tx.subscribe())
    }
}
