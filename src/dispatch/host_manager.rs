//! Worker directory built from registry heartbeats

use crate::registry::{RegistryClient, RegistryError, WORKERS_PATH};
use serde::{Deserialize, Serialize};
use slog::{warn, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Payload of a worker's ephemeral node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub address: String,
    pub groups: Vec<String>,
    /// Attempts currently executing
    pub running: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHost {
    pub host: String,
    pub address: String,
    pub groups: Vec<String>,
    pub running: usize,
    pub capacity: usize,
}

impl WorkerHost {
    pub fn serves(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    pub fn has_free_slot(&self) -> bool {
        self.running < self.capacity
    }
}

/// Live workers, refreshed from `/dagrun/workers`
pub struct HostManager {
    registry: Arc<dyn RegistryClient>,
    hosts: RwLock<BTreeMap<String, WorkerHost>>,
    logger: Logger,
}

impl HostManager {
    pub fn new(registry: Arc<dyn RegistryClient>, logger: Logger) -> Self {
        Self {
            registry,
            hosts: RwLock::new(BTreeMap::new()),
            logger,
        }
    }

    /// Reload the directory from the registry
    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let children = self.registry.children(WORKERS_PATH).await?;
        let mut hosts = BTreeMap::new();
        for (name, payload) in children {
            match serde_json::from_str::<WorkerHeartbeat>(&payload) {
                Ok(beat) => {
                    hosts.insert(
                        name.clone(),
                        WorkerHost {
                            host: name,
                            address: beat.address,
                            groups: beat.groups,
                            running: beat.running,
                            capacity: beat.capacity,
                        },
                    );
                }
                Err(e) => {
                    warn!(self.logger, "Ignoring malformed worker heartbeat";
                        "host" => &name,
                        "error" => %e
                    );
                }
            }
        }
        *self.hosts.write().await = hosts;
        Ok(())
    }

    /// Live workers serving `group`, ordered by host name
    pub async fn candidates(&self, group: &str) -> Vec<WorkerHost> {
        self.hosts
            .read()
            .await
            .values()
            .filter(|host| host.serves(group))
            .cloned()
            .collect()
    }

    pub async fn get(&self, host: &str) -> Option<WorkerHost> {
        self.hosts.read().await.get(host).cloned()
    }

    pub async fn is_alive(&self, host: &str) -> bool {
        self.hosts.read().await.contains_key(host)
    }

    pub async fn live_hosts(&self) -> Vec<String> {
        self.hosts.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{worker_path, InMemoryCoordinator};

    fn beat(groups: &[&str], running: usize) -> String {
        serde_json::to_string(&WorkerHeartbeat {
            address: "inproc://w".to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            running,
            capacity: 4,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_candidates_filter_by_group() {
        let coordinator = InMemoryCoordinator::new();
        let w1 = coordinator.connect("w1").await;
        let w2 = coordinator.connect("w2").await;
        w1.register_ephemeral(&worker_path("w1"), beat(&["default"], 0))
            .await
            .unwrap();
        w2.register_ephemeral(&worker_path("w2"), beat(&["default", "gpu"], 3))
            .await
            .unwrap();
        w2.register_ephemeral(&worker_path("broken"), "not json".to_string())
            .await
            .unwrap();

        let master = Arc::new(coordinator.connect("m1").await);
        let manager = HostManager::new(master, Logger::root(slog::Discard, slog::o!()));
        manager.refresh().await.unwrap();

        assert_eq!(manager.candidates("default").await.len(), 2);
        let gpu = manager.candidates("gpu").await;
        assert_eq!(gpu.len(), 1);
        assert_eq!(gpu[0].host, "w2");
        assert!(gpu[0].has_free_slot());
        assert!(manager.candidates("etl").await.is_empty());

        coordinator.expire_session(w1.session_id()).await;
        manager.refresh().await.unwrap();
        assert!(!manager.is_alive("w1").await);
        assert_eq!(manager.live_hosts().await, vec!["w2".to_string()]);
    }
}
