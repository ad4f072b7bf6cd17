use crate::engine::error::EngineError;
use crate::registry::{workflow_lock_path, RegistryClient, RegistryError};
use slog::{debug, warn, Logger};
use std::sync::Arc;

/// Binds workflow instances to this master through registry locks
///
/// Exactly one master holds `/dagrun/locks/workflows/<id>` at a time; the
/// lock disappears with the holder's session, which is what lets another
/// master take over.
#[derive(Clone)]
pub struct WorkflowOwnership {
    registry: Arc<dyn RegistryClient>,
    logger: Logger,
}

impl WorkflowOwnership {
    pub fn new(registry: Arc<dyn RegistryClient>, logger: Logger) -> Self {
        Self { registry, logger }
    }

    pub fn host(&self) -> &str {
        self.registry.identity()
    }

    /// Try to take ownership; false if another master holds it
    pub async fn acquire(&self, workflow_instance_id: &str) -> Result<bool, EngineError> {
        let acquired = self
            .registry
            .acquire_lock(&workflow_lock_path(workflow_instance_id))
            .await?;
        debug!(self.logger, "Ownership acquire";
            "workflow_instance_id" => workflow_instance_id,
            "acquired" => acquired
        );
        Ok(acquired)
    }

    pub async fn release(&self, workflow_instance_id: &str) {
        match self
            .registry
            .release_lock(&workflow_lock_path(workflow_instance_id))
            .await
        {
            Ok(()) | Err(RegistryError::LockNotHeld { .. }) => {}
            Err(e) => {
                warn!(self.logger, "Failed to release ownership";
                    "workflow_instance_id" => workflow_instance_id,
                    "error" => %e
                );
            }
        }
    }

    /// Master currently holding the lock
    pub async fn owner_of(&self, workflow_instance_id: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .registry
            .lock_holder(&workflow_lock_path(workflow_instance_id))
            .await?)
    }

    /// True only if this session holds the lock
    ///
    /// A lock left behind by an earlier session of the same host is not ours:
    /// it goes away when that session expires.
    pub async fn holds(&self, workflow_instance_id: &str) -> Result<bool, EngineError> {
        Ok(self
            .registry
            .holds_lock(&workflow_lock_path(workflow_instance_id))
            .await?)
    }

    /// Fails unless this session still holds the lock
    pub async fn verify(&self, workflow_instance_id: &str) -> Result<(), EngineError> {
        let not_owner = || EngineError::NotOwner {
            workflow_instance_id: workflow_instance_id.to_string(),
            host: self.host().to_string(),
        };
        match self.holds(workflow_instance_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(not_owner()),
            Err(EngineError::Registry(RegistryError::SessionExpired { .. })) => Err(not_owner()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryCoordinator;

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn test_verify_follows_lock_holder() {
        let coordinator = InMemoryCoordinator::new();
        let a = Arc::new(coordinator.connect("m1").await);
        let b = Arc::new(coordinator.connect("m2").await);
        let own_a = WorkflowOwnership::new(a.clone(), logger());
        let own_b = WorkflowOwnership::new(b, logger());

        assert!(own_a.acquire("wf").await.unwrap());
        assert!(!own_b.acquire("wf").await.unwrap());
        own_a.verify("wf").await.unwrap();
        assert!(matches!(own_b.verify("wf").await, Err(EngineError::NotOwner { .. })));

        coordinator.expire_session(a.session_id()).await;
        assert!(matches!(own_a.verify("wf").await, Err(EngineError::NotOwner { .. })));
        assert!(own_b.acquire("wf").await.unwrap());
        assert_eq!(own_b.owner_of("wf").await.unwrap(), Some("m2".to_string()));
    }

    #[tokio::test]
    async fn test_restarted_host_does_not_inherit_old_session_locks() {
        let coordinator = InMemoryCoordinator::new();
        let old = Arc::new(coordinator.connect("m1").await);
        let restarted = Arc::new(coordinator.connect("m1").await);
        let own_old = WorkflowOwnership::new(old.clone(), logger());
        let own_new = WorkflowOwnership::new(restarted, logger());

        assert!(own_old.acquire("wf").await.unwrap());
        assert_eq!(own_new.owner_of("wf").await.unwrap(), Some("m1".to_string()));
        assert!(!own_new.holds("wf").await.unwrap());
        assert!(matches!(own_new.verify("wf").await, Err(EngineError::NotOwner { .. })));
        assert!(!own_new.acquire("wf").await.unwrap());

        coordinator.expire_session(old.session_id()).await;
        assert!(own_new.acquire("wf").await.unwrap());
        own_new.verify("wf").await.unwrap();
        assert_eq!(coordinator.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_release_is_quiet_when_not_held() {
        let coordinator = InMemoryCoordinator::new();
        let a = Arc::new(coordinator.connect("m1").await);
        let own = WorkflowOwnership::new(a, logger());
        own.release("never-taken").await;
        assert!(own.acquire("never-taken").await.unwrap());
        own.release("never-taken").await;
        assert_eq!(own.owner_of("never-taken").await.unwrap(), None);
    }
}
