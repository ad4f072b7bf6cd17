use crate::config::DispatchConfig;
use crate::dispatch::host_manager::{HostManager, WorkerHost};
use crate::dispatch::logic::LogicTaskRegistry;
use crate::dispatch::selector::{selector_for, HostSelector};
use crate::dispatch::DispatchError;
use crate::model::TaskType;
use crate::transport::{DispatchRequest, RejectReason, Transport, WireMessage};
use slog::{debug, info, warn, Logger};
use std::collections::HashSet;
use std::sync::Arc;

/// Host that accepted the dispatch, or why none did
pub type DispatchOutcome = Result<String, DispatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Runs inside the owning master's loop
    Logic,
    /// Shipped to a worker
    Remote,
}

/// Routes runnable tasks to a logic executor or a worker
pub struct TaskDispatcher {
    logic: Arc<LogicTaskRegistry>,
    hosts: Arc<HostManager>,
    transport: Arc<dyn Transport>,
    config: DispatchConfig,
    selector: Arc<dyn HostSelector>,
    logger: Logger,
}

impl TaskDispatcher {
    pub fn new(
        logic: Arc<LogicTaskRegistry>,
        hosts: Arc<HostManager>,
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
        logger: Logger,
    ) -> Self {
        let selector = selector_for(config.selector);
        Self {
            logic,
            hosts,
            transport,
            config,
            selector,
            logger,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn HostSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn classify(&self, task_type: &TaskType) -> TaskKind {
        if self.logic.contains(task_type) {
            TaskKind::Logic
        } else {
            TaskKind::Remote
        }
    }

    pub fn logic(&self) -> &Arc<LogicTaskRegistry> {
        &self.logic
    }

    pub fn hosts(&self) -> &Arc<HostManager> {
        &self.hosts
    }

    /// Ship one attempt to a worker of `worker_group`
    ///
    /// Hosts that fail are excluded for the rest of this call; once every
    /// candidate has failed the full candidate list is used again.
    pub async fn dispatch(&self, request: DispatchRequest, worker_group: &str) -> DispatchOutcome {
        self.hosts.refresh().await?;
        let candidates = self.hosts.candidates(worker_group).await;
        if candidates.is_empty() {
            warn!(self.logger, "No suitable worker";
                "task_instance_id" => &request.task_instance_id,
                "worker_group" => worker_group
            );
            return Err(DispatchError::NoSuitableWorker {
                group: worker_group.to_string(),
            });
        }

        let key = request.key();
        let max_attempts = self.config.max_attempts.max(1);
        let mut failed: HashSet<String> = HashSet::new();
        let mut last_error = String::new();
        let mut all_busy = true;

        for attempt in 1..=max_attempts {
            let remaining: Vec<WorkerHost> = candidates
                .iter()
                .filter(|host| !failed.contains(&host.host))
                .cloned()
                .collect();
            let pool = if remaining.is_empty() { &candidates } else { &remaining };
            let Some(target) = self.selector.select(pool) else {
                break;
            };

            self.transport.add_peer(&target.host, target.address.clone()).await;
            debug!(self.logger, "Sending dispatch";
                "task_instance_id" => &request.task_instance_id,
                "attempt" => request.attempt,
                "host" => &target.host,
                "try" => attempt
            );

            match self
                .transport
                .send_message(&target.host, WireMessage::Dispatch(request.clone()))
                .await
            {
                Ok(reply) if reply.acknowledges(&key) => {
                    info!(self.logger, "Task dispatched";
                        "task_instance_id" => &request.task_instance_id,
                        "attempt" => request.attempt,
                        "host" => &target.host
                    );
                    return Ok(target.host.clone());
                }
                Ok(WireMessage::Reject(reject)) if reject.reason == RejectReason::Busy => {
                    last_error = format!("worker {} is busy", target.host);
                }
                Ok(other) => {
                    all_busy = false;
                    last_error = format!("unexpected {} reply from {}", other.kind(), target.host);
                }
                Err(e) => {
                    all_busy = false;
                    last_error = e.to_string();
                }
            }
            warn!(self.logger, "Dispatch attempt failed";
                "task_instance_id" => &request.task_instance_id,
                "host" => &target.host,
                "error" => &last_error
            );
            failed.insert(target.host.clone());
        }

        if all_busy && candidates.len() == 1 {
            return Err(DispatchError::Busy {
                host: candidates[0].host.clone(),
            });
        }
        Err(DispatchError::SendFailed {
            attempts: max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::host_manager::WorkerHeartbeat;
    use crate::registry::{worker_path, InMemoryCoordinator, RegistryClient};
    use crate::transport::{
        in_process_address, Envelope, InProcessMessageSender, InProcessServer, MessageHandler,
        TransportError, TransportLayer,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWorker {
        accept: bool,
        seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MessageHandler for CountingWorker {
        async fn handle(&self, envelope: Envelope) -> Result<WireMessage, TransportError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            let key = envelope.message.correlation_key();
            if self.accept {
                Ok(WireMessage::ack(key.unwrap()))
            } else {
                Ok(WireMessage::reject(key, RejectReason::Busy))
            }
        }
    }

    fn request() -> DispatchRequest {
        DispatchRequest {
            workflow_instance_id: "wf".to_string(),
            task_instance_id: "t1".to_string(),
            attempt: 1,
            task_code: "a".to_string(),
            task_type: TaskType::shell(),
            params: serde_json::json!({"command": "true"}),
            variables: Default::default(),
            timeout_ms: None,
            master_host: "m1".to_string(),
        }
    }

    async fn register(coordinator: &Arc<InMemoryCoordinator>, host: &str) -> Box<dyn RegistryClient> {
        let session = coordinator.connect(host).await;
        let beat = WorkerHeartbeat {
            address: in_process_address(host),
            groups: vec!["default".to_string()],
            running: 0,
            capacity: 1,
        };
        session
            .register_ephemeral(&worker_path(host), serde_json::to_string(&beat).unwrap())
            .await
            .unwrap();
        Box::new(session)
    }

    async fn dispatcher(coordinator: &Arc<InMemoryCoordinator>, server: Arc<InProcessServer>) -> TaskDispatcher {
        let logger = Logger::root(slog::Discard, slog::o!());
        let registry = Arc::new(coordinator.connect("m1").await);
        let hosts = Arc::new(HostManager::new(registry, logger.clone()));
        let transport = Arc::new(TransportLayer::new("m1", Arc::new(InProcessMessageSender::new(server))));
        TaskDispatcher::new(
            Arc::new(LogicTaskRegistry::with_defaults()),
            hosts,
            transport,
            DispatchConfig::default().with_max_attempts(3),
            logger,
        )
    }

    #[tokio::test]
    async fn test_classify_by_logic_table() {
        let coordinator = InMemoryCoordinator::new();
        let d = dispatcher(&coordinator, Arc::new(InProcessServer::new())).await;
        assert_eq!(d.classify(&TaskType::conditions()), TaskKind::Logic);
        assert_eq!(d.classify(&TaskType::new("sub_workflow")), TaskKind::Logic);
        assert_eq!(d.classify(&TaskType::shell()), TaskKind::Remote);
        assert_eq!(d.classify(&TaskType::new("SPARK")), TaskKind::Remote);
    }

    #[tokio::test]
    async fn test_busy_worker_is_skipped() {
        let coordinator = InMemoryCoordinator::new();
        let server = Arc::new(InProcessServer::new());
        let busy = Arc::new(CountingWorker { accept: false, seen: AtomicUsize::new(0) });
        let free = Arc::new(CountingWorker { accept: true, seen: AtomicUsize::new(0) });
        server.register_node("w1", busy.clone()).await;
        server.register_node("w2", free.clone()).await;
        let _w1 = register(&coordinator, "w1").await;
        let _w2 = register(&coordinator, "w2").await;

        let d = dispatcher(&coordinator, server).await;
        for _ in 0..2 {
            assert_eq!(d.dispatch(request(), "default").await.unwrap(), "w2");
        }
        assert_eq!(free.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_only_worker_exhausts_attempts() {
        let coordinator = InMemoryCoordinator::new();
        let server = Arc::new(InProcessServer::new());
        let _w1 = register(&coordinator, "w1").await;

        let d = dispatcher(&coordinator, server).await;
        match d.dispatch(request(), "default").await {
            Err(DispatchError::SendFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected SendFailed, got {:?}", other),
        }
        assert!(matches!(
            d.dispatch(request(), "gpu").await,
            Err(DispatchError::NoSuitableWorker { .. })
        ));
    }

    #[tokio::test]
    async fn test_single_busy_worker_reports_busy() {
        let coordinator = InMemoryCoordinator::new();
        let server = Arc::new(InProcessServer::new());
        let busy = Arc::new(CountingWorker { accept: false, seen: AtomicUsize::new(0) });
        server.register_node("w1", busy.clone()).await;
        let _w1 = register(&coordinator, "w1").await;

        let d = dispatcher(&coordinator, server).await;
        assert!(matches!(
            d.dispatch(request(), "default").await,
            Err(DispatchError::Busy { .. })
        ));
        assert_eq!(busy.seen.load(Ordering::SeqCst), 3);
    }
}
