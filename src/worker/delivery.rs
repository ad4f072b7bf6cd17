//! At-least-once delivery of lifecycle frames
//!
//! Every frame is cached under its correlation key until the receiver acks
//! it. One attempt is made immediately; a background loop resends whatever
//! is still pending every `retry_interval`. The target is re-resolved from
//! the registry on every attempt, so events follow a workflow to its new
//! owner after a failover.
//!
//! Ordering gate: a RESULT is never sent while the RUNNING of the same
//! attempt is still unacknowledged.

use crate::config::DeliveryConfig;
use crate::dispatch::WorkerHeartbeat;
use crate::engine::EngineEvent;
use crate::event_bus::EventBus;
use crate::registry::{master_path, worker_path, workflow_lock_path, MasterPresence, RegistryClient};
use crate::transport::{CorrelationKey, EventType, Transport, TransportError, WireMessage};
use slog::{crit, debug, warn, Logger};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// A worker host, resolved through its heartbeat node
    Worker(String),
    /// Whichever master holds the ownership lock of the workflow instance
    WorkflowOwner(String),
}

impl fmt::Display for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryTarget::Worker(host) => write!(f, "worker:{}", host),
            DeliveryTarget::WorkflowOwner(id) => write!(f, "owner-of:{}", id),
        }
    }
}

struct Pending {
    target: DeliveryTarget,
    message: WireMessage,
    attempts: u32,
    acked: Option<oneshot::Sender<()>>,
}

pub struct ReliableEventSender {
    registry: Arc<dyn RegistryClient>,
    transport: Arc<dyn Transport>,
    config: DeliveryConfig,
    pending: Mutex<BTreeMap<CorrelationKey, Pending>>,
    alerts: Arc<EventBus<EngineEvent>>,
    logger: Logger,
}

impl ReliableEventSender {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        transport: Arc<dyn Transport>,
        config: DeliveryConfig,
        logger: Logger,
    ) -> Self {
        Self {
            registry,
            transport,
            config,
            pending: Mutex::new(BTreeMap::new()),
            alerts: Arc::new(EventBus::default()),
            logger,
        }
    }

    /// Publish `DeliveryAlert`s on the node's own event bus
    pub fn with_alerts(mut self, alerts: Arc<EventBus<EngineEvent>>) -> Self {
        self.alerts = alerts;
        self
    }

    /// `DeliveryAlert` events for frames dropped at the attempt ceiling
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<EngineEvent> {
        self.alerts.subscribe()
    }

    /// Queue a frame and make the first attempt
    pub async fn send(&self, target: DeliveryTarget, message: WireMessage) -> Result<(), TransportError> {
        self.enqueue(target, message, None).await
    }

    /// Like `send`; the receiver completes when the frame is acknowledged and
    /// errors if the frame is given up or replaced
    pub async fn send_tracked(
        &self,
        target: DeliveryTarget,
        message: WireMessage,
    ) -> Result<oneshot::Receiver<()>, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(target, message, Some(tx)).await?;
        Ok(rx)
    }

    async fn enqueue(
        &self,
        target: DeliveryTarget,
        message: WireMessage,
        acked: Option<oneshot::Sender<()>>,
    ) -> Result<(), TransportError> {
        let key = message
            .correlation_key()
            .ok_or_else(|| TransportError::Handler(format!("{} frame has no correlation key", message.kind())))?;

        self.pending.lock().await.insert(
            key.clone(),
            Pending {
                target,
                message,
                attempts: 0,
                acked,
            },
        );

        if self.is_gated(&key).await {
            debug!(self.logger, "Holding result until running is acked"; "key" => %key);
            return Ok(());
        }
        if self.attempt(&key).await && key.event_type == EventType::Running {
            let result_key = CorrelationKey::new(&key.task_instance_id, key.attempt, EventType::Result);
            if self.is_pending(&result_key).await {
                self.attempt(&result_key).await;
            }
        }
        Ok(())
    }

    /// Resend everything pending, in key order; returns what is still pending
    pub async fn retry_pending(&self) -> usize {
        let keys: Vec<CorrelationKey> = self.pending.lock().await.keys().cloned().collect();
        for key in keys {
            if self.is_gated(&key).await {
                continue;
            }
            self.attempt(&key).await;
        }
        self.pending_count().await
    }

    pub fn spawn_retry_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let sender = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sender.config.retry_interval());
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sender.retry_pending().await;
            }
        })
    }

    /// Drop pending frames matching `predicate`; returns how many were dropped
    pub async fn discard_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CorrelationKey, &DeliveryTarget) -> bool,
    {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|key, entry| !predicate(key, &entry.target));
        before - pending.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_pending(&self, key: &CorrelationKey) -> bool {
        self.pending.lock().await.contains_key(key)
    }

    /// Host currently responsible for `target`, registered in the peer directory
    pub async fn resolve(&self, target: &DeliveryTarget) -> Result<String, String> {
        match target {
            DeliveryTarget::WorkflowOwner(workflow_instance_id) => {
                let holder = self
                    .registry
                    .lock_holder(&workflow_lock_path(workflow_instance_id))
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("workflow {} has no owner", workflow_instance_id))?;
                let payload = self
                    .registry
                    .get(&master_path(&holder))
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("master {} is not registered", holder))?;
                let presence: MasterPresence =
                    serde_json::from_str(&payload).map_err(|e| e.to_string())?;
                self.transport.add_peer(&holder, presence.address).await;
                Ok(holder)
            }
            DeliveryTarget::Worker(host) => {
                let payload = self
                    .registry
                    .get(&worker_path(host))
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("worker {} is not registered", host))?;
                let beat: WorkerHeartbeat = serde_json::from_str(&payload).map_err(|e| e.to_string())?;
                self.transport.add_peer(host, beat.address).await;
                Ok(host.clone())
            }
        }
    }

    async fn is_gated(&self, key: &CorrelationKey) -> bool {
        if key.event_type != EventType::Result {
            return false;
        }
        let running = CorrelationKey::new(&key.task_instance_id, key.attempt, EventType::Running);
        self.pending.lock().await.contains_key(&running)
    }

    /// One delivery attempt; true once the frame is acknowledged
    async fn attempt(&self, key: &CorrelationKey) -> bool {
        let (target, message, attempts) = {
            let mut pending = self.pending.lock().await;
            let Some(entry) = pending.get_mut(key) else {
                return true;
            };
            entry.attempts += 1;
            (entry.target.clone(), entry.message.clone(), entry.attempts)
        };

        let outcome = match self.resolve(&target).await {
            Ok(host) => self
                .transport
                .send_message(&host, message)
                .await
                .map_err(|e| e.to_string()),
            Err(reason) => Err(reason),
        };

        let reason = match outcome {
            Ok(reply) if reply.acknowledges(key) => {
                let settled = self.pending.lock().await.remove(key);
                if let Some(tx) = settled.and_then(|entry| entry.acked) {
                    let _ = tx.send(());
                }
                debug!(self.logger, "Frame acknowledged";
                    "key" => %key,
                    "target" => %target,
                    "attempts" => attempts
                );
                return true;
            }
            Ok(WireMessage::Reject(reject)) => format!("rejected: {:?}", reject.reason),
            Ok(other) => format!("unexpected {} reply", other.kind()),
            Err(reason) => reason,
        };

        warn!(self.logger, "Delivery attempt failed";
            "key" => %key,
            "target" => %target,
            "attempts" => attempts,
            "reason" => &reason
        );

        if let Some(max) = self.config.max_attempts {
            if attempts >= max && self.pending.lock().await.remove(key).is_some() {
                crit!(self.logger, "Giving up on frame after delivery ceiling";
                    "key" => %key,
                    "target" => %target,
                    "attempts" => attempts
                );
                self.alerts.publish(EngineEvent::DeliveryAlert {
                    key: key.clone(),
                    target: target.to_string(),
                    attempts,
                });
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryCoordinator;
    use crate::transport::{
        in_process_address, Envelope, InProcessMessageSender, InProcessServer, MessageHandler,
        RejectReason, ResultEvent, RunningEvent, TaskOutcome, TransportLayer,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Acks everything once `accepting` is set, records frame order
    struct FlakyMaster {
        accepting: AtomicBool,
        received: Mutex<Vec<EventType>>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for FlakyMaster {
        async fn handle(&self, envelope: Envelope) -> Result<WireMessage, TransportError> {
            let key = envelope.message.correlation_key().unwrap();
            if !self.accepting.load(Ordering::SeqCst) {
                return Ok(WireMessage::reject(Some(key), RejectReason::NotOwner));
            }
            self.received.lock().await.push(key.event_type);
            Ok(WireMessage::ack(key))
        }
    }

    fn running() -> WireMessage {
        WireMessage::Running(RunningEvent {
            workflow_instance_id: "wf".to_string(),
            task_instance_id: "t1".to_string(),
            attempt: 1,
            worker_host: "w1".to_string(),
            start_time: 0,
        })
    }

    fn result() -> WireMessage {
        WireMessage::Result(ResultEvent {
            workflow_instance_id: "wf".to_string(),
            task_instance_id: "t1".to_string(),
            attempt: 1,
            worker_host: "w1".to_string(),
            outcome: TaskOutcome::Success,
            output_vars: Default::default(),
            exit_code: Some(0),
            message: None,
            end_time: 1,
        })
    }

    async fn setup(accepting: bool, config: DeliveryConfig) -> (Arc<ReliableEventSender>, Arc<FlakyMaster>) {
        let coordinator = InMemoryCoordinator::new();
        let master_session = coordinator.connect("m1").await;
        master_session.acquire_lock(&workflow_lock_path("wf")).await.unwrap();
        let presence = MasterPresence { address: in_process_address("m1") };
        master_session
            .register_ephemeral(&master_path("m1"), serde_json::to_string(&presence).unwrap())
            .await
            .unwrap();

        let server = Arc::new(InProcessServer::new());
        let master = Arc::new(FlakyMaster {
            accepting: AtomicBool::new(accepting),
            received: Mutex::new(Vec::new()),
        });
        server.register_node("m1", master.clone()).await;

        let worker_session = Arc::new(coordinator.connect("w1").await);
        let transport = Arc::new(TransportLayer::new("w1", Arc::new(InProcessMessageSender::new(server))));
        let sender = ReliableEventSender::new(
            worker_session,
            transport,
            config,
            Logger::root(slog::Discard, slog::o!()),
        );
        (Arc::new(sender), master)
    }

    #[tokio::test]
    async fn test_immediate_delivery_clears_pending() {
        let (sender, master) = setup(true, DeliveryConfig::default()).await;
        sender.send(DeliveryTarget::WorkflowOwner("wf".to_string()), running()).await.unwrap();
        sender.send(DeliveryTarget::WorkflowOwner("wf".to_string()), result()).await.unwrap();
        assert_eq!(sender.pending_count().await, 0);
        assert_eq!(*master.received.lock().await, vec![EventType::Running, EventType::Result]);
    }

    #[tokio::test]
    async fn test_result_waits_for_running_ack() {
        let (sender, master) = setup(false, DeliveryConfig::default()).await;
        let target = DeliveryTarget::WorkflowOwner("wf".to_string());
        sender.send(target.clone(), running()).await.unwrap();
        sender.send(target, result()).await.unwrap();
        assert_eq!(sender.pending_count().await, 2);

        master.accepting.store(true, Ordering::SeqCst);
        assert_eq!(sender.retry_pending().await, 0);
        assert_eq!(*master.received.lock().await, vec![EventType::Running, EventType::Result]);
    }

    #[tokio::test]
    async fn test_ceiling_drops_and_alerts() {
        let config = DeliveryConfig::default().with_max_attempts(2);
        let (sender, _master) = setup(false, config).await;
        let mut alerts = sender.subscribe_alerts();

        sender.send(DeliveryTarget::WorkflowOwner("wf".to_string()), running()).await.unwrap();
        assert_eq!(sender.retry_pending().await, 0);

        match tokio::time::timeout(Duration::from_secs(1), alerts.recv()).await.unwrap().unwrap() {
            EngineEvent::DeliveryAlert { attempts, key, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(key.event_type, EventType::Running);
            }
            other => panic!("expected alert, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tracked_frame_completes_on_ack() {
        let (sender, master) = setup(false, DeliveryConfig::default()).await;
        let acked = sender
            .send_tracked(DeliveryTarget::WorkflowOwner("wf".to_string()), result())
            .await
            .unwrap();
        assert_eq!(sender.pending_count().await, 1);

        master.accepting.store(true, Ordering::SeqCst);
        sender.retry_pending().await;
        tokio::time::timeout(Duration::from_secs(1), acked).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_alerts_reach_shared_bus() {
        let config = DeliveryConfig::default().with_max_attempts(1);
        let (sender, _master) = setup(false, config).await;
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let sender = match Arc::try_unwrap(sender) {
            Ok(sender) => sender.with_alerts(bus),
            Err(_) => panic!("sender is shared"),
        };

        let acked = sender
            .send_tracked(DeliveryTarget::WorkflowOwner("wf".to_string()), running())
            .await
            .unwrap();
        assert!(acked.await.is_err(), "a dropped frame never completes");
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::DeliveryAlert { attempts: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_target_stays_pending() {
        let (sender, _master) = setup(true, DeliveryConfig::default()).await;
        sender
            .send(DeliveryTarget::WorkflowOwner("unowned".to_string()), running())
            .await
            .unwrap();
        sender.send(DeliveryTarget::Worker("ghost".to_string()), result()).await.unwrap();
        assert_eq!(sender.pending_count().await, 2);

        let dropped = sender
            .discard_where(|_, target| matches!(target, DeliveryTarget::Worker(host) if host == "ghost"))
            .await;
        assert_eq!(dropped, 1);
        assert_eq!(sender.pending_count().await, 1);
    }
}
