//! Master runtime: owns workflow instances and routes frames to their loops

use crate::config::MasterConfig;
use crate::dispatch::logic::ChildLauncher;
use crate::dispatch::{HostManager, LogicTaskRegistry, TaskDispatcher};
use crate::engine::catalog::DefinitionCatalog;
use crate::engine::error::EngineError;
use crate::engine::event::{AckHandle, ControlReply, EngineEvent, LifecycleEvent};
use crate::engine::event_loop::{spawn_loop, LoopContext, LoopStart};
use crate::engine::ownership::WorkflowOwnership;
use crate::engine::repository::{InstanceSnapshot, WorkflowHandle, WorkflowRepository};
use crate::event_bus::{wait_for, EventBus};
use crate::model::{DagGraph, ParentLink, WorkflowDefinition, WorkflowInstance, WorkflowState};
use crate::registry::{
    master_path, MasterPresence, RegistryClient, RegistryError, RegistryEvent, MASTERS_PATH, WORKERS_PATH,
};
use crate::store::MetadataStore;
use crate::transport::{
    CorrelationKey, Envelope, MessageHandler, RejectReason, TaskStateQuery, TaskStateReply, Transport,
    TransportError, WireMessage,
};
use crate::worker::{DeliveryTarget, ReliableEventSender};
use slog::{debug, error, info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Where a frame for a workflow instance should go
pub enum Route {
    /// Owned here; the loop is running
    Loop(WorkflowHandle),
    /// The instance already reached a final state
    Finished(WorkflowState),
    /// Another master holds the ownership lock
    NotOwner(String),
    /// No row for the instance exists
    Unknown,
}

pub struct MasterRuntime {
    host: String,
    address: String,
    request_timeout: Duration,
    orphan_scan_interval: Duration,
    registry: Arc<dyn RegistryClient>,
    catalog: DefinitionCatalog,
    ctx: Arc<LoopContext>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
    logger: Logger,
}

/// Starts SUB_WORKFLOW children on the master that owns the parent
struct RuntimeLauncher(Weak<MasterRuntime>);

#[async_trait::async_trait]
impl ChildLauncher for RuntimeLauncher {
    async fn launch_child(
        &self,
        definition_code: &str,
        version: Option<u32>,
        variables: HashMap<String, String>,
        parent: ParentLink,
    ) -> Result<String, EngineError> {
        let runtime = self.0.upgrade().ok_or(EngineError::ShutDown)?;
        runtime.launch(definition_code, version, variables, Some(parent)).await
    }
}

impl MasterRuntime {
    pub fn new(
        config: &MasterConfig,
        registry: Arc<dyn RegistryClient>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn MetadataStore>,
        logic: Arc<LogicTaskRegistry>,
        logger: Logger,
    ) -> Arc<Self> {
        let logger = logger.new(o!("master" => config.host.clone()));
        let hosts = Arc::new(HostManager::new(
            registry.clone(),
            logger.new(o!("component" => "host_manager")),
        ));
        let dispatcher = TaskDispatcher::new(
            logic,
            hosts,
            transport.clone(),
            config.dispatch.clone(),
            logger.new(o!("component" => "dispatcher")),
        );
        let events = Arc::new(EventBus::default());
        let kills = Arc::new(
            ReliableEventSender::new(
                registry.clone(),
                transport,
                config.delivery.clone(),
                logger.new(o!("component" => "kill_delivery")),
            )
            .with_alerts(events.clone()),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);

        Arc::new_cyclic(|weak: &Weak<MasterRuntime>| {
            let ctx = Arc::new(LoopContext {
                host: config.host.clone(),
                ownership: WorkflowOwnership::new(registry.clone(), logger.new(o!("component" => "ownership"))),
                store,
                dispatcher: Arc::new(dispatcher),
                kills,
                events,
                repository: WorkflowRepository::new(),
                launcher: Arc::new(RuntimeLauncher(weak.clone())),
                shutdown: shutdown_rx,
                logger: logger.clone(),
            });
            Self {
                host: config.host.clone(),
                address: config.advertise_url(),
                request_timeout: config.request_timeout(),
                orphan_scan_interval: config.failover.orphan_scan_interval(),
                registry,
                catalog: DefinitionCatalog::new(),
                ctx,
                shutdown,
                background: Mutex::new(Vec::new()),
                logger,
            }
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn repository(&self) -> &WorkflowRepository {
        &self.ctx.repository
    }

    pub fn kills(&self) -> &Arc<ReliableEventSender> {
        &self.ctx.kills
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    /// Validate and publish a workflow definition
    pub async fn register_definition(&self, definition: WorkflowDefinition) -> Result<Arc<DagGraph>, EngineError> {
        let graph = self.catalog.register(definition).await?;
        info!(self.logger, "Definition registered";
            "code" => &graph.definition().code,
            "version" => graph.definition().version,
            "tasks" => graph.len()
        );
        Ok(graph)
    }

    /// Create and start an instance; `None` version runs the latest definition
    pub async fn start_workflow(
        &self,
        definition_code: &str,
        version: Option<u32>,
        variables: HashMap<String, String>,
    ) -> Result<String, EngineError> {
        self.launch(definition_code, version, variables, None).await
    }

    async fn launch(
        &self,
        definition_code: &str,
        version: Option<u32>,
        variables: HashMap<String, String>,
        parent: Option<ParentLink>,
    ) -> Result<String, EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        let graph = self.catalog.get(definition_code, version).await?;
        let definition = graph.definition();

        let mut pool = definition.global_params.clone();
        pool.extend(variables);
        let mut workflow = WorkflowInstance::new(&definition.code, definition.version, pool);
        workflow.parent = parent;
        let id = workflow.id.clone();

        if !self.ctx.ownership.acquire(&id).await? {
            return Err(EngineError::NotOwner {
                workflow_instance_id: id,
                host: self.host.clone(),
            });
        }
        self.ctx.store.save_workflow(&workflow).await?;
        info!(self.logger, "Workflow instance created";
            "workflow_instance_id" => &id,
            "definition_code" => &definition.code,
            "definition_version" => definition.version,
            "parent" => workflow.parent.as_ref().map(|p| p.workflow_instance_id.as_str()).unwrap_or("-")
        );
        spawn_loop(self.ctx.clone(), graph.clone(), workflow, Vec::new(), LoopStart::Fresh).await;
        Ok(id)
    }

    pub async fn pause(&self, workflow_instance_id: &str) -> Result<(), EngineError> {
        self.control(workflow_instance_id, |reply| LifecycleEvent::Pause { reply }).await
    }

    pub async fn resume(&self, workflow_instance_id: &str) -> Result<(), EngineError> {
        self.control(workflow_instance_id, |reply| LifecycleEvent::Resume { reply }).await
    }

    pub async fn stop(&self, workflow_instance_id: &str) -> Result<(), EngineError> {
        self.control(workflow_instance_id, |reply| LifecycleEvent::Stop { reply }).await
    }

    /// Cancel one task instance; killing a finished task is a no-op
    pub async fn kill_task(&self, workflow_instance_id: &str, task_instance_id: &str) -> Result<(), EngineError> {
        let task_instance_id = task_instance_id.to_string();
        self.control(workflow_instance_id, move |reply| LifecycleEvent::KillTask {
            task_instance_id,
            reply,
        })
        .await
    }

    async fn control<F>(&self, workflow_instance_id: &str, make: F) -> Result<(), EngineError>
    where
        F: FnOnce(ControlReply) -> LifecycleEvent,
    {
        let handle = match self.route(workflow_instance_id).await? {
            Route::Loop(handle) => handle,
            Route::Finished(state) => {
                return Err(EngineError::invalid_transition("workflow", state, "a new state"));
            }
            Route::NotOwner(_) => {
                return Err(EngineError::NotOwner {
                    workflow_instance_id: workflow_instance_id.to_string(),
                    host: self.host.clone(),
                });
            }
            Route::Unknown => return Err(EngineError::WorkflowNotFound(workflow_instance_id.to_string())),
        };

        let closed = || EngineError::LoopClosed(workflow_instance_id.to_string());
        let (reply, rx) = oneshot::channel();
        handle.send(make(reply)).map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }

    /// Current rows of an instance, from its loop or from the store
    pub async fn workflow_status(&self, workflow_instance_id: &str) -> Result<InstanceSnapshot, EngineError> {
        if let Some(handle) = self.ctx.repository.get(workflow_instance_id).await {
            return Ok(handle.snapshot());
        }
        let workflow = self
            .ctx
            .store
            .load_workflow(workflow_instance_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_instance_id.to_string()))?;
        let tasks = self.ctx.store.load_tasks(workflow_instance_id).await?;
        Ok(InstanceSnapshot { workflow, tasks })
    }

    /// Wait until the instance reaches SUCCESS, FAILURE or STOP
    pub async fn wait_for_terminal(
        &self,
        workflow_instance_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowState, EngineError> {
        let mut rx = self.subscribe_events();
        let state = self.workflow_status(workflow_instance_id).await?.workflow.state;
        if state.is_terminal() {
            return Ok(state);
        }

        let finished = wait_for(&mut rx, timeout, |event| match event {
            EngineEvent::WorkflowFinished {
                workflow_instance_id: id,
                state,
            } if id == workflow_instance_id => Some(*state),
            _ => None,
        })
        .await;
        if let Some(state) = finished {
            return Ok(state);
        }

        // Another master may have finished it
        let state = self.workflow_status(workflow_instance_id).await?.workflow.state;
        if state.is_terminal() {
            Ok(state)
        } else {
            Err(EngineError::Timeout(workflow_instance_id.to_string()))
        }
    }

    /// Resolve the loop responsible for an instance, adopting it if nobody owns it
    pub async fn route(&self, workflow_instance_id: &str) -> Result<Route, EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::ShutDown);
        }
        if let Some(handle) = self.ctx.repository.get(workflow_instance_id).await {
            return Ok(Route::Loop(handle));
        }
        let Some(workflow) = self.ctx.store.load_workflow(workflow_instance_id).await? else {
            return Ok(Route::Unknown);
        };
        if workflow.state.is_terminal() {
            return Ok(Route::Finished(workflow.state));
        }

        if !self.ctx.ownership.holds(workflow_instance_id).await? {
            if let Some(holder) = self.ctx.ownership.owner_of(workflow_instance_id).await? {
                return Ok(Route::NotOwner(holder));
            }
            if !self.ctx.ownership.acquire(workflow_instance_id).await? {
                let holder = self.ctx.ownership.owner_of(workflow_instance_id).await?;
                return Ok(Route::NotOwner(holder.unwrap_or_default()));
            }
        }

        match self.adopt(workflow).await? {
            Some(handle) => Ok(Route::Loop(handle)),
            None => Ok(self
                .ctx
                .repository
                .get(workflow_instance_id)
                .await
                .map(Route::Loop)
                .unwrap_or(Route::Unknown)),
        }
    }

    /// Rebuild the loop of an instance whose lock this master holds
    async fn adopt(&self, workflow: WorkflowInstance) -> Result<Option<WorkflowHandle>, EngineError> {
        let graph = self
            .catalog
            .get(&workflow.definition_code, Some(workflow.definition_version))
            .await?;
        let tasks = self.ctx.store.load_tasks(&workflow.id).await?;
        info!(self.logger, "Adopting workflow instance";
            "workflow_instance_id" => &workflow.id,
            "state" => %workflow.state,
            "tasks" => tasks.len()
        );
        Ok(spawn_loop(self.ctx.clone(), graph, workflow, tasks, LoopStart::Recovered).await)
    }

    /// Take over unfinished instances whose owner is gone; returns how many were adopted
    pub async fn recover_orphans(&self) -> Result<usize, EngineError> {
        if self.is_shut_down() {
            return Ok(0);
        }
        let mut adopted = 0;
        for workflow in self.ctx.store.list_unfinished_workflows().await? {
            let id = workflow.id.clone();
            if self.ctx.repository.contains(&id).await {
                continue;
            }
            // Locks of an earlier session of this host are skipped until it expires
            if !self.ctx.ownership.holds(&id).await? && !self.ctx.ownership.acquire(&id).await? {
                continue;
            }

            match self.adopt(workflow).await {
                Ok(Some(_)) => adopted += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(self.logger, "Cannot adopt workflow instance; releasing it";
                        "workflow_instance_id" => &id,
                        "error" => %e
                    );
                    self.ctx.ownership.release(&id).await;
                }
            }
        }
        if adopted > 0 {
            info!(self.logger, "Recovered orphaned workflow instances"; "count" => adopted);
        }
        Ok(adopted)
    }

    /// Publish this master under `/dagrun/masters`
    pub async fn register_presence(&self) -> Result<(), RegistryError> {
        let presence = MasterPresence {
            address: self.address.clone(),
        };
        let payload =
            serde_json::to_string(&presence).map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        self.registry.register_ephemeral(&master_path(&self.host), payload).await
    }

    pub async fn unregister_presence(&self) -> Result<(), RegistryError> {
        self.registry.unregister(&master_path(&self.host)).await
    }

    /// Start liveness watches, the orphan scan and kill redelivery
    pub async fn spawn_background(self: &Arc<Self>) -> Result<(), RegistryError> {
        let mut tasks = Vec::new();

        let mut masters = self.registry.watch_children(MASTERS_PATH).await?;
        let runtime = self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match masters.recv().await {
                    Ok(RegistryEvent::ChildRemoved { name, .. }) => {
                        info!(runtime.logger, "Master left; scanning for orphaned instances"; "host" => &name);
                        runtime.scan_orphans().await;
                    }
                    Ok(RegistryEvent::ChildUpserted { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => runtime.scan_orphans().await,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let mut workers = self.registry.watch_children(WORKERS_PATH).await?;
        let runtime = self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match workers.recv().await {
                    Ok(RegistryEvent::ChildRemoved { name, .. }) => runtime.on_worker_lost(&name).await,
                    Ok(RegistryEvent::ChildUpserted { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let runtime = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runtime.orphan_scan_interval);
            loop {
                ticker.tick().await;
                runtime.scan_orphans().await;
            }
        }));

        tasks.push(self.ctx.kills.spawn_retry_loop());
        self.background.lock().await.extend(tasks);
        Ok(())
    }

    async fn scan_orphans(&self) {
        if let Err(e) = self.recover_orphans().await {
            error!(self.logger, "Orphan scan failed"; "error" => %e);
        }
    }

    async fn on_worker_lost(&self, host: &str) {
        warn!(self.logger, "Worker left the registry"; "host" => host);
        if let Err(e) = self.ctx.dispatcher.hosts().refresh().await {
            debug!(self.logger, "Host refresh failed"; "error" => %e);
        }
        let target = DeliveryTarget::Worker(host.to_string());
        let dropped = self.ctx.kills.discard_where(|_, pending| pending == &target).await;
        if dropped > 0 {
            debug!(self.logger, "Dropped kills for lost worker"; "host" => host, "count" => dropped);
        }
        for handle in self.ctx.repository.handles().await {
            let _ = handle.send(LifecycleEvent::WorkerLost { host: host.to_string() });
        }
    }

    /// Stop every loop and background task; locks stay with the session
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
        info!(self.logger, "Master runtime shut down");
    }
}

/// Inbound frame handler of a master
pub struct MasterMessageHandler {
    runtime: Arc<MasterRuntime>,
}

impl MasterMessageHandler {
    pub fn new(runtime: Arc<MasterRuntime>) -> Self {
        Self { runtime }
    }

    /// Hand a worker event to the owning loop and wait until it was applied
    async fn forward<F>(&self, workflow_instance_id: &str, key: CorrelationKey, make: F) -> WireMessage
    where
        F: FnOnce(AckHandle) -> LifecycleEvent,
    {
        let not_owner = |key: CorrelationKey| WireMessage::reject(Some(key), RejectReason::NotOwner);
        let handle = match self.runtime.route(workflow_instance_id).await {
            Ok(Route::Loop(handle)) => handle,
            // Late events for finished or unknown instances are settled
            Ok(Route::Finished(_)) | Ok(Route::Unknown) => return WireMessage::ack(key),
            Ok(Route::NotOwner(_)) | Err(EngineError::ShutDown) => return not_owner(key),
            Err(e) => {
                warn!(self.runtime.logger, "Cannot route event"; "key" => %key, "error" => %e);
                return WireMessage::reject(Some(key), RejectReason::Invalid(e.to_string()));
            }
        };

        let (ack, rx) = AckHandle::new(key.clone());
        if handle.send(make(ack)).is_err() {
            return not_owner(key);
        }
        match tokio::time::timeout(self.runtime.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            // The loop dropped the event without answering
            Ok(Err(_)) => not_owner(key),
            Err(_) => WireMessage::reject(
                Some(key),
                RejectReason::Invalid("timed out waiting for the workflow loop".to_string()),
            ),
        }
    }

    async fn state_reply(&self, query: TaskStateQuery) -> WireMessage {
        let task = match self.runtime.workflow_status(&query.workflow_instance_id).await {
            Ok(snapshot) => snapshot.task(&query.task_instance_id).cloned(),
            Err(_) => None,
        };
        WireMessage::StateReply(TaskStateReply {
            task_instance_id: query.task_instance_id,
            state: task.as_ref().map(|t| t.state),
            attempt: task.as_ref().map(|t| t.attempt()),
            host: task.and_then(|t| t.host),
        })
    }
}

#[async_trait::async_trait]
impl MessageHandler for MasterMessageHandler {
    async fn handle(&self, envelope: Envelope) -> Result<WireMessage, TransportError> {
        let reply = match envelope.message {
            WireMessage::Running(event) => {
                let id = event.workflow_instance_id.clone();
                let key = event.key();
                self.forward(&id, key, |ack| LifecycleEvent::TaskRunning { event, ack })
                    .await
            }
            WireMessage::Result(event) => {
                let id = event.workflow_instance_id.clone();
                let key = event.key();
                self.forward(&id, key, |ack| LifecycleEvent::TaskResult { event, ack })
                    .await
            }
            WireMessage::StateQuery(query) => self.state_reply(query).await,
            other => {
                debug!(self.runtime.logger, "Unexpected frame"; "kind" => other.kind(), "from" => &envelope.from);
                WireMessage::reject(
                    other.correlation_key(),
                    RejectReason::Invalid(format!("master does not accept {}", other.kind())),
                )
            }
        };
        Ok(reply)
    }
}
