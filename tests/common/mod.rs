//! In-process cluster harness shared by the integration tests
#![allow(dead_code)]

use dagrun::config::{DeliveryConfig, DispatchConfig, FailoverConfig, MasterConfig, WorkerConfig};
use dagrun::dispatch::{ExecutorError, LogicTaskRegistry};
use dagrun::engine::{InstanceSnapshot, MasterMessageHandler, MasterRuntime};
use dagrun::logging::discard_logger;
use dagrun::model::{TaskDefinition, TaskInstance, TaskState, TaskType, WorkflowDefinition, WorkflowState};
use dagrun::registry::{InMemoryCoordinator, InMemoryRegistryClient, RegistryClient};
use dagrun::store::{InMemoryMetadataStore, MetadataStore};
use dagrun::transport::{
    in_process_address, DispatchRequest, Envelope, InProcessMessageSender, InProcessServer, MessageSender,
    ResultEvent, TaskOutcome, TransportError, TransportLayer, WireMessage,
};
use dagrun::worker::{
    ExecutionContext, ExecutionResult, TaskExecutor, TaskExecutorFactory, TaskExecutorRegistry,
    WorkerMessageHandler, WorkerRuntime,
};
use serde::Deserialize;
use slog::Logger;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub const SCRIPTED: &str = "SCRIPTED";
pub const WAIT: Duration = Duration::from_secs(15);

/// Every frame sent through a tapped transport, in send order
#[derive(Default)]
pub struct Tap {
    frames: Mutex<Vec<(String, WireMessage)>>,
}

impl Tap {
    fn record(&self, from: &str, message: &WireMessage) {
        if let Ok(mut frames) = self.frames.lock() {
            frames.push((from.to_string(), message.clone()));
        }
    }

    fn frames(&self) -> Vec<(String, WireMessage)> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    /// Dispatch sends for a task code, including failed sends and re-selections
    pub fn dispatches(&self, task_code: &str) -> Vec<DispatchRequest> {
        self.frames()
            .into_iter()
            .filter_map(|(_, message)| match message {
                WireMessage::Dispatch(req) if req.task_code == task_code => Some(req),
                _ => None,
            })
            .collect()
    }

    /// Dispatch sends originating from one master
    pub fn dispatches_from(&self, master: &str) -> usize {
        self.frames()
            .iter()
            .filter(|(from, message)| from == master && matches!(message, WireMessage::Dispatch(_)))
            .count()
    }

    pub fn results(&self, task_instance_id: &str) -> Vec<ResultEvent> {
        self.frames()
            .into_iter()
            .filter_map(|(_, message)| match message {
                WireMessage::Result(ev) if ev.task_instance_id == task_instance_id => Some(ev),
                _ => None,
            })
            .collect()
    }

    pub fn kills(&self, task_instance_id: &str) -> usize {
        self.frames()
            .iter()
            .filter(|(_, message)| matches!(message, WireMessage::Kill(k) if k.task_instance_id == task_instance_id))
            .count()
    }
}

/// Records each envelope, then hands it to the in-process network
pub struct TapSender {
    inner: InProcessMessageSender,
    tap: Arc<Tap>,
}

#[async_trait::async_trait]
impl MessageSender for TapSender {
    async fn send(&self, address: &str, envelope: Envelope) -> Result<WireMessage, TransportError> {
        self.tap.record(&envelope.from, &envelope.message);
        self.inner.send(address, envelope).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct ScriptedParams {
    /// Executions (counted per task code) that fail before one succeeds
    #[serde(default)]
    fail_times: u32,
    #[serde(default)]
    sleep_ms: u64,
    /// Only the first N executions sleep. None sleeps on every execution
    #[serde(default)]
    sleep_times: Option<u32>,
    #[serde(default)]
    vars: HashMap<String, String>,
}

/// Test task type whose behaviour is described by its params
#[derive(Default)]
pub struct ScriptedFactory {
    executions: Arc<Mutex<HashMap<String, u32>>>,
}

impl ScriptedFactory {
    pub fn executions(&self, task_code: &str) -> u32 {
        self.executions
            .lock()
            .map(|counts| counts.get(task_code).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl TaskExecutorFactory for ScriptedFactory {
    fn create(&self, request: &DispatchRequest) -> Result<Arc<dyn TaskExecutor>, ExecutorError> {
        let params: ScriptedParams = serde_json::from_value(request.params.clone())
            .map_err(|e| ExecutorError::invalid_params(SCRIPTED, e))?;
        Ok(Arc::new(ScriptedExecutor {
            params,
            executions: self.executions.clone(),
            kill: Notify::new(),
        }))
    }
}

struct ScriptedExecutor {
    params: ScriptedParams,
    executions: Arc<Mutex<HashMap<String, u32>>>,
    kill: Notify,
}

#[async_trait::async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutorError> {
        let n = {
            let mut counts = self.executions.lock().expect("executions lock");
            let n = counts.entry(ctx.request.task_code.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let sleeps = self.params.sleep_ms > 0 && self.params.sleep_times.map_or(true, |times| n <= times);
        if sleeps {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.params.sleep_ms)) => {}
                _ = self.kill.notified() => return Ok(ExecutionResult::killed()),
            }
        }

        if n <= self.params.fail_times {
            return Ok(ExecutionResult::failure(format!("scripted failure {}", n)));
        }
        Ok(ExecutionResult {
            outcome: TaskOutcome::Success,
            output_vars: self.params.vars.clone(),
            exit_code: Some(0),
            message: None,
        })
    }

    fn kill(&self) {
        self.kill.notify_one();
    }
}

pub struct TestMaster {
    pub host: String,
    pub runtime: Arc<MasterRuntime>,
    pub registry: Arc<InMemoryRegistryClient>,
}

pub struct TestWorker {
    pub host: String,
    pub runtime: Arc<WorkerRuntime>,
    pub registry: Arc<InMemoryRegistryClient>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct TestCluster {
    pub coordinator: Arc<InMemoryCoordinator>,
    pub network: Arc<InProcessServer>,
    pub store: Arc<InMemoryMetadataStore>,
    pub tap: Arc<Tap>,
    pub scripted: Arc<ScriptedFactory>,
    pub logger: Logger,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            coordinator: InMemoryCoordinator::new(),
            network: Arc::new(InProcessServer::new()),
            store: Arc::new(InMemoryMetadataStore::new()),
            tap: Arc::new(Tap::default()),
            scripted: Arc::new(ScriptedFactory::default()),
            logger: discard_logger(),
        }
    }

    fn transport(&self, host: &str) -> Arc<TransportLayer> {
        let sender = TapSender {
            inner: InProcessMessageSender::new(self.network.clone()),
            tap: self.tap.clone(),
        };
        Arc::new(TransportLayer::new(host, Arc::new(sender)))
    }

    pub fn master_config(&self, host: &str) -> MasterConfig {
        MasterConfig::new(host)
            .with_advertise_address(in_process_address(host))
            .with_dispatch(DispatchConfig::default().with_max_attempts(3))
            .with_delivery(DeliveryConfig::default().with_retry_interval(Duration::from_millis(50)))
            .with_failover(FailoverConfig {
                orphan_scan_interval_ms: 200,
            })
    }

    pub fn worker_config(&self, host: &str) -> WorkerConfig {
        WorkerConfig::new(host)
            .with_advertise_address(in_process_address(host))
            .with_delivery(DeliveryConfig::default().with_retry_interval(Duration::from_millis(50)))
            .with_heartbeat_interval(Duration::from_millis(100))
    }

    pub fn executors(&self) -> TaskExecutorRegistry {
        let mut executors = TaskExecutorRegistry::with_defaults();
        executors.register(SCRIPTED, self.scripted.clone());
        executors
    }

    pub async fn start_master(&self, host: &str, definitions: &[WorkflowDefinition]) -> TestMaster {
        self.start_master_with(self.master_config(host), self.store.clone(), definitions)
            .await
    }

    /// Definitions are registered before the orphan scan starts
    pub async fn start_master_with(
        &self,
        config: MasterConfig,
        store: Arc<dyn MetadataStore>,
        definitions: &[WorkflowDefinition],
    ) -> TestMaster {
        let host = config.host.clone();
        let registry = Arc::new(self.coordinator.connect(&host).await);
        let runtime = MasterRuntime::new(
            &config,
            registry.clone(),
            self.transport(&host),
            store,
            Arc::new(LogicTaskRegistry::with_defaults()),
            self.logger.clone(),
        );
        for definition in definitions {
            runtime
                .register_definition(definition.clone())
                .await
                .expect("definition should register");
        }
        self.network
            .register_node(&host, Arc::new(MasterMessageHandler::new(runtime.clone())))
            .await;
        runtime.register_presence().await.expect("presence should register");
        runtime.spawn_background().await.expect("background should start");
        TestMaster { host, runtime, registry }
    }

    pub async fn start_worker(&self, host: &str) -> TestWorker {
        self.start_worker_with(self.worker_config(host)).await
    }

    pub async fn start_worker_with(&self, config: WorkerConfig) -> TestWorker {
        let host = config.host.clone();
        let registry = Arc::new(self.coordinator.connect(&host).await);
        let runtime = WorkerRuntime::new(
            &config,
            registry.clone(),
            self.transport(&host),
            Arc::new(self.executors()),
            self.logger.clone(),
        )
        .await
        .expect("worker runtime should start");
        self.network
            .register_node(&host, Arc::new(WorkerMessageHandler::new(runtime.clone())))
            .await;
        runtime.reconcile().await;
        runtime.publish_heartbeat().await.expect("heartbeat should publish");
        let tasks = vec![
            runtime.spawn_heartbeat(config.heartbeat_interval()),
            runtime.delivery().spawn_retry_loop(),
        ];
        TestWorker {
            host,
            runtime,
            registry,
            tasks,
        }
    }

    /// Simulate a master process dying: loops stop, the session expires
    pub async fn crash_master(&self, master: TestMaster) {
        master.runtime.shutdown().await;
        self.network.unregister_node(&master.host).await;
        self.coordinator.expire_session(master.registry.session_id()).await;
    }

    /// Replace a worker process with a fresh one under the same host name.
    /// The old session lingers until the new node is registered, as with a
    /// restart that beats the session timeout.
    pub async fn restart_worker(&self, worker: TestWorker, config: WorkerConfig) -> TestWorker {
        for task in &worker.tasks {
            task.abort();
        }
        self.network.unregister_node(&worker.host).await;
        let restarted = self.start_worker_with(config).await;
        self.coordinator.expire_session(worker.registry.session_id()).await;
        restarted
    }

    /// Simulate a worker process dying; running attempts are left behind
    pub async fn crash_worker(&self, worker: TestWorker) {
        for task in &worker.tasks {
            task.abort();
        }
        self.network.unregister_node(&worker.host).await;
        self.coordinator.expire_session(worker.registry.session_id()).await;
    }
}

pub fn scripted(code: &str, params: serde_json::Value) -> TaskDefinition {
    TaskDefinition::new(code, TaskType::new(SCRIPTED)).with_params(params)
}

pub fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until the latest instance of `node_code` is in `state`
pub async fn wait_for_task(runtime: &MasterRuntime, workflow_id: &str, node_code: &str, state: TaskState) -> bool {
    wait_until(WAIT, || async move {
        match runtime.workflow_status(workflow_id).await {
            Ok(snapshot) => snapshot.latest(node_code).map(|t| t.state) == Some(state),
            Err(_) => false,
        }
    })
    .await
}

pub async fn run_to_end(runtime: &MasterRuntime, workflow_id: &str) -> (WorkflowState, InstanceSnapshot) {
    let state = runtime
        .wait_for_terminal(workflow_id, WAIT)
        .await
        .expect("workflow should finish");
    let snapshot = runtime.workflow_status(workflow_id).await.expect("status");
    (state, snapshot)
}

pub fn latest<'a>(snapshot: &'a InstanceSnapshot, node_code: &str) -> &'a TaskInstance {
    snapshot
        .latest(node_code)
        .unwrap_or_else(|| panic!("no task instance for {}", node_code))
}

pub fn instances<'a>(snapshot: &'a InstanceSnapshot, node_code: &str) -> Vec<&'a TaskInstance> {
    snapshot.tasks.iter().filter(|t| t.node_code == node_code).collect()
}
