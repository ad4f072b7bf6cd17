//! Worker execution runtime
//!
//! Accepts DispatchRequests, runs them on a bounded pool and reports
//! RUNNING and RESULT back to the owning master through the reliable sender.

use crate::config::WorkerConfig;
use crate::dispatch::WorkerHeartbeat;
use crate::engine::EngineEvent;
use crate::event_bus::EventBus;
use crate::model::now_millis;
use crate::registry::{worker_path, RegistryClient, RegistryError};
use crate::store::StoreError;
use crate::transport::{
    DispatchRequest, Envelope, KillRequest, MessageHandler, RejectReason, ResultEvent, RunningEvent,
    TaskOutcome, TaskStateQuery, TaskStateReply, Transport, TransportError, WireMessage,
};
use crate::worker::delivery::{DeliveryTarget, ReliableEventSender};
use crate::worker::executor::{ExecutionContext, ExecutionResult, TaskExecutor, TaskExecutorRegistry};
use crate::worker::inflight::{InflightEntry, InflightStore};
use crate::worker::pool::{DedupCache, WorkerPool};
use futures::future::join_all;
use slog::{debug, info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit};
use tokio::task::JoinHandle;

type AttemptKey = (String, u32);

pub struct WorkerRuntime {
    host: String,
    address: String,
    groups: Vec<String>,
    registry: Arc<dyn RegistryClient>,
    transport: Arc<dyn Transport>,
    executors: Arc<TaskExecutorRegistry>,
    pool: WorkerPool,
    dedup: Mutex<DedupCache>,
    running: Mutex<HashMap<AttemptKey, Arc<dyn TaskExecutor>>>,
    inflight: InflightStore,
    delivery: Arc<ReliableEventSender>,
    events: Arc<EventBus<EngineEvent>>,
    logger: Logger,
}

impl WorkerRuntime {
    pub async fn new(
        config: &WorkerConfig,
        registry: Arc<dyn RegistryClient>,
        transport: Arc<dyn Transport>,
        executors: Arc<TaskExecutorRegistry>,
        logger: Logger,
    ) -> Result<Arc<Self>, StoreError> {
        let inflight = InflightStore::open(config.state_dir.clone()).await?;
        let events = Arc::new(EventBus::default());
        let delivery = Arc::new(
            ReliableEventSender::new(
                registry.clone(),
                transport.clone(),
                config.delivery.clone(),
                logger.new(o!("component" => "delivery")),
            )
            .with_alerts(events.clone()),
        );
        Ok(Arc::new(Self {
            host: config.host.clone(),
            address: config.advertise_url(),
            groups: config.groups.clone(),
            registry,
            transport,
            executors,
            pool: WorkerPool::new(config.pool.max_concurrent),
            dedup: Mutex::new(DedupCache::new(config.dedup_retention)),
            running: Mutex::new(HashMap::new()),
            inflight,
            delivery,
            events,
            logger,
        }))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn delivery(&self) -> &Arc<ReliableEventSender> {
        &self.delivery
    }

    /// Worker-side engine events; currently `DeliveryAlert`s
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    pub fn heartbeat(&self) -> WorkerHeartbeat {
        WorkerHeartbeat {
            address: self.address.clone(),
            groups: self.groups.clone(),
            running: self.pool.running(),
            capacity: self.pool.capacity(),
        }
    }

    /// Create or refresh this worker's node under `/dagrun/workers`
    pub async fn publish_heartbeat(&self) -> Result<(), RegistryError> {
        let payload = serde_json::to_string(&self.heartbeat())
            .map_err(|e| RegistryError::Unavailable(e.to_string()))?;
        self.registry.register_ephemeral(&worker_path(&self.host), payload).await
    }

    pub fn spawn_heartbeat(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = runtime.publish_heartbeat().await {
                    warn!(runtime.logger, "Heartbeat failed"; "error" => %e);
                }
            }
        })
    }

    /// Settle attempts left in flight by a previous run of this worker
    ///
    /// Finished attempts whose RESULT was never acknowledged are sent again.
    /// For the others the authoritative state is asked from the owning
    /// master; attempts it still considers in progress are reported failed.
    pub async fn reconcile(self: &Arc<Self>) {
        let entries = self.inflight.entries().await;
        if entries.is_empty() {
            return;
        }
        info!(self.logger, "Reconciling attempts from previous run"; "count" => entries.len());
        join_all(entries.iter().map(|entry| self.reconcile_entry(entry))).await;
    }

    async fn reconcile_entry(self: &Arc<Self>, entry: &InflightEntry) {
        if let Some(result) = entry.result.clone() {
            info!(self.logger, "Resending unacknowledged result";
                "task_instance_id" => &entry.task_instance_id,
                "attempt" => entry.attempt,
                "outcome" => ?result.outcome
            );
            self.deliver_result(result).await;
            return;
        }

        let still_open = match self.query_state(entry).await {
            Ok(reply) => match (reply.state, reply.attempt) {
                (Some(state), Some(attempt)) => !state.is_terminal() && attempt == entry.attempt,
                _ => false,
            },
            Err(reason) => {
                warn!(self.logger, "State query failed; reporting attempt failed";
                    "task_instance_id" => &entry.task_instance_id,
                    "reason" => &reason
                );
                true
            }
        };

        if still_open {
            info!(self.logger, "Reporting attempt lost in restart";
                "task_instance_id" => &entry.task_instance_id,
                "attempt" => entry.attempt
            );
            let result = ResultEvent {
                workflow_instance_id: entry.workflow_instance_id.clone(),
                task_instance_id: entry.task_instance_id.clone(),
                attempt: entry.attempt,
                worker_host: self.host.clone(),
                outcome: TaskOutcome::Failure,
                output_vars: HashMap::new(),
                exit_code: None,
                message: Some("worker restarted".to_string()),
                end_time: now_millis(),
            };
            if let Err(e) = self.inflight.finish(result.clone()).await {
                warn!(self.logger, "Failed to update in-flight file"; "error" => %e);
            }
            self.deliver_result(result).await;
        } else if let Err(e) = self.inflight.remove(&entry.task_instance_id, entry.attempt).await {
            warn!(self.logger, "Failed to update in-flight file"; "error" => %e);
        }
    }

    async fn query_state(&self, entry: &InflightEntry) -> Result<TaskStateReply, String> {
        let owner = self
            .delivery
            .resolve(&DeliveryTarget::WorkflowOwner(entry.workflow_instance_id.clone()))
            .await?;
        let query = WireMessage::StateQuery(TaskStateQuery {
            workflow_instance_id: entry.workflow_instance_id.clone(),
            task_instance_id: entry.task_instance_id.clone(),
            attempt: entry.attempt,
            worker_host: self.host.clone(),
        });
        match self.transport.send_message(&owner, query).await {
            Ok(WireMessage::StateReply(reply)) => Ok(reply),
            Ok(other) => Err(format!("unexpected {} reply", other.kind())),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn report(&self, workflow_instance_id: &str, message: WireMessage) {
        let target = DeliveryTarget::WorkflowOwner(workflow_instance_id.to_string());
        if let Err(e) = self.delivery.send(target, message).await {
            warn!(self.logger, "Failed to queue event"; "error" => %e);
        }
    }

    /// Queue a RESULT; its in-flight entry is dropped once the owner acks it
    async fn deliver_result(self: &Arc<Self>, result: ResultEvent) {
        let target = DeliveryTarget::WorkflowOwner(result.workflow_instance_id.clone());
        let task_instance_id = result.task_instance_id.clone();
        let attempt = result.attempt;
        let acked = match self.delivery.send_tracked(target, WireMessage::Result(result)).await {
            Ok(acked) => acked,
            Err(e) => {
                warn!(self.logger, "Failed to queue result"; "error" => %e);
                return;
            }
        };

        let runtime = self.clone();
        tokio::spawn(async move {
            if acked.await.is_err() {
                warn!(runtime.logger, "Result was given up; forgetting attempt";
                    "task_instance_id" => &task_instance_id,
                    "attempt" => attempt
                );
            }
            if let Err(e) = runtime.inflight.remove(&task_instance_id, attempt).await {
                warn!(runtime.logger, "Failed to update in-flight file"; "error" => %e);
            }
        });
    }

    async fn on_dispatch(self: &Arc<Self>, request: DispatchRequest) -> WireMessage {
        let key = request.key();
        let permit = {
            let mut dedup = self.dedup.lock().await;
            if dedup.contains(&request.task_instance_id, request.attempt) {
                debug!(self.logger, "Duplicate dispatch acknowledged";
                    "task_instance_id" => &request.task_instance_id,
                    "attempt" => request.attempt
                );
                return WireMessage::ack(key);
            }
            let Some(permit) = self.pool.try_acquire() else {
                info!(self.logger, "Pool full, rejecting dispatch";
                    "task_instance_id" => &request.task_instance_id,
                    "capacity" => self.pool.capacity()
                );
                return WireMessage::reject(Some(key), RejectReason::Busy);
            };
            dedup.insert(&request.task_instance_id, request.attempt);
            permit
        };

        let executor = match self.executors.create(&request) {
            Some(Ok(executor)) => Ok(executor),
            Some(Err(e)) => Err(e.to_string()),
            None => Err(format!("no executor registered for task type {}", request.task_type)),
        };

        let attempt_key = (request.task_instance_id.clone(), request.attempt);
        if let Ok(executor) = &executor {
            self.running.lock().await.insert(attempt_key, executor.clone());
        }
        let entry = InflightEntry {
            workflow_instance_id: request.workflow_instance_id.clone(),
            task_instance_id: request.task_instance_id.clone(),
            attempt: request.attempt,
            master_host: request.master_host.clone(),
            result: None,
        };
        if let Err(e) = self.inflight.insert(entry).await {
            warn!(self.logger, "Failed to record in-flight attempt"; "error" => %e);
        }

        info!(self.logger, "Accepted dispatch";
            "task_instance_id" => &request.task_instance_id,
            "attempt" => request.attempt,
            "task_type" => %request.task_type
        );
        let runtime = self.clone();
        tokio::spawn(async move { runtime.run_attempt(request, executor, permit).await });
        WireMessage::ack(key)
    }

    async fn run_attempt(
        self: Arc<Self>,
        request: DispatchRequest,
        executor: Result<Arc<dyn TaskExecutor>, String>,
        permit: OwnedSemaphorePermit,
    ) {
        let running = RunningEvent {
            workflow_instance_id: request.workflow_instance_id.clone(),
            task_instance_id: request.task_instance_id.clone(),
            attempt: request.attempt,
            worker_host: self.host.clone(),
            start_time: now_millis(),
        };
        self.report(&request.workflow_instance_id, WireMessage::Running(running)).await;

        let result = match executor {
            Ok(executor) => {
                let ctx = ExecutionContext {
                    request: request.clone(),
                    worker_host: self.host.clone(),
                    logger: self.logger.new(o!(
                        "task_instance_id" => request.task_instance_id.clone(),
                        "attempt" => request.attempt
                    )),
                };
                executor
                    .execute(&ctx)
                    .await
                    .unwrap_or_else(|e| ExecutionResult::failure(e.to_string()))
            }
            Err(reason) => ExecutionResult::failure(reason),
        };
        drop(permit);

        self.running
            .lock()
            .await
            .remove(&(request.task_instance_id.clone(), request.attempt));

        info!(self.logger, "Attempt finished";
            "task_instance_id" => &request.task_instance_id,
            "attempt" => request.attempt,
            "outcome" => ?result.outcome
        );
        let event = ResultEvent {
            workflow_instance_id: request.workflow_instance_id.clone(),
            task_instance_id: request.task_instance_id.clone(),
            attempt: request.attempt,
            worker_host: self.host.clone(),
            outcome: result.outcome,
            output_vars: result.output_vars,
            exit_code: result.exit_code,
            message: result.message,
            end_time: now_millis(),
        };
        // Kept on disk until acknowledged so a restart can resend it
        if let Err(e) = self.inflight.finish(event.clone()).await {
            warn!(self.logger, "Failed to record finished attempt"; "error" => %e);
        }
        self.deliver_result(event).await;
    }

    async fn on_kill(&self, request: KillRequest) -> WireMessage {
        let executor = self
            .running
            .lock()
            .await
            .get(&(request.task_instance_id.clone(), request.attempt))
            .cloned();
        match executor {
            Some(executor) => {
                info!(self.logger, "Killing attempt";
                    "task_instance_id" => &request.task_instance_id,
                    "attempt" => request.attempt
                );
                executor.kill();
            }
            None => {
                debug!(self.logger, "Kill for unknown or finished attempt";
                    "task_instance_id" => &request.task_instance_id,
                    "attempt" => request.attempt
                );
            }
        }
        WireMessage::ack(request.key())
    }

    /// Kill every running attempt, e.g. before the process exits
    pub async fn kill_all(&self) {
        for executor in self.running.lock().await.values() {
            executor.kill();
        }
    }
}

/// Routes inbound frames to a `WorkerRuntime`
pub struct WorkerMessageHandler {
    runtime: Arc<WorkerRuntime>,
}

impl WorkerMessageHandler {
    pub fn new(runtime: Arc<WorkerRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait::async_trait]
impl MessageHandler for WorkerMessageHandler {
    async fn handle(&self, envelope: Envelope) -> Result<WireMessage, TransportError> {
        Ok(match envelope.message {
            WireMessage::Dispatch(request) => self.runtime.on_dispatch(request).await,
            WireMessage::Kill(request) => self.runtime.on_kill(request).await,
            other => WireMessage::reject(
                other.correlation_key(),
                RejectReason::Invalid(format!("worker does not accept {} frames", other.kind())),
            ),
        })
    }
}
