//! Per-instance interpreter loop
//!
//! Every workflow instance owned by this master has exactly one loop task.
//! All mutation of the instance's rows happens here, one `LifecycleEvent` at
//! a time. Side effects that leave the master (dispatches, kills) are queued
//! in an outbox and only released after the rows they depend on are
//! persisted.

use crate::dispatch::logic::{sub_workflow_outcome, ChildLauncher, LogicContext, LogicOutcome};
use crate::dispatch::{DispatchError, TaskDispatcher, TaskKind};
use crate::engine::error::EngineError;
use crate::engine::event::{AckHandle, ControlReply, EngineEvent, LifecycleEvent};
use crate::engine::ownership::WorkflowOwnership;
use crate::engine::repository::{InstanceSnapshot, WorkflowHandle, WorkflowRepository};
use crate::engine::task_state::{self, Recovery};
use crate::engine::topology::{self, LatestTasks, Readiness};
use crate::engine::workflow_state;
use crate::event_bus::EventBus;
use crate::model::{
    DagGraph, FailureStrategy, RetryPolicy, TaskDefinition, TaskInstance, TaskState, WorkflowInstance,
    WorkflowState,
};
use crate::store::MetadataStore;
use crate::transport::{DispatchRequest, KillRequest, ResultEvent, RunningEvent, TaskOutcome, WireMessage};
use crate::worker::{DeliveryTarget, ReliableEventSender};
use slog::{debug, error, info, o, warn, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const SUB_WORKFLOW_RECHECK: Duration = Duration::from_secs(5);

/// Services shared by every loop of one master
pub struct LoopContext {
    pub host: String,
    pub ownership: WorkflowOwnership,
    pub store: Arc<dyn MetadataStore>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub kills: Arc<ReliableEventSender>,
    pub events: Arc<EventBus<EngineEvent>>,
    pub repository: WorkflowRepository,
    pub launcher: Arc<dyn ChildLauncher>,
    /// Flips to true when the master shuts down
    pub shutdown: watch::Receiver<bool>,
    pub logger: Logger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStart {
    /// Newly created instance; the loop starts it
    Fresh,
    /// Rebuilt from persisted rows after a takeover
    Recovered,
}

enum Flow {
    Continue,
    Finished,
}

enum Outgoing {
    Dispatch { request: DispatchRequest, group: String },
    Kill { host: String, request: KillRequest },
}

/// Spawn the loop for an instance and register it in the repository
///
/// Returns `None` if a loop for the instance is already registered.
pub async fn spawn_loop(
    ctx: Arc<LoopContext>,
    graph: Arc<DagGraph>,
    workflow: WorkflowInstance,
    tasks: Vec<TaskInstance>,
    start: LoopStart,
) -> Option<WorkflowHandle> {
    let id = workflow.id.clone();
    let (tx, rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(InstanceSnapshot {
        workflow: workflow.clone(),
        tasks: tasks.clone(),
    });
    let handle = WorkflowHandle::new(tx.clone(), snapshot_rx);
    if !ctx.repository.insert(&id, handle.clone()).await {
        return None;
    }

    let logger = ctx.logger.new(o!("workflow_instance_id" => id));
    let persisted_tasks = tasks.iter().map(|task| (task.id.clone(), task.clone())).collect();
    let mut instance = WorkflowLoop {
        ctx,
        graph,
        persisted_workflow: Some(workflow.clone()),
        workflow,
        tasks,
        halted: false,
        persisted_tasks,
        outbox: Vec::new(),
        tx,
        rx,
        snapshot: snapshot_tx,
        logger,
    };
    instance.halted = instance.compute_halted();
    if start == LoopStart::Fresh {
        instance.enqueue(LifecycleEvent::WorkflowStart);
    }
    tokio::spawn(instance.run(start));
    Some(handle)
}

pub struct WorkflowLoop {
    ctx: Arc<LoopContext>,
    graph: Arc<DagGraph>,
    workflow: WorkflowInstance,
    /// Oldest first; the last instance of a node is its latest
    tasks: Vec<TaskInstance>,
    /// Set once the `end` failure strategy stopped instantiation
    halted: bool,
    persisted_workflow: Option<WorkflowInstance>,
    persisted_tasks: HashMap<String, TaskInstance>,
    outbox: Vec<Outgoing>,
    tx: mpsc::UnboundedSender<LifecycleEvent>,
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    snapshot: watch::Sender<InstanceSnapshot>,
    logger: Logger,
}

impl WorkflowLoop {
    async fn run(mut self, start: LoopStart) {
        if start == LoopStart::Recovered {
            if let Err(e) = self.take_over().await {
                error!(self.logger, "Failed to rebuild instance after takeover"; "error" => %e);
            }
        }

        let mut shutdown = self.ctx.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let event = tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            if let Err(e) = self.ctx.ownership.verify(&self.workflow.id).await {
                warn!(self.logger, "Ownership lost; leaving instance to its new owner";
                    "event" => event.name(),
                    "error" => %e
                );
                event.refuse(&self.ctx.host, &self.workflow.id);
                self.abandon().await;
                return;
            }

            let name = event.name();
            match self.handle(event).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished) => return,
                Err(e) => {
                    error!(self.logger, "Event handling failed"; "event" => name, "error" => %e);
                }
            }
        }

        info!(self.logger, "Master shutting down; leaving workflow loop");
        self.abandon().await;
    }

    async fn handle(&mut self, event: LifecycleEvent) -> Result<Flow, EngineError> {
        match event {
            LifecycleEvent::WorkflowStart => self.on_start().await?,
            LifecycleEvent::TaskDispatch { task_instance_id } => self.on_task_dispatch(&task_instance_id).await?,
            LifecycleEvent::TaskDispatchCompleted {
                task_instance_id,
                attempt,
                outcome,
            } => self.on_dispatch_completed(&task_instance_id, attempt, outcome).await?,
            LifecycleEvent::TaskRunning { event, ack } => self.on_running(event, ack).await?,
            LifecycleEvent::TaskResult { event, ack } => self.on_result(event, ack).await?,
            LifecycleEvent::TaskTimeout {
                task_instance_id,
                attempt,
            } => self.on_timeout(&task_instance_id, attempt).await?,
            LifecycleEvent::TaskRetryDue {
                task_instance_id,
                attempt,
            } => self.on_retry_due(&task_instance_id, attempt).await?,
            LifecycleEvent::LogicRecheck {
                task_instance_id,
                attempt,
            } => self.on_logic_recheck(&task_instance_id, attempt).await?,
            LifecycleEvent::SubWorkflowFinished {
                task_instance_id,
                child_workflow_instance_id,
                state,
                variables,
            } => {
                self.on_sub_workflow_finished(&task_instance_id, &child_workflow_instance_id, state, variables)
                    .await?
            }
            LifecycleEvent::TopologyTransitionOnTaskFinish { node_code } => self.on_topology(&node_code).await?,
            LifecycleEvent::Pause { reply } => self.on_pause(reply).await,
            LifecycleEvent::Resume { reply } => self.on_resume(reply).await,
            LifecycleEvent::Stop { reply } => self.on_stop(reply).await,
            LifecycleEvent::KillTask {
                task_instance_id,
                reply,
            } => self.on_kill_task(&task_instance_id, reply).await,
            LifecycleEvent::WorkerLost { host } => self.on_worker_lost(&host).await?,
            LifecycleEvent::ParentCancelled => self.on_parent_cancelled().await?,
            LifecycleEvent::WorkflowFinalize => return self.finalize().await,
        }
        Ok(Flow::Continue)
    }

    // ---- helpers -------------------------------------------------------

    fn enqueue(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }

    fn schedule(&self, delay: Duration, event: LifecycleEvent) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    fn index_of(&self, task_instance_id: &str) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == task_instance_id)
    }

    fn latest(&self) -> LatestTasks<'_> {
        let mut latest = HashMap::new();
        for task in &self.tasks {
            latest.insert(task.node_code.as_str(), task);
        }
        latest
    }

    fn node_states(&self) -> HashMap<String, TaskState> {
        self.latest()
            .into_iter()
            .map(|(node, task)| (node.to_string(), task.state))
            .collect()
    }

    fn policy(&self, idx: usize) -> RetryPolicy {
        self.graph
            .task(&self.tasks[idx].node_code)
            .map(|def| def.retry.clone())
            .unwrap_or_else(RetryPolicy::none)
    }

    fn kind(&self, idx: usize) -> TaskKind {
        self.ctx.dispatcher.classify(&self.tasks[idx].task_type)
    }

    fn compute_halted(&self) -> bool {
        if self.graph.definition().failure_strategy != FailureStrategy::End {
            return false;
        }
        let paused = self.workflow.state == WorkflowState::Pause;
        self.latest().values().any(|task| {
            topology::is_failed_outcome(task.state)
                && !(paused && self.workflow.paused_nodes.contains(&task.node_code))
        })
    }

    /// Persist what changed, publish notifications, then release the outbox
    async fn commit(&mut self) -> Result<(), EngineError> {
        if self.persisted_workflow.as_ref() != Some(&self.workflow) {
            self.ctx.store.save_workflow(&self.workflow).await?;
            let state_changed = self.persisted_workflow.as_ref().map(|wf| wf.state) != Some(self.workflow.state);
            self.persisted_workflow = Some(self.workflow.clone());
            if state_changed {
                self.ctx.events.publish(EngineEvent::WorkflowStateChanged {
                    workflow_instance_id: self.workflow.id.clone(),
                    state: self.workflow.state,
                });
            }
        }

        for task in &self.tasks {
            let previous = self.persisted_tasks.get(&task.id);
            if previous == Some(task) {
                continue;
            }
            let state_changed = previous.map(|t| t.state) != Some(task.state);
            self.ctx.store.save_task(task).await?;
            self.persisted_tasks.insert(task.id.clone(), task.clone());
            if state_changed {
                self.ctx.events.publish(EngineEvent::task_changed(task));
            }
        }

        self.snapshot.send_replace(InstanceSnapshot {
            workflow: self.workflow.clone(),
            tasks: self.tasks.clone(),
        });
        self.flush_outbox();
        Ok(())
    }

    fn flush_outbox(&mut self) {
        for item in self.outbox.drain(..) {
            match item {
                Outgoing::Dispatch { request, group } => {
                    let dispatcher = self.ctx.dispatcher.clone();
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let task_instance_id = request.task_instance_id.clone();
                        let attempt = request.attempt;
                        let outcome = dispatcher.dispatch(request, &group).await;
                        let _ = tx.send(LifecycleEvent::TaskDispatchCompleted {
                            task_instance_id,
                            attempt,
                            outcome,
                        });
                    });
                }
                Outgoing::Kill { host, request } => {
                    let kills = self.ctx.kills.clone();
                    let logger = self.logger.clone();
                    tokio::spawn(async move {
                        if let Err(e) = kills.send(DeliveryTarget::Worker(host), WireMessage::Kill(request)).await {
                            warn!(logger, "Failed to queue kill"; "error" => %e);
                        }
                    });
                }
            }
        }
    }

    fn queue_kill(&mut self, idx: usize, host: String) {
        let task = &self.tasks[idx];
        debug!(self.logger, "Queueing kill";
            "task_instance_id" => &task.id,
            "attempt" => task.attempt(),
            "host" => &host
        );
        let request = KillRequest {
            workflow_instance_id: self.workflow.id.clone(),
            task_instance_id: task.id.clone(),
            attempt: task.attempt(),
            master_host: self.ctx.host.clone(),
        };
        self.outbox.push(Outgoing::Kill { host, request });
    }

    fn queue_dispatch(&mut self, idx: usize) {
        let task = &self.tasks[idx];
        let definition = self.graph.task(&task.node_code);
        let request = DispatchRequest {
            workflow_instance_id: self.workflow.id.clone(),
            task_instance_id: task.id.clone(),
            attempt: task.attempt(),
            task_code: task.node_code.clone(),
            task_type: task.task_type.clone(),
            params: definition.map(|d| d.params.clone()).unwrap_or(serde_json::Value::Null),
            variables: self.workflow.variables.clone(),
            timeout_ms: definition.and_then(|d| d.timeout_ms),
            master_host: self.ctx.host.clone(),
        };
        let group = definition
            .map(|d| d.worker_group.clone())
            .unwrap_or_else(crate::model::definition::default_worker_group);
        self.outbox.push(Outgoing::Dispatch { request, group });
    }

    fn arm_timeout(&self, idx: usize) {
        let task = &self.tasks[idx];
        if let Some(timeout) = self.graph.task(&task.node_code).and_then(TaskDefinition::timeout) {
            self.schedule(
                timeout,
                LifecycleEvent::TaskTimeout {
                    task_instance_id: task.id.clone(),
                    attempt: task.attempt(),
                },
            );
        }
    }

    /// Bookkeeping for a task that just became terminal
    fn on_terminal(&mut self, idx: usize) {
        let task = &self.tasks[idx];
        if self.graph.definition().failure_strategy == FailureStrategy::End
            && topology::is_failed_outcome(task.state)
        {
            if !self.halted {
                info!(self.logger, "Task failed; no new tasks will be created";
                    "node_code" => &task.node_code
                );
            }
            self.halted = true;
        }
        self.enqueue(LifecycleEvent::TopologyTransitionOnTaskFinish {
            node_code: task.node_code.clone(),
        });
    }

    fn after_recovery(&mut self, idx: usize, recovery: Recovery) {
        let task = &self.tasks[idx];
        match recovery {
            Recovery::Retry { delay } => {
                info!(self.logger, "Task will be retried";
                    "task_instance_id" => &task.id,
                    "node_code" => &task.node_code,
                    "retry" => task.retry_count + 1,
                    "delay_ms" => delay.as_millis() as u64,
                    "reason" => task.message.as_deref().unwrap_or("")
                );
                self.schedule(
                    delay,
                    LifecycleEvent::TaskRetryDue {
                        task_instance_id: task.id.clone(),
                        attempt: task.attempt(),
                    },
                );
            }
            Recovery::Failed => {
                warn!(self.logger, "Task failed";
                    "task_instance_id" => &task.id,
                    "node_code" => &task.node_code,
                    "reason" => task.message.as_deref().unwrap_or("")
                );
                self.on_terminal(idx);
            }
            Recovery::Ignored => {}
        }
    }

    fn fail_task(&mut self, idx: usize, reason: String) -> Result<(), EngineError> {
        let policy = self.policy(idx);
        let recovery = task_state::fail_recoverable(&mut self.tasks[idx], &policy, reason)?;
        self.after_recovery(idx, recovery);
        Ok(())
    }

    // ---- topology ------------------------------------------------------

    async fn instantiate(&mut self, node: &str, readiness: Readiness) -> Result<(), EngineError> {
        let Some(definition) = self.graph.task(node) else {
            return Ok(());
        };
        let mut task = TaskInstance::new(&self.workflow.id, node, definition.task_type.clone());
        match readiness {
            Readiness::NotReady => {}
            Readiness::Skip => {
                task_state::apply(&mut task, TaskState::Skipped)?;
                debug!(self.logger, "Skipping node"; "node_code" => node);
                self.tasks.push(task);
                self.on_terminal(self.tasks.len() - 1);
            }
            Readiness::Eligible => {
                debug!(self.logger, "Creating task instance";
                    "node_code" => node,
                    "task_instance_id" => &task.id
                );
                self.tasks.push(task);
                self.start_task(self.tasks.len() - 1).await?;
            }
        }
        Ok(())
    }

    /// Instantiate every node that can be decided now
    async fn advance_all(&mut self) -> Result<(), EngineError> {
        loop {
            if self.workflow.state != WorkflowState::Running || self.halted {
                return Ok(());
            }
            let decisions = {
                let latest = self.latest();
                topology::decidable_nodes(&self.graph, &latest)
            };
            if decisions.is_empty() {
                return Ok(());
            }
            for (node, readiness) in decisions {
                if self.workflow.state != WorkflowState::Running || self.halted {
                    return Ok(());
                }
                self.instantiate(&node, readiness).await?;
            }
        }
    }

    async fn check_completion(&mut self) -> Result<(), EngineError> {
        if self.workflow.state != WorkflowState::Running {
            return Ok(());
        }
        let outcome = {
            let latest = self.latest();
            topology::is_complete(&self.graph, &latest, self.halted).then(|| topology::final_state(&latest))
        };
        if let Some(outcome) = outcome {
            workflow_state::finish(&mut self.workflow, outcome)?;
            info!(self.logger, "Workflow complete"; "state" => %outcome);
            self.commit().await?;
            self.enqueue(LifecycleEvent::WorkflowFinalize);
        }
        Ok(())
    }

    async fn start_task(&mut self, idx: usize) -> Result<(), EngineError> {
        match self.kind(idx) {
            TaskKind::Logic => self.run_logic(idx).await,
            TaskKind::Remote => {
                self.queue_dispatch(idx);
                Ok(())
            }
        }
    }

    async fn on_topology(&mut self, node: &str) -> Result<(), EngineError> {
        if self.workflow.state == WorkflowState::Running && !self.halted {
            let decisions: Vec<(String, Readiness)> = {
                let latest = self.latest();
                topology::uninstantiated_successors(&self.graph, node, &latest)
                    .into_iter()
                    .map(|successor| (successor.to_string(), topology::evaluate(&self.graph, successor, &latest)))
                    .filter(|(_, readiness)| *readiness != Readiness::NotReady)
                    .collect()
            };
            for (successor, readiness) in decisions {
                if self.workflow.state != WorkflowState::Running || self.halted {
                    break;
                }
                self.instantiate(&successor, readiness).await?;
            }
        }
        self.commit().await?;
        self.check_completion().await
    }

    // ---- logic tasks ---------------------------------------------------

    async fn run_logic(&mut self, idx: usize) -> Result<(), EngineError> {
        if self.tasks[idx].state == TaskState::Submitted {
            task_state::apply(&mut self.tasks[idx], TaskState::Running)?;
            self.arm_timeout(idx);
        }
        let task = self.tasks[idx].clone();
        let Some(executor) = self.ctx.dispatcher.logic().get(&task.task_type) else {
            return self.apply_logic_outcome(
                idx,
                LogicOutcome::Failure {
                    message: format!("no logic executor for {}", task.task_type),
                },
            );
        };

        let definition = self
            .graph
            .task(&task.node_code)
            .cloned()
            .unwrap_or_else(|| TaskDefinition::new(task.node_code.clone(), task.task_type.clone()));
        let ctx = LogicContext {
            workflow: self.workflow.clone(),
            task,
            definition,
            node_states: self.node_states(),
            store: self.ctx.store.clone(),
            launcher: self.ctx.launcher.clone(),
        };
        let outcome = match executor.execute(&ctx).await {
            Ok(outcome) => outcome,
            Err(e) => LogicOutcome::Failure { message: e.to_string() },
        };
        self.apply_logic_outcome(idx, outcome)
    }

    fn apply_logic_outcome(&mut self, idx: usize, outcome: LogicOutcome) -> Result<(), EngineError> {
        let id = self.tasks[idx].id.clone();
        let attempt = self.tasks[idx].attempt();
        match outcome {
            LogicOutcome::Success { branch, vars } => {
                let task = &mut self.tasks[idx];
                task.branch = branch;
                self.workflow.variables.extend(vars.clone());
                task.output_vars = vars;
                task_state::apply(task, TaskState::Success)?;
                debug!(self.logger, "Logic task succeeded";
                    "node_code" => &task.node_code,
                    "branch" => task.branch.as_deref().unwrap_or("-")
                );
                self.on_terminal(idx);
            }
            LogicOutcome::Failure { message } => {
                let task = &mut self.tasks[idx];
                task.message = Some(message);
                task_state::apply(task, TaskState::Failure)?;
                warn!(self.logger, "Logic task failed";
                    "node_code" => &task.node_code,
                    "reason" => task.message.as_deref().unwrap_or("")
                );
                self.on_terminal(idx);
            }
            LogicOutcome::Pending { recheck } => {
                self.schedule(recheck, LifecycleEvent::LogicRecheck { task_instance_id: id, attempt });
            }
            LogicOutcome::Launched {
                child_workflow_instance_id,
                recheck,
            } => {
                info!(self.logger, "Sub-workflow launched";
                    "task_instance_id" => &id,
                    "child_workflow_instance_id" => &child_workflow_instance_id
                );
                self.tasks[idx].sub_workflow_instance_id = Some(child_workflow_instance_id);
                self.schedule(recheck, LifecycleEvent::LogicRecheck { task_instance_id: id, attempt });
            }
            LogicOutcome::Block { message } => {
                let task = &mut self.tasks[idx];
                task.message = Some(message.clone());
                task_state::apply(task, TaskState::Success)?;
                warn!(self.logger, "Workflow blocked; operator attention required";
                    "node_code" => &task.node_code,
                    "message" => &message
                );
                self.on_terminal(idx);
                self.pause_instance()?;
            }
        }
        Ok(())
    }

    // ---- cancellation --------------------------------------------------

    fn cancel_task(&mut self, idx: usize, reason: &str) -> Result<bool, EngineError> {
        let task = &self.tasks[idx];
        if task.is_terminal() {
            return Ok(false);
        }
        if task.state.is_in_flight() {
            if let Some(host) = task.host.clone() {
                self.queue_kill(idx, host);
            }
        }
        if let Some(child) = self.tasks[idx].sub_workflow_instance_id.clone() {
            self.stop_child(child);
        }
        task_state::kill(&mut self.tasks[idx], reason)?;
        Ok(true)
    }

    /// Kill every non-terminal task; returns the affected node codes
    fn cancel_open_tasks(&mut self, reason: &str) -> Result<Vec<String>, EngineError> {
        let mut nodes = Vec::new();
        for idx in 0..self.tasks.len() {
            if self.cancel_task(idx, reason)? {
                nodes.push(self.tasks[idx].node_code.clone());
            }
        }
        Ok(nodes)
    }

    fn stop_child(&self, child_workflow_instance_id: String) {
        let repository = self.ctx.repository.clone();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            match repository.get(&child_workflow_instance_id).await {
                Some(handle) => {
                    let _ = handle.send(LifecycleEvent::ParentCancelled);
                }
                None => {
                    debug!(logger, "Sub-workflow not owned locally; it is not stopped";
                        "child_workflow_instance_id" => &child_workflow_instance_id
                    );
                }
            }
        });
    }

    fn pause_instance(&mut self) -> Result<(), EngineError> {
        if self.workflow.state != WorkflowState::Running {
            return Err(EngineError::invalid_transition("workflow", self.workflow.state, WorkflowState::Pause));
        }
        let cancelled = self.cancel_open_tasks("paused")?;
        workflow_state::pause(&mut self.workflow, cancelled)?;
        info!(self.logger, "Workflow paused"; "paused_nodes" => ?self.workflow.paused_nodes);
        Ok(())
    }

    // ---- event handlers ------------------------------------------------

    async fn on_start(&mut self) -> Result<(), EngineError> {
        if self.workflow.state != WorkflowState::Submitted {
            debug!(self.logger, "Ignoring start of an already started instance");
            return Ok(());
        }
        workflow_state::start(&mut self.workflow)?;
        self.workflow.host = Some(self.ctx.host.clone());
        info!(self.logger, "Workflow started";
            "definition_code" => &self.workflow.definition_code,
            "definition_version" => self.workflow.definition_version
        );
        self.advance_all().await?;
        self.commit().await?;
        self.check_completion().await
    }

    async fn on_task_dispatch(&mut self, task_instance_id: &str) -> Result<(), EngineError> {
        let Some(idx) = self.index_of(task_instance_id) else {
            return Err(EngineError::TaskNotFound(task_instance_id.to_string()));
        };
        if self.tasks[idx].state == TaskState::Submitted && self.workflow.state == WorkflowState::Running {
            self.start_task(idx).await?;
            self.commit().await?;
        }
        Ok(())
    }

    async fn on_dispatch_completed(
        &mut self,
        task_instance_id: &str,
        attempt: u32,
        outcome: Result<String, DispatchError>,
    ) -> Result<(), EngineError> {
        let Some(idx) = self.index_of(task_instance_id) else {
            return Ok(());
        };
        if self.tasks[idx].attempt() != attempt {
            debug!(self.logger, "Stale dispatch completion"; "task_instance_id" => task_instance_id);
            return Ok(());
        }

        match outcome {
            Ok(host) => {
                let state = self.tasks[idx].state;
                if state == TaskState::Killed {
                    // Cancelled while the dispatch was in flight
                    self.queue_kill(idx, host);
                } else if !state.is_terminal() && state != TaskState::Retry {
                    let task = &mut self.tasks[idx];
                    task.host.get_or_insert(host);
                    if task.state == TaskState::Submitted {
                        task_state::apply(task, TaskState::Dispatched)?;
                    }
                    self.arm_timeout(idx);
                }
                self.commit().await
            }
            Err(e) => {
                if self.tasks[idx].state != TaskState::Submitted {
                    return Ok(());
                }
                warn!(self.logger, "Dispatch failed";
                    "task_instance_id" => task_instance_id,
                    "error" => %e
                );
                self.fail_task(idx, format!("dispatch failed: {}", e))?;
                self.commit().await?;
                self.check_completion().await
            }
        }
    }

    async fn on_running(&mut self, event: RunningEvent, ack: AckHandle) -> Result<(), EngineError> {
        let Some(idx) = self.index_of(&event.task_instance_id) else {
            ack.ack();
            return Ok(());
        };
        let task = &mut self.tasks[idx];
        if task.attempt() != event.attempt || task.is_terminal() || task.state == TaskState::Retry {
            debug!(self.logger, "Ignoring stale running event"; "key" => %event.key());
            ack.ack();
            return Ok(());
        }
        task.host.get_or_insert(event.worker_host);
        task_state::apply(task, TaskState::Running)?;
        self.commit().await?;
        ack.ack();
        Ok(())
    }

    async fn on_result(&mut self, event: ResultEvent, ack: AckHandle) -> Result<(), EngineError> {
        let Some(idx) = self.index_of(&event.task_instance_id) else {
            ack.ack();
            return Ok(());
        };
        let task = &self.tasks[idx];
        if task.attempt() != event.attempt || task.is_terminal() || task.state == TaskState::Retry {
            debug!(self.logger, "Ignoring stale result"; "key" => %event.key());
            ack.ack();
            return Ok(());
        }

        let key = event.key();
        let before = (self.tasks[idx].clone(), self.workflow.variables.clone());
        if let Err(e) = self.apply_result(idx, event) {
            // Redelivery cannot make the frame acceptable; settle it
            warn!(self.logger, "Result rejected"; "key" => %key, "error" => %e);
            let (task, variables) = before;
            self.tasks[idx] = task;
            self.workflow.variables = variables;
            ack.ack();
            return Ok(());
        }
        self.commit().await?;
        ack.ack();
        Ok(())
    }

    /// State first, then outputs, so a rejected transition leaves no trace
    fn apply_result(&mut self, idx: usize, event: ResultEvent) -> Result<(), EngineError> {
        let task = &mut self.tasks[idx];
        match event.outcome {
            TaskOutcome::Success => {
                if task.state == TaskState::Submitted {
                    // The dispatch ack and RUNNING were both overtaken
                    task_state::apply(task, TaskState::Running)?;
                }
                task_state::apply(task, TaskState::Success)?;
                task.host.get_or_insert(event.worker_host);
                task.message = event.message;
                self.workflow.variables.extend(event.output_vars.clone());
                task.output_vars = event.output_vars;
                info!(self.logger, "Task succeeded";
                    "task_instance_id" => &task.id,
                    "node_code" => &task.node_code,
                    "attempt" => event.attempt
                );
                self.on_terminal(idx);
            }
            TaskOutcome::Failure => {
                task.host.get_or_insert(event.worker_host);
                let reason = event.message.unwrap_or_else(|| match event.exit_code {
                    Some(code) => format!("exit code {}", code),
                    None => "task failed".to_string(),
                });
                self.fail_task(idx, reason)?;
            }
            TaskOutcome::Killed => {
                task_state::kill(task, event.message.as_deref().unwrap_or("killed on worker"))?;
                task.host.get_or_insert(event.worker_host);
                self.on_terminal(idx);
            }
        }
        Ok(())
    }

    async fn on_timeout(&mut self, task_instance_id: &str, attempt: u32) -> Result<(), EngineError> {
        let Some(idx) = self.index_of(task_instance_id) else {
            return Ok(());
        };
        let task = &self.tasks[idx];
        if task.attempt() != attempt || !task.state.is_in_flight() {
            return Ok(());
        }
        let timeout_ms = self.graph.task(&task.node_code).and_then(|d| d.timeout_ms).unwrap_or(0);
        warn!(self.logger, "Task timed out";
            "task_instance_id" => task_instance_id,
            "attempt" => attempt,
            "timeout_ms" => timeout_ms
        );
        match self.kind(idx) {
            TaskKind::Remote => {
                if let Some(host) = task.host.clone() {
                    self.queue_kill(idx, host);
                }
            }
            TaskKind::Logic => {
                // A retry launches a fresh child instead of polling this one
                if let Some(child) = self.tasks[idx].sub_workflow_instance_id.take() {
                    self.stop_child(child);
                }
            }
        }
        self.fail_task(idx, format!("timed out after {}ms", timeout_ms))?;
        self.commit().await?;
        self.check_completion().await
    }

    async fn on_retry_due(&mut self, task_instance_id: &str, attempt: u32) -> Result<(), EngineError> {
        let Some(idx) = self.index_of(task_instance_id) else {
            return Ok(());
        };
        let task = &mut self.tasks[idx];
        if task.state != TaskState::Retry || task.attempt() != attempt {
            return Ok(());
        }
        if self.workflow.state != WorkflowState::Running {
            return Ok(());
        }
        task_state::resubmit(task)?;
        self.commit().await?;
        self.start_task(idx).await?;
        self.commit().await
    }

    async fn on_logic_recheck(&mut self, task_instance_id: &str, attempt: u32) -> Result<(), EngineError> {
        let Some(idx) = self.index_of(task_instance_id) else {
            return Ok(());
        };
        let task = &self.tasks[idx];
        if task.attempt() != attempt || task.state != TaskState::Running || self.workflow.state != WorkflowState::Running {
            return Ok(());
        }
        self.run_logic(idx).await?;
        self.commit().await?;
        self.check_completion().await
    }

    async fn on_sub_workflow_finished(
        &mut self,
        task_instance_id: &str,
        child_workflow_instance_id: &str,
        state: WorkflowState,
        variables: HashMap<String, String>,
    ) -> Result<(), EngineError> {
        let Some(idx) = self.index_of(task_instance_id) else {
            return Ok(());
        };
        let task = &self.tasks[idx];
        if task.is_terminal() || task.sub_workflow_instance_id.as_deref() != Some(child_workflow_instance_id) {
            return Ok(());
        }
        let outcome = sub_workflow_outcome(state, variables, SUB_WORKFLOW_RECHECK);
        self.apply_logic_outcome(idx, outcome)?;
        self.commit().await?;
        self.check_completion().await
    }

    async fn on_pause(&mut self, reply: ControlReply) {
        let result = match self.pause_instance() {
            Ok(()) => self.commit().await,
            Err(e) => Err(e),
        };
        let _ = reply.send(result);
    }

    async fn on_resume(&mut self, reply: ControlReply) {
        let result = self.resume_instance().await;
        let failed = result.is_err();
        let _ = reply.send(result);
        if !failed {
            if let Err(e) = self.check_completion().await {
                error!(self.logger, "Completion check failed after resume"; "error" => %e);
            }
        }
    }

    async fn resume_instance(&mut self) -> Result<(), EngineError> {
        if self.workflow.state != WorkflowState::Pause {
            return Err(EngineError::invalid_transition("workflow", self.workflow.state, WorkflowState::Running));
        }
        let nodes = workflow_state::resume(&mut self.workflow)?;
        info!(self.logger, "Workflow resumed"; "nodes" => ?nodes);
        for node in nodes {
            self.instantiate(&node, Readiness::Eligible).await?;
        }
        self.halted = self.compute_halted();
        self.advance_all().await?;
        self.commit().await
    }

    async fn on_stop(&mut self, reply: ControlReply) {
        let result = self.stop_instance().await;
        let stopped = result.is_ok();
        let _ = reply.send(result);
        if stopped {
            self.enqueue(LifecycleEvent::WorkflowFinalize);
        }
    }

    async fn stop_instance(&mut self) -> Result<(), EngineError> {
        if self.workflow.state != WorkflowState::Running {
            return Err(EngineError::invalid_transition("workflow", self.workflow.state, WorkflowState::Stop));
        }
        self.cancel_open_tasks("stopped")?;
        workflow_state::stop(&mut self.workflow)?;
        info!(self.logger, "Workflow stopped");
        self.commit().await
    }

    /// The SUB_WORKFLOW task that launched this instance gave up on it.
    /// Unlike an operator stop this also ends a paused instance.
    async fn on_parent_cancelled(&mut self) -> Result<(), EngineError> {
        if !matches!(self.workflow.state, WorkflowState::Running | WorkflowState::Pause) {
            return Ok(());
        }
        self.cancel_open_tasks("parent cancelled")?;
        workflow_state::abort(&mut self.workflow)?;
        let parent = self.workflow.parent.as_ref().map(|p| p.workflow_instance_id.clone());
        info!(self.logger, "Sub-workflow stopped by its parent";
            "parent_workflow_instance_id" => parent.as_deref().unwrap_or("-")
        );
        self.commit().await?;
        self.enqueue(LifecycleEvent::WorkflowFinalize);
        Ok(())
    }

    async fn on_kill_task(&mut self, task_instance_id: &str, reply: ControlReply) {
        let result = match self.index_of(task_instance_id) {
            None => Err(EngineError::TaskNotFound(task_instance_id.to_string())),
            Some(idx) => match self.cancel_task(idx, "killed by operator") {
                Ok(true) => {
                    info!(self.logger, "Task killed"; "task_instance_id" => task_instance_id);
                    self.on_terminal(idx);
                    self.commit().await
                }
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            },
        };
        let _ = reply.send(result);
    }

    async fn on_worker_lost(&mut self, host: &str) -> Result<(), EngineError> {
        let lost: Vec<usize> = (0..self.tasks.len())
            .filter(|&idx| {
                let task = &self.tasks[idx];
                task.state.is_in_flight() && task.host.as_deref() == Some(host) && self.kind(idx) == TaskKind::Remote
            })
            .collect();
        if lost.is_empty() {
            return Ok(());
        }
        warn!(self.logger, "Worker lost; failing its tasks"; "host" => host, "tasks" => lost.len());
        for idx in lost {
            self.fail_task(idx, format!("worker {} lost", host))?;
        }
        self.commit().await?;
        self.check_completion().await
    }

    async fn finalize(&mut self) -> Result<Flow, EngineError> {
        if !self.workflow.state.is_terminal() {
            return Ok(Flow::Continue);
        }
        self.commit().await?;
        self.ctx.ownership.release(&self.workflow.id).await;

        let state = self.workflow.state;
        self.ctx.events.publish(EngineEvent::WorkflowFinished {
            workflow_instance_id: self.workflow.id.clone(),
            state,
        });

        if let Some(parent) = &self.workflow.parent {
            match self.ctx.repository.get(&parent.workflow_instance_id).await {
                Some(handle) => {
                    let _ = handle.send(LifecycleEvent::SubWorkflowFinished {
                        task_instance_id: parent.task_instance_id.clone(),
                        child_workflow_instance_id: self.workflow.id.clone(),
                        state,
                        variables: self.workflow.variables.clone(),
                    });
                }
                None => {
                    debug!(self.logger, "Parent workflow not local; it will poll";
                        "parent_workflow_instance_id" => &parent.workflow_instance_id
                    );
                }
            }
        }

        self.ctx.repository.remove(&self.workflow.id).await;
        self.drain_after_finish();
        info!(self.logger, "Workflow finalized"; "state" => %state);
        Ok(Flow::Finished)
    }

    /// Answer events that arrived after the instance finished
    fn drain_after_finish(&mut self) {
        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                LifecycleEvent::TaskRunning { ack, .. } | LifecycleEvent::TaskResult { ack, .. } => ack.ack(),
                LifecycleEvent::Pause { reply } | LifecycleEvent::Resume { reply } | LifecycleEvent::Stop { reply } => {
                    let _ = reply.send(Err(EngineError::invalid_transition(
                        "workflow",
                        self.workflow.state,
                        "a new state",
                    )));
                }
                LifecycleEvent::KillTask { reply, .. } => {
                    let _ = reply.send(Ok(()));
                }
                _ => {}
            }
        }
    }

    /// Leave the instance without touching its rows or its lock
    async fn abandon(&mut self) {
        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            event.refuse(&self.ctx.host, &self.workflow.id);
        }
        self.ctx.repository.remove(&self.workflow.id).await;
    }

    /// Resume work on an instance rebuilt from persisted rows
    ///
    /// DISPATCHED/RUNNING remote tasks are not re-dispatched: their worker
    /// keeps reporting to whoever owns the lock. Only their timeout is armed
    /// again, or they are failed if the worker is gone.
    async fn take_over(&mut self) -> Result<(), EngineError> {
        info!(self.logger, "Taking over workflow instance";
            "state" => %self.workflow.state,
            "tasks" => self.tasks.len()
        );
        match self.workflow.state {
            WorkflowState::Submitted => self.enqueue(LifecycleEvent::WorkflowStart),
            WorkflowState::Running => {
                self.workflow.host = Some(self.ctx.host.clone());
                let hosts = self.ctx.dispatcher.hosts().clone();
                if let Err(e) = hosts.refresh().await {
                    warn!(self.logger, "Could not refresh worker list"; "error" => %e);
                }
                let live = hosts.live_hosts().await;

                for idx in 0..self.tasks.len() {
                    let task = &self.tasks[idx];
                    if task.is_terminal() {
                        continue;
                    }
                    match (task.state, self.kind(idx)) {
                        (TaskState::Submitted, _) => self.start_task(idx).await?,
                        (TaskState::Dispatched | TaskState::Running, TaskKind::Remote) => {
                            let host = task.host.clone().unwrap_or_default();
                            if live.contains(&host) {
                                self.arm_timeout(idx);
                            } else {
                                self.fail_task(idx, format!("worker {} lost", host))?;
                            }
                        }
                        (TaskState::Dispatched | TaskState::Running, TaskKind::Logic) => {
                            self.arm_timeout(idx);
                            self.enqueue(LifecycleEvent::LogicRecheck {
                                task_instance_id: task.id.clone(),
                                attempt: task.attempt(),
                            });
                        }
                        (TaskState::Retry, _) => {
                            let delay = self.policy(idx).delay_for(task.retry_count + 1);
                            self.schedule(
                                delay,
                                LifecycleEvent::TaskRetryDue {
                                    task_instance_id: task.id.clone(),
                                    attempt: task.attempt(),
                                },
                            );
                        }
                        _ => {}
                    }
                }

                self.advance_all().await?;
                self.commit().await?;
                self.check_completion().await?;
            }
            state if state.is_terminal() => self.enqueue(LifecycleEvent::WorkflowFinalize),
            _ => {
                self.commit().await?;
            }
        }
        Ok(())
    }
}
