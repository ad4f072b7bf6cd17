//! Worker process assembly

use crate::config::WorkerConfig;
use crate::engine::EngineEvent;
use crate::node::{parse_listen_address, NodeError};
use crate::registry::{HttpRegistryClient, RegistryClient};
use crate::transport::{HttpMessageSender, HttpServer, TransportLayer};
use crate::worker::{TaskExecutorRegistry, WorkerMessageHandler, WorkerRuntime};
use slog::{error, info, o, warn, Logger};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct WorkerNode {
    runtime: Arc<WorkerRuntime>,
    tasks: Vec<JoinHandle<()>>,
    logger: Logger,
}

impl WorkerNode {
    /// Serve HTTP, settle attempts left by a previous run, then start heartbeats
    pub async fn start(
        config: WorkerConfig,
        executors: Arc<TaskExecutorRegistry>,
        logger: Logger,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let address = parse_listen_address(&config.listen_address)?;
        let logger = logger.new(o!("role" => "worker"));
        info!(logger, "Starting worker";
            "host" => &config.host,
            "listen" => &config.listen_address,
            "groups" => ?config.groups,
            "max_concurrent" => config.pool.max_concurrent
        );

        let registry: Arc<dyn RegistryClient> = Arc::new(
            HttpRegistryClient::connect(
                &config.registry.address,
                &config.host,
                config.registry.keepalive_interval(),
                config.registry.watch_poll_interval(),
                logger.new(o!("component" => "registry")),
            )
            .await?,
        );
        let sender = HttpMessageSender::new(config.request_timeout(), logger.new(o!("component" => "http_client")))?;
        let transport = Arc::new(TransportLayer::new(config.host.clone(), Arc::new(sender)));

        let runtime = WorkerRuntime::new(&config, registry, transport, executors, logger.clone()).await?;

        let server = HttpServer::new(
            config.host.clone(),
            "worker",
            address,
            Arc::new(WorkerMessageHandler::new(runtime.clone())),
            logger.new(o!("component" => "http_server")),
        );
        let server_logger = logger.clone();
        let mut tasks = vec![tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!(server_logger, "Worker HTTP server stopped"; "error" => %e);
            }
        })];

        let mut events = runtime.subscribe_events();
        let alert_logger = logger.new(o!("component" => "alerts"));
        tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::DeliveryAlert { key, target, attempts }) => {
                        error!(alert_logger, "Event dropped at delivery ceiling";
                            "key" => %key,
                            "target" => &target,
                            "attempts" => attempts
                        );
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(alert_logger, "Alert stream lagged"; "skipped" => skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        runtime.reconcile().await;
        runtime.publish_heartbeat().await?;
        tasks.push(runtime.spawn_heartbeat(config.heartbeat_interval()));
        tasks.push(runtime.delivery().spawn_retry_loop());
        info!(logger, "Worker started");

        Ok(Self { runtime, tasks, logger })
    }

    pub fn runtime(&self) -> &Arc<WorkerRuntime> {
        &self.runtime
    }

    pub async fn shutdown(self) {
        info!(self.logger, "Shutting down worker");
        self.runtime.kill_all().await;
        for task in self.tasks {
            task.abort();
        }
    }
}
