//! Master process assembly

use crate::config::MasterConfig;
use crate::dispatch::LogicTaskRegistry;
use crate::engine::{MasterMessageHandler, MasterRuntime};
use crate::model::WorkflowDefinition;
use crate::node::{api, parse_listen_address, NodeError};
use crate::registry::{HttpRegistryClient, RegistryClient};
use crate::store::{FileMetadataStore, InMemoryMetadataStore, MetadataStore};
use crate::transport::{HttpMessageSender, HttpServer, TransportLayer};
use slog::{error, info, o, warn, Logger};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct MasterNode {
    runtime: Arc<MasterRuntime>,
    server: JoinHandle<()>,
    logger: Logger,
}

impl MasterNode {
    /// Connect to the registry, load definitions, serve HTTP and start background loops
    pub async fn start(config: MasterConfig, logger: Logger) -> Result<Self, NodeError> {
        config.validate()?;
        let address = parse_listen_address(&config.listen_address)?;
        let logger = logger.new(o!("role" => "master"));
        info!(logger, "Starting master";
            "host" => &config.host,
            "listen" => &config.listen_address,
            "registry" => &config.registry.address
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

        let store: Arc<dyn MetadataStore> = match &config.store_dir {
            Some(dir) => {
                info!(logger, "Using file metadata store"; "dir" => %dir.display());
                Arc::new(FileMetadataStore::open(dir.clone()).await?)
            }
            None => {
                warn!(logger, "No store_dir configured; metadata is kept in memory only");
                Arc::new(InMemoryMetadataStore::new())
            }
        };

        let sender = HttpMessageSender::new(config.request_timeout(), logger.new(o!("component" => "http_client")))?;
        let transport = Arc::new(TransportLayer::new(config.host.clone(), Arc::new(sender)));

        let runtime = MasterRuntime::new(
            &config,
            registry,
            transport,
            store,
            Arc::new(LogicTaskRegistry::with_defaults()),
            logger.clone(),
        );

        if let Some(dir) = &config.definitions_dir {
            load_definitions(&runtime, dir, &logger).await?;
        }

        let server = HttpServer::new(
            config.host.clone(),
            "master",
            address,
            Arc::new(MasterMessageHandler::new(runtime.clone())),
            logger.new(o!("component" => "http_server")),
        )
        .with_routes(api::control_routes(runtime.clone(), logger.new(o!("component" => "api"))));
        let server_logger = logger.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!(server_logger, "Master HTTP server stopped"; "error" => %e);
            }
        });

        runtime.register_presence().await?;
        runtime.spawn_background().await?;
        let adopted = runtime.recover_orphans().await?;
        info!(logger, "Master started"; "adopted" => adopted);

        Ok(Self {
            runtime,
            server,
            logger,
        })
    }

    pub fn runtime(&self) -> &Arc<MasterRuntime> {
        &self.runtime
    }

    pub async fn shutdown(self) {
        info!(self.logger, "Shutting down master");
        self.runtime.shutdown().await;
        if let Err(e) = self.runtime.unregister_presence().await {
            warn!(self.logger, "Failed to unregister master"; "error" => %e);
        }
        self.server.abort();
    }
}

/// Register every `*.json` definition file in `dir`
pub async fn load_definitions(runtime: &MasterRuntime, dir: &Path, logger: &Logger) -> Result<usize, NodeError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in &paths {
        let bytes = tokio::fs::read(path).await?;
        let definition: WorkflowDefinition =
            serde_json::from_slice(&bytes).map_err(|e| NodeError::DefinitionFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        runtime.register_definition(definition).await?;
    }
    info!(logger, "Loaded workflow definitions"; "dir" => %dir.display(), "count" => paths.len());
    Ok(paths.len())
}
