use clap::{Args, Parser, Subcommand};
use dagrun::config::{CoordinatorConfig, MasterConfig, WorkerConfig};
use dagrun::logging::terminal_logger;
use dagrun::node::{MasterNode, WorkerNode};
use dagrun::registry::{InMemoryCoordinator, RegistryService};
use dagrun::worker::TaskExecutorRegistry;
use slog::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "dagrun")]
#[command(about = "Distributed DAG workflow execution", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordination service (locks, ephemeral nodes, watches)
    Coordinator {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on (e.g., 0.0.0.0:5600)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Run a master: owns workflow instances and dispatches their tasks
    Master(MasterArgs),

    /// Run a worker: executes remote tasks
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct MasterArgs {
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    /// Address to listen on (e.g., 0.0.0.0:5700)
    #[arg(short, long)]
    listen: Option<String>,

    /// Advertised address for workers to connect to
    /// If not specified, uses the listen address
    #[arg(short, long)]
    advertise: Option<String>,

    /// Coordinator URL (e.g., http://127.0.0.1:5600)
    #[arg(short, long)]
    registry: Option<String>,

    #[arg(long)]
    store_dir: Option<PathBuf>,

    #[arg(long)]
    definitions_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    /// Address to listen on (e.g., 0.0.0.0:5800)
    #[arg(short, long)]
    listen: Option<String>,

    #[arg(short, long)]
    advertise: Option<String>,

    #[arg(short, long)]
    registry: Option<String>,

    /// Worker groups served (e.g., default,etl)
    #[arg(short, long, value_delimiter = ',')]
    groups: Vec<String>,

    #[arg(short, long)]
    max_concurrent: Option<usize>,

    /// Directory for the in-flight attempt file
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

fn master_config(args: MasterArgs) -> Result<MasterConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => MasterConfig::load_from_file(path)?,
        None => MasterConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(listen) = args.listen {
        config = config.with_listen_address(listen);
    }
    if let Some(advertise) = args.advertise {
        config = config.with_advertise_address(advertise);
    }
    if let Some(registry) = args.registry {
        config.registry = config.registry.with_address(registry);
    }
    if let Some(dir) = args.store_dir {
        config = config.with_store_dir(dir);
    }
    if let Some(dir) = args.definitions_dir {
        config = config.with_definitions_dir(dir);
    }
    Ok(config)
}

fn worker_config(args: WorkerArgs) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::load_from_file(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(listen) = args.listen {
        config = config.with_listen_address(listen);
    }
    if let Some(advertise) = args.advertise {
        config = config.with_advertise_address(advertise);
    }
    if let Some(registry) = args.registry {
        config.registry = config.registry.with_address(registry);
    }
    if !args.groups.is_empty() {
        config = config.with_groups(args.groups);
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config = config.with_max_concurrent(max_concurrent);
    }
    if let Some(dir) = args.state_dir {
        config = config.with_state_dir(dir);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logger = terminal_logger();
    let cli = Cli::parse();

    match cli.command {
        Command::Coordinator { config, listen } => {
            let mut config = match &config {
                Some(path) => CoordinatorConfig::load_from_file(path)?,
                None => CoordinatorConfig::default(),
            };
            if let Some(listen) = listen {
                config.listen_address = listen;
            }
            config.validate()?;
            let address = config.listen_address.parse()?;
            let service = RegistryService::new(InMemoryCoordinator::new(), config.session_timeout(), logger.clone());
            info!(logger, "Press Ctrl+C to shutdown");
            tokio::select! {
                result = service.start(address) => result?,
                _ = signal::ctrl_c() => info!(logger, "Coordinator shutting down"),
            }
        }
        Command::Master(args) => {
            let node = MasterNode::start(master_config(args)?, logger.clone()).await?;
            info!(logger, "Press Ctrl+C to shutdown gracefully");
            signal::ctrl_c().await?;
            node.shutdown().await;
        }
        Command::Worker(args) => {
            let executors = Arc::new(TaskExecutorRegistry::with_defaults());
            let node = WorkerNode::start(worker_config(args)?, executors, logger.clone()).await?;
            info!(logger, "Press Ctrl+C to shutdown gracefully");
            signal::ctrl_c().await?;
            node.shutdown().await;
        }
    }

    Ok(())
}
