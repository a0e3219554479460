//! WolfKeeper - Leader Election and Service Discovery
//!
//! Runs a cluster participant, the development coordinator, or an
//! in-process simulation of a whole fleet.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfkeeper::cluster::{ClusterStatus, NodeRole};
use wolfkeeper::config::{default_config_path, LogFormat, LoggingConfig, WolfKeeperConfig};
use wolfkeeper::coord::{Connector, CoordinatorServer, MemoryEnsemble, RemoteConnector};
use wolfkeeper::error::{Error, Result};
use wolfkeeper::node::ClusterNode;

/// WolfKeeper - Leader Election and Service Discovery
#[derive(Parser)]
#[command(name = "wolfkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the election as a participant
    Start,

    /// Run the development coordinator
    Serve {
        /// Address to listen on (defaults to server.bind_address)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run an in-process fleet, killing the leader every round
    Simulate {
        /// Number of participants
        #[arg(short, long, default_value_t = 5)]
        nodes: usize,

        /// Number of leader failures to inject
        #[arg(short, long, default_value_t = 3)]
        rounds: usize,
    },

    /// Show the election order and registered workers
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfkeeper.toml")]
        output: PathBuf,

        /// Node ID (generated when omitted)
        #[arg(long)]
        node_id: Option<String>,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when there is one
    let logging = WolfKeeperConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Start => run_start(&cli.config).await,
        Commands::Serve { bind } => run_serve(&cli.config, bind).await,
        Commands::Simulate { nodes, rounds } => run_simulate(nodes, rounds).await,
        Commands::Status { json } => run_status(&cli.config, json).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match logging.log_format() {
        Ok(LogFormat::Compact) => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        Ok(LogFormat::Pretty) => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
        // Rejected later by validation; log in the default style until then
        Err(_) => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Load the config file, or defaults when it does not exist
fn load_or_default(config_path: &Path) -> Result<WolfKeeperConfig> {
    if config_path.exists() {
        WolfKeeperConfig::from_file(config_path)
    } else {
        tracing::debug!("No configuration at {:?}; using defaults", config_path);
        Ok(WolfKeeperConfig::for_node("local"))
    }
}

/// Run a participant until interrupted
async fn run_start(config_path: &Path) -> Result<()> {
    let config = match WolfKeeperConfig::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);
    tracing::info!("Coordinator: {}", config.coordinator.address);

    let connector: Arc<dyn Connector> = Arc::new(RemoteConnector::from_config(&config.coordinator));
    let node = Arc::new(ClusterNode::new(&config, connector));

    // Report role changes as they happen
    let mut roles = node.roles();
    let node_id = config.node.id.clone();
    tokio::spawn(async move {
        while roles.changed().await.is_ok() {
            let role = *roles.borrow_and_update();
            tracing::info!("Node {} is now {}", node_id, role);
        }
    });

    let running = Arc::clone(&node);
    let mut handle = tokio::spawn(async move { running.run().await });

    tokio::select! {
        result = &mut handle => {
            return result.map_err(|e| Error::Internal(e.to_string()))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            node.shutdown();
        }
    }

    handle.await.map_err(|e| Error::Internal(e.to_string()))?
}

/// Run the development coordinator until interrupted
async fn run_serve(config_path: &Path, bind: Option<String>) -> Result<()> {
    let config = load_or_default(config_path)?;
    let bind_address = bind.unwrap_or_else(|| config.server.bind_address.clone());

    let server = CoordinatorServer::new(bind_address, MemoryEnsemble::new(), config.max_session_timeout());

    tokio::select! {
        result = server.start() => {
            if let Err(e) = &result {
                tracing::error!("Coordinator error: {}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            server.stop();
            Ok(())
        }
    }
}

/// Run a fleet against an in-process coordinator
async fn run_simulate(nodes: usize, rounds: usize) -> Result<()> {
    if nodes < 2 {
        return Err(Error::Config("simulate needs at least 2 nodes".into()));
    }

    let ensemble = MemoryEnsemble::new();
    let mut fleet = Vec::with_capacity(nodes);
    let mut handles = Vec::with_capacity(nodes);

    for i in 1..=nodes {
        let mut config = WolfKeeperConfig::for_node(format!("sim-{}", i));
        config.node.advertise_address = Some(format!("http://sim-{}:{}", i, config.node.port));
        config.coordinator.reconnect_delay_ms = 100;

        let node = Arc::new(ClusterNode::new(&config, Arc::new(ensemble.clone())));
        let running = Arc::clone(&node);
        handles.push(tokio::spawn(async move { running.run().await }));
        fleet.push(node);
    }

    for round in 1..=rounds {
        let leader = wait_for_convergence(&fleet).await?;
        print_round(&format!("Round {}", round), &leader).await?;

        if let Some(session) = leader.session_id() {
            println!("  killing session {:#x} of {}", session, leader.node_id());
            ensemble.expire_session(session).await;
        }
    }

    let leader = wait_for_convergence(&fleet).await?;
    print_round("Final", &leader).await?;

    for node in &fleet {
        node.shutdown();
    }
    for result in futures::future::join_all(handles).await {
        result.map_err(|e| Error::Internal(e.to_string()))??;
    }

    Ok(())
}

async fn print_round(label: &str, leader: &ClusterNode) -> Result<()> {
    let workers = leader.addresses().await?;
    println!("{}: leader {} with {} workers", label, leader.node_id(), workers.len());
    for worker in workers.iter() {
        println!("  worker {}", worker);
    }
    Ok(())
}

/// Wait until one node leads and it sees every other node as a worker
async fn wait_for_convergence(fleet: &[Arc<ClusterNode>]) -> Result<Arc<ClusterNode>> {
    let deadline = Instant::now() + Duration::from_secs(10);

    loop {
        let leaders: Vec<&Arc<ClusterNode>> = fleet.iter().filter(|n| n.role() == NodeRole::Leader).collect();
        let workers = fleet.iter().filter(|n| n.role() == NodeRole::Worker).count();

        if leaders.len() == 1 && workers == fleet.len() - 1 {
            let leader = leaders[0];
            if let Ok(addresses) = leader.addresses().await {
                if addresses.len() == workers {
                    return Ok(Arc::clone(leader));
                }
            }
        }

        if Instant::now() > deadline {
            return Err(Error::Internal(format!(
                "fleet did not converge: {} leaders, {} workers",
                leaders.len(),
                workers
            )));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Print the cluster as seen by the coordinator
async fn run_status(config_path: &Path, json: bool) -> Result<()> {
    let config = load_or_default(config_path)?;
    let session = RemoteConnector::from_config(&config.coordinator).connect().await?;

    let status = ClusterStatus::read(
        session.coordinator.as_ref(),
        &config.election.election_path,
        &config.election.registry_path,
    )
    .await;
    if let Err(e) = session.coordinator.close().await {
        tracing::debug!("Closing status session: {}", e);
    }
    let status = status?;

    if json {
        let rendered = serde_json::to_string_pretty(&status)
            .map_err(|e| Error::Internal(e.to_string()))?;
        println!("{}", rendered);
        return Ok(());
    }

    println!("Election order ({}):", config.election.election_path);
    if status.candidates.is_empty() {
        println!("  (no candidates)");
    }
    for candidate in &status.candidates {
        if status.leader.as_ref() == Some(candidate) {
            println!("  {}  (leader)", candidate);
        } else {
            println!("  {}", candidate);
        }
    }
    println!();
    println!("Workers ({}):", config.election.registry_path);
    if status.workers.is_empty() {
        println!("  (none registered)");
    }
    for worker in &status.workers {
        println!("  {}", worker);
    }

    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: Option<String>) -> Result<()> {
    let node_id = node_id.unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("node-{}", &id[..8])
    });

    let config_content = format!(r#"# WolfKeeper Configuration
# Generated configuration file

[node]
id = "{node_id}"
port = 8081
# advertise_address = "http://my-host:8081"

[coordinator]
address = "127.0.0.1:2181"
session_timeout_ms = 3000
connect_timeout_ms = 5000
request_timeout_ms = 5000
reconnect_delay_ms = 1000

[election]
election_path = "/election"
registry_path = "/service_registry"

[server]
bind_address = "0.0.0.0:2181"
max_session_timeout_ms = 40000

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nStart a coordinator with: wolfkeeper serve");
    println!("Then join with: wolfkeeper --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> Result<()> {
    match WolfKeeperConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID:        {}", config.node.id);
            println!("  Advertise:      {}", config.advertise_address());
            println!("  Coordinator:    {}", config.coordinator.address);
            println!("  Session:        {} ms", config.coordinator.session_timeout_ms);
            println!("  Election Path:  {}", config.election.election_path);
            println!("  Registry Path:  {}", config.election.registry_path);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
