//! Meridian command line tool.
//!
//! Server modes:
//!   meridian node --node-config <path> --cluster-config <path>
//!   meridian ticket-issuer --config <path>
//!
//! Client commands (talk to any node's cluster front door):
//!   meridian set --addr <host:port> <key> <value>
//!   meridian get --addr <host:port> <key>
//!   meridian info --addr <host:port>
//!   meridian ticket --addr <host:port> <user-id>
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use meridian::{
    ClusterDescription, ClockServer, ConnManager, Connection, Coordinator, Listener, Liveness,
    LivenessSettings, Message, NodeConfig, NodeServer, Storage, TicketIssuer, TicketIssuerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Meridian - a quorum-replicated key-value store.
#[derive(Parser)]
#[command(name = "meridian")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a cluster node (storage, clock, and coordinator services)
    Node {
        /// Path to this node's YAML config
        #[arg(long)]
        node_config: PathBuf,

        /// Path to the shared cluster YAML config
        #[arg(long)]
        cluster_config: PathBuf,
    },

    /// Run the ticket issuer service
    TicketIssuer {
        /// Path to the ticket issuer YAML config
        #[arg(long)]
        config: PathBuf,
    },

    /// Read a key through a node's cluster front door
    Get {
        /// Address of any cluster node
        #[arg(short, long)]
        addr: String,

        /// Key to read
        key: String,
    },

    /// Write a key through a node's cluster front door
    Set {
        /// Address of any cluster node
        #[arg(short, long)]
        addr: String,

        /// Key to write
        key: String,

        /// Value to store
        value: String,
    },

    /// Show a node's identity, uptime, online view, and stored keys
    Info {
        /// Address of the node
        #[arg(short, long)]
        addr: String,
    },

    /// Request a ticket for a user id
    Ticket {
        /// Address of the ticket issuer
        #[arg(short, long)]
        addr: String,

        /// User id requesting the ticket
        user_id: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    meridian::init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Node {
            node_config,
            cluster_config,
        } => run_node(node_config, cluster_config).await,
        Commands::TicketIssuer { config } => run_ticket_issuer(config).await,
        Commands::Get { addr, key } => client_get(&addr, &key).await,
        Commands::Set { addr, key, value } => client_set(&addr, &key, &value).await,
        Commands::Info { addr } => client_info(&addr).await,
        Commands::Ticket { addr, user_id } => client_ticket(&addr, user_id).await,
    }
}

async fn run_node(node_config: PathBuf, cluster_config: PathBuf) -> Result<()> {
    let node = NodeConfig::load(&node_config)
        .with_context(|| format!("loading node config {}", node_config.display()))?;
    let cluster = Arc::new(
        ClusterDescription::load(&cluster_config)
            .with_context(|| format!("loading cluster config {}", cluster_config.display()))?,
    );
    if cluster.node(&node.id).is_none() {
        bail!("node id '{}' is not in the cluster roster", node.id);
    }

    let storage = Arc::new(Storage::open(&node.data_dir)?);
    let clock = Arc::new(ClockServer::open(&node.epoch_file).await?);
    let conns = Arc::new(ConnManager::new(1, None));
    let coordinator = Arc::new(Coordinator::new(Arc::clone(&cluster), Arc::clone(&conns)));
    let liveness = Arc::new(Liveness::new(
        Arc::clone(&cluster),
        Arc::clone(&conns),
        LivenessSettings::default(),
    ));
    liveness.start();

    let listener = Listener::bind(&node.local_address).await?;
    let server = Arc::new(NodeServer::new(
        &node.id,
        Arc::clone(&storage),
        clock,
        coordinator,
        Arc::clone(&liveness),
    ));

    let serving = tokio::spawn(Arc::clone(&server).serve(listener));

    shutdown_signal().await?;
    tracing::info!("shutting down");
    server.stop();
    liveness.stop();
    let _ = serving.await;
    storage.close()?;
    Ok(())
}

async fn run_ticket_issuer(config_path: PathBuf) -> Result<()> {
    let config = TicketIssuerConfig::load(&config_path)
        .with_context(|| format!("loading ticket issuer config {}", config_path.display()))?;

    let listener = Listener::bind(&config.bind_address).await?;
    let issuer = Arc::new(TicketIssuer::new(config)?);

    let serving = tokio::spawn(Arc::clone(&issuer).serve(listener));

    shutdown_signal().await?;
    tracing::info!("shutting down");
    issuer.stop();
    let _ = serving.await;
    Ok(())
}

async fn client_get(addr: &str, key: &str) -> Result<()> {
    let mut conn = Connection::connect(addr).await?;
    let response = conn
        .request(&Message::ClusterGet {
            key: key.to_string(),
        })
        .await?;

    match response {
        Message::ClusterGetAck { entry: Some(entry) } => {
            println!("{}", entry.value);
            Ok(())
        }
        Message::ClusterGetAck { entry: None } => bail!("key '{key}' not found"),
        Message::Error { message } => bail!(message),
        other => bail!("unexpected response: {other:?}"),
    }
}

async fn client_set(addr: &str, key: &str, value: &str) -> Result<()> {
    let mut conn = Connection::connect(addr).await?;
    let response = conn
        .request(&Message::ClusterSet {
            entry: meridian::Entry::new(key, value),
        })
        .await?;

    match response {
        Message::ClusterSetAck => {
            println!("{} {} = {}", "stored".green(), key.bold(), value);
            Ok(())
        }
        Message::Error { message } => bail!(message),
        other => bail!("unexpected response: {other:?}"),
    }
}

async fn client_info(addr: &str) -> Result<()> {
    let mut conn = Connection::connect(addr).await?;
    let response = conn.request(&Message::Info).await?;

    match response {
        Message::InfoAck {
            node_id,
            uptime,
            online_nodes,
            keys,
        } => {
            println!("{}  {}", "node".bold(), node_id);
            println!("{}  {uptime:?}", "uptime".bold());
            println!(
                "{}  {}",
                "online".bold(),
                if online_nodes.is_empty() {
                    "(none)".dimmed().to_string()
                } else {
                    online_nodes.join(", ")
                }
            );
            println!("{}  {}", "keys".bold(), keys.len());
            for key in keys {
                println!("  {key}");
            }
            Ok(())
        }
        Message::Error { message } => bail!(message),
        other => bail!("unexpected response: {other:?}"),
    }
}

async fn client_ticket(addr: &str, user_id: u64) -> Result<()> {
    let mut conn = Connection::connect(addr).await?;
    let response = conn.request(&Message::IssueTicket { user_id }).await?;

    match response {
        Message::IssueTicketAck { ticketed: true } => {
            println!("{} user {user_id}", "ticketed".green());
            Ok(())
        }
        Message::IssueTicketAck { ticketed: false } => {
            println!("{} user {user_id}", "not ticketed".yellow());
            Ok(())
        }
        Message::Error { message } => bail!(message),
        other => bail!("unexpected response: {other:?}"),
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("listening for ctrl-c")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("listening for ctrl-c")?;
    }
    Ok(())
}
