//! Peerlink Agent
//!
//! Registers this node under its namespace, follows the namespace membership
//! and keeps a gRPC channel open to every registered peer.

mod version;

use anyhow::Context;
use clap::{Parser, Subcommand};
use peerlink_core::observability::{
    init_metrics_listener, init_tracing, supervise, RestartPolicy, TracingConfig,
};
use peerlink_core::{
    ConnectionPool, CoordinationStore, Discovery, DiscoveryConfig, EtcdStore, GrpcConnector,
    PeerEntry, PeerlinkConfig, Registrar,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Channel;
use tracing::info;

#[derive(Parser)]
#[command(name = "peerlink-agent")]
#[command(about = "Service discovery and self registration over etcd")]
#[command(version)]
struct Cli {
    /// Service namespace
    #[arg(long, global = true, env = "APP_NAME")]
    namespace: Option<String>,

    /// etcd endpoints (comma-separated)
    #[arg(long, global = true, env = "ETCD_ENDPOINTS")]
    etcd_endpoints: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this node and keep a channel open to every peer
    Run {
        /// Node identifier (random when unset)
        #[arg(long, env = "POD_NAME")]
        node_id: Option<String>,

        /// Address advertised to peers (host:port)
        #[arg(long, env = "ADVERTISE_ADDR")]
        address: Option<String>,

        /// Serve Prometheus metrics on this address
        #[arg(long, env = "METRICS_ADDR")]
        metrics_addr: Option<SocketAddr>,
    },
    /// Print the peers registered in the namespace as JSON
    Peers,
    /// Print build information
    Version,
}

#[derive(Serialize)]
struct PeersReport {
    namespace: String,
    peers: Vec<PeerEntry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = PeerlinkConfig::from_env();
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(endpoints) = cli.etcd_endpoints {
        config.etcd.endpoints = endpoints
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    match cli.command {
        Commands::Version => {
            println!("{}", version::build_info());
            Ok(())
        }
        Commands::Peers => print_peers(&config).await,
        Commands::Run {
            node_id,
            address,
            metrics_addr,
        } => {
            if let Some(node_id) = node_id {
                config.node_id = Some(node_id);
            }
            if let Some(address) = address {
                config.address = Some(address);
            }
            run(config, metrics_addr).await
        }
    }
}

async fn connect(config: &PeerlinkConfig) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    let store = EtcdStore::connect(&config.etcd)
        .await
        .context("Failed to connect to etcd")?;
    Ok(Arc::new(store))
}

async fn print_peers(config: &PeerlinkConfig) -> anyhow::Result<()> {
    let store = connect(config).await?;
    let discovery = Discovery::start(store, config.discovery())
        .await
        .context("Failed to read namespace membership")?;

    let mut peers: Vec<PeerEntry> = discovery
        .snapshot()
        .await
        .into_iter()
        .map(|(peer_id, address)| PeerEntry { peer_id, address })
        .collect();
    peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

    let report = PeersReport {
        namespace: config.namespace.clone(),
        peers,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(mut config: PeerlinkConfig, metrics_addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let tracing_config = TracingConfig::from_env();
    init_tracing(&tracing_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    info!(
        service = %tracing_config.service_name,
        version = %version::full_version(),
        "Starting peerlink-agent"
    );

    if let Some(addr) = metrics_addr {
        init_metrics_listener(addr).context("Failed to start metrics listener")?;
        info!(addr = %addr, "Serving metrics");
    }

    let namespace = config.namespace.clone();
    let node_id = config
        .node_id
        .get_or_insert_with(|| format!("{namespace}-{}", uuid::Uuid::new_v4()))
        .clone();
    let registration = config
        .registration()
        .context("Incomplete registration settings")?;

    info!(
        namespace = %namespace,
        node_id = %node_id,
        endpoints = ?config.etcd.endpoints,
        "Connecting to etcd"
    );
    let store = connect(&config).await?;

    let registrar = Registrar::register(store.clone(), registration)
        .await
        .context("Initial registration failed")?;
    info!(key = %registrar.key(), lease_id = ?registrar.lease_id(), "Registered");

    let connector = GrpcConnector::new(config.pool.clone());
    let discovery_config = config.discovery();
    let policy = RestartPolicy::unlimited(Duration::from_millis(500), Duration::from_secs(30));
    let membership = supervise("membership", policy, || {
        follow_membership(store.clone(), discovery_config.clone(), connector.clone())
    });

    let result = tokio::select! {
        result = membership => result.context("Membership tracking stopped"),
        signal = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            signal.context("Failed to listen for shutdown signal")
        }
    };

    registrar
        .close()
        .await
        .context("Failed to revoke registration")?;
    info!("Registration closed");

    result
}

/// Track membership and pool connections until the discovery goes stale.
async fn follow_membership(
    store: Arc<dyn CoordinationStore>,
    config: DiscoveryConfig,
    connector: GrpcConnector,
) -> peerlink_core::Result<()> {
    let discovery = Discovery::start(store, config).await?;
    let pool = ConnectionPool::start(discovery.clone(), connector, |channel: Channel| channel).await;
    info!(
        peers = discovery.len().await,
        connections = pool.len().await,
        "Tracking membership"
    );

    discovery.stopped().await;
    pool.shutdown().await;
    Err(peerlink_core::Error::WatchClosed)
}
