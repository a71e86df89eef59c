//! volmesh node binary.
//!
//! Runs one or more coordinators in a single process on an in-memory
//! coordination store and in-memory snapshot stores. Useful for trying the
//! procurement protocol end to end; real deployments swap in a replicated
//! store and an on-disk snapshot backend through `NodeServices`.
//!
//! Configuration layers, lowest precedence first: environment (VOLMESH_*),
//! TOML file, command-line arguments.
//!
//! # Usage
//!
//! ```bash
//! # One node
//! volmesh-node --node-id node-1
//!
//! # Three nodes sharing one store
//! volmesh-node --node-id node-1 --peer node-2 --peer node-3
//!
//! # With a config file
//! volmesh-node --config /etc/volmesh/node.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use volmesh::cluster::Coordinator;
use volmesh::cluster::InProcessTransport;
use volmesh::cluster::NodeConfig;
use volmesh::cluster::NodeServices;
use volmesh::cluster::load_config;
use volmesh::types::DeterministicKeyValueStore;
use volmesh::types::InMemorySnapshotStore;
use volmesh::types::StaticContainerInventory;

#[derive(Parser, Debug)]
#[command(name = "volmesh-node", version)]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Identity of this node in the cluster.
    #[arg(long)]
    node_id: Option<String>,

    /// Address peers reach this node on. Repeatable.
    #[arg(long = "address")]
    addresses: Vec<String>,

    /// Namespace for every key in the coordination store.
    #[arg(long)]
    key_prefix: Option<String>,

    /// How long a procurement waits for the master to hand over.
    #[arg(long)]
    procure_timeout_ms: Option<u64>,

    /// Deadline for each local dispatch; 0 waits indefinitely.
    #[arg(long)]
    dispatch_timeout_ms: Option<u64>,

    /// Root under which filesystems are mounted.
    #[arg(long)]
    mount_prefix: Option<String>,

    /// Extra node started in this process on the same store. Repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,
}

impl Args {
    /// CLI values as a config overlay; unset flags keep their defaults so
    /// they never win a merge.
    fn overrides(&self) -> NodeConfig {
        let defaults = NodeConfig::default();
        NodeConfig {
            node_id: self.node_id.clone().unwrap_or_default(),
            addresses: self.addresses.clone(),
            key_prefix: self.key_prefix.clone().unwrap_or(defaults.key_prefix),
            procure_timeout_ms: self.procure_timeout_ms.unwrap_or(defaults.procure_timeout_ms),
            dispatch_timeout_ms: self.dispatch_timeout_ms.unwrap_or(defaults.dispatch_timeout_ms),
            mount_prefix: self.mount_prefix.clone().unwrap_or(defaults.mount_prefix),
            ..defaults
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

async fn start_node(
    config: NodeConfig,
    kv: &Arc<DeterministicKeyValueStore>,
    transport: &Arc<InProcessTransport>,
) -> Result<Arc<Coordinator>> {
    let node_id = config.node();
    let services = NodeServices {
        kv: kv.clone(),
        store: Arc::new(InMemorySnapshotStore::new(config.mount_prefix.clone())),
        transport: transport.clone(),
        inventory: Arc::new(StaticContainerInventory::new()),
    };
    let coordinator = Coordinator::new(config, services);
    transport.register(node_id.clone(), &coordinator);
    coordinator.start().await.with_context(|| format!("failed to start node {node_id}"))?;
    info!(%node_id, "node started");
    Ok(coordinator)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = load_config(args.config.as_deref(), args.overrides()).context("failed to load configuration")?;
    info!(
        node_id = %config.node_id,
        key_prefix = %config.key_prefix,
        procure_timeout_ms = config.procure_timeout_ms,
        peers = args.peers.len(),
        "loaded configuration"
    );

    let kv = DeterministicKeyValueStore::new();
    let transport = InProcessTransport::new();

    let mut nodes = Vec::with_capacity(1 + args.peers.len());
    for peer in &args.peers {
        let peer_config = NodeConfig {
            node_id: peer.clone(),
            addresses: Vec::new(),
            ..config.clone()
        };
        peer_config.validate().with_context(|| format!("invalid peer {peer}"))?;
        nodes.push(start_node(peer_config, &kv, &transport).await?);
    }
    nodes.push(start_node(config, &kv, &transport).await?);

    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    for node in &nodes {
        if node.pending_remote_requests() > 0 {
            warn!(node_id = %node.node_id(), pending = node.pending_remote_requests(), "abandoning routed requests");
        }
        node.shutdown().await;
        transport.unregister(node.node_id());
    }
    info!("shutdown complete");
    Ok(())
}
