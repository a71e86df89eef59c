//! Multi-node clusters inside one process.
//!
//! Every node shares one `DeterministicKeyValueStore` and gets its own
//! in-memory snapshot store and container inventory. Snapshot data moves
//! through an `InProcessTransport`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use volmesh_cluster::Coordinator;
use volmesh_cluster::InProcessTransport;
use volmesh_cluster::NodeConfig;
use volmesh_cluster::NodeServices;
use volmesh_core::DeterministicKeyValueStore;
use volmesh_core::InMemorySnapshotStore;
use volmesh_core::NodeId;
use volmesh_core::Principal;
use volmesh_core::SnapshotId;
use volmesh_core::StaticContainerInventory;
use volmesh_core::VolumeRef;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestNode {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<InMemorySnapshotStore>,
    pub inventory: Arc<StaticContainerInventory>,
}

pub struct TestCluster {
    pub kv: Arc<DeterministicKeyValueStore>,
    pub transport: Arc<InProcessTransport>,
    pub nodes: Vec<TestNode>,
}

/// Config tuned for tests: fast background loops.
pub fn test_config(node_id: &str) -> NodeConfig {
    NodeConfig {
        dirty_poll_interval_ms: 20,
        container_poll_interval_ms: 20,
        procure_retry_initial_backoff_ms: 10,
        procure_retry_max_backoff_ms: 50,
        ..NodeConfig::for_node(node_id)
    }
}

impl TestCluster {
    pub async fn start(nodes: usize) -> Self {
        Self::start_with(nodes, |_| {}).await
    }

    pub async fn start_with(nodes: usize, tweak: impl Fn(&mut NodeConfig)) -> Self {
        init_test_tracing();
        let mut cluster = Self {
            kv: DeterministicKeyValueStore::new(),
            transport: InProcessTransport::new(),
            nodes: Vec::with_capacity(nodes),
        };
        for i in 1..=nodes {
            let mut config = test_config(&format!("node-{i}"));
            tweak(&mut config);
            cluster.add_node(config).await;
        }
        cluster
    }

    /// Start one more node with `config` on the shared store.
    pub async fn add_node(&mut self, config: NodeConfig) -> &TestNode {
        let store = Arc::new(InMemorySnapshotStore::new(config.mount_prefix.clone()));
        let inventory = Arc::new(StaticContainerInventory::new());
        let services = NodeServices {
            kv: self.kv.clone(),
            store: store.clone(),
            transport: self.transport.clone(),
            inventory: inventory.clone(),
        };
        let node_id = config.node();
        let coordinator = Coordinator::new(config, services);
        self.transport.register(node_id, &coordinator);
        coordinator.start().await.expect("coordinator starts");
        self.nodes.push(TestNode {
            coordinator,
            store,
            inventory,
        });
        &self.nodes[self.nodes.len() - 1]
    }

    /// Coordinator of `node-{n}`.
    pub fn node(&self, n: usize) -> &Arc<Coordinator> {
        &self.nodes[n - 1].coordinator
    }

    pub fn store(&self, n: usize) -> &Arc<InMemorySnapshotStore> {
        &self.nodes[n - 1].store
    }

    pub fn inventory(&self, n: usize) -> &Arc<StaticContainerInventory> {
        &self.nodes[n - 1].inventory
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.coordinator.shutdown().await;
        }
    }
}

/// Logs go to the test writer; set RUST_LOG to see more.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("volmesh_cluster=info,volmesh_fsm=warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

pub fn alice() -> Principal {
    Principal::new("alice")
}

pub fn bob() -> Principal {
    Principal::new("bob")
}

pub fn notebook() -> VolumeRef {
    VolumeRef::top_level("alice/notebook".parse().expect("valid volume name"))
}

pub fn node_id(n: usize) -> NodeId {
    NodeId::from(format!("node-{n}"))
}

/// Commit `volume` through `coordinator` and return the new snapshot id.
pub async fn commit(coordinator: &Coordinator, volume: &VolumeRef, label: &str) -> SnapshotId {
    let metadata = BTreeMap::from([("message".to_string(), label.to_string())]);
    coordinator
        .snapshot_volume(&alice(), volume, metadata)
        .await
        .expect("snapshot succeeds")
}

/// Poll `check` until it returns true, panicking after `TEST_TIMEOUT`.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while !check().await {
        if start.elapsed() > TEST_TIMEOUT {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
