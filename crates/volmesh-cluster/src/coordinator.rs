//! Process-wide coordinator.
//!
//! Owns the table of local filesystem machines plus the advisory caches
//! (address book, peer snapshot lists, server states, dirty bytes,
//! containers, transfers) and the background loops that keep them current.
//! Mutations of a filesystem always go through its machine; the caches are
//! only mirrors of the coordination store.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;
use volmesh_core::ContainerInfo;
use volmesh_core::ContainerInventory;
use volmesh_core::DirtyInfo;
use volmesh_core::FilesystemId;
use volmesh_core::KeyValueStore;
use volmesh_core::NodeId;
use volmesh_core::Principal;
use volmesh_core::RegistryEntry;
use volmesh_core::ScanRequest;
use volmesh_core::Snapshot;
use volmesh_core::SnapshotStore;
use volmesh_core::StateReport;
use volmesh_core::TopicObserver;
use volmesh_core::TransferPollResult;
use volmesh_core::VolumeRef;
use volmesh_fsm::FsMachine;
use volmesh_fsm::MachineConfig;
use volmesh_fsm::MachineContext;
use volmesh_fsm::MachineHandle;
use volmesh_fsm::PeerTransport;
use volmesh_fsm::PeerView;
use volmesh_fsm::PendingResponse;
use volmesh_fsm::Request;
use volmesh_fsm::Response;
use volmesh_registry::KeyKind;
use volmesh_registry::Keyspace;
use volmesh_registry::Registry;

use crate::config::NodeConfig;
use crate::error::ClusterError;

/// Collaborators a coordinator is built from.
#[derive(Clone)]
pub struct NodeServices {
    pub kv: Arc<dyn KeyValueStore>,
    pub store: Arc<dyn SnapshotStore>,
    pub transport: Arc<dyn PeerTransport>,
    pub inventory: Arc<dyn ContainerInventory>,
}

pub struct Coordinator {
    pub(crate) node_id: NodeId,
    pub(crate) config: NodeConfig,
    pub(crate) kv: Arc<dyn KeyValueStore>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) inventory: Arc<dyn ContainerInventory>,

    pub(crate) machines: RwLock<HashMap<FilesystemId, MachineHandle>>,
    pub(crate) addresses: RwLock<BTreeMap<NodeId, Vec<String>>>,
    /// Every node's last reported history per filesystem.
    pub(crate) peer_snapshots: RwLock<HashMap<FilesystemId, PeerView>>,
    pub(crate) server_states: RwLock<HashMap<FilesystemId, BTreeMap<NodeId, StateReport>>>,
    pub(crate) dirty: RwLock<HashMap<FilesystemId, DirtyInfo>>,
    pub(crate) containers: RwLock<HashMap<FilesystemId, ContainerInfo>>,
    pub(crate) transfers: RwLock<HashMap<String, TransferPollResult>>,
    /// Filesystem each locally started transfer runs against.
    pub(crate) transfer_index: RwLock<HashMap<String, FilesystemId>>,

    /// Fired with the master's snapshot list whenever it changes.
    pub(crate) new_snaps_on_master: TopicObserver<FilesystemId, Vec<Snapshot>>,
    pub(crate) containers_changed: Notify,
    pub(crate) pending_remote_requests: Arc<AtomicUsize>,
    /// Routed requests this node is currently serving.
    pub(crate) routed_in_flight: Mutex<HashSet<String>>,

    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(config: NodeConfig, services: NodeServices) -> Arc<Self> {
        let keys = Keyspace::new(config.key_prefix.clone());
        let registry = Arc::new(Registry::new(services.kv.clone(), keys));
        Arc::new(Self {
            node_id: config.node(),
            config,
            kv: services.kv,
            registry,
            store: services.store,
            transport: services.transport,
            inventory: services.inventory,
            machines: RwLock::new(HashMap::new()),
            addresses: RwLock::new(BTreeMap::new()),
            peer_snapshots: RwLock::new(HashMap::new()),
            server_states: RwLock::new(HashMap::new()),
            dirty: RwLock::new(HashMap::new()),
            containers: RwLock::new(HashMap::new()),
            transfers: RwLock::new(HashMap::new()),
            transfer_index: RwLock::new(HashMap::new()),
            new_snaps_on_master: TopicObserver::default(),
            containers_changed: Notify::new(),
            pending_remote_requests: Arc::new(AtomicUsize::new(0)),
            routed_in_flight: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn keys(&self) -> &Keyspace {
        self.registry.keys()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bring the node up and start the background loops.
    ///
    /// Watches are opened before the initial scan so nothing written in
    /// between is missed.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn start(self: &Arc<Self>) -> Result<(), ClusterError> {
        if self.cancel.is_cancelled() {
            return Err(ClusterError::ShuttingDown);
        }
        let watch = self.kv.watch(&self.keys().root()).await?;
        let requests = self.kv.watch(&self.keys().requests_prefix()).await?;

        self.publish_addresses().await?;
        self.registry.refresh().await?;
        self.load_caches().await?;
        self.reconcile_local_machines().await?;

        let handles = vec![
            tokio::spawn(self.clone().run_watch_loop(watch)),
            tokio::spawn(self.clone().run_routing_loop(requests)),
            tokio::spawn(self.clone().run_container_loop()),
            tokio::spawn(self.clone().run_dirty_loop()),
        ];
        self.tasks.lock().extend(handles);

        info!(
            node_id = %self.node_id,
            filesystems = self.machines.read().len(),
            "coordinator started"
        );
        Ok(())
    }

    /// Stop the background loops and every local machine.
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id, "coordinator shutting down");
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }
        // Dropping the last handle stops a machine once its inbox drains.
        self.machines.write().clear();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn publish_addresses(&self) -> Result<(), ClusterError> {
        let key = self.keys().addresses(&self.node_id);
        self.registry.write_json(&key, &self.config.addresses).await?;
        self.addresses.write().insert(self.node_id.clone(), self.config.addresses.clone());
        Ok(())
    }

    /// Fill the advisory caches from the coordination store.
    pub(crate) async fn load_caches(&self) -> Result<(), ClusterError> {
        let prefixes = [
            self.keys().addresses_prefix(),
            self.keys().snapshots_prefix(),
            self.keys().states_prefix(),
            self.keys().dirty_prefix(),
            self.keys().containers_prefix(),
            self.keys().transfers_prefix(),
        ];
        for prefix in prefixes {
            for entry in self.kv.scan_all(ScanRequest::prefix(prefix)).await? {
                self.apply_cache_entry(&entry.key, Some(&entry.value));
            }
        }
        Ok(())
    }

    /// Mirror one coordination-store key into the caches. `None` = deleted.
    ///
    /// Returns what the key was, for callers that react further.
    pub(crate) fn apply_cache_entry(&self, key: &str, value: Option<&str>) -> Option<KeyKind> {
        let kind = self.keys().parse(key)?;
        match &kind {
            KeyKind::Addresses(node) => match value.and_then(|v| parse_cached::<Vec<String>>(key, v)) {
                Some(addresses) => {
                    self.addresses.write().insert(node.clone(), addresses);
                }
                None => {
                    self.addresses.write().remove(node);
                }
            },
            KeyKind::Snapshots { node_id, filesystem_id } => {
                let snapshots = value.and_then(|v| parse_cached::<Vec<Snapshot>>(key, v));
                self.record_peer_snapshots(filesystem_id, node_id, snapshots);
            }
            KeyKind::State { node_id, filesystem_id } => {
                let report = value.and_then(|v| parse_cached::<StateReport>(key, v));
                let mut states = self.server_states.write();
                match report {
                    Some(report) => {
                        states.entry(filesystem_id.clone()).or_default().insert(node_id.clone(), report);
                    }
                    None => {
                        if let Some(nodes) = states.get_mut(filesystem_id) {
                            nodes.remove(node_id);
                        }
                    }
                }
            }
            KeyKind::Dirty(id) => match value.and_then(|v| parse_cached::<DirtyInfo>(key, v)) {
                Some(info) => {
                    self.dirty.write().insert(id.clone(), info);
                }
                None => {
                    self.dirty.write().remove(id);
                }
            },
            KeyKind::Containers(id) => match value.and_then(|v| parse_cached::<ContainerInfo>(key, v)) {
                Some(info) => {
                    self.containers.write().insert(id.clone(), info);
                }
                None => {
                    self.containers.write().remove(id);
                }
            },
            KeyKind::Transfer { transfer_id } => match value.and_then(|v| parse_cached::<TransferPollResult>(key, v)) {
                Some(result) => {
                    self.transfers.write().insert(transfer_id.clone(), result);
                }
                None => {
                    self.transfers.write().remove(transfer_id);
                }
            },
            KeyKind::Filesystem(_)
            | KeyKind::Clone { .. }
            | KeyKind::Master(_)
            | KeyKind::Request { .. }
            | KeyKind::Response { .. } => {}
        }
        Some(kind)
    }

    /// Record a node's history in the mirror and in the local machine's view.
    pub(crate) fn record_peer_snapshots(&self, id: &FilesystemId, node: &NodeId, snapshots: Option<Vec<Snapshot>>) {
        {
            let mut mirror = self.peer_snapshots.write();
            match &snapshots {
                Some(snapshots) => {
                    mirror.entry(id.clone()).or_default().insert(node.clone(), snapshots.clone());
                }
                None => {
                    if let Some(view) = mirror.get_mut(id) {
                        view.remove(node);
                    }
                }
            }
        }
        // A machine's own entry is written by the machine alone.
        if node != &self.node_id
            && let Some(machine) = self.machine(id)
        {
            match snapshots {
                Some(snapshots) => machine.update_peer_snapshots(node, snapshots),
                None => machine.remove_peer(node),
            }
        }
    }

    // ========================================================================
    // Machines
    // ========================================================================

    pub fn machine(&self, id: &FilesystemId) -> Option<MachineHandle> {
        self.machines.read().get(id).cloned()
    }

    pub fn local_filesystem_ids(&self) -> Vec<FilesystemId> {
        let mut ids: Vec<FilesystemId> = self.machines.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The machine for `id`, started if this node has none yet.
    pub fn init_filesystem_machine(&self, id: &FilesystemId) -> MachineHandle {
        if let Some(handle) = self.machine(id) {
            return handle;
        }
        let handle = {
            let mut machines = self.machines.write();
            if let Some(handle) = machines.get(id) {
                return handle.clone();
            }
            let ctx = MachineContext {
                node_id: self.node_id.clone(),
                filesystem_id: id.clone(),
                store: self.store.clone(),
                registry: self.registry.clone(),
                transport: self.transport.clone(),
            };
            let config = MachineConfig {
                queue_depth: self.config.request_queue_depth,
            };
            let handle = FsMachine::spawn(ctx, config);
            machines.insert(id.clone(), handle.clone());
            handle
        };

        let known = self.peer_snapshots.read().get(id).cloned().unwrap_or_default();
        for (node, snapshots) in known {
            handle.update_peer_snapshots(&node, snapshots);
        }
        self.spawn_metadata_sync(&handle);
        debug!(filesystem_id = %id, "started filesystem machine");
        handle
    }

    pub(crate) fn remove_machine(&self, id: &FilesystemId) {
        if self.machines.write().remove(id).is_some() {
            debug!(filesystem_id = %id, "dropped filesystem machine");
        }
    }

    /// Send `request` to the local machine for `id`.
    pub async fn dispatch(&self, id: &FilesystemId, request: Request) -> Result<PendingResponse, ClusterError> {
        if self.cancel.is_cancelled() {
            return Err(ClusterError::ShuttingDown);
        }
        let machine = self.init_filesystem_machine(id);
        Ok(machine.dispatch(request).await?)
    }

    /// Dispatch locally and wait, bounded by the configured dispatch timeout.
    pub async fn dispatch_and_wait(&self, id: &FilesystemId, request: Request) -> Result<Response, ClusterError> {
        let pending = self.dispatch(id, request).await?;
        self.await_response(pending).await
    }

    pub(crate) async fn await_response(&self, pending: PendingResponse) -> Result<Response, ClusterError> {
        let response = match self.config.dispatch_timeout() {
            Some(deadline) => pending.wait_timeout(deadline).await?,
            None => pending.wait().await?,
        };
        Ok(response)
    }

    // ========================================================================
    // Read-only views
    // ========================================================================

    /// Every node's known history of `id`, including this node's.
    pub fn peer_view(&self, id: &FilesystemId) -> PeerView {
        match self.machine(id) {
            Some(machine) => machine.view(),
            None => self.peer_snapshots.read().get(id).cloned().unwrap_or_default(),
        }
    }

    pub fn addresses_of(&self, node: &NodeId) -> Option<Vec<String>> {
        self.addresses.read().get(node).cloned()
    }

    pub fn address_book(&self) -> BTreeMap<NodeId, Vec<String>> {
        self.addresses.read().clone()
    }

    pub fn dirty_info(&self, id: &FilesystemId) -> Option<DirtyInfo> {
        self.dirty.read().get(id).cloned()
    }

    pub fn containers_for(&self, id: &FilesystemId) -> Option<ContainerInfo> {
        self.containers.read().get(id).cloned()
    }

    pub fn server_states(&self, id: &FilesystemId) -> BTreeMap<NodeId, StateReport> {
        self.server_states.read().get(id).cloned().unwrap_or_default()
    }

    /// Remote requests still waiting for their response record.
    pub fn pending_remote_requests(&self) -> usize {
        self.pending_remote_requests.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Name resolution
    // ========================================================================

    /// Resolve `volume` and check `principal` may use it.
    pub(crate) async fn resolve(
        &self,
        principal: &Principal,
        volume: &VolumeRef,
        action: &'static str,
    ) -> Result<(FilesystemId, RegistryEntry), ClusterError> {
        let entry = self
            .registry
            .lookup_entry(&volume.name)
            .await?
            .ok_or_else(|| ClusterError::NotFound {
                what: format!("volume {}", volume.name),
            })?;
        if !entry.authorize(principal) {
            return Err(ClusterError::PermissionDenied {
                user: principal.user_id.clone(),
                action,
                what: volume.name.to_string(),
            });
        }
        let id = self.registry.maybe_clone_filesystem_id(&volume.name, volume.branch.as_deref()).await?;
        Ok((id, entry))
    }

    pub(crate) fn wait_budget(&self) -> Duration {
        self.config.dispatch_timeout().unwrap_or_else(|| self.config.procure_timeout())
    }
}

fn parse_cached<T: serde::de::DeserializeOwned>(key: &str, value: &str) -> Option<T> {
    match serde_json::from_str(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(%key, error = %e, "ignoring unparseable record");
            None
        }
    }
}
