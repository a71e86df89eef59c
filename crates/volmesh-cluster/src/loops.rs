//! Background loops of a coordinator.
//!
//! - the watch loop mirrors the coordination store into the registry cache
//!   and the advisory caches, and converges local machines on master changes
//! - one metadata sync task per machine publishes its snapshots, state and
//!   transfer progress
//! - the container and dirty loops refresh the advisory records of the
//!   filesystems mastered here

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;
use volmesh_core::ContainerInfo;
use volmesh_core::DeleteRequest;
use volmesh_core::DirtyInfo;
use volmesh_core::FilesystemId;
use volmesh_core::KeyValueStore;
use volmesh_core::NodeId;
use volmesh_core::StateReport;
use volmesh_core::WatchEvent;
use volmesh_core::WatchNotification;
use volmesh_core::WatchSubscription;
use volmesh_fsm::MachineHandle;
use volmesh_fsm::MachineState;
use volmesh_fsm::MachineStatus;
use volmesh_fsm::Request;
use volmesh_fsm::Response;
use volmesh_registry::KeyKind;
use volmesh_registry::MasterFilter;

use crate::coordinator::Coordinator;
use crate::error::ClusterError;

/// Version reported in this node's state records.
pub(crate) const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

impl Coordinator {
    // ========================================================================
    // Watch loop
    // ========================================================================

    pub(crate) async fn run_watch_loop(self: Arc<Self>, mut watch: WatchSubscription) {
        info!(node_id = %self.node_id, prefix = watch.prefix(), "watch loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                notification = watch.next() => match notification {
                    Some(WatchNotification::Event(event)) => self.apply_event(&event),
                    Some(WatchNotification::Lagged { missed }) => {
                        warn!(missed, "coordination watch lagged, resynchronizing");
                        if let Err(e) = self.resync().await {
                            warn!(error = %e, "resynchronization failed");
                        }
                    }
                    None => break,
                },
            }
        }
        info!(node_id = %self.node_id, "watch loop stopped");
    }

    fn apply_event(self: &Arc<Self>, event: &WatchEvent) {
        match self.registry.apply_watch_event(event) {
            Some(KeyKind::Master(id)) => match event.value.as_deref() {
                Some(master) => self.converge(&id, &NodeId::from(master)),
                None => {
                    // Released with the name gone: deleted cluster-wide.
                    let known_here = self.machine(&id).is_some() || self.peer_snapshots.read().contains_key(&id);
                    if known_here && self.registry.lookup_by_id(&id).is_none() {
                        let this = self.clone();
                        tokio::spawn(async move { this.forget_filesystem(&id).await });
                    }
                }
            },
            Some(KeyKind::Snapshots { node_id, filesystem_id }) => {
                self.apply_cache_entry(&event.key, event.value.as_deref());
                if self.registry.cached_master_node(&filesystem_id).as_ref() == Some(&node_id) {
                    let snapshots = self
                        .peer_snapshots
                        .read()
                        .get(&filesystem_id)
                        .and_then(|view| view.get(&node_id).cloned())
                        .unwrap_or_default();
                    self.new_snaps_on_master.publish(&filesystem_id, snapshots);
                }
            }
            Some(_) => {
                self.apply_cache_entry(&event.key, event.value.as_deref());
            }
            None => {}
        }
    }

    /// Rebuild everything from a full scan after missing watch events.
    async fn resync(self: &Arc<Self>) -> Result<(), ClusterError> {
        self.registry.refresh().await?;
        self.load_caches().await?;
        self.reconcile_local_machines().await
    }

    /// Start machines for every filesystem mastered here or present in the
    /// local store, then converge every local machine on its master.
    pub(crate) async fn reconcile_local_machines(self: &Arc<Self>) -> Result<(), ClusterError> {
        let mastered = self.registry.list_master_nodes(&MasterFilter::node(self.node_id.clone()));
        let mut ids: BTreeSet<FilesystemId> = mastered.into_keys().collect();
        ids.extend(self.store.list_filesystems().await?);
        for id in &ids {
            self.init_filesystem_machine(id);
        }

        for id in self.local_filesystem_ids() {
            if let Some(master) = self.registry.cached_master_node(&id) {
                self.converge(&id, &master);
            }
        }
        debug!(node_id = %self.node_id, filesystems = ids.len(), "reconciled local machines");
        Ok(())
    }

    /// Bring the local machine for `id` in line with its master assignment.
    fn converge(self: &Arc<Self>, id: &FilesystemId, master: &NodeId) {
        let machine = self.machine(id);
        if master == &self.node_id {
            match machine {
                // Discovery mounts it.
                None => {
                    self.init_filesystem_machine(id);
                }
                Some(machine) if machine.state() == MachineState::Inactive => {
                    self.spawn_dispatch(id, Request::Activate);
                }
                Some(_) => {}
            }
        } else if machine.is_some_and(|machine| machine.state() == MachineState::Active) {
            self.spawn_dispatch(id, Request::Deactivate);
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, id: &FilesystemId, request: Request) {
        let this = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let name = request.name();
            match this.dispatch_and_wait(&id, request).await {
                Ok(Response::Error { kind, message }) => {
                    debug!(filesystem_id = %id, request = name, ?kind, %message, "background request refused")
                }
                Ok(response) => debug!(filesystem_id = %id, request = name, response = response.name(), "background request done"),
                Err(e) => warn!(filesystem_id = %id, request = name, error = %e, "background request failed"),
            }
        });
    }

    /// Drop every local trace of a filesystem that was deleted cluster-wide.
    pub(crate) async fn forget_filesystem(&self, id: &FilesystemId) {
        if let Some(machine) = self.machine(id)
            && machine.state() != MachineState::Deleted
        {
            match machine.request(Request::Delete, Some(self.wait_budget())).await {
                Ok(Response::Deleted) => {}
                Ok(other) => warn!(filesystem_id = %id, response = other.name(), "could not delete local replica"),
                Err(e) => warn!(filesystem_id = %id, error = %e, "could not delete local replica"),
            }
        }
        self.remove_machine(id);

        for key in [self.keys().snapshots(&self.node_id, id), self.keys().state(&self.node_id, id)] {
            if let Err(e) = self.kv.delete(DeleteRequest::new(key)).await {
                debug!(filesystem_id = %id, error = %e, "could not remove node record");
            }
        }
        self.peer_snapshots.write().remove(id);
        self.server_states.write().remove(id);
        self.dirty.write().remove(id);
        self.containers.write().remove(id);
        info!(filesystem_id = %id, "forgot deleted filesystem");
    }

    // ========================================================================
    // Per-machine metadata sync
    // ========================================================================

    /// Publish what `machine` announces to the coordination store: its
    /// snapshot list, its state and the progress of its transfers.
    ///
    /// Stops when the machine stops, is deleted, or the node shuts down. A
    /// deleted machine's records are removed.
    pub(crate) fn spawn_metadata_sync(&self, machine: &MachineHandle) {
        let id = machine.filesystem_id().clone();
        let node = self.node_id.clone();
        let keys = self.keys().clone();
        let kv = self.kv.clone();
        let registry = self.registry.clone();
        let cancel = self.cancel.clone();

        let mut status = machine.subscribe_status();
        let mut snapshots = machine.subscribe_snapshots();
        let mut transfer = machine.subscribe_transfer();
        let initial_snapshots = machine.view().remove(&node).unwrap_or_default();
        let initial_status = status.borrow_and_update().clone();

        let task = tokio::spawn(async move {
            let snapshots_key = keys.snapshots(&node, &id);
            let state_key = keys.state(&node, &id);
            let report = |status: &MachineStatus| StateReport {
                state: status.state.as_str().to_string(),
                status: status.status.clone(),
                version: NODE_VERSION.to_string(),
            };
            let publish_snapshots = |list: Vec<volmesh_core::Snapshot>| {
                let kv = kv.clone();
                let registry = registry.clone();
                let key = snapshots_key.clone();
                async move {
                    // No history means nothing to replicate from here.
                    let result = if list.is_empty() {
                        kv.delete(DeleteRequest::new(&key)).await.map(|_| ()).map_err(ClusterError::from)
                    } else {
                        registry.write_json(&key, &list).await.map_err(ClusterError::from)
                    };
                    if let Err(e) = result {
                        warn!(%key, error = %e, "failed to publish snapshots");
                    }
                }
            };

            publish_snapshots(initial_snapshots).await;
            if let Err(e) = registry.write_json(&state_key, &report(&initial_status)).await {
                warn!(key = %state_key, error = %e, "failed to publish state");
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = status.borrow_and_update().clone();
                        if current.state == MachineState::Deleted {
                            for key in [&snapshots_key, &state_key] {
                                if let Err(e) = kv.delete(DeleteRequest::new(key.as_str())).await {
                                    debug!(%key, error = %e, "could not remove record of deleted filesystem");
                                }
                            }
                            break;
                        }
                        if let Err(e) = registry.write_json(&state_key, &report(&current)).await {
                            warn!(key = %state_key, error = %e, "failed to publish state");
                        }
                    }
                    changed = snapshots.recv() => match changed {
                        Some(changed) => publish_snapshots(changed.snapshots).await,
                        None => break,
                    },
                    changed = transfer.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = transfer.borrow_and_update().clone();
                        if let Some(result) = current {
                            let key = keys.transfer(&result.transfer_request_id);
                            if let Err(e) = registry.write_json(&key, &result).await {
                                warn!(%key, error = %e, "failed to publish transfer progress");
                            }
                        }
                    }
                }
            }
            debug!(filesystem_id = %id, "metadata sync stopped");
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    // ========================================================================
    // Advisory caches
    // ========================================================================

    /// Wake the container loop ahead of its interval.
    pub fn notify_containers_changed(&self) {
        self.containers_changed.notify_one();
    }

    pub(crate) async fn run_container_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.container_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(node_id = %self.node_id, "container loop started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.containers_changed.notified() => {}
            }
            self.refresh_containers().await;
        }
        info!(node_id = %self.node_id, "container loop stopped");
    }

    /// Publish container usage for every filesystem mastered here. Failures
    /// are left for the next cycle.
    async fn refresh_containers(&self) {
        let related = match self.inventory.all_related().await {
            Ok(related) => related,
            Err(e) => {
                warn!(error = %e, "container inventory unavailable");
                return;
            }
        };

        let mastered = self.registry.list_master_nodes(&MasterFilter::node(self.node_id.clone()));
        for id in mastered.keys() {
            let mut containers = related.get(id).cloned().unwrap_or_default();
            containers.sort();
            let info = ContainerInfo {
                server: self.node_id.clone(),
                containers,
            };
            if self.containers.read().get(id) == Some(&info) {
                continue;
            }
            match self.registry.write_json(&self.keys().containers(id), &info).await {
                Ok(()) => {
                    debug!(filesystem_id = %id, containers = info.containers.len(), "published container usage");
                    self.containers.write().insert(id.clone(), info);
                }
                Err(e) => warn!(filesystem_id = %id, error = %e, "failed to publish container usage"),
            }
        }
    }

    pub(crate) async fn run_dirty_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.dirty_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(node_id = %self.node_id, "dirty loop started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.refresh_dirty().await;
        }
        info!(node_id = %self.node_id, "dirty loop stopped");
    }

    /// Poll every active local machine for its uncommitted bytes.
    async fn refresh_dirty(&self) {
        let active: Vec<MachineHandle> = self
            .machines
            .read()
            .values()
            .filter(|machine| machine.state() == MachineState::Active)
            .cloned()
            .collect();
        join_all(active.iter().map(|machine| self.poll_dirty(machine))).await;
    }

    async fn poll_dirty(&self, machine: &MachineHandle) {
        let id = machine.filesystem_id();
        let info = match machine.request(Request::PollDirty, Some(self.wait_budget())).await {
            Ok(Response::Dirty {
                dirty_bytes,
                size_bytes,
            }) => DirtyInfo {
                server: self.node_id.clone(),
                dirty_bytes,
                size_bytes,
            },
            Ok(other) => {
                debug!(filesystem_id = %id, response = other.name(), "dirty poll refused");
                return;
            }
            Err(e) => {
                debug!(filesystem_id = %id, error = %e, "dirty poll failed");
                return;
            }
        };
        if self.dirty.read().get(id) == Some(&info) {
            return;
        }
        match self.registry.write_json(&self.keys().dirty(id), &info).await {
            Ok(()) => {
                self.dirty.write().insert(id.clone(), info);
            }
            Err(e) => warn!(filesystem_id = %id, error = %e, "failed to publish dirty bytes"),
        }
    }
}
