//! The filesystem machine actor.
//!
//! One machine per filesystem per node. It owns every mutation of that
//! filesystem's local copy: requests arrive on a bounded inbox and are
//! handled strictly one after another, each answered on its own reply
//! channel. State, snapshots and transfer progress are published on watch
//! and observer channels so readers never have to go through the inbox.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use volmesh_core::CloneInfo;
use volmesh_core::DiscoveredFilesystem;
use volmesh_core::FilesystemId;
use volmesh_core::NodeId;
use volmesh_core::Observer;
use volmesh_core::Origin;
use volmesh_core::Snapshot;
use volmesh_core::SnapshotId;
use volmesh_core::SnapshotStore;
use volmesh_core::SnapshotStream;
use volmesh_core::StoreError;
use volmesh_core::TransferDirection;
use volmesh_core::TransferPollResult;
use volmesh_core::TransferRequest;
use volmesh_core::constants::DEFAULT_BRANCH;
use volmesh_core::constants::DEFAULT_REQUEST_QUEUE_DEPTH;
use volmesh_core::constants::DIVERGED_BRANCH_MARKER;
use volmesh_core::now_unix_ms;
use volmesh_core::restrict_snapshots;
use volmesh_core::short_id;
use volmesh_registry::Registry;
use volmesh_registry::RegistryError;

use crate::error::HandlerError;
use crate::event::Request;
use crate::event::Response;
use crate::handle::Envelope;
use crate::handle::MachineHandle;
use crate::handle::SnapshotsChanged;
use crate::latency::PeerView;
use crate::latency::send_base;
use crate::stash::stash_branch;
use crate::state::MachineState;
use crate::state::MachineStatus;
use crate::transfer::TransferTracker;
use crate::transport::PeerTransport;
use crate::transport::TransportError;

/// Metadata key marking snapshots taken automatically before a move.
pub const SNAPSHOT_TYPE_KEY: &str = "type";
pub const MIGRATION_SNAPSHOT_TYPE: &str = "migration";

/// Collaborators a machine works with.
#[derive(Clone)]
pub struct MachineContext {
    pub node_id: NodeId,
    pub filesystem_id: FilesystemId,
    pub store: Arc<dyn SnapshotStore>,
    pub registry: Arc<Registry>,
    pub transport: Arc<dyn PeerTransport>,
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Requests that may wait in the inbox before `dispatch` blocks.
    pub queue_depth: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_REQUEST_QUEUE_DEPTH,
        }
    }
}

pub struct FsMachine {
    ctx: MachineContext,
    inbox: mpsc::Receiver<Envelope>,
    state: MachineState,
    status_tx: watch::Sender<MachineStatus>,
    view: Arc<watch::Sender<PeerView>>,
    snapshots: Arc<Observer<SnapshotsChanged>>,
    transfer_tx: Arc<watch::Sender<Option<TransferPollResult>>>,
    local: DiscoveredFilesystem,
    /// Target of a move in progress.
    handoff_target: Option<NodeId>,
}

impl FsMachine {
    /// Start a machine and return its handle.
    ///
    /// The machine discovers the local copy before taking requests; requests
    /// dispatched meanwhile wait in the inbox. It stops once every handle is
    /// dropped.
    pub fn spawn(ctx: MachineContext, config: MachineConfig) -> MachineHandle {
        let (requests, inbox) = mpsc::channel(config.queue_depth.max(1));
        let (status_tx, status) = watch::channel(MachineStatus {
            state: MachineState::Discovering,
            status: "discovering".into(),
            transitioned_at_ms: now_unix_ms(),
        });
        let (transfer_tx, transfer) = watch::channel(None);
        let (view, _) = watch::channel(PeerView::new());
        let view = Arc::new(view);
        let snapshots = Arc::new(Observer::default());

        let handle = MachineHandle {
            filesystem_id: ctx.filesystem_id.clone(),
            node_id: ctx.node_id.clone(),
            requests,
            status,
            view: view.clone(),
            snapshots: snapshots.clone(),
            transfer,
        };
        let local = DiscoveredFilesystem::missing(ctx.filesystem_id.clone());
        let machine = FsMachine {
            ctx,
            inbox,
            state: MachineState::Discovering,
            status_tx,
            view,
            snapshots,
            transfer_tx: Arc::new(transfer_tx),
            local,
            handoff_target: None,
        };
        tokio::spawn(machine.run());
        handle
    }

    async fn run(mut self) {
        self.discover().await;

        while let Some(envelope) = self.inbox.recv().await {
            let Envelope {
                request_id,
                request,
                reply,
            } = envelope;
            let name = request.name();
            debug!(
                filesystem_id = %self.ctx.filesystem_id,
                request_id = %request_id,
                request = name,
                state = %self.state,
                "handling request"
            );
            let response = self.handle(request).await;
            if reply.send(response).is_err() {
                debug!(filesystem_id = %self.ctx.filesystem_id, request_id = %request_id, "caller went away before the response");
            }
        }
        debug!(filesystem_id = %self.ctx.filesystem_id, "machine stopped");
    }

    // ========================================================================
    // State publication
    // ========================================================================

    fn transition(&mut self, state: MachineState, status: impl Into<String>) {
        let status = status.into();
        if state != self.state {
            info!(
                filesystem_id = %self.ctx.filesystem_id,
                from = %self.state,
                to = %state,
                status = %status,
                "state transition"
            );
        }
        self.state = state;
        self.status_tx.send_replace(MachineStatus {
            state,
            status,
            transitioned_at_ms: now_unix_ms(),
        });
    }

    fn restore(&mut self, previous: MachineStatus) {
        self.transition(previous.state, previous.status);
    }

    fn current_status(&self) -> MachineStatus {
        self.status_tx.borrow().clone()
    }

    /// Re-read the local copy and publish the snapshot list if it changed.
    async fn refresh_local(&mut self) -> Result<(), StoreError> {
        let discovered = self.ctx.store.discover(&self.ctx.filesystem_id).await?;
        let changed = discovered.snapshots != self.local.snapshots || discovered.exists != self.local.exists;
        self.local = discovered;
        if changed {
            self.publish_snapshots();
        }
        Ok(())
    }

    fn publish_snapshots(&self) {
        let snapshots = self.local.snapshots.clone();
        let node = self.ctx.node_id.clone();
        let exists = self.local.exists;
        self.view.send_modify(|view| {
            if exists {
                view.insert(node, snapshots);
            } else {
                view.remove(&node);
            }
        });
        self.snapshots.publish(SnapshotsChanged {
            filesystem_id: self.ctx.filesystem_id.clone(),
            node_id: self.ctx.node_id.clone(),
            snapshots: self.local.snapshots.clone(),
        });
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    async fn discover(&mut self) {
        if let Err(e) = self.refresh_local().await {
            warn!(filesystem_id = %self.ctx.filesystem_id, error = %e, "discovery failed");
            self.transition(MachineState::Inactive, format!("discovery failed: {e}"));
            return;
        }
        // Announce even an empty history so subscribers learn where we stand.
        self.publish_snapshots();

        if !self.local.exists {
            self.transition(MachineState::Inactive, "not present locally");
            return;
        }
        match self.ctx.registry.current_master_node(&self.ctx.filesystem_id).await {
            Ok(master) if master == self.ctx.node_id => match self.ctx.store.mount(&self.ctx.filesystem_id).await {
                Ok(record) => self.transition(MachineState::Active, format!("mounted at {}", record.mountpoint)),
                Err(e) => {
                    error!(filesystem_id = %self.ctx.filesystem_id, error = %e, "mount failed during discovery");
                    self.transition(MachineState::Inactive, format!("mount failed: {e}"));
                }
            },
            Ok(master) => {
                if self.local.mounted
                    && let Err(e) = self.ctx.store.unmount(&self.ctx.filesystem_id).await
                {
                    warn!(filesystem_id = %self.ctx.filesystem_id, error = %e, "failed to unmount replica");
                }
                self.transition(MachineState::Inactive, format!("replica of {master}"));
            }
            Err(e) => self.transition(MachineState::Inactive, format!("master unknown: {e}")),
        }
    }

    // ========================================================================
    // Request handling
    // ========================================================================

    async fn handle(&mut self, request: Request) -> Response {
        let name = request.name();
        match self.handle_request(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(filesystem_id = %self.ctx.filesystem_id, request = name, error = %e, "request failed");
                Response::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        }
    }

    fn require(&self, request: &'static str, allowed: &[MachineState]) -> Result<(), HandlerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(HandlerError::InvalidState {
                request,
                state: self.state,
            })
        }
    }

    async fn handle_request(&mut self, request: Request) -> Result<Response, HandlerError> {
        use MachineState::Active;
        use MachineState::Inactive;

        match request {
            Request::Create => {
                self.require("create", &[Inactive])?;
                self.create().await
            }
            Request::Snapshot { metadata } => {
                self.require("snapshot", &[Active])?;
                let snapshot_id = self.snapshot(metadata).await?;
                Ok(Response::Snapshotted { snapshot_id })
            }
            Request::Clone {
                snapshot_id,
                new_filesystem_id,
            } => {
                self.require("clone", &[Active, Inactive])?;
                self.clone_into(snapshot_id, new_filesystem_id).await
            }
            Request::Rollback { snapshot_id } => {
                self.require("rollback", &[Active])?;
                self.rollback(snapshot_id).await
            }
            Request::Stash {
                new_filesystem_id,
                rollback_to,
            } => {
                self.require("stash", &[Active, Inactive])?;
                self.stash(new_filesystem_id, rollback_to).await
            }
            Request::Move { target } => {
                self.require("move", &[Active])?;
                self.move_to(target).await
            }
            Request::Activate => {
                self.require("activate", &[Active, Inactive])?;
                self.activate().await
            }
            Request::Deactivate => {
                self.require("deactivate", &[Active, Inactive])?;
                self.deactivate().await
            }
            Request::Receive { stream } => {
                self.require("receive", &[Inactive])?;
                self.receive(stream).await
            }
            Request::Transfer {
                transfer_id,
                request,
                initiator,
            } => match request.direction {
                TransferDirection::Push => {
                    self.require("push", &[Active])?;
                    self.transfer(transfer_id, request, initiator).await
                }
                TransferDirection::Pull => {
                    self.require("pull", &[Active, Inactive])?;
                    self.transfer(transfer_id, request, initiator).await
                }
            },
            Request::Mount => {
                self.require("mount", &[Active])?;
                let record = self.ctx.store.mount(&self.ctx.filesystem_id).await?;
                self.local.mounted = true;
                Ok(Response::Mounted {
                    mountpoint: record.mountpoint,
                })
            }
            Request::Unmount => {
                self.require("unmount", &[Active, Inactive])?;
                self.ctx.store.unmount(&self.ctx.filesystem_id).await?;
                self.local.mounted = false;
                Ok(Response::Unmounted)
            }
            Request::PollDirty => {
                self.require("poll dirty", &[Active, Inactive])?;
                let (dirty_bytes, size_bytes) = self
                    .ctx
                    .store
                    .dirty_delta(&self.ctx.filesystem_id, self.local.latest_snapshot())
                    .await?;
                Ok(Response::Dirty {
                    dirty_bytes,
                    size_bytes,
                })
            }
            Request::Discover => {
                self.require("discover", &[Active, Inactive])?;
                self.refresh_local().await?;
                Ok(Response::Discovered {
                    exists: self.local.exists,
                    mounted: self.local.mounted,
                    snapshot_count: self.local.snapshots.len(),
                })
            }
            Request::Delete => {
                self.require("delete", &[Active, Inactive])?;
                self.delete().await
            }
        }
    }

    /// Fails unless the coordination store names this node as master.
    async fn confirm_master(&self) -> Result<(), HandlerError> {
        let master = self.ctx.registry.current_master_node(&self.ctx.filesystem_id).await?;
        if master == self.ctx.node_id {
            Ok(())
        } else {
            Err(HandlerError::NotMaster {
                filesystem_id: self.ctx.filesystem_id.to_string(),
                master: master.to_string(),
            })
        }
    }

    async fn create(&mut self) -> Result<Response, HandlerError> {
        if self.local.exists {
            return Err(HandlerError::AlreadyExists {
                filesystem_id: self.ctx.filesystem_id.to_string(),
            });
        }
        self.confirm_master().await?;
        self.ctx.store.create(&self.ctx.filesystem_id).await?;
        let record = self.ctx.store.mount(&self.ctx.filesystem_id).await?;
        self.refresh_local().await?;
        self.transition(MachineState::Active, format!("mounted at {}", record.mountpoint));
        Ok(Response::Created)
    }

    async fn snapshot(&mut self, metadata: BTreeMap<String, String>) -> Result<SnapshotId, HandlerError> {
        let snapshot_id = SnapshotId::generate();
        self.ctx.store.snapshot(&self.ctx.filesystem_id, &snapshot_id, metadata).await?;
        self.refresh_local().await?;
        info!(filesystem_id = %self.ctx.filesystem_id, %snapshot_id, "committed snapshot");
        Ok(snapshot_id)
    }

    async fn clone_into(&mut self, snapshot_id: SnapshotId, new_id: FilesystemId) -> Result<Response, HandlerError> {
        let previous = self.current_status();
        self.transition(MachineState::Cloning, format!("cloning {snapshot_id} into {new_id}"));
        let result = self.ctx.store.clone_filesystem(&self.ctx.filesystem_id, &snapshot_id, &new_id).await;
        self.restore(previous);
        result?;
        Ok(Response::Cloned { filesystem_id: new_id })
    }

    async fn rollback(&mut self, snapshot_id: SnapshotId) -> Result<Response, HandlerError> {
        let id = self.ctx.filesystem_id.clone();
        self.ctx.store.unmount(&id).await?;
        let rolled_back = self.ctx.store.rollback(&id, &snapshot_id).await;
        let remounted = self.ctx.store.mount(&id).await;
        rolled_back?;
        remounted?;
        self.refresh_local().await?;
        info!(filesystem_id = %id, %snapshot_id, "rolled back");
        Ok(Response::RolledBack)
    }

    async fn stash(&mut self, new_id: FilesystemId, rollback_to: SnapshotId) -> Result<Response, HandlerError> {
        if !self.local.snapshots.iter().any(|s| s.id == rollback_to) {
            return Err(StoreError::SnapshotMissing {
                command: "stash".into(),
                filesystem_id: self.ctx.filesystem_id.to_string(),
                snapshot_id: rollback_to.to_string(),
            }
            .into());
        }
        let previous = self.current_status();
        self.transition(MachineState::Cloning, format!("stashing into {new_id}"));
        let result = stash_branch(self.ctx.store.as_ref(), &self.ctx.filesystem_id, &new_id, &rollback_to).await;
        self.restore(previous);
        if let Err(e) = result {
            if let Err(refresh_err) = self.refresh_local().await {
                warn!(filesystem_id = %self.ctx.filesystem_id, error = %refresh_err, "rediscover after failed stash");
            }
            self.transition(self.state, format!("stash failed: {e}"));
            return Err(e.into());
        }
        self.refresh_local().await?;
        Ok(Response::Stashed {
            new_filesystem_id: new_id,
        })
    }

    async fn move_to(&mut self, target: NodeId) -> Result<Response, HandlerError> {
        if target == self.ctx.node_id {
            return Ok(Response::Moved { target });
        }
        self.handoff_target = Some(target.clone());
        self.transition(MachineState::Moving, format!("moving to {target}"));

        let result = self.hand_off().await;
        self.handoff_target = None;
        match result {
            Ok(()) => {
                self.transition(MachineState::Inactive, format!("handed off to {target}"));
                Ok(Response::Moved { target })
            }
            Err(e) => {
                match self.ctx.store.mount(&self.ctx.filesystem_id).await {
                    Ok(_) => self.transition(MachineState::Active, format!("move to {target} failed: {e}")),
                    Err(mount_err) => {
                        error!(filesystem_id = %self.ctx.filesystem_id, error = %mount_err, "remount after failed move");
                        self.transition(MachineState::Inactive, format!("remount after failed move: {mount_err}"));
                    }
                }
                Err(e)
            }
        }
    }

    async fn hand_off(&mut self) -> Result<(), HandlerError> {
        let Some(target) = self.handoff_target.clone() else {
            return Ok(());
        };
        let (dirty, _) = self
            .ctx
            .store
            .dirty_delta(&self.ctx.filesystem_id, self.local.latest_snapshot())
            .await?;
        if dirty > 0 {
            let metadata = BTreeMap::from([(SNAPSHOT_TYPE_KEY.to_string(), MIGRATION_SNAPSHOT_TYPE.to_string())]);
            self.snapshot(metadata).await?;
        }
        self.ctx.store.unmount(&self.ctx.filesystem_id).await?;
        self.local.mounted = false;
        self.push_missing(&target, None, None).await?;
        self.ctx.registry.handoff_master(&self.ctx.filesystem_id, &self.ctx.node_id, &target).await?;
        Ok(())
    }

    async fn activate(&mut self) -> Result<Response, HandlerError> {
        if self.state == MachineState::Active {
            return Ok(Response::Activated);
        }
        self.confirm_master().await?;
        self.refresh_local().await?;
        if !self.local.exists {
            return Err(StoreError::FilesystemMissing {
                command: "activate".into(),
                filesystem_id: self.ctx.filesystem_id.to_string(),
            }
            .into());
        }
        let record = self.ctx.store.mount(&self.ctx.filesystem_id).await?;
        self.local.mounted = true;
        self.transition(MachineState::Active, format!("mounted at {}", record.mountpoint));
        Ok(Response::Activated)
    }

    async fn deactivate(&mut self) -> Result<Response, HandlerError> {
        if self.state == MachineState::Inactive {
            return Ok(Response::Deactivated);
        }
        let master = match self.ctx.registry.current_master_node(&self.ctx.filesystem_id).await {
            Ok(master) if master == self.ctx.node_id => {
                return Err(HandlerError::InvalidState {
                    request: "deactivate",
                    state: self.state,
                });
            }
            Ok(master) => master.to_string(),
            Err(RegistryError::MasterUnknown { .. }) => "nobody".to_string(),
            Err(e) => return Err(e.into()),
        };
        self.ctx.store.unmount(&self.ctx.filesystem_id).await?;
        self.local.mounted = false;
        self.transition(MachineState::Inactive, format!("replica of {master}"));
        Ok(Response::Deactivated)
    }

    async fn receive(&mut self, stream: SnapshotStream) -> Result<Response, HandlerError> {
        let previous = self.current_status();
        self.transition(MachineState::Receiving, format!("receiving {} snapshots", stream.snapshots.len()));
        let result = self.ctx.store.receive(&self.ctx.filesystem_id, stream).await;
        let refreshed = self.refresh_local().await;
        self.restore(previous);
        result?;
        refreshed?;
        let latest = self.local.latest_snapshot().cloned();
        if let Some(latest) = &latest {
            self.transition(MachineState::Inactive, format!("received up to {latest}"));
        }
        Ok(Response::Received { latest })
    }

    async fn delete(&mut self) -> Result<Response, HandlerError> {
        let id = self.ctx.filesystem_id.clone();
        if self.local.exists {
            self.ctx.store.unmount(&id).await?;
            match self.ctx.store.destroy(&id).await {
                Ok(()) | Err(StoreError::FilesystemMissing { .. }) => {}
                Err(e) => {
                    if self.state == MachineState::Active
                        && let Err(mount_err) = self.ctx.store.mount(&id).await
                    {
                        error!(filesystem_id = %id, error = %mount_err, "remount after failed delete");
                    }
                    return Err(e.into());
                }
            }
        }
        self.refresh_local().await?;
        self.transition(MachineState::Deleted, "deleted");
        Ok(Response::Deleted)
    }

    // ========================================================================
    // Data movement
    // ========================================================================

    /// Send `peer` the snapshots it lacks, up to `upto` (default: latest).
    ///
    /// The starting point comes from the peer view; if the peer has no entry
    /// or rejects a stream built from a stale entry, its history is asked
    /// for directly and the push retried once.
    async fn push_missing(
        &mut self,
        peer: &NodeId,
        upto: Option<&SnapshotId>,
        tracker: Option<&TransferTracker>,
    ) -> Result<(), HandlerError> {
        let local = match upto {
            Some(upto) => {
                restrict_snapshots(&self.local.snapshots, upto).ok_or_else(|| StoreError::SnapshotMissing {
                    command: "send".into(),
                    filesystem_id: self.ctx.filesystem_id.to_string(),
                    snapshot_id: upto.to_string(),
                })?
            }
            None => self.local.snapshots.clone(),
        };

        let viewed = self.view.borrow().get(peer).cloned();
        let mut from_view = viewed.is_some();
        let mut remote = match viewed {
            Some(remote) => remote,
            None => self.ctx.transport.snapshots(peer, &self.ctx.filesystem_id).await?,
        };

        loop {
            let base = send_base(&local, &remote).map_err(|common| HandlerError::Diverged {
                filesystem_id: self.ctx.filesystem_id.to_string(),
                peer: peer.to_string(),
                reason: format!(
                    "peer holds snapshots this node lacks (last common {})",
                    common.map(|s| s.to_string()).unwrap_or_else(|| "none".into())
                ),
            })?;
            match self.send_segments(peer, base, &local, tracker).await {
                Err(HandlerError::Transport {
                    source: TransportError::Rejected { reason, .. },
                }) if from_view => {
                    debug!(filesystem_id = %self.ctx.filesystem_id, %peer, %reason, "peer view was stale, re-reading");
                    from_view = false;
                    remote = self.ctx.transport.snapshots(peer, &self.ctx.filesystem_id).await?;
                    self.view.send_modify(|view| {
                        view.insert(peer.clone(), remote.clone());
                    });
                }
                result => return result,
            }
        }
    }

    /// One stream per missing snapshot, so progress is visible per segment.
    /// An up-to-date peer still gets an empty stream so it holds the
    /// filesystem.
    async fn send_segments(
        &self,
        peer: &NodeId,
        base: Option<SnapshotId>,
        local: &[Snapshot],
        tracker: Option<&TransferTracker>,
    ) -> Result<(), HandlerError> {
        let start = match &base {
            Some(base) => local.iter().position(|s| &s.id == base).map(|i| i + 1).unwrap_or(local.len()),
            None => 0,
        };
        let missing = &local[start..];
        if let Some(tracker) = tracker {
            tracker.plan(base.clone(), missing.len() as u32);
        }

        let id = &self.ctx.filesystem_id;
        if missing.is_empty() {
            let stream = self.ctx.store.send(id, base.as_ref(), base.as_ref()).await?;
            self.ctx.transport.push(peer, stream).await?;
            return Ok(());
        }

        let mut from = base;
        for (i, snapshot) in missing.iter().enumerate() {
            let stream = self.ctx.store.send(id, from.as_ref(), Some(&snapshot.id)).await?;
            let size = stream.size_bytes();
            if let Some(tracker) = tracker {
                tracker.segment(i as u32 + 1, size);
            }
            self.ctx.transport.push(peer, stream).await?;
            if let Some(tracker) = tracker {
                tracker.sent(size);
            }
            from = Some(snapshot.id.clone());
        }
        debug!(filesystem_id = %id, %peer, segments = missing.len(), "pushed snapshots");
        Ok(())
    }

    async fn transfer(
        &mut self,
        transfer_id: String,
        request: TransferRequest,
        initiator: NodeId,
    ) -> Result<Response, HandlerError> {
        let poll = TransferPollResult::queued(&transfer_id, &request, self.ctx.filesystem_id.clone(), initiator);
        let tracker = TransferTracker::begin(self.transfer_tx.clone(), poll);
        info!(filesystem_id = %self.ctx.filesystem_id, %transfer_id, transfer = %request, "starting transfer");

        let previous = self.current_status();
        let result = match request.direction {
            TransferDirection::Push => {
                self.transition(MachineState::Pushing, format!("pushing to {}", request.peer));
                self.push_missing(&request.peer, request.target_commit.as_ref(), Some(&tracker))
                    .await
                    .map(|()| None)
            }
            TransferDirection::Pull => {
                self.transition(MachineState::Receiving, format!("pulling from {}", request.peer));
                self.pull(&request, &tracker).await
            }
        };
        self.restore(previous);
        if let Err(e) = self.refresh_local().await {
            warn!(filesystem_id = %self.ctx.filesystem_id, error = %e, "rediscovery after transfer failed");
        }

        match result {
            Ok(stashed) => {
                tracker.finish(match &stashed {
                    Some(id) => format!("done; diverged history stashed as {id}"),
                    None => "done".to_string(),
                });
                Ok(Response::Transferred { transfer_id, stashed })
            }
            Err(e) => {
                tracker.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Fetch what the peer has beyond our history. Returns the id local
    /// history was stashed under if it had diverged.
    async fn pull(
        &mut self,
        request: &TransferRequest,
        tracker: &TransferTracker,
    ) -> Result<Option<FilesystemId>, HandlerError> {
        let peer = &request.peer;
        let id = self.ctx.filesystem_id.clone();
        let mut remote = self.ctx.transport.snapshots(peer, &id).await?;
        if let Some(target) = &request.target_commit {
            remote = restrict_snapshots(&remote, target).ok_or_else(|| TransportError::Rejected {
                peer: peer.to_string(),
                reason: format!("peer does not hold {target}"),
            })?;
        }

        let (base, stashed) = match send_base(&remote, &self.local.snapshots) {
            Ok(base) => (base, None),
            Err(common) if request.stash_divergence => {
                let Some(common) = common else {
                    return Err(HandlerError::Diverged {
                        filesystem_id: id.to_string(),
                        peer: peer.to_string(),
                        reason: "no common snapshot to stash from".into(),
                    });
                };
                let stashed = self.stash_diverged(&common).await?;
                (Some(common), Some(stashed))
            }
            Err(_) => {
                return Err(HandlerError::Diverged {
                    filesystem_id: id.to_string(),
                    peer: peer.to_string(),
                    reason: "local history has snapshots the peer lacks".into(),
                });
            }
        };

        tracker.plan(base.clone(), 1);
        let stream = self
            .ctx
            .transport
            .fetch(peer, &id, base, request.target_commit.clone())
            .await?;
        let size = stream.size_bytes();
        tracker.segment(1, size);
        self.ctx.store.receive(&id, stream).await?;
        tracker.sent(size);
        Ok(stashed)
    }

    /// Move local-only history after `common` onto a new branch named after
    /// the current one, mastered here.
    async fn stash_diverged(&mut self, common: &SnapshotId) -> Result<FilesystemId, HandlerError> {
        let id = self.ctx.filesystem_id.clone();
        let stashed = FilesystemId::generate();
        stash_branch(self.ctx.store.as_ref(), &id, &stashed, common).await?;
        self.refresh_local().await?;

        match self.ctx.registry.lookup_by_id(&id) {
            Some(location) => {
                let current = location.branch.as_deref().unwrap_or(DEFAULT_BRANCH);
                let branch = format!("{current}-{DIVERGED_BRANCH_MARKER}-{}", short_id(stashed.as_str()));
                let clone = CloneInfo {
                    filesystem_id: stashed.clone(),
                    origin: Origin {
                        filesystem_id: id.clone(),
                        snapshot_id: common.clone(),
                    },
                };
                self.ctx.registry.register_clone(&location.top_level_id, &branch, clone.clone()).await?;
                self.ctx.registry.claim_clone_master(&clone, &self.ctx.node_id).await?;
                info!(filesystem_id = %id, %branch, stashed_as = %stashed, "stashed diverged history");
            }
            None => warn!(filesystem_id = %id, stashed_as = %stashed, "stashed diverged history of an unregistered filesystem"),
        }
        Ok(stashed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use volmesh_core::DeterministicKeyValueStore;
    use volmesh_core::InMemorySnapshotStore;
    use volmesh_core::KeyValueStore;
    use volmesh_registry::Keyspace;

    use super::*;
    use crate::event::ErrorKind;

    const WAIT: Duration = Duration::from_secs(5);

    /// Delivers pushes straight into a peer's store.
    struct DirectTransport {
        peer: Arc<InMemorySnapshotStore>,
    }

    #[async_trait]
    impl PeerTransport for DirectTransport {
        async fn push(&self, peer: &NodeId, stream: SnapshotStream) -> Result<(), TransportError> {
            let id = stream.filesystem_id.clone();
            self.peer.receive(&id, stream).await.map_err(|e| TransportError::Rejected {
                peer: peer.to_string(),
                reason: e.to_string(),
            })
        }

        async fn snapshots(&self, _peer: &NodeId, id: &FilesystemId) -> Result<Vec<Snapshot>, TransportError> {
            Ok(self.peer.discover(id).await.map(|d| d.snapshots).unwrap_or_default())
        }

        async fn fetch(
            &self,
            peer: &NodeId,
            id: &FilesystemId,
            from: Option<SnapshotId>,
            to: Option<SnapshotId>,
        ) -> Result<SnapshotStream, TransportError> {
            self.peer.send(id, from.as_ref(), to.as_ref()).await.map_err(|e| TransportError::Rejected {
                peer: peer.to_string(),
                reason: e.to_string(),
            })
        }
    }

    struct Fixture {
        store: Arc<InMemorySnapshotStore>,
        peer_store: Arc<InMemorySnapshotStore>,
        registry: Arc<Registry>,
        node: NodeId,
        id: FilesystemId,
    }

    impl Fixture {
        fn new() -> Self {
            let kv = DeterministicKeyValueStore::new();
            Self {
                store: Arc::new(InMemorySnapshotStore::default()),
                peer_store: Arc::new(InMemorySnapshotStore::default()),
                registry: Arc::new(Registry::new(kv, Keyspace::new("volmesh"))),
                node: NodeId::from("node-1"),
                id: FilesystemId::generate(),
            }
        }

        fn spawn(&self) -> MachineHandle {
            FsMachine::spawn(
                MachineContext {
                    node_id: self.node.clone(),
                    filesystem_id: self.id.clone(),
                    store: self.store.clone(),
                    registry: self.registry.clone(),
                    transport: Arc::new(DirectTransport {
                        peer: self.peer_store.clone(),
                    }),
                },
                MachineConfig::default(),
            )
        }

        async fn active_machine(&self) -> MachineHandle {
            self.registry.claim_master(&self.id, &self.node).await.unwrap();
            let machine = self.spawn();
            let response = machine.request(Request::Create, Some(WAIT)).await.unwrap();
            assert_eq!(response, Response::Created);
            machine
        }
    }

    async fn snapshot(machine: &MachineHandle, label: &str) -> SnapshotId {
        let metadata = BTreeMap::from([("label".to_string(), label.to_string())]);
        match machine.request(Request::Snapshot { metadata }, Some(WAIT)).await.unwrap() {
            Response::Snapshotted { snapshot_id } => snapshot_id,
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_mounts_and_activates() {
        let f = Fixture::new();
        let machine = f.active_machine().await;
        assert_eq!(machine.state(), MachineState::Active);
        assert!(f.store.discover(&f.id).await.unwrap().mounted);
        assert!(machine.view().contains_key(&f.node));
    }

    #[tokio::test]
    async fn test_create_without_mastership_is_refused() {
        let f = Fixture::new();
        f.registry.claim_master(&f.id, &NodeId::from("node-9")).await.unwrap();
        let machine = f.spawn();
        let response = machine.request(Request::Create, Some(WAIT)).await.unwrap();
        assert!(matches!(response, Response::Error { kind: ErrorKind::NotMaster, .. }));
        assert_eq!(machine.state(), MachineState::Inactive);
    }

    #[tokio::test]
    async fn test_responses_follow_dispatch_order() {
        let f = Fixture::new();
        let machine = f.active_machine().await;

        let mut pending = Vec::new();
        for label in ["first", "second", "third"] {
            let metadata = BTreeMap::from([("label".to_string(), label.to_string())]);
            pending.push((label, machine.dispatch(Request::Snapshot { metadata }).await.unwrap()));
        }
        let mut committed = Vec::new();
        for (label, pending) in pending.into_iter().rev() {
            match pending.wait_timeout(WAIT).await.unwrap() {
                Response::Snapshotted { snapshot_id } => committed.push((label, snapshot_id)),
                other => panic!("unexpected response {other:?}"),
            }
        }
        committed.reverse();

        let history = f.store.discover(&f.id).await.unwrap().snapshots;
        assert_eq!(history.len(), 3);
        for ((label, snapshot_id), stored) in committed.iter().zip(&history) {
            assert_eq!(&stored.id, snapshot_id);
            assert_eq!(stored.metadata.get("label").map(String::as_str), Some(*label));
        }
    }

    #[tokio::test]
    async fn test_invalid_state_is_reported_not_applied() {
        let f = Fixture::new();
        let machine = f.spawn();
        machine.wait_for_state(MachineState::Inactive, WAIT).await.unwrap();

        let response = machine
            .request(
                Request::Snapshot {
                    metadata: BTreeMap::new(),
                },
                Some(WAIT),
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::Error { kind: ErrorKind::InvalidState, .. }));
        assert!(!f.store.discover(&f.id).await.unwrap().exists);
    }

    #[tokio::test]
    async fn test_move_pushes_history_then_hands_off() {
        let f = Fixture::new();
        let machine = f.active_machine().await;
        snapshot(&machine, "one").await;
        f.store.write_data(&f.id, b"unsaved").await.unwrap();

        let target = NodeId::from("node-2");
        let response = machine.request(Request::Move { target: target.clone() }, Some(WAIT)).await.unwrap();
        assert_eq!(response, Response::Moved { target: target.clone() });
        assert_eq!(machine.state(), MachineState::Inactive);
        assert_eq!(f.registry.current_master_node(&f.id).await.unwrap(), target);

        // The uncommitted write travelled as a migration snapshot.
        let replica = f.peer_store.discover(&f.id).await.unwrap();
        assert_eq!(replica.snapshots.len(), 2);
        assert_eq!(
            replica.snapshots[1].metadata.get(SNAPSHOT_TYPE_KEY).map(String::as_str),
            Some(MIGRATION_SNAPSHOT_TYPE)
        );
        assert!(!f.store.discover(&f.id).await.unwrap().mounted);
    }

    #[tokio::test]
    async fn test_failed_handoff_stays_active_and_mounted() {
        let f = Fixture::new();
        let machine = f.active_machine().await;
        // Someone else took over behind our back; the handoff CAS must lose.
        f.registry
            .store()
            .write(volmesh_core::WriteRequest::set(f.registry.keys().master(&f.id), "node-3"))
            .await
            .unwrap();

        let response = machine
            .request(
                Request::Move {
                    target: NodeId::from("node-2"),
                },
                Some(WAIT),
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::Error { kind: ErrorKind::CasConflict, .. }));
        assert_eq!(machine.state(), MachineState::Active);
        assert!(f.store.discover(&f.id).await.unwrap().mounted);
    }

    #[tokio::test]
    async fn test_push_transfer_reports_progress() {
        let f = Fixture::new();
        let machine = f.active_machine().await;
        snapshot(&machine, "a").await;
        snapshot(&machine, "b").await;

        let request = TransferRequest {
            peer: NodeId::from("node-2"),
            user: "alice".into(),
            api_key: "key".into(),
            direction: TransferDirection::Push,
            local_namespace: "alice".into(),
            local_name: "notebook".into(),
            local_branch_name: "master".into(),
            remote_namespace: "alice".into(),
            remote_name: "notebook".into(),
            remote_branch_name: "master".into(),
            target_commit: None,
            stash_divergence: false,
        };
        let response = machine
            .request(
                Request::Transfer {
                    transfer_id: "t-1".into(),
                    request,
                    initiator: f.node.clone(),
                },
                Some(WAIT),
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::Transferred { stashed: None, .. }));

        let poll = machine.transfer().unwrap();
        assert_eq!(poll.status, volmesh_core::TransferStatus::Finished);
        assert_eq!((poll.index, poll.total), (2, 2));
        assert!(poll.sent > 0);
        assert_eq!(machine.state(), MachineState::Active);
        assert_eq!(f.peer_store.discover(&f.id).await.unwrap().snapshots.len(), 2);
    }

    #[tokio::test]
    async fn test_diverged_pull_stashes_local_history() {
        let f = Fixture::new();
        let name = volmesh_core::VolumeName::new("alice", "notebook").unwrap();
        f.registry
            .register_filesystem(&name, volmesh_core::RegistryEntry::new(f.id.clone(), "alice"))
            .await
            .unwrap();
        let machine = f.active_machine().await;
        let common = snapshot(&machine, "shared").await;
        let stream = f.store.send(&f.id, None, None).await.unwrap();
        f.peer_store.receive(&f.id, stream).await.unwrap();
        f.peer_store
            .snapshot(&f.id, &SnapshotId::from("remote-only"), BTreeMap::new())
            .await
            .unwrap();
        let local_only = snapshot(&machine, "local-only").await;

        let request = TransferRequest {
            peer: NodeId::from("node-2"),
            user: "alice".into(),
            api_key: "key".into(),
            direction: TransferDirection::Pull,
            local_namespace: "alice".into(),
            local_name: "notebook".into(),
            local_branch_name: "master".into(),
            remote_namespace: "alice".into(),
            remote_name: "notebook".into(),
            remote_branch_name: "master".into(),
            target_commit: None,
            stash_divergence: true,
        };
        let response = machine
            .request(
                Request::Transfer {
                    transfer_id: "t-2".into(),
                    request,
                    initiator: f.node.clone(),
                },
                Some(WAIT),
            )
            .await
            .unwrap();
        let Response::Transferred {
            stashed: Some(stashed), ..
        } = response
        else {
            panic!("unexpected response {response:?}");
        };

        let current: Vec<SnapshotId> =
            f.store.discover(&f.id).await.unwrap().snapshots.into_iter().map(|s| s.id).collect();
        assert_eq!(current, vec![common, SnapshotId::from("remote-only")]);
        assert_eq!(f.store.own_snapshot_ids(&stashed), vec![local_only]);

        let branches = f.registry.clones_of(&f.id);
        let (branch, clone) = branches.iter().next().unwrap();
        assert!(branch.starts_with("master-DIVERGED-"));
        assert_eq!(clone.filesystem_id, stashed);
        assert_eq!(f.registry.current_master_node(&stashed).await.unwrap(), f.node);
    }

    #[tokio::test]
    async fn test_rollback_discards_later_snapshots() {
        let f = Fixture::new();
        let machine = f.active_machine().await;
        let a = snapshot(&machine, "a").await;
        snapshot(&machine, "b").await;

        let response = machine.request(Request::Rollback { snapshot_id: a.clone() }, Some(WAIT)).await.unwrap();
        assert_eq!(response, Response::RolledBack);

        let local = f.store.discover(&f.id).await.unwrap();
        assert_eq!(local.snapshots.into_iter().map(|s| s.id).collect::<Vec<_>>(), vec![a.clone()]);
        assert!(local.mounted);
        assert_eq!(machine.view()[&f.node].iter().map(|s| &s.id).collect::<Vec<_>>(), vec![&a]);
        assert_eq!(machine.state(), MachineState::Active);
    }

    #[tokio::test]
    async fn test_rollback_past_clone_point_is_refused_and_stays_mounted() {
        let f = Fixture::new();
        let machine = f.active_machine().await;
        let a = snapshot(&machine, "a").await;
        let b = snapshot(&machine, "b").await;
        let clone_id = FilesystemId::generate();
        let response = machine
            .request(
                Request::Clone {
                    snapshot_id: b,
                    new_filesystem_id: clone_id.clone(),
                },
                Some(WAIT),
            )
            .await
            .unwrap();
        assert_eq!(response, Response::Cloned { filesystem_id: clone_id });

        let response = machine.request(Request::Rollback { snapshot_id: a }, Some(WAIT)).await.unwrap();
        assert!(matches!(response, Response::Error { kind: ErrorKind::StoreCommandFailed, .. }), "got {response:?}");

        let local = f.store.discover(&f.id).await.unwrap();
        assert_eq!(local.snapshots.len(), 2);
        assert!(local.mounted);
        assert_eq!(machine.state(), MachineState::Active);
    }

    #[tokio::test]
    async fn test_failed_stash_rediscovers_local_filesystem() {
        let f = Fixture::new();
        let machine = f.active_machine().await;
        let a = snapshot(&machine, "a").await;

        // The clone fails after the rename, so nothing is left under the id.
        f.store.inject_failure("clone");
        let response = machine
            .request(
                Request::Stash {
                    new_filesystem_id: FilesystemId::generate(),
                    rollback_to: a,
                },
                Some(WAIT),
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::Error { .. }), "got {response:?}");

        assert!(!f.store.discover(&f.id).await.unwrap().exists);
        assert!(!machine.view().contains_key(&f.node));
    }

    #[tokio::test]
    async fn test_stash_to_unknown_snapshot_changes_nothing() {
        let f = Fixture::new();
        let machine = f.active_machine().await;
        let a = snapshot(&machine, "a").await;

        let response = machine
            .request(
                Request::Stash {
                    new_filesystem_id: FilesystemId::generate(),
                    rollback_to: SnapshotId::from("never-taken"),
                },
                Some(WAIT),
            )
            .await
            .unwrap();
        assert!(matches!(response, Response::Error { .. }), "got {response:?}");

        let local = f.store.discover(&f.id).await.unwrap();
        assert_eq!(local.snapshots.into_iter().map(|s| s.id).collect::<Vec<_>>(), vec![a]);
        assert!(local.mounted);
    }

    #[tokio::test]
    async fn test_delete_is_terminal() {
        let f = Fixture::new();
        let machine = f.active_machine().await;
        assert_eq!(machine.request(Request::Delete, Some(WAIT)).await.unwrap(), Response::Deleted);
        assert_eq!(machine.state(), MachineState::Deleted);
        assert!(!f.store.discover(&f.id).await.unwrap().exists);

        let response = machine.request(Request::Activate, Some(WAIT)).await.unwrap();
        assert!(matches!(response, Response::Error { kind: ErrorKind::InvalidState, .. }));
    }

    #[tokio::test]
    async fn test_snapshot_subscribers_see_new_commits() {
        let f = Fixture::new();
        let machine = f.active_machine().await;
        let mut changes = machine.subscribe_snapshots();
        let id = snapshot(&machine, "x").await;

        let change = tokio::time::timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert_eq!(change.node_id, f.node);
        assert_eq!(change.snapshots.last().map(|s| &s.id), Some(&id));
    }
}
