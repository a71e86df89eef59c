//! Replication: transfers between nodes and the hooks peers call.

use std::time::Duration;

use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;
use uuid::Uuid;
use volmesh_core::FilesystemId;
use volmesh_core::Principal;
use volmesh_core::Snapshot;
use volmesh_core::SnapshotId;
use volmesh_core::SnapshotStream;
use volmesh_core::TransferDirection;
use volmesh_core::TransferPollResult;
use volmesh_core::TransferRequest;
use volmesh_core::VolumeName;
use volmesh_core::VolumeRef;
use volmesh_core::constants::DEFAULT_BRANCH;
use volmesh_fsm::Request;
use volmesh_fsm::Response;

use crate::coordinator::Coordinator;
use crate::error::ClusterError;

impl Coordinator {
    /// Queue a push or pull of a local volume and return its transfer id.
    ///
    /// The transfer runs on the volume's master; progress is published to
    /// the coordination store and read back with [`Coordinator::poll_transfer`].
    #[instrument(skip(self, principal, request), fields(user = %principal.user_id, transfer = %request))]
    pub async fn start_transfer(&self, principal: &Principal, request: TransferRequest) -> Result<String, ClusterError> {
        let name = VolumeName::new(request.local_namespace.clone(), request.local_name.clone())?;
        let volume = VolumeRef::branch(name, request.local_branch_name.clone());
        let (id, _) = self.resolve(principal, &volume, "transfer").await?;

        let transfer_id = Uuid::new_v4().to_string();
        let queued = TransferPollResult::queued(&transfer_id, &request, id.clone(), self.node_id.clone());
        self.registry.write_json(&self.keys().transfer(&transfer_id), &queued).await?;
        self.transfers.write().insert(transfer_id.clone(), queued);
        self.transfer_index.write().insert(transfer_id.clone(), id.clone());

        let pending = self
            .global_request(
                &id,
                Request::Transfer {
                    transfer_id: transfer_id.clone(),
                    request,
                    initiator: self.node_id.clone(),
                },
            )
            .await?;

        let fs = id.clone();
        let tid = transfer_id.clone();
        tokio::spawn(async move {
            match pending.wait().await {
                Ok(Response::Transferred { stashed, .. }) => {
                    info!(filesystem_id = %fs, transfer_id = %tid, stashed = ?stashed, "transfer finished")
                }
                Ok(other) => warn!(filesystem_id = %fs, transfer_id = %tid, response = other.name(), "transfer failed"),
                Err(e) => warn!(filesystem_id = %fs, transfer_id = %tid, error = %e, "lost track of transfer"),
            }
        });
        Ok(transfer_id)
    }

    /// Latest known progress of a transfer.
    pub async fn poll_transfer(&self, transfer_id: &str) -> Result<TransferPollResult, ClusterError> {
        let local = self.transfer_index.read().get(transfer_id).cloned();
        if let Some(id) = local
            && let Some(machine) = self.machine(&id)
            && let Some(result) = machine.transfer()
            && result.transfer_request_id == transfer_id
        {
            return Ok(result);
        }
        if let Some(result) = self.transfers.read().get(transfer_id).cloned() {
            return Ok(result);
        }
        self.registry
            .read_json(&self.keys().transfer(transfer_id))
            .await?
            .ok_or_else(|| ClusterError::NotFound {
                what: format!("transfer {transfer_id}"),
            })
    }

    /// Pull whatever the master of `id` has that this node lacks.
    #[instrument(skip(self))]
    pub async fn catch_up(&self, id: &FilesystemId) -> Result<(), ClusterError> {
        let master = self.registry.current_master_node(id).await?;
        if master == self.node_id {
            return Ok(());
        }
        let location = self.registry.lookup_by_id(id).ok_or_else(|| ClusterError::NotFound {
            what: format!("filesystem {id}"),
        })?;
        let branch = location.branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        let request = TransferRequest {
            peer: master,
            user: location.entry.owner_id.clone(),
            api_key: String::new(),
            direction: TransferDirection::Pull,
            local_namespace: location.name.namespace.clone(),
            local_name: location.name.name.clone(),
            local_branch_name: branch.clone(),
            remote_namespace: location.name.namespace,
            remote_name: location.name.name,
            remote_branch_name: branch,
            target_commit: None,
            stash_divergence: false,
        };
        let transfer_id = Uuid::new_v4().to_string();
        self.transfer_index.write().insert(transfer_id.clone(), id.clone());
        let response = self
            .dispatch_and_wait(
                id,
                Request::Transfer {
                    transfer_id,
                    request,
                    initiator: self.node_id.clone(),
                },
            )
            .await?;
        match response {
            Response::Transferred { .. } => Ok(()),
            other => Err(ClusterError::from_response(id.as_str(), "catch-up", other)),
        }
    }

    // ========================================================================
    // Peer hooks
    // ========================================================================

    /// Apply a stream a peer pushed to this node.
    pub async fn receive_snapshots(&self, stream: SnapshotStream) -> Result<(), ClusterError> {
        let id = stream.filesystem_id.clone();
        debug!(filesystem_id = %id, from = ?stream.from, snapshots = stream.snapshots.len(), "receiving snapshots");
        match self.dispatch_and_wait(&id, Request::Receive { stream }).await? {
            Response::Received { .. } => Ok(()),
            other => Err(ClusterError::from_response(id.as_str(), "receive", other)),
        }
    }

    /// Serialize local history of `id` for a peer.
    pub async fn serve_snapshots(
        &self,
        id: &FilesystemId,
        from: Option<&SnapshotId>,
        to: Option<&SnapshotId>,
    ) -> Result<SnapshotStream, ClusterError> {
        Ok(self.store.send(id, from, to).await?)
    }

    /// Authoritative local history of `id`; empty when absent.
    pub async fn local_snapshots(&self, id: &FilesystemId) -> Result<Vec<Snapshot>, ClusterError> {
        Ok(self.store.discover(id).await?.snapshots)
    }

    /// History of `id` as last reported by its master.
    pub async fn snapshots_for_current_master(&self, id: &FilesystemId) -> Result<Vec<Snapshot>, ClusterError> {
        let master = self.registry.current_master_node(id).await?;
        Ok(self.peer_view(id).remove(&master).unwrap_or_default())
    }

    /// Wait until the master of `id` reports `snapshot_id`.
    pub async fn wait_for_master_commit(
        &self,
        id: &FilesystemId,
        snapshot_id: &SnapshotId,
        timeout: Duration,
    ) -> Result<(), ClusterError> {
        let mut updates = self.new_snaps_on_master.subscribe(id);
        let holds = |snapshots: &[Snapshot]| snapshots.iter().any(|s| &s.id == snapshot_id);
        if holds(&self.snapshots_for_current_master(id).await?) {
            return Ok(());
        }

        let waited = tokio::time::timeout(timeout, async {
            while let Some(snapshots) = updates.recv().await {
                if holds(&snapshots) {
                    return true;
                }
            }
            false
        })
        .await;
        match waited {
            Ok(true) => Ok(()),
            Ok(false) => Err(ClusterError::ShuttingDown),
            Err(_) => Err(ClusterError::Timeout {
                what: format!("{snapshot_id} on the master of {id}"),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}
