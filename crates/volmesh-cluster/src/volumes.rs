//! Volume-level operations: listing, snapshots, branches, deletion and
//! replication latency.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use futures::future::join_all;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;
use volmesh_core::CloneInfo;
use volmesh_core::DeleteRequest;
use volmesh_core::FilesystemId;
use volmesh_core::KeyValueStore;
use volmesh_core::NodeId;
use volmesh_core::Origin;
use volmesh_core::Principal;
use volmesh_core::SnapshotId;
use volmesh_core::StateReport;
use volmesh_core::VolumeRef;
use volmesh_core::VolumeSummary;
use volmesh_core::constants::DEFAULT_BRANCH;
use volmesh_core::format_server_status;
use volmesh_fsm::ErrorKind;
use volmesh_fsm::Request;
use volmesh_fsm::Response;

use crate::coordinator::Coordinator;
use crate::error::ClusterError;
use crate::loops::NODE_VERSION;

impl Coordinator {
    /// Every volume `principal` may see.
    ///
    /// Volumes the principal is not authorized for are left out; a volume
    /// that fails to load is skipped with a warning.
    #[instrument(skip(self, principal), fields(user = %principal.user_id))]
    pub async fn list_volumes(&self, principal: &Principal) -> Vec<VolumeSummary> {
        let ids = self.registry.filesystem_ids_including_clones();
        let results = join_all(ids.iter().map(|id| self.get_volume(principal, id))).await;

        let mut volumes = Vec::with_capacity(ids.len());
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(summary) => volumes.push(summary),
                Err(ClusterError::PermissionDenied { .. }) => {}
                Err(e) => warn!(filesystem_id = %id, error = %e, "skipping volume in listing"),
            }
        }
        volumes.sort_by(|a, b| (&a.name, &a.branch).cmp(&(&b.name, &b.branch)));
        volumes
    }

    /// Summary of one filesystem, read from the published channels of its
    /// machine where there is one and from the caches otherwise.
    pub async fn get_volume(&self, principal: &Principal, id: &FilesystemId) -> Result<VolumeSummary, ClusterError> {
        let location = self.registry.lookup_by_id(id).ok_or_else(|| ClusterError::NotFound {
            what: format!("filesystem {id}"),
        })?;
        if !location.entry.authorize(principal) {
            return Err(ClusterError::PermissionDenied {
                user: principal.user_id.clone(),
                action: "view",
                what: location.name.to_string(),
            });
        }
        let master = match self.registry.cached_master_node(id) {
            Some(master) => master,
            None => self.registry.current_master_node(id).await?,
        };

        let view = self.peer_view(id);
        let mut states = self.server_states(id);
        if let Some(machine) = self.machine(id) {
            let status = machine.status();
            states.insert(
                self.node_id.clone(),
                StateReport {
                    state: status.state.as_str().to_string(),
                    status: status.status,
                    version: NODE_VERSION.to_string(),
                },
            );
        }

        let nodes: BTreeSet<&NodeId> = view.keys().chain(states.keys()).collect();
        let server_statuses: BTreeMap<NodeId, String> = nodes
            .into_iter()
            .map(|node| {
                let count = view.get(node).map(Vec::len).unwrap_or(0);
                (node.clone(), format_server_status(states.get(node), count))
            })
            .collect();

        let (dirty_bytes, size_bytes) = self
            .dirty_info(id)
            .map(|d| (d.dirty_bytes, d.size_bytes))
            .unwrap_or((0, 0));

        Ok(VolumeSummary {
            id: id.clone(),
            name: location.name,
            branch: location.branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            commit_count: view.get(&master).map(|s| s.len() as u64).unwrap_or(0),
            master,
            dirty_bytes,
            size_bytes,
            server_statuses,
        })
    }

    /// Commit the current contents of `volume` on its master.
    #[instrument(skip(self, principal, metadata), fields(user = %principal.user_id, volume = %volume.name))]
    pub async fn snapshot_volume(
        &self,
        principal: &Principal,
        volume: &VolumeRef,
        metadata: BTreeMap<String, String>,
    ) -> Result<SnapshotId, ClusterError> {
        let (id, _) = self.resolve(principal, volume, "snapshot").await?;
        let pending = self.global_request(&id, Request::Snapshot { metadata }).await?;
        match self.await_response(pending).await? {
            Response::Snapshotted { snapshot_id } => Ok(snapshot_id),
            other => Err(ClusterError::from_response(id.as_str(), "snapshot", other)),
        }
    }

    /// Branch `new_branch` off `volume` at `snapshot_id`.
    ///
    /// The clone is made on the source's master and that node is claimed as
    /// the new branch's master.
    #[instrument(skip(self, principal), fields(user = %principal.user_id, volume = %volume.name))]
    pub async fn clone_branch(
        &self,
        principal: &Principal,
        volume: &VolumeRef,
        snapshot_id: &SnapshotId,
        new_branch: &str,
    ) -> Result<FilesystemId, ClusterError> {
        let (source, entry) = self.resolve(principal, volume, "clone").await?;
        let top_level_id = entry.id;
        if self.registry.clones_of(&top_level_id).contains_key(new_branch) {
            return Err(ClusterError::AlreadyExists {
                what: format!("branch {new_branch} of {}", volume.name),
            });
        }

        let master = self.registry.current_master_node(&source).await?;
        let new_id = FilesystemId::generate();
        let pending = self
            .global_request(
                &source,
                Request::Clone {
                    snapshot_id: snapshot_id.clone(),
                    new_filesystem_id: new_id.clone(),
                },
            )
            .await?;
        match self.await_response(pending).await? {
            Response::Cloned { .. } => {}
            other => return Err(ClusterError::from_response(source.as_str(), "clone", other)),
        }

        let clone = CloneInfo {
            filesystem_id: new_id.clone(),
            origin: Origin {
                filesystem_id: source,
                snapshot_id: snapshot_id.clone(),
            },
        };
        self.activate_clone(&top_level_id, new_branch, &clone, &master).await?;
        Ok(new_id)
    }

    /// Register a clone that already exists on `node` and make `node` its
    /// master. `node`'s watch loop then brings it up.
    pub async fn activate_clone(
        &self,
        top_level_id: &FilesystemId,
        branch: &str,
        clone: &CloneInfo,
        node: &NodeId,
    ) -> Result<(), ClusterError> {
        self.registry.register_clone(top_level_id, branch, clone.clone()).await?;
        self.registry.claim_clone_master(clone, node).await?;
        info!(%top_level_id, branch, filesystem_id = %clone.filesystem_id, node_id = %node, "activated clone");
        if node == &self.node_id {
            self.init_filesystem_machine(&clone.filesystem_id);
        }
        Ok(())
    }

    /// Roll `volume` back to `rollback_to`, keeping what came after on a new
    /// branch `new_branch`.
    #[instrument(skip(self, principal), fields(user = %principal.user_id, volume = %volume.name))]
    pub async fn stash_branch(
        &self,
        principal: &Principal,
        volume: &VolumeRef,
        rollback_to: &SnapshotId,
        new_branch: &str,
    ) -> Result<FilesystemId, ClusterError> {
        let (id, entry) = self.resolve(principal, volume, "stash").await?;
        if !entry.authorize_owner(principal) {
            return Err(ClusterError::PermissionDenied {
                user: principal.user_id.clone(),
                action: "stash",
                what: volume.name.to_string(),
            });
        }
        let master = self.registry.current_master_node(&id).await?;
        let clone = CloneInfo {
            filesystem_id: FilesystemId::generate(),
            origin: Origin {
                filesystem_id: id.clone(),
                snapshot_id: rollback_to.clone(),
            },
        };
        // The branch name is held before anything on disk changes.
        self.registry.register_clone(&entry.id, new_branch, clone.clone()).await?;

        let stashed = match self.dispatch_stash(&id, &clone, rollback_to).await {
            Ok(stashed) => stashed,
            Err(e) => {
                if let Err(release_err) = self.registry.unregister_clone(&entry.id, new_branch).await {
                    warn!(branch = new_branch, error = %release_err, "failed to release reserved branch");
                }
                return Err(e);
            }
        };
        self.activate_clone(&entry.id, new_branch, &clone, &master).await?;
        Ok(stashed)
    }

    async fn dispatch_stash(
        &self,
        id: &FilesystemId,
        clone: &CloneInfo,
        rollback_to: &SnapshotId,
    ) -> Result<FilesystemId, ClusterError> {
        let pending = self
            .global_request(
                id,
                Request::Stash {
                    new_filesystem_id: clone.filesystem_id.clone(),
                    rollback_to: rollback_to.clone(),
                },
            )
            .await?;
        match self.await_response(pending).await? {
            Response::Stashed { new_filesystem_id } => Ok(new_filesystem_id),
            other => Err(ClusterError::from_response(id.as_str(), "stash", other)),
        }
    }

    /// Delete `volume` everywhere. Only the owner may, and a top-level
    /// volume must have no branches left.
    #[instrument(skip(self, principal), fields(user = %principal.user_id, volume = %volume.name))]
    pub async fn delete_volume(&self, principal: &Principal, volume: &VolumeRef) -> Result<(), ClusterError> {
        let (id, entry) = self.resolve(principal, volume, "delete").await?;
        if !entry.authorize_owner(principal) {
            return Err(ClusterError::PermissionDenied {
                user: principal.user_id.clone(),
                action: "delete",
                what: volume.name.to_string(),
            });
        }
        if volume.branch.is_none() && !self.registry.clones_of(&id).is_empty() {
            return Err(ClusterError::Rejected {
                filesystem_id: id.to_string(),
                request: "delete".into(),
                kind: ErrorKind::InvalidState,
                message: format!("{} still has branches", volume.name),
            });
        }

        let master = self.registry.current_master_node(&id).await?;
        let pending = self.global_request(&id, Request::Delete).await?;
        match self.await_response(pending).await? {
            Response::Deleted => {}
            other => return Err(ClusterError::from_response(id.as_str(), "delete", other)),
        }

        // Unregister before releasing, so a node seeing the release already
        // sees the name gone.
        match &volume.branch {
            Some(branch) => self.registry.unregister_clone(&entry.id, branch).await?,
            None => self.registry.unregister_filesystem(&volume.name).await?,
        }
        if !self.registry.release_master(&id, &master).await? {
            warn!(filesystem_id = %id, %master, "master changed while deleting");
        }
        for key in [self.keys().dirty(&id), self.keys().containers(&id)] {
            if let Err(e) = self.kv.delete(DeleteRequest::new(key)).await {
                debug!(filesystem_id = %id, error = %e, "could not remove advisory record");
            }
        }
        info!(filesystem_id = %id, volume = %volume.name, "deleted volume");
        Ok(())
    }

    /// Per node, the snapshots of `id` that node is missing.
    pub fn replication_latency(&self, id: &FilesystemId) -> BTreeMap<NodeId, Vec<SnapshotId>> {
        volmesh_fsm::replication_latency(&self.peer_view(id))
    }
}
