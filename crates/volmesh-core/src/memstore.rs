//! In-memory snapshot store.
//!
//! Models the parts of a copy-on-write store the cluster depends on: per
//! filesystem snapshot chains, clone origins with promote semantics, mounts
//! that follow renames, and dirty/used byte accounting. Streams are JSON.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_MOUNT_PREFIX;
use crate::error::StoreError;
use crate::store::DiscoveredFilesystem;
use crate::store::MountRecord;
use crate::store::SnapshotStore;
use crate::store::SnapshotStream;
use crate::types::FilesystemId;
use crate::types::Origin;
use crate::types::Snapshot;
use crate::types::SnapshotId;

#[derive(Debug, Clone)]
struct Commit {
    snapshot: Snapshot,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
struct Dataset {
    /// Snapshots this dataset owns, oldest first.
    own: Vec<Commit>,
    origin: Option<Origin>,
    dirty: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WireSegment {
    id: SnapshotId,
    data: Vec<u8>,
}

#[derive(Default)]
struct State {
    datasets: BTreeMap<FilesystemId, Dataset>,
    mounts: BTreeMap<String, MountRecord>,
    injected_failures: BTreeSet<String>,
}

fn missing(command: &str, id: &FilesystemId) -> StoreError {
    StoreError::FilesystemMissing {
        command: command.to_string(),
        filesystem_id: id.to_string(),
    }
}

fn snapshot_missing(command: &str, id: &FilesystemId, snapshot: &SnapshotId) -> StoreError {
    StoreError::SnapshotMissing {
        command: command.to_string(),
        filesystem_id: id.to_string(),
        snapshot_id: snapshot.to_string(),
    }
}

impl State {
    fn take_injected(&mut self, command: &str, id: &FilesystemId) -> Result<(), StoreError> {
        if self.injected_failures.remove(command) {
            return Err(StoreError::CommandFailed {
                command: command.to_string(),
                filesystem_id: id.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn dataset(&self, command: &str, id: &FilesystemId) -> Result<&Dataset, StoreError> {
        self.datasets.get(id).ok_or_else(|| missing(command, id))
    }

    fn dataset_mut(&mut self, command: &str, id: &FilesystemId) -> Result<&mut Dataset, StoreError> {
        self.datasets.get_mut(id).ok_or_else(|| missing(command, id))
    }

    /// Visible history: the origin chain up to the branch point, then our own.
    fn history(&self, id: &FilesystemId) -> Vec<Commit> {
        let Some(dataset) = self.datasets.get(id) else {
            return Vec::new();
        };
        let mut commits = match &dataset.origin {
            Some(origin) => {
                let mut parent = self.history(&origin.filesystem_id);
                if let Some(pos) = parent.iter().position(|c| c.snapshot.id == origin.snapshot_id) {
                    parent.truncate(pos + 1);
                }
                parent
            }
            None => Vec::new(),
        };
        commits.extend(dataset.own.iter().cloned());
        commits
    }

    /// The dataset in `id`'s lineage that owns `snapshot`.
    fn owner_of(&self, id: &FilesystemId, snapshot: &SnapshotId) -> Option<FilesystemId> {
        let dataset = self.datasets.get(id)?;
        if dataset.own.iter().any(|c| &c.snapshot.id == snapshot) {
            return Some(id.clone());
        }
        let origin = dataset.origin.as_ref()?;
        self.owner_of(&origin.filesystem_id, snapshot)
    }

    fn mounted_at(&self, id: &FilesystemId) -> Option<&MountRecord> {
        self.mounts.values().find(|m| &m.filesystem_id == id)
    }

    fn ensure_unmounted(&self, command: &str, id: &FilesystemId) -> Result<(), StoreError> {
        match self.mounted_at(id) {
            Some(record) => Err(StoreError::Busy {
                command: command.to_string(),
                filesystem_id: id.to_string(),
                mountpoint: record.mountpoint.clone(),
            }),
            None => Ok(()),
        }
    }

    fn children_of(&self, id: &FilesystemId) -> Vec<(FilesystemId, SnapshotId)> {
        self.datasets
            .iter()
            .filter_map(|(child, d)| match &d.origin {
                Some(o) if &o.filesystem_id == id => Some((child.clone(), o.snapshot_id.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Snapshot store held entirely in memory.
pub struct InMemorySnapshotStore {
    mount_prefix: String,
    state: Mutex<State>,
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new(DEFAULT_MOUNT_PREFIX)
    }
}

impl InMemorySnapshotStore {
    pub fn new(mount_prefix: impl Into<String>) -> Self {
        Self {
            mount_prefix: mount_prefix.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Make the next invocation of `command` fail.
    pub fn inject_failure(&self, command: &str) {
        self.state.lock().injected_failures.insert(command.to_string());
    }

    /// Snapshot ids owned by `id` itself, excluding inherited history.
    pub fn own_snapshot_ids(&self, id: &FilesystemId) -> Vec<SnapshotId> {
        let state = self.state.lock();
        state
            .datasets
            .get(id)
            .map(|d| d.own.iter().map(|c| c.snapshot.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn origin_of(&self, id: &FilesystemId) -> Option<Origin> {
        self.state.lock().datasets.get(id).and_then(|d| d.origin.clone())
    }

    fn mountpoint_for(&self, id: &FilesystemId) -> String {
        format!("{}/{}", self.mount_prefix.trim_end_matches('/'), id)
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn list_filesystems(&self) -> Result<Vec<FilesystemId>, StoreError> {
        Ok(self.state.lock().datasets.keys().cloned().collect())
    }

    async fn discover(&self, id: &FilesystemId) -> Result<DiscoveredFilesystem, StoreError> {
        let mut state = self.state.lock();
        state.take_injected("discover", id)?;
        let Some(dataset) = state.datasets.get(id) else {
            return Ok(DiscoveredFilesystem::missing(id.clone()));
        };
        Ok(DiscoveredFilesystem {
            id: id.clone(),
            exists: true,
            mounted: state.mounted_at(id).is_some(),
            snapshots: state.history(id).into_iter().map(|c| c.snapshot).collect(),
            origin: dataset.origin.clone(),
        })
    }

    async fn create(&self, id: &FilesystemId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_injected("create", id)?;
        if state.datasets.contains_key(id) {
            return Err(StoreError::FilesystemExists {
                command: "create".into(),
                filesystem_id: id.to_string(),
            });
        }
        state.datasets.insert(id.clone(), Dataset::default());
        Ok(())
    }

    async fn destroy(&self, id: &FilesystemId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_injected("destroy", id)?;
        state.dataset("destroy", id)?;
        if let Some((clone_id, snapshot_id)) = state.children_of(id).into_iter().next() {
            return Err(StoreError::CloneDependency {
                command: "destroy".into(),
                filesystem_id: id.to_string(),
                clone_id: clone_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            });
        }
        state.ensure_unmounted("destroy", id)?;
        state.datasets.remove(id);
        Ok(())
    }

    async fn snapshot(
        &self,
        id: &FilesystemId,
        snapshot_id: &SnapshotId,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_injected("snapshot", id)?;
        state.dataset("snapshot", id)?;
        if state.history(id).iter().any(|c| &c.snapshot.id == snapshot_id) {
            return Err(StoreError::CommandFailed {
                command: "snapshot".into(),
                filesystem_id: id.to_string(),
                reason: format!("snapshot {snapshot_id} already exists"),
            });
        }
        let dataset = state.dataset_mut("snapshot", id)?;
        let data = std::mem::take(&mut dataset.dirty);
        dataset.own.push(Commit {
            snapshot: Snapshot::with_metadata(snapshot_id.clone(), metadata),
            data,
        });
        Ok(())
    }

    async fn clone_filesystem(
        &self,
        source: &FilesystemId,
        snapshot: &SnapshotId,
        dest: &FilesystemId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_injected("clone", dest)?;
        state.dataset("clone", source)?;
        if state.datasets.contains_key(dest) {
            return Err(StoreError::FilesystemExists {
                command: "clone".into(),
                filesystem_id: dest.to_string(),
            });
        }
        // The snapshot must be visible from `source`, not just owned somewhere
        // in its lineage past the branch point.
        if !state.history(source).iter().any(|c| &c.snapshot.id == snapshot) {
            return Err(snapshot_missing("clone", source, snapshot));
        }
        let owner = state
            .owner_of(source, snapshot)
            .ok_or_else(|| snapshot_missing("clone", source, snapshot))?;
        state.datasets.insert(dest.clone(), Dataset {
            own: Vec::new(),
            origin: Some(Origin {
                filesystem_id: owner,
                snapshot_id: snapshot.clone(),
            }),
            dirty: Vec::new(),
        });
        Ok(())
    }

    async fn rename(&self, from: &FilesystemId, to: &FilesystemId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_injected("rename", from)?;
        if state.datasets.contains_key(to) {
            return Err(StoreError::FilesystemExists {
                command: "rename".into(),
                filesystem_id: to.to_string(),
            });
        }
        let dataset = state.datasets.remove(from).ok_or_else(|| missing("rename", from))?;
        state.datasets.insert(to.clone(), dataset);
        for other in state.datasets.values_mut() {
            if let Some(origin) = other.origin.as_mut()
                && &origin.filesystem_id == from
            {
                origin.filesystem_id = to.clone();
            }
        }
        // An existing mount keeps following the dataset under its new name.
        for record in state.mounts.values_mut() {
            if &record.filesystem_id == from {
                record.filesystem_id = to.clone();
            }
        }
        Ok(())
    }

    async fn promote(&self, id: &FilesystemId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_injected("promote", id)?;
        let origin = state
            .dataset("promote", id)?
            .origin
            .clone()
            .ok_or_else(|| StoreError::CommandFailed {
                command: "promote".into(),
                filesystem_id: id.to_string(),
                reason: "filesystem is not a clone".into(),
            })?;
        let parent_id = origin.filesystem_id.clone();
        state.ensure_unmounted("promote", id)?;
        state.ensure_unmounted("promote", &parent_id)?;

        let parent = state.dataset_mut("promote", &parent_id)?;
        let split = parent
            .own
            .iter()
            .position(|c| c.snapshot.id == origin.snapshot_id)
            .ok_or_else(|| snapshot_missing("promote", &parent_id, &origin.snapshot_id))?;
        let moved: Vec<Commit> = parent.own.drain(..=split).collect();
        let grandparent = parent.origin.replace(Origin {
            filesystem_id: id.clone(),
            snapshot_id: origin.snapshot_id.clone(),
        });
        let moved_ids: BTreeSet<SnapshotId> = moved.iter().map(|c| c.snapshot.id.clone()).collect();

        let dataset = state.dataset_mut("promote", id)?;
        let mut own = moved;
        own.append(&mut dataset.own);
        dataset.own = own;
        dataset.origin = grandparent;

        // Sibling clones of the moved snapshots now hang off the promoted dataset.
        for (other_id, other) in state.datasets.iter_mut() {
            if other_id == id || other_id == &parent_id {
                continue;
            }
            if let Some(o) = other.origin.as_mut()
                && o.filesystem_id == parent_id
                && moved_ids.contains(&o.snapshot_id)
            {
                o.filesystem_id = id.clone();
            }
        }
        Ok(())
    }

    async fn rollback(&self, id: &FilesystemId, snapshot: &SnapshotId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_injected("rollback", id)?;
        let dataset = state.dataset("rollback", id)?;
        let keep = dataset
            .own
            .iter()
            .position(|c| &c.snapshot.id == snapshot)
            .ok_or_else(|| snapshot_missing("rollback", id, snapshot))?;
        let discarded: BTreeSet<SnapshotId> = dataset.own[keep + 1..].iter().map(|c| c.snapshot.id.clone()).collect();
        if let Some((clone_id, snapshot_id)) =
            state.children_of(id).into_iter().find(|(_, s)| discarded.contains(s))
        {
            return Err(StoreError::CloneDependency {
                command: "rollback".into(),
                filesystem_id: id.to_string(),
                clone_id: clone_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            });
        }
        let dataset = state.dataset_mut("rollback", id)?;
        dataset.own.truncate(keep + 1);
        dataset.dirty.clear();
        Ok(())
    }

    async fn mount(&self, id: &FilesystemId) -> Result<MountRecord, StoreError> {
        let mountpoint = self.mountpoint_for(id);
        let mut state = self.state.lock();
        state.take_injected("mount", id)?;
        state.dataset("mount", id)?;
        if let Some(existing) = state.mounted_at(id) {
            return Ok(existing.clone());
        }
        if let Some(occupant) = state.mounts.get(&mountpoint) {
            return Err(StoreError::Busy {
                command: "mount".into(),
                filesystem_id: id.to_string(),
                mountpoint: occupant.mountpoint.clone(),
            });
        }
        let record = MountRecord {
            mountpoint: mountpoint.clone(),
            filesystem_id: id.clone(),
            options: "rw".into(),
        };
        state.mounts.insert(mountpoint, record.clone());
        Ok(record)
    }

    async fn unmount(&self, id: &FilesystemId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_injected("unmount", id)?;
        state.mounts.retain(|_, record| &record.filesystem_id != id);
        Ok(())
    }

    async fn list_mounts(&self) -> Result<Vec<MountRecord>, StoreError> {
        Ok(self.state.lock().mounts.values().cloned().collect())
    }

    async fn unmount_path(&self, mountpoint: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        match state.mounts.remove(mountpoint) {
            Some(_) => Ok(()),
            None => Err(StoreError::CommandFailed {
                command: "umount".into(),
                filesystem_id: mountpoint.to_string(),
                reason: "not mounted".into(),
            }),
        }
    }

    async fn mount_at(&self, record: &MountRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.take_injected("mount", &record.filesystem_id)?;
        state.dataset("mount", &record.filesystem_id)?;
        if state.mounts.contains_key(&record.mountpoint) {
            return Err(StoreError::Busy {
                command: "mount".into(),
                filesystem_id: record.filesystem_id.to_string(),
                mountpoint: record.mountpoint.clone(),
            });
        }
        state.mounts.insert(record.mountpoint.clone(), record.clone());
        Ok(())
    }

    async fn dirty_delta(
        &self,
        id: &FilesystemId,
        latest_snapshot: Option<&SnapshotId>,
    ) -> Result<(u64, u64), StoreError> {
        let state = self.state.lock();
        let dataset = state.dataset("diff", id)?;
        let history = state.history(id);
        if let Some(latest) = latest_snapshot
            && !history.iter().any(|c| &c.snapshot.id == latest)
        {
            return Err(snapshot_missing("diff", id, latest));
        }
        let dirty = dataset.dirty.len() as u64;
        let committed: u64 = history.iter().map(|c| c.data.len() as u64).sum();
        Ok((dirty, committed + dirty))
    }

    async fn send(
        &self,
        id: &FilesystemId,
        from: Option<&SnapshotId>,
        to: Option<&SnapshotId>,
    ) -> Result<SnapshotStream, StoreError> {
        let state = self.state.lock();
        state.dataset("send", id)?;
        let history = state.history(id);
        let start = match from {
            Some(from) => {
                history
                    .iter()
                    .position(|c| &c.snapshot.id == from)
                    .ok_or_else(|| snapshot_missing("send", id, from))?
                    + 1
            }
            None => 0,
        };
        let end = match to {
            Some(to) => {
                history
                    .iter()
                    .position(|c| &c.snapshot.id == to)
                    .ok_or_else(|| snapshot_missing("send", id, to))?
                    + 1
            }
            None => history.len(),
        };
        let slice = if start <= end { &history[start..end] } else { &[][..] };
        let segments: Vec<WireSegment> = slice
            .iter()
            .map(|c| WireSegment {
                id: c.snapshot.id.clone(),
                data: c.data.clone(),
            })
            .collect();
        let payload = serde_json::to_vec(&segments).map_err(|e| StoreError::CommandFailed {
            command: "send".into(),
            filesystem_id: id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(SnapshotStream {
            filesystem_id: id.clone(),
            from: from.cloned(),
            snapshots: slice.iter().map(|c| c.snapshot.clone()).collect(),
            payload,
        })
    }

    async fn receive(&self, id: &FilesystemId, stream: SnapshotStream) -> Result<(), StoreError> {
        let segments: Vec<WireSegment> =
            serde_json::from_slice(&stream.payload).map_err(|e| StoreError::CommandFailed {
                command: "recv".into(),
                filesystem_id: id.to_string(),
                reason: e.to_string(),
            })?;
        let mut data_by_id: BTreeMap<SnapshotId, Vec<u8>> = segments.into_iter().map(|s| (s.id, s.data)).collect();

        let mut state = self.state.lock();
        state.take_injected("recv", id)?;
        let history: Vec<SnapshotId> = state.history(id).into_iter().map(|c| c.snapshot.id).collect();
        let exists = state.datasets.contains_key(id);

        // Work out which stream snapshots are new for us.
        let incoming: Vec<Snapshot> = if stream.from.as_ref() == history.last() {
            stream.snapshots
        } else if stream.from.is_none() && history.iter().zip(&stream.snapshots).all(|(a, b)| a == &b.id) {
            // A full stream over a replica that holds a prefix of it.
            if history.len() > stream.snapshots.len() {
                return Err(StoreError::Diverged {
                    command: "recv".into(),
                    filesystem_id: id.to_string(),
                    stream_from: None,
                    local_latest: history.last().map(|s| s.to_string()),
                });
            }
            stream.snapshots.into_iter().skip(history.len()).collect()
        } else {
            return Err(StoreError::Diverged {
                command: "recv".into(),
                filesystem_id: id.to_string(),
                stream_from: stream.from.map(|s| s.to_string()),
                local_latest: history.last().map(|s| s.to_string()),
            });
        };

        if !exists {
            state.datasets.insert(id.clone(), Dataset::default());
        }
        let dataset = state.dataset_mut("recv", id)?;
        for snapshot in incoming {
            let data = data_by_id.remove(&snapshot.id).unwrap_or_default();
            dataset.own.push(Commit { snapshot, data });
        }
        Ok(())
    }

    async fn write_data(&self, id: &FilesystemId, data: &[u8]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let dataset = state.dataset_mut("write", id)?;
        dataset.dirty.extend_from_slice(data);
        Ok(())
    }
}
