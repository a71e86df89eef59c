//! Snapshot-store driver interface.
//!
//! The driver owns the on-disk copy-on-write filesystems. Every method either
//! completes the whole command or returns a [`StoreError`] naming it; the core
//! never retries a driver command.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::StoreError;
use crate::types::FilesystemId;
use crate::types::Origin;
use crate::types::Snapshot;
use crate::types::SnapshotId;

/// Result of inspecting one filesystem in the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredFilesystem {
    pub id: FilesystemId,
    pub exists: bool,
    pub mounted: bool,
    /// Full visible history, oldest first. Empty when `exists` is false.
    pub snapshots: Vec<Snapshot>,
    pub origin: Option<Origin>,
}

impl DiscoveredFilesystem {
    pub fn missing(id: FilesystemId) -> Self {
        Self {
            id,
            exists: false,
            mounted: false,
            snapshots: Vec::new(),
            origin: None,
        }
    }

    pub fn latest_snapshot(&self) -> Option<&SnapshotId> {
        self.snapshots.last().map(|s| &s.id)
    }
}

/// One active mount.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MountRecord {
    pub mountpoint: String,
    pub filesystem_id: FilesystemId,
    pub options: String,
}

/// A serialized slice of history moving between nodes.
///
/// `from` is the snapshot the receiver must already end at; `None` means the
/// stream carries the whole history and may create the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStream {
    pub filesystem_id: FilesystemId,
    pub from: Option<SnapshotId>,
    pub snapshots: Vec<Snapshot>,
    /// Opaque driver payload.
    pub payload: Vec<u8>,
}

impl SnapshotStream {
    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn last_snapshot(&self) -> Option<&SnapshotId> {
        self.snapshots.last().map(|s| &s.id)
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Ids of every filesystem present locally.
    async fn list_filesystems(&self) -> Result<Vec<FilesystemId>, StoreError>;

    async fn discover(&self, id: &FilesystemId) -> Result<DiscoveredFilesystem, StoreError>;

    async fn create(&self, id: &FilesystemId) -> Result<(), StoreError>;

    async fn destroy(&self, id: &FilesystemId) -> Result<(), StoreError>;

    /// Commit the current contents as a new snapshot.
    async fn snapshot(
        &self,
        id: &FilesystemId,
        snapshot_id: &SnapshotId,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Create `dest` as a writable clone of `source@snapshot`.
    async fn clone_filesystem(
        &self,
        source: &FilesystemId,
        snapshot: &SnapshotId,
        dest: &FilesystemId,
    ) -> Result<(), StoreError>;

    async fn rename(&self, from: &FilesystemId, to: &FilesystemId) -> Result<(), StoreError>;

    /// Make `id` independent of its origin; the origin becomes its clone.
    async fn promote(&self, id: &FilesystemId) -> Result<(), StoreError>;

    /// Discard everything after `snapshot`.
    async fn rollback(&self, id: &FilesystemId, snapshot: &SnapshotId) -> Result<(), StoreError>;

    async fn mount(&self, id: &FilesystemId) -> Result<MountRecord, StoreError>;

    async fn unmount(&self, id: &FilesystemId) -> Result<(), StoreError>;

    async fn list_mounts(&self) -> Result<Vec<MountRecord>, StoreError>;

    async fn unmount_path(&self, mountpoint: &str) -> Result<(), StoreError>;

    /// Re-establish a previously recorded mount with its original options.
    async fn mount_at(&self, record: &MountRecord) -> Result<(), StoreError>;

    /// `(dirty_bytes, used_bytes)` relative to `latest_snapshot`.
    async fn dirty_delta(
        &self,
        id: &FilesystemId,
        latest_snapshot: Option<&SnapshotId>,
    ) -> Result<(u64, u64), StoreError>;

    /// Serialize the history after `from` up to and including `to`
    /// (`None` = latest).
    async fn send(
        &self,
        id: &FilesystemId,
        from: Option<&SnapshotId>,
        to: Option<&SnapshotId>,
    ) -> Result<SnapshotStream, StoreError>;

    /// Apply a stream produced by [`SnapshotStore::send`] on another node.
    async fn receive(&self, id: &FilesystemId, stream: SnapshotStream) -> Result<(), StoreError>;

    /// Append uncommitted data. Used by drivers that model writes directly.
    async fn write_data(&self, id: &FilesystemId, data: &[u8]) -> Result<(), StoreError>;
}
