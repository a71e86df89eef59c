//! Name, clone and master-assignment registry.
//!
//! The coordination store is authoritative. The in-process cache mirrors it
//! and is updated only after a successful store write or from the watch feed,
//! so readers of the cache may briefly see stale data but never data the
//! store did not accept.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;
use volmesh_core::CloneInfo;
use volmesh_core::FilesystemId;
use volmesh_core::KeyValueStore;
use volmesh_core::KeyValueStoreError;
use volmesh_core::NodeId;
use volmesh_core::ReadRequest;
use volmesh_core::RegistryEntry;
use volmesh_core::ScanRequest;
use volmesh_core::VolumeName;
use volmesh_core::WatchEvent;
use volmesh_core::WriteRequest;
use volmesh_core::normalize_branch;

use crate::error::CorruptedDataSnafu;
use crate::error::RegistryError;
use crate::error::SerializationSnafu;
use crate::keys::KeyKind;
use crate::keys::Keyspace;

/// Which master assignments [`Registry::list_master_nodes`] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterFilter {
    /// Only filesystems mastered by this node. `None` = every node.
    pub node_id: Option<NodeId>,
}

impl MasterFilter {
    pub fn node(node_id: NodeId) -> Self {
        Self { node_id: Some(node_id) }
    }
}

/// Where a filesystem id sits in the naming hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemLocation {
    pub name: VolumeName,
    /// `None` for the top-level filesystem.
    pub branch: Option<String>,
    pub top_level_id: FilesystemId,
    pub entry: RegistryEntry,
    pub clone: Option<CloneInfo>,
}

#[derive(Default)]
struct RegistryCache {
    names: BTreeMap<VolumeName, RegistryEntry>,
    clones: BTreeMap<FilesystemId, BTreeMap<String, CloneInfo>>,
    masters: BTreeMap<FilesystemId, NodeId>,
}

pub struct Registry {
    store: Arc<dyn KeyValueStore>,
    keys: Keyspace,
    cache: RwLock<RegistryCache>,
}

impl Registry {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: Keyspace) -> Self {
        Self {
            store,
            keys,
            cache: RwLock::new(RegistryCache::default()),
        }
    }

    pub fn keys(&self) -> &Keyspace {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    // ========================================================================
    // Volume names
    // ========================================================================

    /// Bind `name` to `entry.id`.
    ///
    /// Idempotent when the name is already bound to the same id; fails with
    /// `AlreadyExists` if it is bound to a different one.
    pub async fn register_filesystem(
        &self,
        name: &VolumeName,
        entry: RegistryEntry,
    ) -> Result<RegistryEntry, RegistryError> {
        let key = self.keys.filesystem(name);
        let value = serde_json::to_string(&entry).context(SerializationSnafu)?;
        match self.store.write(WriteRequest::create_only(&key, value)).await {
            Ok(_) => {
                info!(volume = %name, filesystem_id = %entry.id, "registered filesystem");
                self.cache.write().names.insert(name.clone(), entry.clone());
                Ok(entry)
            }
            Err(KeyValueStoreError::CompareAndSwapFailed { .. }) => {
                let existing = self.lookup_entry(name).await?.ok_or_else(|| RegistryError::NotFound {
                    what: format!("registry entry for {name}"),
                })?;
                if existing.id == entry.id {
                    Ok(existing)
                } else {
                    Err(RegistryError::AlreadyExists {
                        name: name.to_string(),
                        existing_id: existing.id.to_string(),
                    })
                }
            }
            Err(source) => Err(source.into()),
        }
    }

    /// Authoritative read of a name binding. Refreshes the cache.
    pub async fn lookup_entry(&self, name: &VolumeName) -> Result<Option<RegistryEntry>, RegistryError> {
        let key = self.keys.filesystem(name);
        let entry: Option<RegistryEntry> = self.read_json(&key).await?;
        let mut cache = self.cache.write();
        match &entry {
            Some(entry) => cache.names.insert(name.clone(), entry.clone()),
            None => cache.names.remove(name),
        };
        Ok(entry)
    }

    pub async fn unregister_filesystem(&self, name: &VolumeName) -> Result<(), RegistryError> {
        self.store.write(WriteRequest::delete(self.keys.filesystem(name))).await?;
        self.cache.write().names.remove(name);
        info!(volume = %name, "unregistered filesystem");
        Ok(())
    }

    // ========================================================================
    // Clones
    // ========================================================================

    /// Record `clone` as branch `branch` of `top_level_id`.
    pub async fn register_clone(
        &self,
        top_level_id: &FilesystemId,
        branch: &str,
        clone: CloneInfo,
    ) -> Result<(), RegistryError> {
        let key = self.keys.clone_key(top_level_id, branch);
        let value = serde_json::to_string(&clone).context(SerializationSnafu)?;
        match self.store.write(WriteRequest::create_only(&key, value)).await {
            Ok(_) => {
                info!(%top_level_id, branch, filesystem_id = %clone.filesystem_id, "registered clone");
                self.cache
                    .write()
                    .clones
                    .entry(top_level_id.clone())
                    .or_default()
                    .insert(branch.to_string(), clone);
                Ok(())
            }
            Err(KeyValueStoreError::CompareAndSwapFailed { actual, .. }) => {
                // A retry of our own earlier registration is not a conflict.
                let same = actual
                    .as_deref()
                    .and_then(|v| serde_json::from_str::<CloneInfo>(v).ok())
                    .is_some_and(|existing| existing == clone);
                if same {
                    Ok(())
                } else {
                    Err(RegistryError::BranchExists {
                        top_level_id: top_level_id.to_string(),
                        branch: branch.to_string(),
                    })
                }
            }
            Err(source) => Err(source.into()),
        }
    }

    pub async fn unregister_clone(&self, top_level_id: &FilesystemId, branch: &str) -> Result<(), RegistryError> {
        self.store.write(WriteRequest::delete(self.keys.clone_key(top_level_id, branch))).await?;
        let mut cache = self.cache.write();
        if let Some(branches) = cache.clones.get_mut(top_level_id) {
            branches.remove(branch);
        }
        Ok(())
    }

    /// Branches registered under a top-level filesystem.
    pub fn clones_of(&self, top_level_id: &FilesystemId) -> BTreeMap<String, CloneInfo> {
        self.cache.read().clones.get(top_level_id).cloned().unwrap_or_default()
    }

    /// Resolve `(name, branch)` to a filesystem id.
    ///
    /// A branch of `None`, `""` or `master` names the top-level filesystem.
    /// Falls back to the store on a cache miss.
    pub async fn maybe_clone_filesystem_id(
        &self,
        name: &VolumeName,
        branch: Option<&str>,
    ) -> Result<FilesystemId, RegistryError> {
        let cached = self.cache.read().names.get(name).cloned();
        let entry = match cached {
            Some(entry) => entry,
            None => self.lookup_entry(name).await?.ok_or_else(|| RegistryError::NotFound {
                what: format!("volume {name}"),
            })?,
        };
        let Some(branch) = normalize_branch(branch.map(str::to_string)) else {
            return Ok(entry.id);
        };

        let cached = self.cache.read().clones.get(&entry.id).and_then(|b| b.get(&branch)).cloned();
        if let Some(clone) = cached {
            return Ok(clone.filesystem_id);
        }
        let key = self.keys.clone_key(&entry.id, &branch);
        let clone: CloneInfo = self.read_json(&key).await?.ok_or_else(|| RegistryError::NotFound {
            what: format!("branch {branch} of {name}"),
        })?;
        self.cache
            .write()
            .clones
            .entry(entry.id.clone())
            .or_default()
            .insert(branch, clone.clone());
        Ok(clone.filesystem_id)
    }

    // ========================================================================
    // Master assignment
    // ========================================================================

    /// Authoritative read of the master assignment. Refreshes the cache.
    ///
    /// `MasterUnknown` means registered-but-ownerless and is transient.
    pub async fn current_master_node(&self, id: &FilesystemId) -> Result<NodeId, RegistryError> {
        let key = self.keys.master(id);
        let result = self.store.read(ReadRequest::new(&key)).await?;
        match result.kv {
            Some(kv) => {
                let node = NodeId::from(kv.value);
                self.set_master_node(id, node.clone());
                Ok(node)
            }
            None => {
                self.cache.write().masters.remove(id);
                Err(RegistryError::MasterUnknown {
                    filesystem_id: id.to_string(),
                })
            }
        }
    }

    /// Last known master, from cache only.
    pub fn cached_master_node(&self, id: &FilesystemId) -> Option<NodeId> {
        self.cache.read().masters.get(id).cloned()
    }

    /// Update the cached master. Does not write the store.
    pub fn set_master_node(&self, id: &FilesystemId, node: NodeId) {
        let previous = self.cache.write().masters.insert(id.clone(), node.clone());
        if previous.as_ref() != Some(&node) {
            debug!(filesystem_id = %id, node_id = %node, "master cache updated");
        }
    }

    /// Claim an unowned filesystem for `node` (create-only CAS).
    pub async fn claim_master(&self, id: &FilesystemId, node: &NodeId) -> Result<(), RegistryError> {
        let key = self.keys.master(id);
        match self.store.write(WriteRequest::create_only(&key, node.as_str())).await {
            Ok(_) => {
                info!(filesystem_id = %id, node_id = %node, "claimed master");
                self.set_master_node(id, node.clone());
                Ok(())
            }
            Err(KeyValueStoreError::CompareAndSwapFailed { actual, .. }) => {
                if let Some(actual) = &actual {
                    self.set_master_node(id, NodeId::from(actual.as_str()));
                }
                Err(RegistryError::MasterConflict {
                    filesystem_id: id.to_string(),
                    expected: None,
                    actual,
                })
            }
            Err(source) => Err(source.into()),
        }
    }

    /// Claim a clone, after checking that its origin is owned by someone.
    pub async fn claim_clone_master(&self, clone: &CloneInfo, node: &NodeId) -> Result<(), RegistryError> {
        match self.current_master_node(&clone.origin.filesystem_id).await {
            Ok(_) => {}
            Err(RegistryError::MasterUnknown { .. }) => {
                return Err(RegistryError::OriginNotOwned {
                    filesystem_id: clone.filesystem_id.to_string(),
                    origin_id: clone.origin.filesystem_id.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
        self.claim_master(&clone.filesystem_id, node).await
    }

    /// Hand mastership from `from` to `to`. Only the current master may do this.
    pub async fn handoff_master(&self, id: &FilesystemId, from: &NodeId, to: &NodeId) -> Result<(), RegistryError> {
        let key = self.keys.master(id);
        match self.store.write(WriteRequest::replace(&key, from.as_str(), to.as_str())).await {
            Ok(_) => {
                info!(filesystem_id = %id, from = %from, to = %to, "handed off master");
                self.set_master_node(id, to.clone());
                Ok(())
            }
            Err(KeyValueStoreError::CompareAndSwapFailed { actual, .. }) => {
                warn!(filesystem_id = %id, from = %from, actual = ?actual, "handoff lost a race");
                Err(RegistryError::MasterConflict {
                    filesystem_id: id.to_string(),
                    expected: Some(from.to_string()),
                    actual,
                })
            }
            Err(source) => Err(source.into()),
        }
    }

    /// Drop the assignment if `node` still holds it. Returns whether it did.
    pub async fn release_master(&self, id: &FilesystemId, node: &NodeId) -> Result<bool, RegistryError> {
        let key = self.keys.master(id);
        let result = self.store.write(WriteRequest::compare_and_delete(&key, node.as_str())).await?;
        if result.succeeded {
            self.cache.write().masters.remove(id);
            info!(filesystem_id = %id, node_id = %node, "released master");
        }
        Ok(result.succeeded)
    }

    /// Filesystems this registry believes are mastered per `filter`.
    pub fn list_master_nodes(&self, filter: &MasterFilter) -> BTreeMap<FilesystemId, NodeId> {
        self.cache
            .read()
            .masters
            .iter()
            .filter(|(_, node)| filter.node_id.as_ref().is_none_or(|want| want == *node))
            .map(|(id, node)| (id.clone(), node.clone()))
            .collect()
    }

    // ========================================================================
    // Enumeration
    // ========================================================================

    /// Every registered filesystem id, top-level and clones.
    pub fn filesystem_ids_including_clones(&self) -> Vec<FilesystemId> {
        let cache = self.cache.read();
        let mut ids: Vec<FilesystemId> = cache
            .names
            .values()
            .map(|e| e.id.clone())
            .chain(cache.clones.values().flat_map(|b| b.values().map(|c| c.filesystem_id.clone())))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Reverse lookup from id to name, branch and owning entry.
    pub fn lookup_by_id(&self, id: &FilesystemId) -> Option<FilesystemLocation> {
        let cache = self.cache.read();
        if let Some((name, entry)) = cache.names.iter().find(|(_, e)| &e.id == id) {
            return Some(FilesystemLocation {
                name: name.clone(),
                branch: None,
                top_level_id: id.clone(),
                entry: entry.clone(),
                clone: None,
            });
        }
        for (top_level_id, branches) in &cache.clones {
            if let Some((branch, clone)) = branches.iter().find(|(_, c)| &c.filesystem_id == id) {
                let (name, entry) = cache.names.iter().find(|(_, e)| &e.id == top_level_id)?;
                return Some(FilesystemLocation {
                    name: name.clone(),
                    branch: Some(branch.clone()),
                    top_level_id: top_level_id.clone(),
                    entry: entry.clone(),
                    clone: Some(clone.clone()),
                });
            }
        }
        None
    }

    // ========================================================================
    // Cache maintenance
    // ========================================================================

    /// Rebuild the cache from a full scan of the store.
    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let mut fresh = RegistryCache::default();

        for kv in self.store.scan_all(ScanRequest::prefix(self.keys.filesystems_prefix())).await? {
            if let Some(KeyKind::Filesystem(name)) = self.keys.parse(&kv.key) {
                let entry: RegistryEntry = parse_json(&kv.key, &kv.value)?;
                fresh.names.insert(name, entry);
            }
        }
        for kv in self.store.scan_all(ScanRequest::prefix(self.keys.clones_prefix())).await? {
            if let Some(KeyKind::Clone { top_level_id, branch }) = self.keys.parse(&kv.key) {
                let clone: CloneInfo = parse_json(&kv.key, &kv.value)?;
                fresh.clones.entry(top_level_id).or_default().insert(branch, clone);
            }
        }
        for kv in self.store.scan_all(ScanRequest::prefix(self.keys.masters_prefix())).await? {
            if let Some(KeyKind::Master(id)) = self.keys.parse(&kv.key) {
                fresh.masters.insert(id, NodeId::from(kv.value));
            }
        }

        debug!(
            names = fresh.names.len(),
            clones = fresh.clones.values().map(BTreeMap::len).sum::<usize>(),
            masters = fresh.masters.len(),
            "registry cache refreshed"
        );
        *self.cache.write() = fresh;
        Ok(())
    }

    /// Mirror one watched change into the cache.
    ///
    /// Returns the parsed key so callers can route the other key kinds.
    pub fn apply_watch_event(&self, event: &WatchEvent) -> Option<KeyKind> {
        let kind = self.keys.parse(&event.key)?;
        match &kind {
            KeyKind::Filesystem(name) => {
                let mut cache = self.cache.write();
                match event.value.as_deref().map(|v| parse_json::<RegistryEntry>(&event.key, v)) {
                    Some(Ok(entry)) => {
                        cache.names.insert(name.clone(), entry);
                    }
                    Some(Err(e)) => warn!(key = %event.key, error = %e, "ignoring unparseable registry entry"),
                    None => {
                        cache.names.remove(name);
                    }
                }
            }
            KeyKind::Clone { top_level_id, branch } => {
                let mut cache = self.cache.write();
                match event.value.as_deref().map(|v| parse_json::<CloneInfo>(&event.key, v)) {
                    Some(Ok(clone)) => {
                        cache.clones.entry(top_level_id.clone()).or_default().insert(branch.clone(), clone);
                    }
                    Some(Err(e)) => warn!(key = %event.key, error = %e, "ignoring unparseable clone record"),
                    None => {
                        if let Some(branches) = cache.clones.get_mut(top_level_id) {
                            branches.remove(branch);
                        }
                    }
                }
            }
            KeyKind::Master(id) => match &event.value {
                Some(node) => self.set_master_node(id, NodeId::from(node.as_str())),
                None => {
                    self.cache.write().masters.remove(id);
                }
            },
            _ => {}
        }
        Some(kind)
    }

    // ========================================================================
    // JSON helpers
    // ========================================================================

    /// Read and decode a JSON value. `None` if the key is absent.
    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, RegistryError> {
        match self.store.read(ReadRequest::new(key)).await {
            Ok(result) => match result.kv {
                Some(kv) => Ok(Some(parse_json(key, &kv.value)?)),
                None => Ok(None),
            },
            Err(KeyValueStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Unconditionally write a JSON value.
    pub async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), RegistryError> {
        let value = serde_json::to_string(value).context(SerializationSnafu)?;
        self.store.write(WriteRequest::set(key, value)).await?;
        Ok(())
    }
}

fn parse_json<T: DeserializeOwned>(key: &str, value: &str) -> Result<T, RegistryError> {
    serde_json::from_str(value).context(CorruptedDataSnafu { key })
}

#[cfg(test)]
mod tests {
    use volmesh_core::DeterministicKeyValueStore;
    use volmesh_core::Origin;
    use volmesh_core::SnapshotId;
    use volmesh_core::constants::MAX_SCAN_RESULTS;

    use super::*;

    fn registry(store: Arc<DeterministicKeyValueStore>) -> Registry {
        Registry::new(store, Keyspace::new("volmesh"))
    }

    fn notebook() -> VolumeName {
        VolumeName::new("alice", "notebook").unwrap()
    }

    #[tokio::test]
    async fn test_refresh_reads_past_a_single_scan_page() {
        let store = DeterministicKeyValueStore::new();
        let reg = registry(store.clone());
        let total = MAX_SCAN_RESULTS as usize + 5;
        for i in 0..total {
            let key = reg.keys().master(&FilesystemId::from(format!("fs-{i:05}").as_str()));
            store.write(WriteRequest::set(key, "node-1")).await.unwrap();
        }

        reg.refresh().await.unwrap();
        assert_eq!(reg.list_master_nodes(&MasterFilter { node_id: None }).len(), total);
    }

    #[tokio::test]
    async fn test_register_is_idempotent_for_same_id() {
        let reg = registry(DeterministicKeyValueStore::new());
        let id = FilesystemId::generate();
        reg.register_filesystem(&notebook(), RegistryEntry::new(id.clone(), "alice")).await.unwrap();
        let again = reg.register_filesystem(&notebook(), RegistryEntry::new(id.clone(), "alice")).await.unwrap();
        assert_eq!(again.id, id);

        let err = reg
            .register_filesystem(&notebook(), RegistryEntry::new(FilesystemId::generate(), "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_master_claim_is_create_only() {
        let store = DeterministicKeyValueStore::new();
        let a = registry(store.clone());
        let b = registry(store);
        let id = FilesystemId::generate();

        a.claim_master(&id, &NodeId::from("node-1")).await.unwrap();
        let err = b.claim_master(&id, &NodeId::from("node-2")).await.unwrap_err();
        assert!(matches!(err, RegistryError::MasterConflict { .. }));
        // The loser's cache learned the winner from the failed CAS.
        assert_eq!(b.cached_master_node(&id), Some(NodeId::from("node-1")));
    }

    #[tokio::test]
    async fn test_handoff_requires_current_master() {
        let reg = registry(DeterministicKeyValueStore::new());
        let id = FilesystemId::generate();
        let (n1, n2, n3) = (NodeId::from("n1"), NodeId::from("n2"), NodeId::from("n3"));
        reg.claim_master(&id, &n1).await.unwrap();

        assert!(reg.handoff_master(&id, &n3, &n2).await.is_err());
        reg.handoff_master(&id, &n1, &n2).await.unwrap();
        assert_eq!(reg.current_master_node(&id).await.unwrap(), n2);
    }

    #[tokio::test]
    async fn test_unowned_filesystem_is_master_unknown() {
        let reg = registry(DeterministicKeyValueStore::new());
        let err = reg.current_master_node(&FilesystemId::generate()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_clone_resolution_and_branch_conflict() {
        let reg = registry(DeterministicKeyValueStore::new());
        let top = FilesystemId::generate();
        reg.register_filesystem(&notebook(), RegistryEntry::new(top.clone(), "alice")).await.unwrap();
        let clone = CloneInfo {
            filesystem_id: FilesystemId::generate(),
            origin: Origin {
                filesystem_id: top.clone(),
                snapshot_id: SnapshotId::from("A"),
            },
        };
        reg.register_clone(&top, "experiment", clone.clone()).await.unwrap();
        reg.register_clone(&top, "experiment", clone.clone()).await.unwrap();

        let other = CloneInfo {
            filesystem_id: FilesystemId::generate(),
            origin: clone.origin.clone(),
        };
        assert!(matches!(
            reg.register_clone(&top, "experiment", other).await,
            Err(RegistryError::BranchExists { .. })
        ));

        assert_eq!(reg.maybe_clone_filesystem_id(&notebook(), None).await.unwrap(), top);
        assert_eq!(reg.maybe_clone_filesystem_id(&notebook(), Some("master")).await.unwrap(), top);
        assert_eq!(reg.maybe_clone_filesystem_id(&notebook(), Some("experiment")).await.unwrap(), clone.filesystem_id);
        assert!(matches!(
            reg.maybe_clone_filesystem_id(&notebook(), Some("nope")).await,
            Err(RegistryError::NotFound { .. })
        ));

        let location = reg.lookup_by_id(&clone.filesystem_id).unwrap();
        assert_eq!(location.branch.as_deref(), Some("experiment"));
        assert_eq!(location.top_level_id, top);
        assert_eq!(reg.filesystem_ids_including_clones().len(), 2);
    }

    #[tokio::test]
    async fn test_clone_claim_requires_owned_origin() {
        let reg = registry(DeterministicKeyValueStore::new());
        let clone = CloneInfo {
            filesystem_id: FilesystemId::generate(),
            origin: Origin {
                filesystem_id: FilesystemId::generate(),
                snapshot_id: SnapshotId::from("A"),
            },
        };
        let node = NodeId::from("n1");
        assert!(matches!(
            reg.claim_clone_master(&clone, &node).await,
            Err(RegistryError::OriginNotOwned { .. })
        ));
        reg.claim_master(&clone.origin.filesystem_id, &node).await.unwrap();
        reg.claim_clone_master(&clone, &node).await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_and_watch_keep_peer_caches_in_sync() {
        let store = DeterministicKeyValueStore::new();
        let writer = registry(store.clone());
        let reader = registry(store.clone());
        let mut watch = store.watch("volmesh/").await.unwrap();

        let id = FilesystemId::generate();
        writer.register_filesystem(&notebook(), RegistryEntry::new(id.clone(), "alice")).await.unwrap();
        writer.claim_master(&id, &NodeId::from("n1")).await.unwrap();

        for _ in 0..2 {
            if let Some(volmesh_core::WatchNotification::Event(ev)) = watch.next().await {
                reader.apply_watch_event(&ev);
            }
        }
        assert_eq!(reader.cached_master_node(&id), Some(NodeId::from("n1")));
        assert_eq!(reader.list_master_nodes(&MasterFilter::node(NodeId::from("n1"))).len(), 1);
        assert!(reader.list_master_nodes(&MasterFilter::node(NodeId::from("n2"))).is_empty());

        let late = registry(store);
        late.refresh().await.unwrap();
        assert_eq!(late.filesystem_ids_including_clones(), vec![id]);
    }
}
