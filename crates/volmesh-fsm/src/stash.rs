//! Moving recent history aside onto a new filesystem.

use tracing::error;
use tracing::info;
use volmesh_core::FilesystemId;
use volmesh_core::MountRecord;
use volmesh_core::SnapshotId;
use volmesh_core::SnapshotStore;
use volmesh_core::StoreError;

/// Roll `existing` back to `rollback_to`, keeping everything after it
/// reachable under `new`.
///
/// Afterwards `existing` owns the history up to `rollback_to` with no
/// origin, and `new` is a clone of `existing@rollback_to` that owns the
/// rest. Mounts of either filesystem are restored at the same mountpoints
/// with the same options, now pointing at `existing`. Returns those mounts.
///
/// A failed remount is returned as an error; the mountpoint is left empty.
pub async fn stash_branch(
    store: &dyn SnapshotStore,
    existing: &FilesystemId,
    new: &FilesystemId,
    rollback_to: &SnapshotId,
) -> Result<Vec<MountRecord>, StoreError> {
    // Recorded before the rename, so they still name `existing`.
    let mounts: Vec<MountRecord> = store
        .list_mounts()
        .await?
        .into_iter()
        .filter(|m| &m.filesystem_id == existing || &m.filesystem_id == new)
        .collect();

    store.rename(existing, new).await?;
    store.clone_filesystem(new, rollback_to, existing).await?;
    for mount in &mounts {
        store.unmount_path(&mount.mountpoint).await?;
    }
    store.promote(existing).await?;

    for mount in &mounts {
        let restored = MountRecord {
            filesystem_id: existing.clone(),
            ..mount.clone()
        };
        if let Err(e) = store.mount_at(&restored).await {
            error!(
                filesystem_id = %existing,
                mountpoint = %restored.mountpoint,
                error = %e,
                "failed to restore mount after stash"
            );
            return Err(e);
        }
    }

    info!(filesystem_id = %existing, stashed_as = %new, %rollback_to, "stashed history");
    Ok(mounts)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use volmesh_core::InMemorySnapshotStore;
    use volmesh_core::Origin;

    use super::*;

    async fn chain(store: &InMemorySnapshotStore, id: &FilesystemId, snaps: &[&str]) {
        store.create(id).await.unwrap();
        for s in snaps {
            store.write_data(id, s.as_bytes()).await.unwrap();
            store.snapshot(id, &SnapshotId::from(*s), BTreeMap::new()).await.unwrap();
        }
    }

    fn ids(snapshots: &[volmesh_core::Snapshot]) -> Vec<&str> {
        snapshots.iter().map(|s| s.id.as_str()).collect()
    }

    #[tokio::test]
    async fn stash_splits_history_and_keeps_mounts() {
        let store = InMemorySnapshotStore::default();
        let foo = FilesystemId::from("foo");
        let oops = FilesystemId::from("foo-oops");
        chain(&store, &foo, &["A", "B", "C", "D"]).await;
        store.mount(&foo).await.unwrap();
        let mounts_before = store.list_mounts().await.unwrap();

        stash_branch(&store, &foo, &oops, &SnapshotId::from("C")).await.unwrap();

        let current = store.discover(&foo).await.unwrap();
        assert_eq!(ids(&current.snapshots), vec!["A", "B", "C"]);
        assert_eq!(current.origin, None);
        assert!(current.mounted);

        let stashed = store.discover(&oops).await.unwrap();
        assert_eq!(ids(&stashed.snapshots), vec!["A", "B", "C", "D"]);
        assert_eq!(
            stashed.origin,
            Some(Origin {
                filesystem_id: foo.clone(),
                snapshot_id: SnapshotId::from("C"),
            })
        );
        assert_eq!(store.own_snapshot_ids(&oops), vec![SnapshotId::from("D")]);

        assert_eq!(store.list_mounts().await.unwrap(), mounts_before);
    }

    #[tokio::test]
    async fn stash_surfaces_remount_failure() {
        let store = InMemorySnapshotStore::default();
        let foo = FilesystemId::from("foo");
        chain(&store, &foo, &["A", "B"]).await;
        store.mount(&foo).await.unwrap();

        store.inject_failure("mount");
        let err = stash_branch(&store, &foo, &FilesystemId::from("foo-stash"), &SnapshotId::from("A"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CommandFailed { ref command, .. } if command == "mount"));
        assert!(store.list_mounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stash_of_unmounted_filesystem_mounts_nothing() {
        let store = InMemorySnapshotStore::default();
        let foo = FilesystemId::from("foo");
        chain(&store, &foo, &["A", "B"]).await;

        let restored = stash_branch(&store, &foo, &FilesystemId::from("side"), &SnapshotId::from("A"))
            .await
            .unwrap();
        assert!(restored.is_empty());
        assert_eq!(ids(&store.discover(&foo).await.unwrap().snapshots), vec!["A"]);
    }
}
