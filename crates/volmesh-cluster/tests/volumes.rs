//! Listing, branches, deletion and the advisory caches.

mod support;

use support::TEST_TIMEOUT;
use support::TestCluster;
use support::alice;
use support::bob;
use support::commit;
use support::eventually;
use support::node_id;
use support::notebook;
use volmesh_cluster::ClusterError;
use volmesh_core::ContainerInfo;
use volmesh_core::ContainerRef;
use volmesh_core::FilesystemId;
use volmesh_core::Principal;
use volmesh_core::RegistryEntry;
use volmesh_core::SnapshotId;
use volmesh_core::SnapshotStore;
use volmesh_core::VolumeRef;
use volmesh_fsm::ErrorKind;
use volmesh_fsm::MachineState;

fn diary() -> VolumeRef {
    VolumeRef::top_level("bob/diary".parse().unwrap())
}

#[tokio::test]
async fn test_list_volumes_filters_by_principal() {
    let cluster = TestCluster::start(2).await;
    let (n1, n2) = (cluster.node(1), cluster.node(2));

    let notebook_id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    commit(n1, &notebook(), "first").await;
    n2.procure_filesystem(&bob(), &diary()).await.unwrap();

    let admin = &Principal::admin();
    eventually("node-1 to learn about both volumes", move || async move {
        n1.list_volumes(admin).await.len() == 2
    })
    .await;

    let visible = n1.list_volumes(&alice()).await;
    assert_eq!(visible.len(), 1);
    let summary = &visible[0];
    assert_eq!(summary.id, notebook_id);
    assert_eq!(summary.name.to_string(), "alice/notebook");
    assert_eq!(summary.branch, "master");
    assert_eq!(summary.master, node_id(1));
    assert_eq!(summary.commit_count, 1);
    assert!(summary.server_statuses[&node_id(1)].starts_with("active"));

    let err = n1.get_volume(&bob(), &notebook_id).await.unwrap_err();
    assert!(matches!(err, ClusterError::PermissionDenied { .. }), "got {err}");
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_clone_branch_is_registered_mastered_and_active() {
    let cluster = TestCluster::start(1).await;
    let n1 = cluster.node(1);

    n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    let base = commit(n1, &notebook(), "base").await;

    let clone_id = n1.clone_branch(&alice(), &notebook(), &base, "experiment").await.unwrap();

    let branch = VolumeRef::branch(notebook().name, "experiment");
    let resolved = n1
        .registry()
        .maybe_clone_filesystem_id(&branch.name, branch.branch.as_deref())
        .await
        .unwrap();
    assert_eq!(resolved, clone_id);
    assert_eq!(n1.registry().current_master_node(&clone_id).await.unwrap(), node_id(1));
    n1.machine(&clone_id)
        .unwrap()
        .wait_for_state(MachineState::Active, TEST_TIMEOUT)
        .await
        .unwrap();

    let on_branch = commit(n1, &branch, "on the branch").await;
    let history: Vec<_> = n1.local_snapshots(&clone_id).await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(history, vec![base.clone(), on_branch]);

    let err = n1.clone_branch(&alice(), &notebook(), &base, "experiment").await.unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyExists { .. }), "got {err}");

    let branches: Vec<String> = n1.list_volumes(&alice()).await.into_iter().map(|v| v.branch).collect();
    assert_eq!(branches, vec!["experiment".to_string(), "master".to_string()]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stash_branch_keeps_later_history_on_new_branch() {
    let cluster = TestCluster::start(1).await;
    let n1 = cluster.node(1);

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    let kept = commit(n1, &notebook(), "kept").await;
    let stashed_commit = commit(n1, &notebook(), "stashed").await;

    let stashed = n1.stash_branch(&alice(), &notebook(), &kept, "old-work").await.unwrap();

    let remaining: Vec<_> = n1.local_snapshots(&id).await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(remaining, vec![kept]);
    let moved: Vec<_> = n1.local_snapshots(&stashed).await.unwrap().into_iter().map(|s| s.id).collect();
    assert!(moved.contains(&stashed_commit));
    assert_eq!(n1.registry().current_master_node(&stashed).await.unwrap(), node_id(1));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stash_onto_taken_branch_leaves_history_alone() {
    let cluster = TestCluster::start(1).await;
    let n1 = cluster.node(1);

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    let a = commit(n1, &notebook(), "a").await;
    let b = commit(n1, &notebook(), "b").await;
    n1.clone_branch(&alice(), &notebook(), &a, "taken").await.unwrap();

    let err = n1.stash_branch(&alice(), &notebook(), &a, "taken").await.unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyExists { .. }), "got {err}");

    let history: Vec<_> = n1.local_snapshots(&id).await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(history, vec![a, b]);
    let branches: Vec<String> = n1.registry().clones_of(&id).into_keys().collect();
    assert_eq!(branches, vec!["taken".to_string()]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_stash_releases_branch_name() {
    let cluster = TestCluster::start(1).await;
    let n1 = cluster.node(1);

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    let a = commit(n1, &notebook(), "a").await;

    let missing = SnapshotId::from("never-taken");
    n1.stash_branch(&alice(), &notebook(), &missing, "old-work").await.unwrap_err();
    assert!(n1.registry().clones_of(&id).is_empty());

    let history: Vec<_> = n1.local_snapshots(&id).await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(history, vec![a.clone()]);
    n1.stash_branch(&alice(), &notebook(), &a, "old-work").await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_delete_removes_volume_from_every_node() {
    let cluster = TestCluster::start(2).await;
    let (n1, n2) = (cluster.node(1), cluster.node(2));

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    commit(n1, &notebook(), "first").await;
    // node-2 becomes master, node-1 keeps a replica.
    n2.procure_filesystem(&alice(), &notebook()).await.unwrap();

    n1.delete_volume(&alice(), &notebook()).await.unwrap();

    assert!(n1.registry().lookup_entry(&notebook().name).await.unwrap().is_none());
    let id = &id;
    for (coordinator, store) in [(n1, cluster.store(1)), (n2, cluster.store(2))] {
        eventually("the filesystem to be forgotten", move || async move {
            coordinator.machine(id).is_none() && !store.discover(id).await.unwrap().exists
        })
        .await;
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_delete_is_owner_only_and_refuses_volumes_with_branches() {
    let cluster = TestCluster::start(1).await;
    let n1 = cluster.node(1);

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    n1.registry()
        .register_filesystem(
            &"bob/shared".parse().unwrap(),
            RegistryEntry {
                collaborator_ids: vec!["alice".into()],
                ..RegistryEntry::new(FilesystemId::generate(), "bob")
            },
        )
        .await
        .unwrap();
    let shared = VolumeRef::top_level("bob/shared".parse().unwrap());
    let err = n1.delete_volume(&alice(), &shared).await.unwrap_err();
    assert!(matches!(err, ClusterError::PermissionDenied { .. }), "got {err}");

    let base = commit(n1, &notebook(), "base").await;
    n1.clone_branch(&alice(), &notebook(), &base, "experiment").await.unwrap();
    let err = n1.delete_volume(&alice(), &notebook()).await.unwrap_err();
    assert!(
        matches!(
            err,
            ClusterError::Rejected {
                kind: ErrorKind::InvalidState,
                ..
            }
        ),
        "got {err}"
    );
    assert_eq!(n1.machine(&id).unwrap().state(), MachineState::Active);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_container_and_dirty_caches_reach_other_nodes() {
    let cluster = TestCluster::start(2).await;
    let (n1, n2) = (cluster.node(1), cluster.node(2));

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    let containers = vec![ContainerRef {
        id: "c-1".into(),
        name: "jupyter".into(),
    }];
    cluster.inventory(1).set(id.clone(), containers.clone());
    n1.notify_containers_changed();
    cluster.store(1).write_data(&id, b"scratch").await.unwrap();

    let expected = ContainerInfo {
        server: node_id(1),
        containers,
    };
    let (id, expected) = (&id, &expected);
    eventually("container usage on node-2", move || async move {
        n2.containers_for(id).as_ref() == Some(expected)
    })
    .await;
    eventually("dirty bytes on node-2", move || async move {
        n2.dirty_info(id).is_some_and(|dirty| dirty.server == node_id(1) && dirty.dirty_bytes == 7)
    })
    .await;

    // An unavailable inventory leaves the last record in place.
    cluster.inventory(1).set_unavailable(Some("runtime restarting".into()));
    n1.notify_containers_changed();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(n2.containers_for(id).as_ref(), Some(expected));
    cluster.shutdown().await;
}
