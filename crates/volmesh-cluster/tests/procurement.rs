//! Creation and procurement across nodes.

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
use volmesh_cluster::RoutedRequest;
use volmesh_core::FilesystemId;
use volmesh_core::KeyValueStore;
use volmesh_core::NodeId;
use volmesh_core::ReadRequest;
use volmesh_core::RegistryEntry;
use volmesh_core::ScanRequest;
use volmesh_core::SnapshotStore;
use volmesh_core::VolumeName;
use volmesh_core::WriteRequest;
use volmesh_fsm::MachineState;
use volmesh_fsm::Request;
use volmesh_fsm::Response;
use volmesh_registry::KeyKind;

#[tokio::test]
async fn test_procure_creates_missing_volume_on_this_node() {
    let cluster = TestCluster::start(1).await;
    let n1 = cluster.node(1);

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();

    assert_eq!(n1.registry().current_master_node(&id).await.unwrap(), node_id(1));
    assert_eq!(n1.machine(&id).unwrap().state(), MachineState::Active);
    assert!(cluster.store(1).discover(&id).await.unwrap().mounted);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_procure_moves_master_and_history_to_requester() {
    let cluster = TestCluster::start(2).await;
    let (n1, n2) = (cluster.node(1), cluster.node(2));

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    let first = commit(n1, &notebook(), "first").await;
    let second = commit(n1, &notebook(), "second").await;

    let procured = n2.procure_filesystem(&alice(), &notebook()).await.unwrap();
    assert_eq!(procured, id);
    assert_eq!(n2.registry().current_master_node(&id).await.unwrap(), node_id(2));
    assert_eq!(n2.machine(&id).unwrap().state(), MachineState::Active);

    let held: Vec<_> = n2.local_snapshots(&id).await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(held, vec![first, second]);

    // The old master steps down and unmounts its copy.
    n1.machine(&id)
        .unwrap()
        .wait_for_state(MachineState::Inactive, TEST_TIMEOUT)
        .await
        .unwrap();
    assert!(!cluster.store(1).discover(&id).await.unwrap().mounted);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_procure_back_and_forth_keeps_new_commits() {
    let cluster = TestCluster::start(2).await;
    let (n1, n2) = (cluster.node(1), cluster.node(2));

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    commit(n1, &notebook(), "on node-1").await;
    n2.procure_filesystem(&alice(), &notebook()).await.unwrap();
    let later = commit(n2, &notebook(), "on node-2").await;

    n1.procure_filesystem(&alice(), &notebook()).await.unwrap();

    assert_eq!(n1.registry().current_master_node(&id).await.unwrap(), node_id(1));
    let held: Vec<_> = n1.local_snapshots(&id).await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(held.last(), Some(&later));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_procure_on_current_master_is_idempotent() {
    let cluster = TestCluster::start(1).await;
    let n1 = cluster.node(1);

    let first = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    let again = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();

    assert_eq!(first, again);
    assert_eq!(n1.registry().filesystem_ids_including_clones(), vec![first.clone()]);
    assert_eq!(n1.machine(&first).unwrap().state(), MachineState::Active);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_procure_without_access_is_refused_and_not_retried() {
    let cluster = TestCluster::start(2).await;
    cluster.node(1).procure_filesystem(&alice(), &notebook()).await.unwrap();

    let err = cluster.node(2).procure_filesystem(&bob(), &notebook()).await.unwrap_err();
    assert!(matches!(err, ClusterError::PermissionDenied { .. }), "got {err}");
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_create_has_exactly_one_winner() {
    let cluster = TestCluster::start(2).await;
    let (n1, n2) = (cluster.node(1), cluster.node(2));
    let name: VolumeName = "alice/notebook".parse().unwrap();

    let principal = alice();

    let (a, b) = tokio::join!(n1.create_filesystem(&principal, &name), n2.create_filesystem(&principal, &name));

    let (winner, id, loser) = match (a, b) {
        (Ok(id), Err(e)) => (node_id(1), id, e),
        (Err(e), Ok(id)) => (node_id(2), id, e),
        (a, b) => panic!("expected exactly one winner, got {a:?} and {b:?}"),
    };
    assert!(
        matches!(loser, ClusterError::AlreadyExists { .. } | ClusterError::CasConflict { .. }),
        "loser failed with {loser}"
    );
    assert_eq!(n1.registry().current_master_node(&id).await.unwrap(), winner);
    assert_eq!(n1.registry().lookup_entry(&name).await.unwrap().unwrap().id, id);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_create_resumes_after_crash_between_register_and_claim() {
    let cluster = TestCluster::start(1).await;
    let n1 = cluster.node(1);
    let name: VolumeName = "alice/notebook".parse().unwrap();

    // Registered, but the creator died before claiming it.
    let orphan = FilesystemId::generate();
    n1.registry()
        .register_filesystem(&name, RegistryEntry::new(orphan.clone(), "alice"))
        .await
        .unwrap();

    let id = n1.create_filesystem(&alice(), &name).await.unwrap();
    assert_eq!(id, orphan);
    assert_eq!(n1.registry().current_master_node(&id).await.unwrap(), node_id(1));

    let err = n1.create_filesystem(&alice(), &name).await.unwrap_err();
    assert!(matches!(err, ClusterError::AlreadyExists { .. }), "got {err}");
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_procure_timeout_drains_late_response() {
    let cluster = TestCluster::start_with(1, |config| {
        config.procure_timeout_ms = 200;
        config.procure_max_attempts = 1;
    })
    .await;
    let n1 = cluster.node(1);
    let keys = n1.registry().keys().clone();

    // Mastered by a node that never answers.
    let id = FilesystemId::generate();
    n1.registry()
        .register_filesystem(&notebook().name, RegistryEntry::new(id.clone(), "alice"))
        .await
        .unwrap();
    n1.registry().claim_master(&id, &NodeId::from("node-9")).await.unwrap();

    let err = n1.procure_filesystem(&alice(), &notebook()).await.unwrap_err();
    assert!(matches!(err, ClusterError::ProcurementTimeout { .. }), "got {err}");
    assert_eq!(n1.pending_remote_requests(), 1);

    let scan = cluster.kv.scan(ScanRequest::prefix(keys.requests_prefix())).await.unwrap();
    let request_id = scan
        .entries
        .iter()
        .find_map(|entry| match keys.parse(&entry.key) {
            Some(KeyKind::Request { request_id, .. }) => Some(request_id),
            _ => None,
        })
        .expect("routed move request recorded");

    let late = serde_json::to_string(&Response::Moved { target: node_id(1) }).unwrap();
    cluster.kv.write(WriteRequest::set(keys.response(&request_id), late)).await.unwrap();

    eventually("the late response to be drained", move || async move { n1.pending_remote_requests() == 0 }).await;
    let kv = &cluster.kv;
    let response_key = &keys.response(&request_id);
    eventually("the response record to be removed", move || async move {
        kv.read(ReadRequest::new(response_key.as_str())).await.unwrap().kv.is_none()
    })
    .await;
    // Left behind, the unanswered move would be served by the next master.
    let request_key = &keys.request(&id, &request_id);
    eventually("the request record to be removed", move || async move {
        kv.read(ReadRequest::new(request_key.as_str())).await.unwrap().kv.is_none()
    })
    .await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stale_routed_request_is_dropped_unserved() {
    let cluster = TestCluster::start(2).await;
    let n1 = cluster.node(1);
    let keys = n1.registry().keys().clone();
    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();

    let stale = RoutedRequest {
        from: node_id(2),
        request: Request::Move { target: node_id(2) },
        issued_at_ms: 1,
    };
    let request_key = keys.request(&id, "stale-move");
    cluster
        .kv
        .write(WriteRequest::set(&request_key, serde_json::to_string(&stale).unwrap()))
        .await
        .unwrap();

    let kv = &cluster.kv;
    let request_key = &request_key;
    eventually("the stale request to be dropped", move || async move {
        kv.read(ReadRequest::new(request_key.as_str())).await.unwrap().kv.is_none()
    })
    .await;
    assert!(kv.read(ReadRequest::new(keys.response("stale-move"))).await.unwrap().kv.is_none());
    assert_eq!(n1.registry().current_master_node(&id).await.unwrap(), node_id(1));
    assert_eq!(n1.machine(&id).unwrap().state(), MachineState::Active);
    cluster.shutdown().await;
}
