//! Replication latency, catch-up and transfers between nodes.

mod support;

use std::time::Duration;

use support::TEST_TIMEOUT;
use support::TestCluster;
use support::alice;
use support::commit;
use support::eventually;
use support::node_id;
use support::notebook;
use volmesh_cluster::ClusterError;
use volmesh_core::SnapshotId;
use volmesh_core::TransferDirection;
use volmesh_core::TransferRequest;
use volmesh_core::TransferStatus;
use volmesh_fsm::MachineState;

fn push_to(peer: usize) -> TransferRequest {
    TransferRequest {
        peer: node_id(peer),
        user: "alice".into(),
        api_key: "secret".into(),
        direction: TransferDirection::Push,
        local_namespace: "alice".into(),
        local_name: "notebook".into(),
        local_branch_name: "master".into(),
        remote_namespace: "alice".into(),
        remote_name: "notebook".into(),
        remote_branch_name: "master".into(),
        target_commit: None,
        stash_divergence: false,
    }
}

#[tokio::test]
async fn test_latency_reports_replica_missing_new_commit_until_caught_up() {
    let cluster = TestCluster::start(2).await;
    let (n1, n2) = (cluster.node(1), cluster.node(2));

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    commit(n1, &notebook(), "A").await;
    n2.procure_filesystem(&alice(), &notebook()).await.unwrap();
    let b = commit(n2, &notebook(), "B").await;

    let id = &id;
    let lagging = &b;
    for coordinator in [n1, n2] {
        eventually("node-1 to show as lagging by B", move || async move {
            let latency = coordinator.replication_latency(id);
            latency.get(&node_id(1)) == Some(&vec![lagging.clone()])
                && latency.get(&node_id(2)).is_some_and(Vec::is_empty)
        })
        .await;
    }

    n1.catch_up(id).await.unwrap();
    assert_eq!(n1.machine(id).unwrap().state(), MachineState::Inactive);
    for coordinator in [n1, n2] {
        eventually("every node to be caught up", move || async move {
            let latency = coordinator.replication_latency(id);
            latency.len() == 2 && latency.values().all(Vec::is_empty)
        })
        .await;
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_catch_up_on_master_is_a_no_op() {
    let cluster = TestCluster::start(1).await;
    let n1 = cluster.node(1);

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    n1.catch_up(&id).await.unwrap();
    assert_eq!(n1.machine(&id).unwrap().state(), MachineState::Active);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_wait_for_master_commit_sees_remote_commit() {
    let cluster = TestCluster::start(2).await;
    let (n1, n2) = (cluster.node(1), cluster.node(2));

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    let id = &id;
    eventually("node-2 to learn the master", move || async move {
        n2.registry().current_master_node(id).await.is_ok_and(|master| master == node_id(1))
    })
    .await;

    let expected = SnapshotId::from("not-yet-taken");
    let err = n2
        .wait_for_master_commit(id, &expected, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Timeout { .. }), "got {err}");

    let taken = commit(n1, &notebook(), "A").await;
    n2.wait_for_master_commit(id, &taken, TEST_TIMEOUT).await.unwrap();
    let on_master: Vec<_> = n2.snapshots_for_current_master(id).await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(on_master, vec![taken]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_push_transfer_is_tracked_on_both_nodes() {
    let cluster = TestCluster::start(2).await;
    let (n1, n2) = (cluster.node(1), cluster.node(2));

    let id = n1.procure_filesystem(&alice(), &notebook()).await.unwrap();
    let a = commit(n1, &notebook(), "A").await;

    let transfer_id = n1.start_transfer(&alice(), push_to(2)).await.unwrap();
    let transfer_id = transfer_id.as_str();

    eventually("the push to finish on node-1", move || async move {
        n1.poll_transfer(transfer_id)
            .await
            .is_ok_and(|poll| poll.status == TransferStatus::Finished)
    })
    .await;
    let poll = n1.poll_transfer(transfer_id).await.unwrap();
    assert_eq!(poll.filesystem_id, id);
    assert_eq!(poll.initiator_node_id, node_id(1));
    assert_eq!(poll.total, 1);

    eventually("node-2 to see the finished transfer", move || async move {
        n2.poll_transfer(transfer_id)
            .await
            .is_ok_and(|poll| poll.status == TransferStatus::Finished)
    })
    .await;

    let held: Vec<_> = n2.local_snapshots(&id).await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(held, vec![a]);
    assert_eq!(n1.registry().current_master_node(&id).await.unwrap(), node_id(1));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_poll_unknown_transfer_is_not_found() {
    let cluster = TestCluster::start(1).await;

    let err = cluster.node(1).poll_transfer("no-such-transfer").await.unwrap_err();
    assert!(matches!(err, ClusterError::NotFound { .. }), "got {err}");
    cluster.shutdown().await;
}
