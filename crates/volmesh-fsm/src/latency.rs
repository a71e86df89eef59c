//! Replication lag across the nodes that hold a filesystem.

use std::collections::BTreeMap;
use std::collections::HashSet;

use volmesh_core::NodeId;
use volmesh_core::Snapshot;
use volmesh_core::SnapshotId;

/// Snapshot history each node reports for one filesystem, oldest first.
pub type PeerView = BTreeMap<NodeId, Vec<Snapshot>>;

/// For every node in `view`, the snapshots some other node has and it lacks.
///
/// Snapshots are listed in the order they first appear when walking the
/// nodes in id order. A node that is fully caught up maps to an empty list.
pub fn replication_latency(view: &PeerView) -> BTreeMap<NodeId, Vec<SnapshotId>> {
    let mut seen = HashSet::new();
    let mut all: Vec<&SnapshotId> = Vec::new();
    for snapshots in view.values() {
        for snapshot in snapshots {
            if seen.insert(&snapshot.id) {
                all.push(&snapshot.id);
            }
        }
    }

    view.iter()
        .map(|(node, snapshots)| {
            let have: HashSet<&SnapshotId> = snapshots.iter().map(|s| &s.id).collect();
            let missing = all.iter().filter(|id| !have.contains(*id)).map(|id| (*id).clone()).collect();
            (node.clone(), missing)
        })
        .collect()
}

/// Last snapshot shared by both histories when compared position by position.
pub fn last_common_snapshot(a: &[Snapshot], b: &[Snapshot]) -> Option<SnapshotId> {
    let shared = shared_prefix_len(a, b);
    shared.checked_sub(1).map(|i| a[i].id.clone())
}

/// Where an incremental send from a node holding `source` to one holding
/// `dest` starts.
///
/// `Ok(None)` means `dest` is empty and needs the full history. `Err`
/// carries the last common snapshot when `dest` holds history `source`
/// lacks; such a receiver cannot take an incremental stream.
pub fn send_base(source: &[Snapshot], dest: &[Snapshot]) -> Result<Option<SnapshotId>, Option<SnapshotId>> {
    let common = last_common_snapshot(source, dest);
    if shared_prefix_len(source, dest) == dest.len() {
        Ok(common)
    } else {
        Err(common)
    }
}

fn shared_prefix_len(a: &[Snapshot], b: &[Snapshot]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x.id == y.id).count()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn history(ids: &[&str]) -> Vec<Snapshot> {
        ids.iter().map(|id| Snapshot::new(*id)).collect()
    }

    #[test]
    fn lagging_replica_lists_missing_commits() {
        let mut view = PeerView::new();
        view.insert(NodeId::from("node-1"), history(&["A", "B", "C"]));
        view.insert(NodeId::from("node-2"), history(&["A"]));

        let latency = replication_latency(&view);
        assert!(latency[&NodeId::from("node-1")].is_empty());
        assert_eq!(latency[&NodeId::from("node-2")], vec![SnapshotId::from("B"), SnapshotId::from("C")]);
    }

    #[test]
    fn send_base_distinguishes_prefix_from_divergence() {
        let local = history(&["A", "B", "C"]);
        assert_eq!(send_base(&local, &[]), Ok(None));
        assert_eq!(send_base(&local, &history(&["A", "B"])), Ok(Some(SnapshotId::from("B"))));
        assert_eq!(send_base(&local, &history(&["A", "X"])), Err(Some(SnapshotId::from("A"))));
        assert_eq!(send_base(&local, &history(&["X"])), Err(None));
    }

    fn arb_view() -> impl Strategy<Value = PeerView> {
        prop::collection::btree_map(
            "node-[0-4]",
            prop::collection::btree_set("[a-f]", 0..6),
            0..5,
        )
        .prop_map(|nodes| {
            nodes
                .into_iter()
                .map(|(node, ids)| (NodeId::from(node), ids.into_iter().map(Snapshot::new).collect()))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn missing_and_held_partition_the_union(view in arb_view()) {
            let union: HashSet<SnapshotId> =
                view.values().flat_map(|s| s.iter().map(|s| s.id.clone())).collect();
            let latency = replication_latency(&view);
            prop_assert_eq!(latency.len(), view.len());

            for (node, snapshots) in &view {
                let held: HashSet<SnapshotId> = snapshots.iter().map(|s| s.id.clone()).collect();
                let missing: HashSet<SnapshotId> = latency[node].iter().cloned().collect();
                prop_assert_eq!(missing.len(), latency[node].len());
                prop_assert!(missing.is_disjoint(&held));
                let combined: HashSet<SnapshotId> = missing.union(&held).cloned().collect();
                prop_assert_eq!(&combined, &union);
            }
        }
    }
}
