//! Peer transport between coordinators in one process.
//!
//! Used by the node binary's single-process cluster and by the integration
//! tests. Coordinators are held weakly so a dropped node reads as
//! unreachable instead of being kept alive by its peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;
use volmesh_core::FilesystemId;
use volmesh_core::NodeId;
use volmesh_core::Snapshot;
use volmesh_core::SnapshotId;
use volmesh_core::SnapshotStream;
use volmesh_fsm::PeerTransport;
use volmesh_fsm::TransportError;

use crate::coordinator::Coordinator;
use crate::error::ClusterError;

#[derive(Default)]
pub struct InProcessTransport {
    peers: RwLock<HashMap<NodeId, Weak<Coordinator>>>,
}

impl InProcessTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `coordinator` reachable as `node`.
    pub fn register(&self, node: NodeId, coordinator: &Arc<Coordinator>) {
        debug!(node_id = %node, "peer registered with in-process transport");
        self.peers.write().insert(node, Arc::downgrade(coordinator));
    }

    pub fn unregister(&self, node: &NodeId) {
        self.peers.write().remove(node);
    }

    fn peer(&self, node: &NodeId) -> Result<Arc<Coordinator>, TransportError> {
        self.peers
            .read()
            .get(node)
            .and_then(Weak::upgrade)
            .filter(|coordinator| !coordinator.is_shutting_down())
            .ok_or_else(|| TransportError::Unreachable { peer: node.to_string() })
    }
}

fn rejected(peer: &NodeId, error: ClusterError) -> TransportError {
    TransportError::Rejected {
        peer: peer.to_string(),
        reason: error.to_string(),
    }
}

#[async_trait]
impl PeerTransport for InProcessTransport {
    async fn push(&self, peer: &NodeId, stream: SnapshotStream) -> Result<(), TransportError> {
        let coordinator = self.peer(peer)?;
        coordinator.receive_snapshots(stream).await.map_err(|e| rejected(peer, e))
    }

    async fn snapshots(&self, peer: &NodeId, filesystem_id: &FilesystemId) -> Result<Vec<Snapshot>, TransportError> {
        let coordinator = self.peer(peer)?;
        coordinator.local_snapshots(filesystem_id).await.map_err(|e| rejected(peer, e))
    }

    async fn fetch(
        &self,
        peer: &NodeId,
        filesystem_id: &FilesystemId,
        from: Option<SnapshotId>,
        to: Option<SnapshotId>,
    ) -> Result<SnapshotStream, TransportError> {
        let coordinator = self.peer(peer)?;
        coordinator
            .serve_snapshots(filesystem_id, from.as_ref(), to.as_ref())
            .await
            .map_err(|e| rejected(peer, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let transport = InProcessTransport::new();
        let err = transport.snapshots(&NodeId::from("node-9"), &FilesystemId::from("fs")).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Unreachable {
                peer: "node-9".into()
            }
        );
    }
}
