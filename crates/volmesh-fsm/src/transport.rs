//! Moving snapshot streams between nodes.

use async_trait::async_trait;
use snafu::Snafu;
use volmesh_core::FilesystemId;
use volmesh_core::NodeId;
use volmesh_core::Snapshot;
use volmesh_core::SnapshotId;
use volmesh_core::SnapshotStream;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("peer {peer} is unreachable"))]
    Unreachable { peer: String },

    #[snafu(display("peer {peer} rejected the stream: {reason}"))]
    Rejected { peer: String, reason: String },
}

/// Data plane between machines on different nodes.
///
/// The control plane (who masters what, request routing) goes through the
/// coordination store; only snapshot data crosses this interface.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Deliver `stream` to `peer`, which applies it to its own copy.
    async fn push(&self, peer: &NodeId, stream: SnapshotStream) -> Result<(), TransportError>;

    /// Snapshot history `peer` holds for `filesystem_id`; empty if none.
    async fn snapshots(&self, peer: &NodeId, filesystem_id: &FilesystemId) -> Result<Vec<Snapshot>, TransportError>;

    /// Ask `peer` for the history of `filesystem_id` after `from`, up to and
    /// including `to` (`None` = its latest).
    async fn fetch(
        &self,
        peer: &NodeId,
        filesystem_id: &FilesystemId,
        from: Option<SnapshotId>,
        to: Option<SnapshotId>,
    ) -> Result<SnapshotStream, TransportError>;
}
