//! Replication job descriptions and their poll-able progress records.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::types::FilesystemId;
use crate::types::NodeId;
use crate::types::SnapshotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Local history is sent to the peer.
    Push,
    /// The peer's history is fetched into the local filesystem.
    Pull,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Push => f.write_str("push"),
            TransferDirection::Pull => f.write_str("pull"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Queued,
    Starting,
    Running,
    Finished,
    Error,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Finished | TransferStatus::Error)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Queued => "queued",
            TransferStatus::Starting => "starting",
            TransferStatus::Running => "running",
            TransferStatus::Finished => "finished",
            TransferStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A request to replicate one filesystem to or from a peer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub peer: NodeId,
    pub user: String,
    pub api_key: String,
    pub direction: TransferDirection,
    pub local_namespace: String,
    pub local_name: String,
    pub local_branch_name: String,
    pub remote_namespace: String,
    pub remote_name: String,
    pub remote_branch_name: String,
    /// Stop at this commit instead of the peer's latest.
    pub target_commit: Option<SnapshotId>,
    /// On a diverged pull, move local-only history aside to a new branch.
    #[serde(default)]
    pub stash_divergence: bool,
}

// The api key must never end up in logs.
impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("peer", &self.peer)
            .field("user", &self.user)
            .field("api_key", &"<redacted>")
            .field("direction", &self.direction)
            .field("local", &format_args!("{}/{}@{}", self.local_namespace, self.local_name, self.local_branch_name))
            .field(
                "remote",
                &format_args!("{}/{}@{}", self.remote_namespace, self.remote_name, self.remote_branch_name),
            )
            .field("target_commit", &self.target_commit)
            .field("stash_divergence", &self.stash_divergence)
            .finish()
    }
}

impl fmt::Display for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}@{} <-> {}:{}/{}@{} (user {}, api key <redacted>)",
            self.direction,
            self.local_namespace,
            self.local_name,
            self.local_branch_name,
            self.peer,
            self.remote_namespace,
            self.remote_name,
            self.remote_branch_name,
            self.user
        )
    }
}

/// Progress of one replication job.
///
/// Written only by the fsMachine driving the job; everyone else reads a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPollResult {
    pub transfer_request_id: String,
    pub peer: NodeId,
    pub user: String,
    pub direction: TransferDirection,
    pub local_namespace: String,
    pub local_name: String,
    pub local_branch_name: String,
    pub remote_namespace: String,
    pub remote_name: String,
    pub remote_branch_name: String,
    pub filesystem_id: FilesystemId,
    pub initiator_node_id: NodeId,
    pub peer_node_id: NodeId,
    pub starting_commit: Option<SnapshotId>,
    pub target_commit: Option<SnapshotId>,
    /// Segment currently being sent, 1-based; 0 before the first segment.
    pub index: u32,
    pub total: u32,
    pub status: TransferStatus,
    pub nanoseconds_elapsed: u64,
    /// Bytes in the current segment.
    pub size: u64,
    /// Bytes sent so far across all segments.
    pub sent: u64,
    pub message: String,
}

impl TransferPollResult {
    /// Fresh record for a job that has not started moving data yet.
    pub fn queued(
        transfer_request_id: impl Into<String>,
        request: &TransferRequest,
        filesystem_id: FilesystemId,
        initiator_node_id: NodeId,
    ) -> Self {
        Self {
            transfer_request_id: transfer_request_id.into(),
            peer: request.peer.clone(),
            user: request.user.clone(),
            direction: request.direction,
            local_namespace: request.local_namespace.clone(),
            local_name: request.local_name.clone(),
            local_branch_name: request.local_branch_name.clone(),
            remote_namespace: request.remote_namespace.clone(),
            remote_name: request.remote_name.clone(),
            remote_branch_name: request.remote_branch_name.clone(),
            filesystem_id,
            initiator_node_id,
            peer_node_id: request.peer.clone(),
            starting_commit: None,
            target_commit: request.target_commit.clone(),
            index: 0,
            total: 0,
            status: TransferStatus::Queued,
            nanoseconds_elapsed: 0,
            size: 0,
            sent: 0,
            message: String::new(),
        }
    }
}
