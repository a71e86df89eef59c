//! Requests accepted by a filesystem machine and the responses it emits.
//!
//! Both sides are serializable so a request can be routed through the
//! coordination store to whichever node currently masters the filesystem.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use volmesh_core::FilesystemId;
use volmesh_core::NodeId;
use volmesh_core::SnapshotId;
use volmesh_core::SnapshotStream;
use volmesh_core::TransferRequest;

/// Generate a fresh request id.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum Request {
    /// Create the filesystem locally and mount it.
    Create,
    Snapshot {
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    },
    /// Clone `snapshot_id` into a new writable filesystem.
    Clone {
        snapshot_id: SnapshotId,
        new_filesystem_id: FilesystemId,
    },
    Rollback {
        snapshot_id: SnapshotId,
    },
    /// Move history after `rollback_to` aside into `new_filesystem_id`.
    Stash {
        new_filesystem_id: FilesystemId,
        rollback_to: SnapshotId,
    },
    /// Hand mastership to `target`, pushing whatever it is missing first.
    Move {
        target: NodeId,
    },
    /// Become active after mastership was assigned here.
    Activate,
    /// Step down after mastership moved elsewhere.
    Deactivate,
    Receive {
        stream: SnapshotStream,
    },
    Transfer {
        transfer_id: String,
        request: TransferRequest,
        /// Node that asked for the transfer.
        initiator: NodeId,
    },
    Mount,
    Unmount,
    PollDirty,
    Discover,
    Delete,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Create => "create",
            Request::Snapshot { .. } => "snapshot",
            Request::Clone { .. } => "clone",
            Request::Rollback { .. } => "rollback",
            Request::Stash { .. } => "stash",
            Request::Move { .. } => "move",
            Request::Activate => "activate",
            Request::Deactivate => "deactivate",
            Request::Receive { .. } => "receive",
            Request::Transfer { .. } => "transfer",
            Request::Mount => "mount",
            Request::Unmount => "unmount",
            Request::PollDirty => "poll-dirty",
            Request::Discover => "discover",
            Request::Delete => "delete",
        }
    }
}

/// Coarse classification of a failed request, stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The request is not accepted in the machine's current state.
    InvalidState,
    /// A snapshot-store command failed.
    StoreCommandFailed,
    /// A master-assignment compare-and-swap lost.
    CasConflict,
    /// This node does not master the filesystem.
    NotMaster,
    AlreadyExists,
    Diverged,
    Transport,
    Registry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum Response {
    Created,
    Snapshotted {
        snapshot_id: SnapshotId,
    },
    Cloned {
        filesystem_id: FilesystemId,
    },
    RolledBack,
    Stashed {
        new_filesystem_id: FilesystemId,
    },
    Moved {
        target: NodeId,
    },
    Activated,
    Deactivated,
    Received {
        latest: Option<SnapshotId>,
    },
    Transferred {
        transfer_id: String,
        /// Set when a diverged pull stashed local history on a new branch.
        stashed: Option<FilesystemId>,
    },
    Mounted {
        mountpoint: String,
    },
    Unmounted,
    Dirty {
        dirty_bytes: u64,
        size_bytes: u64,
    },
    Discovered {
        exists: bool,
        mounted: bool,
        snapshot_count: usize,
    },
    Deleted,
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Created => "created",
            Response::Snapshotted { .. } => "snapshotted",
            Response::Cloned { .. } => "cloned",
            Response::RolledBack => "rolled-back",
            Response::Stashed { .. } => "stashed",
            Response::Moved { .. } => "moved",
            Response::Activated => "activated",
            Response::Deactivated => "deactivated",
            Response::Received { .. } => "received",
            Response::Transferred { .. } => "transferred",
            Response::Mounted { .. } => "mounted",
            Response::Unmounted => "unmounted",
            Response::Dirty { .. } => "dirty",
            Response::Discovered { .. } => "discovered",
            Response::Deleted => "deleted",
            Response::Error { .. } => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_by_name_on_the_wire() {
        let request = Request::Move {
            target: NodeId::from("node-2"),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["name"], request.name());
        assert_eq!(serde_json::from_value::<Request>(value).unwrap(), request);
    }

    #[test]
    fn error_responses_keep_their_kind() {
        let response = Response::Error {
            kind: ErrorKind::InvalidState,
            message: "cannot snapshot while inactive".into(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"invalid-state\""));
        assert!(serde_json::from_str::<Response>(&json).unwrap().is_error());
    }
}
