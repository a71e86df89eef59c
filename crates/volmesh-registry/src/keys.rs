//! Coordination-store keyspace.
//!
//! Pure functions: building a key and parsing it back never touch the store.
//!
//! ```text
//! <prefix>/registry/filesystems/<namespace>/<name>   RegistryEntry
//! <prefix>/registry/clones/<topLevelId>/<branch>     CloneInfo
//! <prefix>/filesystems/masters/<id>                  NodeId (CAS-guarded)
//! <prefix>/filesystems/containers/<id>               ContainerInfo
//! <prefix>/filesystems/dirty/<id>                    DirtyInfo
//! <prefix>/filesystems/requests/<id>/<requestId>     routed request
//! <prefix>/filesystems/responses/<requestId>         routed response
//! <prefix>/filesystems/transfers/<transferId>        TransferPollResult
//! <prefix>/servers/addresses/<node>                  Vec<String>
//! <prefix>/servers/snapshots/<node>/<id>             Vec<Snapshot>
//! <prefix>/servers/states/<node>/<id>                StateReport
//! ```

use volmesh_core::FilesystemId;
use volmesh_core::NodeId;
use volmesh_core::VolumeName;

/// What a key under the volmesh prefix refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Filesystem(VolumeName),
    Clone { top_level_id: FilesystemId, branch: String },
    Master(FilesystemId),
    Containers(FilesystemId),
    Dirty(FilesystemId),
    Request { filesystem_id: FilesystemId, request_id: String },
    Response { request_id: String },
    Transfer { transfer_id: String },
    Addresses(NodeId),
    Snapshots { node_id: NodeId, filesystem_id: FilesystemId },
    State { node_id: NodeId, filesystem_id: FilesystemId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Prefix covering every volmesh key, with a trailing slash.
    pub fn root(&self) -> String {
        format!("{}/", self.prefix)
    }

    pub fn filesystems_prefix(&self) -> String {
        format!("{}/registry/filesystems/", self.prefix)
    }

    pub fn filesystem(&self, name: &VolumeName) -> String {
        format!("{}{}/{}", self.filesystems_prefix(), name.namespace, name.name)
    }

    pub fn clones_prefix(&self) -> String {
        format!("{}/registry/clones/", self.prefix)
    }

    pub fn clone_key(&self, top_level_id: &FilesystemId, branch: &str) -> String {
        format!("{}{}/{}", self.clones_prefix(), top_level_id, branch)
    }

    pub fn masters_prefix(&self) -> String {
        format!("{}/filesystems/masters/", self.prefix)
    }

    pub fn master(&self, id: &FilesystemId) -> String {
        format!("{}{}", self.masters_prefix(), id)
    }

    pub fn containers_prefix(&self) -> String {
        format!("{}/filesystems/containers/", self.prefix)
    }

    pub fn containers(&self, id: &FilesystemId) -> String {
        format!("{}{}", self.containers_prefix(), id)
    }

    pub fn dirty_prefix(&self) -> String {
        format!("{}/filesystems/dirty/", self.prefix)
    }

    pub fn dirty(&self, id: &FilesystemId) -> String {
        format!("{}{}", self.dirty_prefix(), id)
    }

    pub fn requests_prefix(&self) -> String {
        format!("{}/filesystems/requests/", self.prefix)
    }

    pub fn request(&self, id: &FilesystemId, request_id: &str) -> String {
        format!("{}{}/{}", self.requests_prefix(), id, request_id)
    }

    pub fn responses_prefix(&self) -> String {
        format!("{}/filesystems/responses/", self.prefix)
    }

    pub fn response(&self, request_id: &str) -> String {
        format!("{}{}", self.responses_prefix(), request_id)
    }

    pub fn transfers_prefix(&self) -> String {
        format!("{}/filesystems/transfers/", self.prefix)
    }

    pub fn transfer(&self, transfer_id: &str) -> String {
        format!("{}{}", self.transfers_prefix(), transfer_id)
    }

    pub fn addresses_prefix(&self) -> String {
        format!("{}/servers/addresses/", self.prefix)
    }

    pub fn addresses(&self, node: &NodeId) -> String {
        format!("{}{}", self.addresses_prefix(), node)
    }

    pub fn snapshots_prefix(&self) -> String {
        format!("{}/servers/snapshots/", self.prefix)
    }

    pub fn snapshots(&self, node: &NodeId, id: &FilesystemId) -> String {
        format!("{}{}/{}", self.snapshots_prefix(), node, id)
    }

    pub fn states_prefix(&self) -> String {
        format!("{}/servers/states/", self.prefix)
    }

    pub fn state(&self, node: &NodeId, id: &FilesystemId) -> String {
        format!("{}{}/{}", self.states_prefix(), node, id)
    }

    /// Classify a key. `None` for keys outside the volmesh layout.
    pub fn parse(&self, key: &str) -> Option<KeyKind> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        let kind = match parts.as_slice() {
            ["registry", "filesystems", namespace, name] => {
                KeyKind::Filesystem(VolumeName::new(*namespace, *name).ok()?)
            }
            ["registry", "clones", top, branch] => KeyKind::Clone {
                top_level_id: FilesystemId::from(*top),
                branch: branch.to_string(),
            },
            ["filesystems", "masters", id] => KeyKind::Master(FilesystemId::from(*id)),
            ["filesystems", "containers", id] => KeyKind::Containers(FilesystemId::from(*id)),
            ["filesystems", "dirty", id] => KeyKind::Dirty(FilesystemId::from(*id)),
            ["filesystems", "requests", id, request_id] => KeyKind::Request {
                filesystem_id: FilesystemId::from(*id),
                request_id: request_id.to_string(),
            },
            ["filesystems", "responses", request_id] => KeyKind::Response {
                request_id: request_id.to_string(),
            },
            ["filesystems", "transfers", transfer_id] => KeyKind::Transfer {
                transfer_id: transfer_id.to_string(),
            },
            ["servers", "addresses", node] => KeyKind::Addresses(NodeId::from(*node)),
            ["servers", "snapshots", node, id] => KeyKind::Snapshots {
                node_id: NodeId::from(*node),
                filesystem_id: FilesystemId::from(*id),
            },
            ["servers", "states", node, id] => KeyKind::State {
                node_id: NodeId::from(*node),
                filesystem_id: FilesystemId::from(*id),
            },
            _ => return None,
        };
        Some(kind)
    }
}
