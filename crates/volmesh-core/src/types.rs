//! Domain types shared across the cluster.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::ADMIN_USER_ID;
use crate::constants::DEFAULT_BRANCH;
use crate::constants::DEFAULT_NAMESPACE;
use crate::error::NameError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Opaque identifier of one independently mastered filesystem.
    ///
    /// Immutable once assigned.
    FilesystemId
);

string_id!(
    /// Identifier of a cluster node.
    NodeId
);

string_id!(
    /// Identifier of a snapshot ("commit") within a filesystem's history.
    SnapshotId
);

impl FilesystemId {
    /// Allocate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl SnapshotId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// User-chosen `(namespace, name)` pair for a volume.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeName {
    pub namespace: String,
    pub name: String,
}

fn check_component(input: &str, component: &str, what: &str) -> Result<(), NameError> {
    if component.is_empty() {
        return Err(NameError::InvalidVolumeName {
            input: input.to_string(),
            reason: format!("{what} must not be empty"),
        });
    }
    if component.contains(['/', '@']) || component.chars().any(char::is_whitespace) {
        return Err(NameError::InvalidVolumeName {
            input: input.to_string(),
            reason: format!("{what} must not contain '/', '@' or whitespace"),
        });
    }
    Ok(())
}

impl VolumeName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, NameError> {
        let namespace = namespace.into();
        let name = name.into();
        let input = format!("{namespace}/{name}");
        check_component(&input, &namespace, "namespace")?;
        check_component(&input, &name, "name")?;
        Ok(Self { namespace, name })
    }
}

impl FromStr for VolumeName {
    type Err = NameError;

    /// Parses `namespace/name`, or a bare `name` in the default namespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name)) => {
                check_component(s, namespace, "namespace")?;
                check_component(s, name, "name")?;
                Ok(Self {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            None => {
                check_component(s, s, "name")?;
                Ok(Self {
                    namespace: DEFAULT_NAMESPACE.to_string(),
                    name: s.to_string(),
                })
            }
        }
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A volume name plus an optional branch.
///
/// `None` means the top-level filesystem. The branch spelled `master` is
/// normalised to `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeRef {
    pub name: VolumeName,
    pub branch: Option<String>,
}

impl VolumeRef {
    pub fn top_level(name: VolumeName) -> Self {
        Self { name, branch: None }
    }

    pub fn branch(name: VolumeName, branch: impl Into<String>) -> Self {
        Self {
            name,
            branch: normalize_branch(Some(branch.into())),
        }
    }

    /// Branch label as users see it.
    pub fn branch_label(&self) -> &str {
        self.branch.as_deref().unwrap_or(DEFAULT_BRANCH)
    }
}

/// Collapse the default branch name to "no branch".
pub fn normalize_branch(branch: Option<String>) -> Option<String> {
    branch.filter(|b| !b.is_empty() && b != DEFAULT_BRANCH)
}

impl FromStr for VolumeRef {
    type Err = NameError;

    /// Parses `namespace/name@branch`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, branch) = match s.split_once('@') {
            Some((name, branch)) => {
                if branch.contains(['/', '@']) {
                    return Err(NameError::InvalidVolumeName {
                        input: s.to_string(),
                        reason: "branch must not contain '/' or '@'".to_string(),
                    });
                }
                (name, Some(branch.to_string()))
            }
            None => (s, None),
        };
        Ok(Self {
            name: name.parse()?,
            branch: normalize_branch(branch),
        })
    }
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.branch {
            Some(branch) => write!(f, "{}@{}", self.name, branch),
            None => write!(f, "{}", self.name),
        }
    }
}

/// One snapshot: identifier plus free-form metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn new(id: impl Into<SnapshotId>) -> Self {
        Self {
            id: id.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(id: impl Into<SnapshotId>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            id: id.into(),
            metadata,
        }
    }
}

/// The prefix of `snapshots` ending at (and including) `to`.
///
/// `None` if `to` is not part of the list.
pub fn restrict_snapshots(snapshots: &[Snapshot], to: &SnapshotId) -> Option<Vec<Snapshot>> {
    let end = snapshots.iter().position(|s| &s.id == to)?;
    Some(snapshots[..=end].to_vec())
}

/// Where a clone branched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub filesystem_id: FilesystemId,
    pub snapshot_id: SnapshotId,
}

/// A named clone of a top-level filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneInfo {
    pub filesystem_id: FilesystemId,
    pub origin: Origin,
}

/// The caller on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into() }
    }

    pub fn admin() -> Self {
        Self::new(ADMIN_USER_ID)
    }

    pub fn is_admin(&self) -> bool {
        self.user_id == ADMIN_USER_ID
    }
}

/// Persisted binding of a volume name to its top-level filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: FilesystemId,
    pub owner_id: String,
    #[serde(default)]
    pub collaborator_ids: Vec<String>,
}

impl RegistryEntry {
    pub fn new(id: FilesystemId, owner_id: impl Into<String>) -> Self {
        Self {
            id,
            owner_id: owner_id.into(),
            collaborator_ids: Vec::new(),
        }
    }

    /// Owner, collaborators and the admin may use the volume.
    pub fn authorize(&self, principal: &Principal) -> bool {
        principal.is_admin()
            || principal.user_id == self.owner_id
            || self.collaborator_ids.iter().any(|c| c == &principal.user_id)
    }

    /// Only the owner and the admin may perform owner-level operations.
    pub fn authorize_owner(&self, principal: &Principal) -> bool {
        principal.is_admin() || principal.user_id == self.owner_id
    }
}

/// Advisory count of uncommitted bytes on a filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyInfo {
    pub server: NodeId,
    pub dirty_bytes: u64,
    pub size_bytes: u64,
}

/// A container using a filesystem.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
}

/// Advisory record of the containers using a filesystem on its master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub server: NodeId,
    pub containers: Vec<ContainerRef>,
}

/// A node's last published view of one filesystem's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReport {
    pub state: String,
    pub status: String,
    pub version: String,
}

/// What a listing returns for one filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSummary {
    pub id: FilesystemId,
    pub name: VolumeName,
    pub branch: String,
    pub master: NodeId,
    pub dirty_bytes: u64,
    pub size_bytes: u64,
    pub commit_count: u64,
    pub server_statuses: BTreeMap<NodeId, String>,
}

/// Render one node's status line for a volume listing.
pub fn format_server_status(report: Option<&StateReport>, snapshot_count: usize) -> String {
    match report {
        Some(report) => format!(
            "{}: {}, {} snaps (v{})",
            report.state, report.status, snapshot_count, report.version
        ),
        None => format!("unknown, {snapshot_count} snaps"),
    }
}
