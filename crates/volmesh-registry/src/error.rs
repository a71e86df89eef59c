//! Registry errors.

use snafu::Snafu;
use volmesh_core::KeyValueStoreError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    /// The name is bound to a different filesystem.
    #[snafu(display("volume {name} already exists with id {existing_id}"))]
    AlreadyExists { name: String, existing_id: String },

    /// The branch name is already used under this top-level filesystem.
    #[snafu(display("branch {branch} already exists under {top_level_id}"))]
    BranchExists { top_level_id: String, branch: String },

    #[snafu(display("{what} not found"))]
    NotFound { what: String },

    /// Registered but currently ownerless. Transient: a claim is in flight or
    /// its claimant crashed.
    #[snafu(display("filesystem {filesystem_id} has no current master"))]
    MasterUnknown { filesystem_id: String },

    /// A master-assignment compare-and-swap lost.
    #[snafu(display("master of {filesystem_id} changed concurrently: expected {expected:?}, found {actual:?}"))]
    MasterConflict {
        filesystem_id: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// A clone's origin must be owned before the clone can be claimed.
    #[snafu(display("origin {origin_id} of clone {filesystem_id} has no master"))]
    OriginNotOwned { filesystem_id: String, origin_id: String },

    #[snafu(display("storage error: {source}"))]
    Storage { source: KeyValueStoreError },

    #[snafu(display("corrupted data in key '{key}': {source}"))]
    CorruptedData { key: String, source: serde_json::Error },

    #[snafu(display("serialization error: {source}"))]
    Serialization { source: serde_json::Error },
}

impl From<KeyValueStoreError> for RegistryError {
    fn from(source: KeyValueStoreError) -> Self {
        RegistryError::Storage { source }
    }
}

impl RegistryError {
    /// True for conditions that a fresh read and retry can resolve.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::MasterUnknown { .. } | RegistryError::MasterConflict { .. } => true,
            RegistryError::Storage { source } => {
                matches!(source, KeyValueStoreError::Timeout { .. } | KeyValueStoreError::Failed { .. })
                    || source.is_cas_conflict()
            }
            _ => false,
        }
    }
}
