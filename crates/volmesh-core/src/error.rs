//! Error types shared by every volmesh crate.

use snafu::Snafu;
use thiserror::Error;

/// Errors returned by a coordination store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyValueStoreError {
    /// The key does not exist.
    #[error("key '{key}' not found")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// A compare-and-swap found a different current value.
    #[error("compare-and-swap failed for key '{key}': expected {expected:?}, found {actual:?}")]
    CompareAndSwapFailed {
        /// The contested key.
        key: String,
        /// Value the caller expected (`None` = key absent).
        expected: Option<String>,
        /// Value actually present (`None` = key absent).
        actual: Option<String>,
    },

    /// Keys must not be empty.
    #[error("key must not be empty")]
    EmptyKey,

    #[error("key size {size} exceeds maximum of {max} bytes")]
    KeyTooLarge { size: u32, max: u32 },

    #[error("value size {size} exceeds maximum of {max} bytes")]
    ValueTooLarge { size: u32, max: u32 },

    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Any other backend failure.
    #[error("operation failed: {reason}")]
    Failed {
        /// Human-readable description of the failure.
        reason: String,
    },
}

impl KeyValueStoreError {
    /// True when the error reports a lost compare-and-swap race.
    pub fn is_cas_conflict(&self) -> bool {
        matches!(self, KeyValueStoreError::CompareAndSwapFailed { .. })
    }
}

/// Errors returned by the snapshot-store driver.
///
/// Every variant names the command that failed and the filesystem it ran
/// against. Callers never retry these inside the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The filesystem does not exist in the local store.
    #[snafu(display("{command} {filesystem_id}: filesystem does not exist"))]
    FilesystemMissing { command: String, filesystem_id: String },

    /// The target name is already taken.
    #[snafu(display("{command} {filesystem_id}: filesystem already exists"))]
    FilesystemExists { command: String, filesystem_id: String },

    /// A referenced snapshot is not part of the filesystem's history.
    #[snafu(display("{command} {filesystem_id}: snapshot {snapshot_id} not found"))]
    SnapshotMissing {
        command: String,
        filesystem_id: String,
        snapshot_id: String,
    },

    /// Rolling back would orphan a clone that descends from a later snapshot.
    #[snafu(display("{command} {filesystem_id}: clone {clone_id} depends on snapshot {snapshot_id}"))]
    CloneDependency {
        command: String,
        filesystem_id: String,
        clone_id: String,
        snapshot_id: String,
    },

    /// The filesystem (or one it depends on) is mounted and must not be.
    #[snafu(display("{command} {filesystem_id}: filesystem is busy ({mountpoint} is mounted)"))]
    Busy {
        command: String,
        filesystem_id: String,
        mountpoint: String,
    },

    /// An incremental stream does not start where the local history ends.
    #[snafu(display(
        "{command} {filesystem_id}: stream starts at {stream_from:?} but local history ends at {local_latest:?}"
    ))]
    Diverged {
        command: String,
        filesystem_id: String,
        stream_from: Option<String>,
        local_latest: Option<String>,
    },

    /// The driver command ran and reported failure.
    #[snafu(display("{command} {filesystem_id} failed: {reason}"))]
    CommandFailed {
        command: String,
        filesystem_id: String,
        reason: String,
    },
}

impl StoreError {
    /// Driver command that produced this error.
    pub fn command(&self) -> &str {
        match self {
            StoreError::FilesystemMissing { command, .. }
            | StoreError::FilesystemExists { command, .. }
            | StoreError::SnapshotMissing { command, .. }
            | StoreError::CloneDependency { command, .. }
            | StoreError::Busy { command, .. }
            | StoreError::Diverged { command, .. }
            | StoreError::CommandFailed { command, .. } => command,
        }
    }

    /// Filesystem the failed command ran against.
    pub fn filesystem_id(&self) -> &str {
        match self {
            StoreError::FilesystemMissing { filesystem_id, .. }
            | StoreError::FilesystemExists { filesystem_id, .. }
            | StoreError::SnapshotMissing { filesystem_id, .. }
            | StoreError::CloneDependency { filesystem_id, .. }
            | StoreError::Busy { filesystem_id, .. }
            | StoreError::Diverged { filesystem_id, .. }
            | StoreError::CommandFailed { filesystem_id, .. } => filesystem_id,
        }
    }
}

/// Errors from the container-runtime inventory.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum InventoryError {
    #[snafu(display("container runtime unavailable: {reason}"))]
    Unavailable { reason: String },
}

/// Errors from parsing user-supplied volume names.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum NameError {
    #[snafu(display("invalid volume name '{input}': {reason}"))]
    InvalidVolumeName { input: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_error_not_found_display() {
        let err = KeyValueStoreError::NotFound { key: "k".to_string() };
        assert_eq!(err.to_string(), "key 'k' not found");
    }

    #[test]
    fn kv_error_cas_conflict_detection() {
        let err = KeyValueStoreError::CompareAndSwapFailed {
            key: "k".into(),
            expected: None,
            actual: Some("node-1".into()),
        };
        assert!(err.is_cas_conflict());
        assert!(!KeyValueStoreError::EmptyKey.is_cas_conflict());
    }

    #[test]
    fn store_error_carries_command_context() {
        let err = StoreError::CloneDependency {
            command: "rollback".into(),
            filesystem_id: "fs-1".into(),
            clone_id: "fs-2".into(),
            snapshot_id: "C".into(),
        };
        assert_eq!(err.command(), "rollback");
        assert_eq!(err.filesystem_id(), "fs-1");
        assert_eq!(err.to_string(), "rollback fs-1: clone fs-2 depends on snapshot C");
    }
}
