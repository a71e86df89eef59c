//! Coordinator errors.

use snafu::Snafu;
use volmesh_core::KeyValueStoreError;
use volmesh_core::NameError;
use volmesh_core::StoreError;
use volmesh_fsm::ErrorKind;
use volmesh_fsm::MachineError;
use volmesh_fsm::Response;
use volmesh_registry::RegistryError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClusterError {
    /// A name, branch or id did not resolve.
    #[snafu(display("{what} not found"))]
    NotFound { what: String },

    #[snafu(display("{what} already exists"))]
    AlreadyExists { what: String },

    #[snafu(display("user {user} may not {action} {what}"))]
    PermissionDenied {
        user: String,
        action: &'static str,
        what: String,
    },

    /// The current master did not hand the filesystem over in time.
    #[snafu(display("procuring {filesystem_id} timed out after {timeout_ms}ms"))]
    ProcurementTimeout { filesystem_id: String, timeout_ms: u64 },

    /// The handoff answered with something other than `moved`.
    #[snafu(display("procuring {filesystem_id} failed: got {response}: {message}"))]
    ProcurementFailed {
        filesystem_id: String,
        response: String,
        message: String,
    },

    #[snafu(display("{request} on {filesystem_id} failed: {message}"))]
    StoreCommandFailed {
        filesystem_id: String,
        request: String,
        message: String,
    },

    /// A concurrent coordination-store write won.
    #[snafu(display("lost a race on {filesystem_id}: {message}"))]
    CasConflict { filesystem_id: String, message: String },

    /// Registered but ownerless; a claim is in flight or its claimant crashed.
    #[snafu(display("filesystem {filesystem_id} has no current master"))]
    MasterUnknown { filesystem_id: String },

    /// A machine refused a request.
    #[snafu(display("{request} on {filesystem_id} was rejected ({kind:?}): {message}"))]
    Rejected {
        filesystem_id: String,
        request: String,
        kind: ErrorKind,
        message: String,
    },

    #[snafu(display("{request} on {filesystem_id} answered {response}"))]
    UnexpectedResponse {
        filesystem_id: String,
        request: String,
        response: String,
    },

    #[snafu(display("timed out after {timeout_ms}ms waiting for {what}"))]
    Timeout { what: String, timeout_ms: u64 },

    #[snafu(display("invalid volume name: {source}"))]
    InvalidName { source: NameError },

    #[snafu(display("{source}"))]
    Machine { source: MachineError },

    #[snafu(display("registry: {source}"))]
    Registry { source: RegistryError },

    #[snafu(display("coordination store: {source}"))]
    Storage { source: KeyValueStoreError },

    #[snafu(display("serialization error: {source}"))]
    Serialization { source: serde_json::Error },

    #[snafu(display("coordinator is shutting down"))]
    ShuttingDown,
}

impl ClusterError {
    /// Turn a machine's answer into an error when it is not the one expected.
    pub fn from_response(filesystem_id: &str, request: &str, response: Response) -> Self {
        match response {
            Response::Error {
                kind: ErrorKind::StoreCommandFailed,
                message,
            } => ClusterError::StoreCommandFailed {
                filesystem_id: filesystem_id.to_string(),
                request: request.to_string(),
                message,
            },
            Response::Error {
                kind: ErrorKind::CasConflict,
                message,
            } => ClusterError::CasConflict {
                filesystem_id: filesystem_id.to_string(),
                message,
            },
            Response::Error {
                kind: ErrorKind::AlreadyExists,
                ..
            } => ClusterError::AlreadyExists {
                what: format!("filesystem {filesystem_id}"),
            },
            Response::Error { kind, message } => ClusterError::Rejected {
                filesystem_id: filesystem_id.to_string(),
                request: request.to_string(),
                kind,
                message,
            },
            other => ClusterError::UnexpectedResponse {
                filesystem_id: filesystem_id.to_string(),
                request: request.to_string(),
                response: other.name().to_string(),
            },
        }
    }
}

impl From<RegistryError> for ClusterError {
    fn from(source: RegistryError) -> Self {
        match source {
            RegistryError::NotFound { what } => ClusterError::NotFound { what },
            RegistryError::AlreadyExists { name, .. } => ClusterError::AlreadyExists {
                what: format!("volume {name}"),
            },
            RegistryError::BranchExists { top_level_id, branch } => ClusterError::AlreadyExists {
                what: format!("branch {branch} of {top_level_id}"),
            },
            RegistryError::MasterUnknown { filesystem_id } => ClusterError::MasterUnknown { filesystem_id },
            RegistryError::MasterConflict {
                filesystem_id,
                expected,
                actual,
            } => ClusterError::CasConflict {
                filesystem_id,
                message: format!("master expected {expected:?}, found {actual:?}"),
            },
            RegistryError::Storage { source } => ClusterError::Storage { source },
            source => ClusterError::Registry { source },
        }
    }
}

impl From<MachineError> for ClusterError {
    fn from(source: MachineError) -> Self {
        ClusterError::Machine { source }
    }
}

impl From<KeyValueStoreError> for ClusterError {
    fn from(source: KeyValueStoreError) -> Self {
        ClusterError::Storage { source }
    }
}

impl From<StoreError> for ClusterError {
    fn from(source: StoreError) -> Self {
        ClusterError::StoreCommandFailed {
            filesystem_id: source.filesystem_id().to_string(),
            request: source.command().to_string(),
            message: source.to_string(),
        }
    }
}

impl From<NameError> for ClusterError {
    fn from(source: NameError) -> Self {
        ClusterError::InvalidName { source }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(source: serde_json::Error) -> Self {
        ClusterError::Serialization { source }
    }
}
