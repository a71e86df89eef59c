//! Errors for talking to a machine and for the work a machine does.

use snafu::Snafu;
use volmesh_core::StoreError;
use volmesh_registry::RegistryError;

use crate::event::ErrorKind;
use crate::state::MachineState;
use crate::transport::TransportError;

/// Failure to get a response out of a machine at all.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MachineError {
    /// The machine's inbox is closed; it has stopped.
    #[snafu(display("machine for {filesystem_id} is not running"))]
    Closed { filesystem_id: String },

    /// The machine stopped before answering.
    #[snafu(display("machine for {filesystem_id} dropped request {request_id}"))]
    Dropped { filesystem_id: String, request_id: String },

    #[snafu(display("{request} on {filesystem_id} did not complete within {timeout_ms}ms"))]
    Timeout {
        filesystem_id: String,
        request: String,
        timeout_ms: u64,
    },
}

/// Failure while handling one request. Turned into a
/// [`Response::Error`](crate::Response::Error) before it leaves the machine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HandlerError {
    #[snafu(display("cannot {request} while {state}"))]
    InvalidState { request: &'static str, state: MachineState },

    #[snafu(display("{source}"))]
    Store { source: StoreError },

    #[snafu(display("{source}"))]
    Registry { source: RegistryError },

    #[snafu(display("{source}"))]
    Transport { source: TransportError },

    #[snafu(display("{filesystem_id} is mastered by {master}, not this node"))]
    NotMaster { filesystem_id: String, master: String },

    #[snafu(display("{filesystem_id} already exists locally"))]
    AlreadyExists { filesystem_id: String },

    #[snafu(display("history of {filesystem_id} diverged from {peer}: {reason}"))]
    Diverged {
        filesystem_id: String,
        peer: String,
        reason: String,
    },
}

impl HandlerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::InvalidState { .. } => ErrorKind::InvalidState,
            HandlerError::Store {
                source: StoreError::Diverged { .. },
            } => ErrorKind::Diverged,
            HandlerError::Store { .. } => ErrorKind::StoreCommandFailed,
            HandlerError::Registry {
                source: RegistryError::MasterConflict { .. },
            } => ErrorKind::CasConflict,
            HandlerError::Registry { .. } => ErrorKind::Registry,
            HandlerError::Transport { .. } => ErrorKind::Transport,
            HandlerError::NotMaster { .. } => ErrorKind::NotMaster,
            HandlerError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            HandlerError::Diverged { .. } => ErrorKind::Diverged,
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(source: StoreError) -> Self {
        HandlerError::Store { source }
    }
}

impl From<RegistryError> for HandlerError {
    fn from(source: RegistryError) -> Self {
        HandlerError::Registry { source }
    }
}

impl From<TransportError> for HandlerError {
    fn from(source: TransportError) -> Self {
        HandlerError::Transport { source }
    }
}
