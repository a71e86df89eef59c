//! Per-filesystem state machines.
//!
//! Every filesystem a node knows about gets one [`FsMachine`] actor. All
//! mutations of the local copy go through its inbox and are applied one at
//! a time; callers hold a [`MachineHandle`] to dispatch [`Request`]s and to
//! watch state, snapshot and transfer progress.
//!
//! # Lifecycle
//!
//! ```text
//! discovering -> inactive <-> active
//!                   |           |
//!               receiving    pushing / moving / cloning
//!                   \           /
//!                     deleted
//! ```

mod error;
mod event;
mod handle;
mod latency;
mod machine;
mod stash;
mod state;
mod transfer;
mod transport;

pub use error::HandlerError;
pub use error::MachineError;
pub use event::ErrorKind;
pub use event::Request;
pub use event::Response;
pub use event::new_request_id;
pub use handle::MachineHandle;
pub use handle::PendingResponse;
pub use handle::SnapshotsChanged;
pub use latency::PeerView;
pub use latency::last_common_snapshot;
pub use latency::replication_latency;
pub use latency::send_base;
pub use machine::FsMachine;
pub use machine::MIGRATION_SNAPSHOT_TYPE;
pub use machine::MachineConfig;
pub use machine::MachineContext;
pub use machine::SNAPSHOT_TYPE_KEY;
pub use stash::stash_branch;
pub use state::MachineState;
pub use state::MachineStatus;
pub use transfer::TransferTracker;
pub use transport::PeerTransport;
pub use transport::TransportError;
