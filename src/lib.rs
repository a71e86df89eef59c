//! volmesh: cluster coordination for copy-on-write snapshot filesystems.
//!
//! Every node runs a [`cluster::Coordinator`] against a shared
//! coordination store. Volumes are registered by name in the
//! [`registry`], each filesystem is driven by one [`fsm`] machine per
//! node, and exactly one node masters a filesystem at a time.
//!
//! The crates are re-exported here so the node binary and embedders can
//! depend on a single crate:
//!
//! - [`types`]: shared types, store traits and in-memory backends
//! - [`registry`]: names, branches and master assignments in the store
//! - [`fsm`]: the per-filesystem actor
//! - [`cluster`]: the coordinator, routing and background loops

pub use volmesh_cluster as cluster;
pub use volmesh_core as types;
pub use volmesh_fsm as fsm;
pub use volmesh_registry as registry;
