//! Cluster coordination for volmesh nodes.
//!
//! A [`Coordinator`] runs on every node. It owns the node's filesystem
//! machines and the advisory caches, and implements the cross-node
//! protocols on top of the registry:
//!
//! - creation: claim the master assignment, then create on disk
//! - procurement: ask the current master to push what this node lacks and
//!   hand mastership over, then activate locally
//! - request routing to whichever node masters a filesystem
//! - replication latency and transfers between nodes
//!
//! ## Example
//!
//! ```ignore
//! use volmesh_cluster::{Coordinator, NodeConfig, NodeServices};
//!
//! let coordinator = Coordinator::new(NodeConfig::for_node("node-1"), services);
//! coordinator.start().await?;
//!
//! let volume = VolumeRef::top_level("alice/notebook".parse()?);
//! let id = coordinator.procure_filesystem(&Principal::new("alice"), &volume).await?;
//! ```

pub mod config;
mod coordinator;
mod error;
mod loops;
mod procure;
mod retry;
mod routing;
mod transfers;
mod transport;
mod volumes;

pub use config::ConfigError;
pub use config::NodeConfig;
pub use config::load_config;
pub use coordinator::Coordinator;
pub use coordinator::NodeServices;
pub use error::ClusterError;
pub use retry::BackoffResult;
pub use retry::Retryability;
pub use retry::RetryPolicy;
pub use retry::compute_backoff_with_jitter;
pub use routing::RoutedRequest;
pub use transport::InProcessTransport;
