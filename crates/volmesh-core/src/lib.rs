//! Core types and collaborator interfaces for volmesh.
//!
//! Everything the cluster layers share lives here:
//!
//! - domain types: filesystem, node and snapshot ids, volume names, registry
//!   entries, transfer records
//! - the coordination store ([`KeyValueStore`]) and its deterministic
//!   in-memory implementation
//! - the snapshot-store driver ([`SnapshotStore`]) and an in-memory driver
//! - the container inventory interface
//! - typed publish/subscribe topics

pub mod constants;
mod error;
mod inmemory;
mod inventory;
mod kv;
mod memstore;
mod observer;
mod store;
mod traits;
mod transfer;
mod types;
mod utils;

pub use error::InventoryError;
pub use error::KeyValueStoreError;
pub use error::NameError;
pub use error::StoreError;
pub use inmemory::DeterministicKeyValueStore;
pub use inventory::ContainerInventory;
pub use inventory::StaticContainerInventory;
pub use kv::DeleteRequest;
pub use kv::DeleteResult;
pub use kv::KeyValueWithRevision;
pub use kv::ReadRequest;
pub use kv::ReadResult;
pub use kv::ScanRequest;
pub use kv::ScanResult;
pub use kv::WatchEvent;
pub use kv::WatchNotification;
pub use kv::WatchSubscription;
pub use kv::WriteCommand;
pub use kv::WriteRequest;
pub use kv::WriteResult;
pub use kv::validate_write_command;
pub use memstore::InMemorySnapshotStore;
pub use observer::Observer;
pub use observer::Subscription;
pub use observer::TopicObserver;
pub use store::DiscoveredFilesystem;
pub use store::MountRecord;
pub use store::SnapshotStore;
pub use store::SnapshotStream;
pub use traits::KeyValueStore;
pub use transfer::TransferDirection;
pub use transfer::TransferPollResult;
pub use transfer::TransferRequest;
pub use transfer::TransferStatus;
pub use types::CloneInfo;
pub use types::ContainerInfo;
pub use types::ContainerRef;
pub use types::DirtyInfo;
pub use types::FilesystemId;
pub use types::NodeId;
pub use types::Origin;
pub use types::Principal;
pub use types::RegistryEntry;
pub use types::Snapshot;
pub use types::SnapshotId;
pub use types::StateReport;
pub use types::VolumeName;
pub use types::VolumeRef;
pub use types::VolumeSummary;
pub use types::format_server_status;
pub use types::normalize_branch;
pub use types::restrict_snapshots;
pub use utils::now_unix_ms;
pub use utils::short_id;
