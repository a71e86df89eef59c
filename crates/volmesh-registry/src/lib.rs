//! Registry of volume names, clones and master assignments.
//!
//! Built on the coordination store's compare-and-swap. Mastership of a
//! filesystem is claimed with a create-only write and moved only by an
//! explicit handoff from the current master; nothing else overwrites it.

mod error;
pub mod keys;
mod registry;

pub use error::RegistryError;
pub use keys::KeyKind;
pub use keys::Keyspace;
pub use registry::FilesystemLocation;
pub use registry::MasterFilter;
pub use registry::Registry;
