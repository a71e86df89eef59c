//! Container-runtime inventory.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::InventoryError;
use crate::types::ContainerRef;
use crate::types::FilesystemId;

/// Reports which containers use which filesystems on this node.
#[async_trait]
pub trait ContainerInventory: Send + Sync {
    async fn all_related(&self) -> Result<BTreeMap<FilesystemId, Vec<ContainerRef>>, InventoryError>;
}

/// Inventory whose contents are set explicitly.
#[derive(Default)]
pub struct StaticContainerInventory {
    related: RwLock<BTreeMap<FilesystemId, Vec<ContainerRef>>>,
    unavailable: RwLock<Option<String>>,
}

impl StaticContainerInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: FilesystemId, containers: Vec<ContainerRef>) {
        self.related.write().insert(id, containers);
    }

    pub fn clear(&self, id: &FilesystemId) {
        self.related.write().remove(id);
    }

    /// Make every query fail with `reason` until cleared with `None`.
    pub fn set_unavailable(&self, reason: Option<String>) {
        *self.unavailable.write() = reason;
    }
}

#[async_trait]
impl ContainerInventory for StaticContainerInventory {
    async fn all_related(&self) -> Result<BTreeMap<FilesystemId, Vec<ContainerRef>>, InventoryError> {
        if let Some(reason) = self.unavailable.read().clone() {
            return Err(InventoryError::Unavailable { reason });
        }
        Ok(self.related.read().clone())
    }
}
