//! Coordination-store interface.

use async_trait::async_trait;

use crate::constants::MAX_SCAN_PAGES;
use crate::error::KeyValueStoreError;
use crate::kv::DeleteRequest;
use crate::kv::DeleteResult;
use crate::kv::KeyValueWithRevision;
use crate::kv::ReadRequest;
use crate::kv::ReadResult;
use crate::kv::ScanRequest;
use crate::kv::ScanResult;
use crate::kv::WatchSubscription;
use crate::kv::WriteRequest;
use crate::kv::WriteResult;

/// Key-value store with watch and compare-and-swap semantics.
///
/// This is the single source of truth for master assignment and filesystem
/// registration. Everything cached in process is a mirror of what lives here.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Apply a write. A lost compare-and-swap returns
    /// [`KeyValueStoreError::CompareAndSwapFailed`].
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError>;

    /// Read a value by key with revision metadata.
    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError>;

    /// Delete a key.
    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError>;

    /// List keys matching a prefix.
    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError>;

    /// Subscribe to changes under a prefix.
    async fn watch(&self, prefix: &str) -> Result<WatchSubscription, KeyValueStoreError>;

    /// Every entry under `request.prefix`, following continuation tokens.
    ///
    /// `request.limit` is the page size. Fails rather than returning a
    /// partial listing once [`MAX_SCAN_PAGES`] pages have been read.
    async fn scan_all(&self, mut request: ScanRequest) -> Result<Vec<KeyValueWithRevision>, KeyValueStoreError> {
        let mut entries = Vec::new();
        for _ in 0..MAX_SCAN_PAGES {
            let page = self.scan(request.clone()).await?;
            entries.extend(page.entries);
            match page.continuation_token {
                Some(token) if page.is_truncated => request.continuation_token = Some(token),
                _ => return Ok(entries),
            }
        }
        Err(KeyValueStoreError::Failed {
            reason: format!("scan of '{}' exceeded {MAX_SCAN_PAGES} pages", request.prefix),
        })
    }
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        (**self).write(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        (**self).read(request).await
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        (**self).delete(request).await
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        (**self).scan(request).await
    }

    async fn watch(&self, prefix: &str) -> Result<WatchSubscription, KeyValueStoreError> {
        (**self).watch(prefix).await
    }
}
