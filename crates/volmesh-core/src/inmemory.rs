//! Deterministic in-memory coordination store.
//!
//! Single-process backend for the cluster and the store every multi-node test
//! shares. All writes are linearized behind one lock, and every applied change
//! is fanned out to watchers in revision order.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

use crate::constants::MAX_SCAN_RESULTS;
use crate::constants::WATCH_CHANNEL_CAPACITY;
use crate::error::KeyValueStoreError;
use crate::kv::DeleteRequest;
use crate::kv::DeleteResult;
use crate::kv::KeyValueWithRevision;
use crate::kv::ReadRequest;
use crate::kv::ReadResult;
use crate::kv::ScanRequest;
use crate::kv::ScanResult;
use crate::kv::WatchEvent;
use crate::kv::WatchSubscription;
use crate::kv::WriteCommand;
use crate::kv::WriteRequest;
use crate::kv::WriteResult;
use crate::kv::validate_write_command;
use crate::traits::KeyValueStore;

#[derive(Clone)]
struct VersionedValue {
    value: String,
    version: u64,
    create_revision: u64,
    mod_revision: u64,
}

struct Inner {
    data: BTreeMap<String, VersionedValue>,
    revision: u64,
}

impl Inner {
    fn put(&mut self, key: &str, value: &str) -> u64 {
        self.revision += 1;
        let revision = self.revision;
        let entry = match self.data.get(key) {
            Some(existing) => VersionedValue {
                value: value.to_string(),
                version: existing.version + 1,
                create_revision: existing.create_revision,
                mod_revision: revision,
            },
            None => VersionedValue {
                value: value.to_string(),
                version: 1,
                create_revision: revision,
                mod_revision: revision,
            },
        };
        self.data.insert(key.to_string(), entry);
        revision
    }

    fn remove(&mut self, key: &str) -> Option<u64> {
        self.data.remove(key)?;
        self.revision += 1;
        Some(self.revision)
    }
}

/// A deterministic in-memory key-value store.
pub struct DeterministicKeyValueStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for DeterministicKeyValueStore {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl DeterministicKeyValueStore {
    /// Create a new store wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    fn new_inner() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                data: BTreeMap::new(),
                revision: 0,
            }),
            events,
        }
    }

    /// Current store revision.
    pub async fn revision(&self) -> u64 {
        self.inner.read().await.revision
    }

    /// Number of keys currently stored.
    pub async fn len(&self) -> usize {
        self.inner.read().await.data.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.data.is_empty()
    }

    fn publish(&self, key: &str, value: Option<&str>, revision: u64) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(WatchEvent {
            key: key.to_string(),
            value: value.map(str::to_string),
            revision,
        });
    }
}

#[async_trait]
impl KeyValueStore for DeterministicKeyValueStore {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        validate_write_command(&request.command)?;
        // Publishing happens under the write lock so watchers see revision order.
        let mut inner = self.inner.write().await;

        match request.command {
            WriteCommand::Set { key, value } => {
                let revision = inner.put(&key, &value);
                self.publish(&key, Some(&value), revision);
                Ok(WriteResult {
                    revision,
                    succeeded: true,
                })
            }
            WriteCommand::Delete { key } => {
                let revision = match inner.remove(&key) {
                    Some(revision) => {
                        self.publish(&key, None, revision);
                        revision
                    }
                    None => inner.revision,
                };
                Ok(WriteResult {
                    revision,
                    succeeded: true,
                })
            }
            WriteCommand::CompareAndSwap {
                key,
                expected,
                new_value,
            } => {
                let current = inner.data.get(&key).map(|v| v.value.clone());
                if current != expected {
                    return Err(KeyValueStoreError::CompareAndSwapFailed {
                        key,
                        expected,
                        actual: current,
                    });
                }
                let revision = inner.put(&key, &new_value);
                self.publish(&key, Some(&new_value), revision);
                Ok(WriteResult {
                    revision,
                    succeeded: true,
                })
            }
            WriteCommand::CompareAndDelete { key, expected } => {
                let matches = inner.data.get(&key).is_some_and(|v| v.value == expected);
                if !matches {
                    return Ok(WriteResult {
                        revision: inner.revision,
                        succeeded: false,
                    });
                }
                let revision = inner.remove(&key).unwrap_or(inner.revision);
                self.publish(&key, None, revision);
                Ok(WriteResult {
                    revision,
                    succeeded: true,
                })
            }
        }
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        let inner = self.inner.read().await;
        let kv = inner.data.get(&request.key).map(|v| KeyValueWithRevision {
            key: request.key.clone(),
            value: v.value.clone(),
            version: v.version,
            create_revision: v.create_revision,
            mod_revision: v.mod_revision,
        });
        Ok(ReadResult { kv })
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResult, KeyValueStoreError> {
        let mut inner = self.inner.write().await;
        let is_deleted = match inner.remove(&request.key) {
            Some(revision) => {
                self.publish(&request.key, None, revision);
                true
            }
            None => false,
        };
        Ok(DeleteResult {
            key: request.key,
            is_deleted,
        })
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, KeyValueStoreError> {
        let inner = self.inner.read().await;
        let limit = request.limit.unwrap_or(MAX_SCAN_RESULTS).min(MAX_SCAN_RESULTS) as usize;

        // The token is the last key of the previous page.
        let start = match &request.continuation_token {
            Some(after) => Bound::Excluded(after.clone()),
            None => Bound::Included(request.prefix.clone()),
        };
        let mut entries: Vec<KeyValueWithRevision> = inner
            .data
            .range((start, Bound::Unbounded))
            .skip_while(|(k, _)| k.as_str() < request.prefix.as_str())
            .take_while(|(k, _)| k.starts_with(&request.prefix))
            .take(limit + 1)
            .map(|(k, v)| KeyValueWithRevision {
                key: k.clone(),
                value: v.value.clone(),
                version: v.version,
                create_revision: v.create_revision,
                mod_revision: v.mod_revision,
            })
            .collect();

        let is_truncated = entries.len() > limit;
        entries.truncate(limit);
        let continuation_token = if is_truncated {
            entries.last().map(|e| e.key.clone())
        } else {
            None
        };
        Ok(ScanResult {
            entries,
            is_truncated,
            continuation_token,
        })
    }

    async fn watch(&self, prefix: &str) -> Result<WatchSubscription, KeyValueStoreError> {
        Ok(WatchSubscription::new(prefix, self.events.subscribe()))
    }
}
