//! Coordination-store request and response types.
//!
//! Compare-and-swap is the only cross-node ordering primitive the cluster
//! relies on. `CompareAndSwap { expected: None }` is a create-only write and
//! `CompareAndSwap { expected: Some(v) }` succeeds only while the key exists
//! and holds exactly `v`.

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::constants::MAX_KEY_SIZE;
use crate::constants::MAX_VALUE_SIZE;
use crate::error::KeyValueStoreError;

/// Commands that modify coordination-store state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteCommand {
    /// Set a key unconditionally.
    Set { key: String, value: String },
    /// Delete a key unconditionally.
    Delete { key: String },
    /// Atomically replace the value if the current value matches `expected`.
    CompareAndSwap {
        key: String,
        expected: Option<String>,
        new_value: String,
    },
    /// Atomically delete the key if its current value matches `expected`.
    CompareAndDelete { key: String, expected: String },
}

impl WriteCommand {
    /// Key this command targets.
    pub fn key(&self) -> &str {
        match self {
            WriteCommand::Set { key, .. }
            | WriteCommand::Delete { key }
            | WriteCommand::CompareAndSwap { key, .. }
            | WriteCommand::CompareAndDelete { key, .. } => key,
        }
    }
}

/// Request to perform a write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteRequest {
    pub command: WriteCommand,
}

impl WriteRequest {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::Set {
                key: key.into(),
                value: value.into(),
            },
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::Delete { key: key.into() },
        }
    }

    /// Create-only write: fails if the key already exists.
    pub fn create_only(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare_and_swap(key, None, value)
    }

    /// Must-exist write: fails unless the key currently holds `expected`.
    pub fn replace(key: impl Into<String>, expected: impl Into<String>, value: impl Into<String>) -> Self {
        Self::compare_and_swap(key, Some(expected.into()), value)
    }

    pub fn compare_and_swap(key: impl Into<String>, expected: Option<String>, new_value: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::CompareAndSwap {
                key: key.into(),
                expected,
                new_value: new_value.into(),
            },
        }
    }

    pub fn compare_and_delete(key: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::CompareAndDelete {
                key: key.into(),
                expected: expected.into(),
            },
        }
    }
}

/// Result of a write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WriteResult {
    /// Store revision after the write was applied.
    pub revision: u64,
    /// False when a compare-and-delete found a different value and did nothing.
    pub succeeded: bool,
}

/// Key-value pair with revision metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValueWithRevision {
    pub key: String,
    pub value: String,
    /// Number of times this key has been written since it was created.
    pub version: u64,
    /// Store revision at which the key was created.
    pub create_revision: u64,
    /// Store revision of the last modification.
    pub mod_revision: u64,
}

/// Request to read a single key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadRequest {
    pub key: String,
}

impl ReadRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Response from a read. `kv` is `None` when the key is absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadResult {
    pub kv: Option<KeyValueWithRevision>,
}

/// Request to delete a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: String,
}

impl DeleteRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Result of a delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    pub key: String,
    pub is_deleted: bool,
}

/// Request to list keys under a prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanRequest {
    pub prefix: String,
    pub limit: Option<u32>,
    /// Resume after the page that returned this token.
    pub continuation_token: Option<String>,
}

impl ScanRequest {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            limit: None,
            continuation_token: None,
        }
    }
}

/// Entries matching a scan, in key order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResult {
    pub entries: Vec<KeyValueWithRevision>,
    pub is_truncated: bool,
    /// Set when truncated; pass it back to fetch the next page.
    pub continuation_token: Option<String>,
}

/// A single change observed on the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    /// New value, or `None` when the key was deleted.
    pub value: Option<String>,
    pub revision: u64,
}

/// What a watch subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchNotification {
    Event(WatchEvent),
    /// The subscriber fell behind and missed events; it must rescan.
    Lagged { missed: u64 },
}

/// Live subscription to every change under a key prefix.
///
/// Dropping the subscription unsubscribes.
pub struct WatchSubscription {
    prefix: String,
    receiver: broadcast::Receiver<WatchEvent>,
}

impl WatchSubscription {
    pub fn new(prefix: impl Into<String>, receiver: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            receiver,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next change under the prefix.
    ///
    /// Returns `None` once the store has shut down.
    pub async fn next(&mut self) -> Option<WatchNotification> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(WatchNotification::Event(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some(WatchNotification::Lagged { missed });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Validate a write command against fixed size limits.
pub fn validate_write_command(command: &WriteCommand) -> Result<(), KeyValueStoreError> {
    let key = command.key();
    if key.is_empty() {
        return Err(KeyValueStoreError::EmptyKey);
    }
    if key.len() > MAX_KEY_SIZE as usize {
        return Err(KeyValueStoreError::KeyTooLarge {
            size: key.len() as u32,
            max: MAX_KEY_SIZE,
        });
    }
    let value = match command {
        WriteCommand::Set { value, .. } => Some(value),
        WriteCommand::CompareAndSwap { new_value, .. } => Some(new_value),
        WriteCommand::Delete { .. } | WriteCommand::CompareAndDelete { .. } => None,
    };
    if let Some(value) = value
        && value.len() > MAX_VALUE_SIZE as usize
    {
        return Err(KeyValueStoreError::ValueTooLarge {
            size: value.len() as u32,
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_only_has_no_expected_value() {
        let req = WriteRequest::create_only("k", "v");
        assert_eq!(req.command, WriteCommand::CompareAndSwap {
            key: "k".into(),
            expected: None,
            new_value: "v".into(),
        });
    }

    #[test]
    fn replace_expects_current_value() {
        let req = WriteRequest::replace("k", "old", "new");
        match req.command {
            WriteCommand::CompareAndSwap { expected, .. } => assert_eq!(expected.as_deref(), Some("old")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_empty_key() {
        let cmd = WriteCommand::Delete { key: String::new() };
        assert_eq!(validate_write_command(&cmd), Err(KeyValueStoreError::EmptyKey));
    }

    #[test]
    fn validate_rejects_oversized_value() {
        let cmd = WriteCommand::Set {
            key: "k".into(),
            value: "x".repeat(MAX_VALUE_SIZE as usize + 1),
        };
        assert!(matches!(validate_write_command(&cmd), Err(KeyValueStoreError::ValueTooLarge { .. })));
    }

    #[tokio::test]
    async fn watch_subscription_filters_by_prefix() {
        let (tx, rx) = broadcast::channel(8);
        let mut sub = WatchSubscription::new("a/", rx);
        tx.send(WatchEvent {
            key: "b/1".into(),
            value: None,
            revision: 1,
        })
        .unwrap();
        tx.send(WatchEvent {
            key: "a/1".into(),
            value: Some("x".into()),
            revision: 2,
        })
        .unwrap();
        match sub.next().await {
            Some(WatchNotification::Event(ev)) => assert_eq!(ev.key, "a/1"),
            other => panic!("unexpected notification {other:?}"),
        }
    }
}
