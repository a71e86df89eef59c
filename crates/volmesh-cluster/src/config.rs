//! Node configuration.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;
use volmesh_core::NodeId;
use volmesh_core::constants::DEFAULT_CONTAINER_POLL_INTERVAL_MS;
use volmesh_core::constants::DEFAULT_DIRTY_POLL_INTERVAL_MS;
use volmesh_core::constants::DEFAULT_KEY_PREFIX;
use volmesh_core::constants::DEFAULT_MOUNT_PREFIX;
use volmesh_core::constants::DEFAULT_PROCURE_TIMEOUT_MS;
use volmesh_core::constants::DEFAULT_REQUEST_QUEUE_DEPTH;
use volmesh_core::constants::PROCURE_RETRY_INITIAL_BACKOFF_MS;
use volmesh_core::constants::PROCURE_RETRY_MAX_BACKOFF_MS;

/// Configuration for one volmesh node.
///
/// Loaded in layers, lowest precedence first:
/// 1. Environment variables (VOLMESH_*)
/// 2. TOML configuration file
/// 3. Command-line arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's identity in the cluster.
    #[serde(default)]
    pub node_id: String,

    /// Addresses peers can reach this node on, published to the address book.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Namespace for every key this node reads or writes.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How long a procurement waits for the current master to hand over.
    #[serde(default = "default_procure_timeout_ms")]
    pub procure_timeout_ms: u64,

    #[serde(default = "default_procure_retry_initial_backoff_ms")]
    pub procure_retry_initial_backoff_ms: u64,

    #[serde(default = "default_procure_retry_max_backoff_ms")]
    pub procure_retry_max_backoff_ms: u64,

    /// Attempts before procurement gives up. 0 retries until success.
    #[serde(default)]
    pub procure_max_attempts: u32,

    /// Deadline for each local dispatch. 0 waits indefinitely.
    #[serde(default)]
    pub dispatch_timeout_ms: u64,

    #[serde(default = "default_dirty_poll_interval_ms")]
    pub dirty_poll_interval_ms: u64,

    #[serde(default = "default_container_poll_interval_ms")]
    pub container_poll_interval_ms: u64,

    /// Requests that may queue on one filesystem before dispatch blocks.
    #[serde(default = "default_request_queue_depth")]
    pub request_queue_depth: usize,

    /// Root under which the snapshot store mounts filesystems.
    #[serde(default = "default_mount_prefix")]
    pub mount_prefix: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            addresses: Vec::new(),
            key_prefix: default_key_prefix(),
            procure_timeout_ms: default_procure_timeout_ms(),
            procure_retry_initial_backoff_ms: default_procure_retry_initial_backoff_ms(),
            procure_retry_max_backoff_ms: default_procure_retry_max_backoff_ms(),
            procure_max_attempts: 0,
            dispatch_timeout_ms: 0,
            dirty_poll_interval_ms: default_dirty_poll_interval_ms(),
            container_poll_interval_ms: default_container_poll_interval_ms(),
            request_queue_depth: default_request_queue_depth(),
            mount_prefix: default_mount_prefix(),
        }
    }
}

impl NodeConfig {
    /// Defaults for `node_id`.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu { path })
    }

    /// Load configuration from environment variables.
    ///
    /// Variables follow the pattern VOLMESH_<FIELD_NAME>; `VOLMESH_ADDRESSES`
    /// is comma separated.
    pub fn from_env() -> Self {
        Self {
            node_id: parse_env("VOLMESH_NODE_ID").unwrap_or_default(),
            addresses: parse_env_vec("VOLMESH_ADDRESSES"),
            key_prefix: parse_env("VOLMESH_KEY_PREFIX").unwrap_or_else(default_key_prefix),
            procure_timeout_ms: parse_env("VOLMESH_PROCURE_TIMEOUT_MS").unwrap_or_else(default_procure_timeout_ms),
            procure_retry_initial_backoff_ms: parse_env("VOLMESH_PROCURE_RETRY_INITIAL_BACKOFF_MS")
                .unwrap_or_else(default_procure_retry_initial_backoff_ms),
            procure_retry_max_backoff_ms: parse_env("VOLMESH_PROCURE_RETRY_MAX_BACKOFF_MS")
                .unwrap_or_else(default_procure_retry_max_backoff_ms),
            procure_max_attempts: parse_env("VOLMESH_PROCURE_MAX_ATTEMPTS").unwrap_or(0),
            dispatch_timeout_ms: parse_env("VOLMESH_DISPATCH_TIMEOUT_MS").unwrap_or(0),
            dirty_poll_interval_ms: parse_env("VOLMESH_DIRTY_POLL_INTERVAL_MS")
                .unwrap_or_else(default_dirty_poll_interval_ms),
            container_poll_interval_ms: parse_env("VOLMESH_CONTAINER_POLL_INTERVAL_MS")
                .unwrap_or_else(default_container_poll_interval_ms),
            request_queue_depth: parse_env("VOLMESH_REQUEST_QUEUE_DEPTH").unwrap_or_else(default_request_queue_depth),
            mount_prefix: parse_env("VOLMESH_MOUNT_PREFIX").unwrap_or_else(default_mount_prefix),
        }
    }

    /// Overlay `other` on `self`. A field in `other` wins only when it differs
    /// from its default.
    pub fn merge(&mut self, other: Self) {
        if !other.node_id.is_empty() {
            self.node_id = other.node_id;
        }
        if !other.addresses.is_empty() {
            self.addresses = other.addresses;
        }
        if other.key_prefix != default_key_prefix() {
            self.key_prefix = other.key_prefix;
        }
        if other.procure_timeout_ms != default_procure_timeout_ms() {
            self.procure_timeout_ms = other.procure_timeout_ms;
        }
        if other.procure_retry_initial_backoff_ms != default_procure_retry_initial_backoff_ms() {
            self.procure_retry_initial_backoff_ms = other.procure_retry_initial_backoff_ms;
        }
        if other.procure_retry_max_backoff_ms != default_procure_retry_max_backoff_ms() {
            self.procure_retry_max_backoff_ms = other.procure_retry_max_backoff_ms;
        }
        if other.procure_max_attempts != 0 {
            self.procure_max_attempts = other.procure_max_attempts;
        }
        if other.dispatch_timeout_ms != 0 {
            self.dispatch_timeout_ms = other.dispatch_timeout_ms;
        }
        if other.dirty_poll_interval_ms != default_dirty_poll_interval_ms() {
            self.dirty_poll_interval_ms = other.dirty_poll_interval_ms;
        }
        if other.container_poll_interval_ms != default_container_poll_interval_ms() {
            self.container_poll_interval_ms = other.container_poll_interval_ms;
        }
        if other.request_queue_depth != default_request_queue_depth() {
            self.request_queue_depth = other.request_queue_depth;
        }
        if other.mount_prefix != default_mount_prefix() {
            self.mount_prefix = other.mount_prefix;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "node_id must not be empty".into(),
            });
        }

        if self.node_id.contains('/') {
            return Err(ConfigError::Validation {
                message: "node_id must not contain '/'".into(),
            });
        }

        if self.key_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Validation {
                message: "key_prefix must not be empty".into(),
            });
        }

        if self.procure_timeout_ms == 0 {
            return Err(ConfigError::Validation {
                message: "procure_timeout_ms must be non-zero".into(),
            });
        }

        if self.procure_retry_initial_backoff_ms == 0 {
            return Err(ConfigError::Validation {
                message: "procure_retry_initial_backoff_ms must be non-zero".into(),
            });
        }

        if self.procure_retry_max_backoff_ms < self.procure_retry_initial_backoff_ms {
            return Err(ConfigError::Validation {
                message: "procure_retry_max_backoff_ms must be at least procure_retry_initial_backoff_ms".into(),
            });
        }

        if self.dirty_poll_interval_ms == 0 || self.container_poll_interval_ms == 0 {
            return Err(ConfigError::Validation {
                message: "poll intervals must be non-zero".into(),
            });
        }

        if self.request_queue_depth == 0 {
            return Err(ConfigError::Validation {
                message: "request_queue_depth must be non-zero".into(),
            });
        }

        Ok(())
    }

    pub fn node(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }

    pub fn procure_timeout(&self) -> Duration {
        Duration::from_millis(self.procure_timeout_ms)
    }

    /// `None` when dispatches wait indefinitely.
    pub fn dispatch_timeout(&self) -> Option<Duration> {
        (self.dispatch_timeout_ms > 0).then(|| Duration::from_millis(self.dispatch_timeout_ms))
    }

    pub fn dirty_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dirty_poll_interval_ms)
    }

    pub fn container_poll_interval(&self) -> Duration {
        Duration::from_millis(self.container_poll_interval_ms)
    }
}

/// Build the effective configuration: environment, then the TOML file if
/// given, then `overrides`, then validate.
pub fn load_config(toml_path: Option<&Path>, overrides: NodeConfig) -> Result<NodeConfig, ConfigError> {
    let mut config = NodeConfig::from_env();

    if let Some(path) = toml_path {
        let toml_config = NodeConfig::from_toml_file(path)?;
        config.merge(toml_config);
    }

    config.merge(overrides);
    config.validate()?;
    Ok(config)
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_procure_timeout_ms() -> u64 {
    DEFAULT_PROCURE_TIMEOUT_MS
}

fn default_procure_retry_initial_backoff_ms() -> u64 {
    PROCURE_RETRY_INITIAL_BACKOFF_MS
}

fn default_procure_retry_max_backoff_ms() -> u64 {
    PROCURE_RETRY_MAX_BACKOFF_MS
}

fn default_dirty_poll_interval_ms() -> u64 {
    DEFAULT_DIRTY_POLL_INTERVAL_MS
}

fn default_container_poll_interval_ms() -> u64 {
    DEFAULT_CONTAINER_POLL_INTERVAL_MS
}

fn default_request_queue_depth() -> usize {
    DEFAULT_REQUEST_QUEUE_DEPTH
}

fn default_mount_prefix() -> String {
    DEFAULT_MOUNT_PREFIX.to_string()
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn parse_env_vec(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Configuration loading and parsing errors.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("configuration validation failed: {message}"))]
    Validation { message: String },
}
