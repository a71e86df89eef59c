//! Fixed limits and defaults for volmesh.
//!
//! Every queue, scan and wait in the system is bounded by one of
//! these constants or by a config value that defaults to one of them.

// ============================================================================
// Naming
// ============================================================================

/// Branch name that refers to a volume's top-level filesystem.
pub const DEFAULT_BRANCH: &str = "master";

/// Namespace assumed when a volume name carries no `namespace/` prefix.
pub const DEFAULT_NAMESPACE: &str = "admin";

/// User id that passes every authorization check.
pub const ADMIN_USER_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Marker inserted into the name of a branch created to hold diverged history.
pub const DIVERGED_BRANCH_MARKER: &str = "DIVERGED";

// ============================================================================
// Coordination Store
// ============================================================================

/// Default namespace under which all volmesh keys live.
pub const DEFAULT_KEY_PREFIX: &str = "volmesh";

/// Maximum size of a single key in bytes (1 KB).
pub const MAX_KEY_SIZE: u32 = 1024;

/// Maximum size of a single value in bytes (4 MB).
///
/// Routed requests carry whole snapshot streams, so this is larger than a
/// typical metadata value.
pub const MAX_VALUE_SIZE: u32 = 4 * 1024 * 1024;

/// Maximum number of entries a single scan returns.
pub const MAX_SCAN_RESULTS: u32 = 10_000;

/// Maximum number of pages [`scan_all`](crate::KeyValueStore::scan_all)
/// follows before giving up.
pub const MAX_SCAN_PAGES: u32 = 1_000;

/// Capacity of the in-memory store's watch feed before slow subscribers lag.
pub const WATCH_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Procurement
// ============================================================================

/// Wall-clock bound on one procurement attempt (30 seconds).
pub const DEFAULT_PROCURE_TIMEOUT_MS: u64 = 30_000;

/// First sleep between procurement attempts.
pub const PROCURE_RETRY_INITIAL_BACKOFF_MS: u64 = 100;

/// Ceiling for the exponential procurement backoff.
pub const PROCURE_RETRY_MAX_BACKOFF_MS: u64 = 5_000;

/// Upper bound on how long a drained response is awaited after its caller
/// gave up (10 minutes). After this the waiter is dropped.
pub const LATE_RESPONSE_DRAIN_MS: u64 = 600_000;

// ============================================================================
// State Machines
// ============================================================================

/// Depth of each fsMachine's request inbox.
pub const DEFAULT_REQUEST_QUEUE_DEPTH: usize = 64;

/// Capacity of each snapshot-change broadcast topic.
pub const OBSERVER_CHANNEL_CAPACITY: usize = 64;

/// Maximum number of snapshots moved in a single transfer.
pub const MAX_TRANSFER_SEGMENTS: u32 = 100_000;

// ============================================================================
// Background Loops
// ============================================================================

/// Interval between dirty-byte polls of locally mastered filesystems.
pub const DEFAULT_DIRTY_POLL_INTERVAL_MS: u64 = 1_000;

/// Interval between container inventory refreshes.
pub const DEFAULT_CONTAINER_POLL_INTERVAL_MS: u64 = 1_000;

/// Default mount root for the in-memory snapshot store.
pub const DEFAULT_MOUNT_PREFIX: &str = "/var/lib/volmesh/mnt";

// ============================================================================
// Compile-time checks
// ============================================================================

const _: () = assert!(PROCURE_RETRY_INITIAL_BACKOFF_MS > 0);
const _: () = assert!(PROCURE_RETRY_INITIAL_BACKOFF_MS <= PROCURE_RETRY_MAX_BACKOFF_MS);
const _: () = assert!(DEFAULT_REQUEST_QUEUE_DEPTH > 0);
const _: () = assert!(MAX_KEY_SIZE < MAX_VALUE_SIZE);
