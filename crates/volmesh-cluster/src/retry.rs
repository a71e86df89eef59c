//! Retry with capped exponential backoff.
//!
//! Whether an error is worth another attempt is decided by
//! [`ClusterError::retryability`], an exhaustive match: adding a variant
//! forces a decision about it.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use volmesh_fsm::ErrorKind;
use volmesh_fsm::MachineError;

use crate::config::NodeConfig;
use crate::error::ClusterError;

/// How an error affects a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Expected to self-correct after a fresh read.
    Transient,
    /// Retrying cannot help; surface it.
    Terminal,
}

impl ClusterError {
    pub fn retryability(&self) -> Retryability {
        match self {
            ClusterError::ProcurementTimeout { .. }
            | ClusterError::ProcurementFailed { .. }
            | ClusterError::CasConflict { .. }
            | ClusterError::MasterUnknown { .. }
            | ClusterError::Storage { .. }
            | ClusterError::Timeout { .. } => Retryability::Transient,
            ClusterError::Machine { source } => match source {
                MachineError::Timeout { .. } | MachineError::Dropped { .. } => Retryability::Transient,
                MachineError::Closed { .. } => Retryability::Terminal,
            },
            ClusterError::Rejected { kind, .. } => match kind {
                ErrorKind::CasConflict | ErrorKind::NotMaster | ErrorKind::Transport | ErrorKind::Registry => {
                    Retryability::Transient
                }
                ErrorKind::InvalidState
                | ErrorKind::StoreCommandFailed
                | ErrorKind::AlreadyExists
                | ErrorKind::Diverged => Retryability::Terminal,
            },
            ClusterError::Registry { source } => {
                if source.is_transient() {
                    Retryability::Transient
                } else {
                    Retryability::Terminal
                }
            }
            ClusterError::NotFound { .. }
            | ClusterError::AlreadyExists { .. }
            | ClusterError::PermissionDenied { .. }
            | ClusterError::StoreCommandFailed { .. }
            | ClusterError::UnexpectedResponse { .. }
            | ClusterError::InvalidName { .. }
            | ClusterError::Serialization { .. }
            | ClusterError::ShuttingDown => Retryability::Terminal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.retryability() == Retryability::Transient
    }
}

/// Result of a backoff calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffResult {
    /// How long to sleep before the next attempt.
    pub sleep_ms: u64,
    /// Backoff to feed into the following calculation.
    pub next_backoff_ms: u64,
}

/// Exponential backoff with bounded jitter.
///
/// Jitter is `jitter_seed % (current / 2 + 1)`; the next backoff doubles
/// `current`, capped at `max_backoff_ms`.
pub fn compute_backoff_with_jitter(current_backoff_ms: u64, max_backoff_ms: u64, jitter_seed: u64) -> BackoffResult {
    let max_jitter = current_backoff_ms.saturating_div(2).saturating_add(1);
    let jitter = jitter_seed % max_jitter;

    let sleep_ms = current_backoff_ms.saturating_add(jitter);

    let doubled = current_backoff_ms.saturating_mul(2);
    let next_backoff_ms = if doubled < max_backoff_ms {
        doubled
    } else {
        max_backoff_ms
    };

    BackoffResult {
        sleep_ms,
        next_backoff_ms,
    }
}

/// Retry loop for operations such as procurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// 0 retries until success or a terminal error.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            initial_backoff_ms: config.procure_retry_initial_backoff_ms,
            max_backoff_ms: config.procure_retry_max_backoff_ms,
            max_attempts: config.procure_max_attempts,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn once() -> Self {
        Self {
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            max_attempts: 1,
        }
    }

    /// Run `attempt` until it succeeds, fails terminally, runs out of
    /// attempts or `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, ClusterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let mut backoff_ms = self.initial_backoff_ms;
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ClusterError::ShuttingDown);
            }
            attempts = attempts.saturating_add(1);

            let err = match attempt().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(operation, attempts, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.retryability() == Retryability::Terminal {
                return Err(err);
            }
            if self.max_attempts != 0 && attempts >= self.max_attempts {
                warn!(operation, attempts, error = %err, "giving up after max attempts");
                return Err(err);
            }

            let backoff = compute_backoff_with_jitter(backoff_ms, self.max_backoff_ms, rand::random::<u64>());
            backoff_ms = backoff.next_backoff_ms;
            warn!(operation, attempts, error = %err, sleep_ms = backoff.sleep_ms, "transient failure, retrying");

            tokio::select! {
                _ = cancel.cancelled() => return Err(ClusterError::ShuttingDown),
                _ = tokio::time::sleep(Duration::from_millis(backoff.sleep_ms)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let first = compute_backoff_with_jitter(100, 5000, 0);
        assert_eq!(first.sleep_ms, 100);
        assert_eq!(first.next_backoff_ms, 200);

        let capped = compute_backoff_with_jitter(4000, 5000, 0);
        assert_eq!(capped.next_backoff_ms, 5000);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let result = compute_backoff_with_jitter(100, 5000, 1_000_003);
        assert!(result.sleep_ms >= 100 && result.sleep_ms <= 150);
    }

    proptest! {
        #[test]
        fn prop_backoff_never_exceeds_bounds(current in 0u64..100_000, max in 0u64..100_000, seed: u64) {
            let result = compute_backoff_with_jitter(current, max, seed);
            prop_assert!(result.sleep_ms >= current);
            prop_assert!(result.sleep_ms <= current + current / 2);
            prop_assert!(result.next_backoff_ms <= max);
        }
    }

    #[test]
    fn test_classification() {
        let transient = ClusterError::CasConflict {
            filesystem_id: "fs".into(),
            message: "lost".into(),
        };
        assert!(transient.is_transient());

        let terminal = ClusterError::PermissionDenied {
            user: "bob".into(),
            action: "procure",
            what: "alice/notebook".into(),
        };
        assert!(!terminal.is_transient());

        let rejected = ClusterError::Rejected {
            filesystem_id: "fs".into(),
            request: "move".into(),
            kind: ErrorKind::NotMaster,
            message: "moved on".into(),
        };
        assert!(rejected.is_transient());
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = fast_policy(0)
            .run("test", &cancel, move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err(ClusterError::MasterUnknown {
                        filesystem_id: "fs".into(),
                    })
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_terminal_error_stops_immediately() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = fast_policy(0)
            .run("test", &cancel, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClusterError::NotFound { what: "volume".into() })
            })
            .await;
        assert!(matches!(result, Err(ClusterError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_attempts_bounds_transient_retries() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = fast_policy(3)
            .run("test", &cancel, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClusterError::Timeout {
                    what: "x".into(),
                    timeout_ms: 1,
                })
            })
            .await;
        assert!(matches!(result, Err(ClusterError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_loop() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = fast_policy(0).run("test", &cancel, move || async move { Ok(()) }).await;
        assert!(matches!(result, Err(ClusterError::ShuttingDown)));
    }
}
