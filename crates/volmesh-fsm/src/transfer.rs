//! Progress reporting for a running transfer.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use volmesh_core::SnapshotId;
use volmesh_core::TransferPollResult;
use volmesh_core::TransferStatus;

/// Writes progress of one transfer into the machine's transfer channel.
///
/// The machine running the job is the only writer; pollers read clones of
/// the latest record.
pub struct TransferTracker {
    tx: Arc<watch::Sender<Option<TransferPollResult>>>,
    started: Instant,
}

impl TransferTracker {
    /// Publish `initial` and start the clock.
    pub fn begin(tx: Arc<watch::Sender<Option<TransferPollResult>>>, mut initial: TransferPollResult) -> Self {
        initial.status = TransferStatus::Starting;
        tx.send_replace(Some(initial));
        Self {
            tx,
            started: Instant::now(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut TransferPollResult)) {
        let elapsed = self.started.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.tx.send_modify(|poll| {
            if let Some(poll) = poll {
                f(poll);
                poll.nanoseconds_elapsed = elapsed;
            }
        });
    }

    pub fn plan(&self, starting_commit: Option<SnapshotId>, total: u32) {
        self.update(|p| {
            p.starting_commit = starting_commit;
            p.total = total;
            p.status = TransferStatus::Running;
        });
    }

    /// Segment `index` (1-based) of `size` bytes is about to be sent.
    pub fn segment(&self, index: u32, size: u64) {
        self.update(|p| {
            p.index = index;
            p.size = size;
        });
    }

    pub fn sent(&self, bytes: u64) {
        self.update(|p| p.sent = p.sent.saturating_add(bytes));
    }

    pub fn finish(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|p| {
            p.status = TransferStatus::Finished;
            p.message = message;
        });
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|p| {
            p.status = TransferStatus::Error;
            p.message = message;
        });
    }
}
