//! Caller side of a filesystem machine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;
use volmesh_core::FilesystemId;
use volmesh_core::NodeId;
use volmesh_core::Observer;
use volmesh_core::Snapshot;
use volmesh_core::Subscription;
use volmesh_core::TransferPollResult;

use crate::error::MachineError;
use crate::event::Request;
use crate::event::Response;
use crate::event::new_request_id;
use crate::latency::PeerView;
use crate::state::MachineState;
use crate::state::MachineStatus;

/// A request on its way into a machine's inbox.
pub(crate) struct Envelope {
    pub request_id: String,
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

/// Published whenever the local snapshot list of a filesystem changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotsChanged {
    pub filesystem_id: FilesystemId,
    pub node_id: NodeId,
    pub snapshots: Vec<Snapshot>,
}

/// The one response a dispatched request will get.
pub struct PendingResponse {
    filesystem_id: FilesystemId,
    request_id: String,
    request_name: &'static str,
    rx: oneshot::Receiver<Response>,
}

impl PendingResponse {
    pub fn new(
        filesystem_id: FilesystemId,
        request_id: String,
        request_name: &'static str,
        rx: oneshot::Receiver<Response>,
    ) -> Self {
        Self {
            filesystem_id,
            request_id,
            request_name,
            rx,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn wait(self) -> Result<Response, MachineError> {
        self.rx.await.map_err(|_| MachineError::Dropped {
            filesystem_id: self.filesystem_id.to_string(),
            request_id: self.request_id,
        })
    }

    /// Wait at most `timeout`. On timeout the response is discarded when it
    /// eventually arrives.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Response, MachineError> {
        let filesystem_id = self.filesystem_id.clone();
        let request = self.request_name;
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(MachineError::Timeout {
                filesystem_id: filesystem_id.to_string(),
                request: request.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Like [`PendingResponse::wait_timeout`], but on timeout a background
    /// task keeps the channel open for up to `drain` so a late response is
    /// consumed and logged rather than lost with the sender blocked on it.
    pub async fn wait_or_drain(mut self, timeout: Duration, drain: Duration) -> Result<Response, MachineError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MachineError::Dropped {
                filesystem_id: self.filesystem_id.to_string(),
                request_id: self.request_id,
            }),
            Err(_) => {
                let PendingResponse {
                    filesystem_id,
                    request_id,
                    request_name,
                    rx,
                } = self;
                let fs = filesystem_id.clone();
                let id = request_id.clone();
                tokio::spawn(async move {
                    match tokio::time::timeout(drain, rx).await {
                        Ok(Ok(response)) => {
                            debug!(filesystem_id = %fs, request_id = %id, response = response.name(), "drained late response")
                        }
                        Ok(Err(_)) => debug!(filesystem_id = %fs, request_id = %id, "late response never arrived"),
                        Err(_) => warn!(filesystem_id = %fs, request_id = %id, "gave up draining late response"),
                    }
                });
                Err(MachineError::Timeout {
                    filesystem_id: filesystem_id.to_string(),
                    request: request_name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Cloneable handle to a running machine.
///
/// Requests are processed one at a time in the order they were accepted,
/// and each caller receives only the response to its own request.
#[derive(Clone)]
pub struct MachineHandle {
    pub(crate) filesystem_id: FilesystemId,
    pub(crate) node_id: NodeId,
    pub(crate) requests: mpsc::Sender<Envelope>,
    pub(crate) status: watch::Receiver<MachineStatus>,
    pub(crate) view: Arc<watch::Sender<PeerView>>,
    pub(crate) snapshots: Arc<Observer<SnapshotsChanged>>,
    pub(crate) transfer: watch::Receiver<Option<TransferPollResult>>,
}

impl MachineHandle {
    pub fn filesystem_id(&self) -> &FilesystemId {
        &self.filesystem_id
    }

    /// Queue `request`. Waits for inbox capacity, not for processing.
    pub async fn dispatch(&self, request: Request) -> Result<PendingResponse, MachineError> {
        self.dispatch_with_id(new_request_id(), request).await
    }

    /// Queue `request` under a caller-chosen id.
    pub async fn dispatch_with_id(&self, request_id: String, request: Request) -> Result<PendingResponse, MachineError> {
        let (reply, rx) = oneshot::channel();
        let name = request.name();
        let envelope = Envelope {
            request_id: request_id.clone(),
            request,
            reply,
        };
        self.requests.send(envelope).await.map_err(|_| MachineError::Closed {
            filesystem_id: self.filesystem_id.to_string(),
        })?;
        Ok(PendingResponse::new(self.filesystem_id.clone(), request_id, name, rx))
    }

    /// Dispatch and wait for the response, bounded by `deadline` if given.
    pub async fn request(&self, request: Request, deadline: Option<Duration>) -> Result<Response, MachineError> {
        let pending = self.dispatch(request).await?;
        match deadline {
            Some(deadline) => pending.wait_timeout(deadline).await,
            None => pending.wait().await,
        }
    }

    pub fn status(&self) -> MachineStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> MachineState {
        self.status.borrow().state
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MachineStatus> {
        self.status.clone()
    }

    /// Wait until the machine reaches `state`, or `timeout` passes.
    pub async fn wait_for_state(&self, state: MachineState, timeout: Duration) -> Result<MachineStatus, MachineError> {
        let mut rx = self.status.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| s.state == state)).await;
        match waited {
            Ok(Ok(status)) => Ok(status.clone()),
            Ok(Err(_)) => Err(MachineError::Closed {
                filesystem_id: self.filesystem_id.to_string(),
            }),
            Err(_) => Err(MachineError::Timeout {
                filesystem_id: self.filesystem_id.to_string(),
                request: format!("wait for {state}"),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn subscribe_snapshots(&self) -> Subscription<SnapshotsChanged> {
        self.snapshots.subscribe()
    }

    /// What every node is known to hold, including this one.
    pub fn view(&self) -> PeerView {
        self.view.borrow().clone()
    }

    /// Record `node`'s reported history. Reports about this node itself are
    /// ignored; the machine maintains its own entry.
    pub fn update_peer_snapshots(&self, node: &NodeId, snapshots: Vec<Snapshot>) {
        if node == &self.node_id {
            return;
        }
        self.view.send_modify(|view| {
            view.insert(node.clone(), snapshots);
        });
    }

    pub fn remove_peer(&self, node: &NodeId) {
        if node == &self.node_id {
            return;
        }
        self.view.send_if_modified(|view| view.remove(node).is_some());
    }

    /// Latest progress record of the most recent transfer, if any.
    pub fn transfer(&self) -> Option<TransferPollResult> {
        self.transfer.borrow().clone()
    }

    pub fn subscribe_transfer(&self) -> watch::Receiver<Option<TransferPollResult>> {
        self.transfer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}
