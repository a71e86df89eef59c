//! Cluster-wide request routing.
//!
//! A request for a filesystem mastered elsewhere is written to
//! `requests/<id>/<requestId>`. The master's routing loop dispatches it to
//! its local machine and writes the answer to `responses/<requestId>`, which
//! the requester is already watching.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::instrument;
use tracing::warn;
use volmesh_core::DeleteRequest;
use volmesh_core::FilesystemId;
use volmesh_core::KeyValueStore;
use volmesh_core::NodeId;
use volmesh_core::ReadRequest;
use volmesh_core::ScanRequest;
use volmesh_core::WatchNotification;
use volmesh_core::WatchSubscription;
use volmesh_core::now_unix_ms;
use volmesh_core::constants::LATE_RESPONSE_DRAIN_MS;
use volmesh_fsm::ErrorKind;
use volmesh_fsm::PendingResponse;
use volmesh_fsm::Request;
use volmesh_fsm::Response;
use volmesh_fsm::new_request_id;
use volmesh_registry::KeyKind;

use crate::coordinator::Coordinator;
use crate::error::ClusterError;

/// A request forwarded to the master of a filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedRequest {
    pub from: NodeId,
    pub request: Request,
    /// When the requester wrote it. Older than the drain window means
    /// nobody is waiting any more.
    #[serde(default)]
    pub issued_at_ms: u64,
}

impl RoutedRequest {
    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.issued_at_ms) > LATE_RESPONSE_DRAIN_MS
    }
}

/// Counts a remote waiter for as long as it lives.
struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Coordinator {
    /// Send `request` to whichever node masters `id`.
    ///
    /// Dispatches locally when that is this node. Otherwise the response is
    /// awaited in the background for up to the late-response drain window,
    /// whether or not the caller is still listening, and its record is
    /// removed once read.
    #[instrument(skip(self, request), fields(request = request.name()))]
    pub async fn global_request(&self, id: &FilesystemId, request: Request) -> Result<PendingResponse, ClusterError> {
        if self.cancel.is_cancelled() {
            return Err(ClusterError::ShuttingDown);
        }
        let master = self.registry.current_master_node(id).await?;
        if master == self.node_id {
            return self.dispatch(id, request).await;
        }

        let request_id = new_request_id();
        let name = request.name();
        let response_key = self.keys().response(&request_id);
        let mut responses = self.kv.watch(&response_key).await?;
        let routed = RoutedRequest {
            from: self.node_id.clone(),
            request,
            issued_at_ms: now_unix_ms(),
        };
        let request_key = self.keys().request(id, &request_id);
        self.registry.write_json(&request_key, &routed).await?;
        debug!(filesystem_id = %id, %master, %request_id, request = name, "routed request to master");

        let (tx, rx) = oneshot::channel();
        let guard = PendingGuard::new(self.pending_remote_requests.clone());
        let kv = self.kv.clone();
        let cancel = self.cancel.clone();
        let fs = id.clone();
        let rid = request_id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let bound = Duration::from_millis(LATE_RESPONSE_DRAIN_MS);
            match tokio::time::timeout(bound, next_response(&kv, &response_key, &mut responses, &cancel)).await {
                Ok(Some(response)) => {
                    if tx.send(response).is_err() {
                        debug!(filesystem_id = %fs, request_id = %rid, "response arrived after the caller left");
                    }
                }
                Ok(None) => debug!(filesystem_id = %fs, request_id = %rid, "stopped waiting for response"),
                Err(_) => warn!(filesystem_id = %fs, request_id = %rid, "no response within the drain window"),
            }
            // The master removes the request when it answers. One that never
            // answered would otherwise be served by a later master.
            for key in [&request_key, &response_key] {
                if let Err(e) = kv.delete(DeleteRequest::new(key)).await {
                    debug!(%key, error = %e, "could not remove routed record");
                }
            }
        });

        Ok(PendingResponse::new(id.clone(), request_id, name, rx))
    }

    pub(crate) async fn run_routing_loop(self: Arc<Self>, mut requests: WatchSubscription) {
        debug!(node_id = %self.node_id, "request routing loop started");
        if let Err(e) = self.scan_routed_requests().await {
            warn!(error = %e, "initial scan of routed requests failed");
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                notification = requests.next() => match notification {
                    Some(WatchNotification::Event(event)) => {
                        if let Some(value) = event.value {
                            self.accept_routed(&event.key, value);
                        }
                    }
                    Some(WatchNotification::Lagged { missed }) => {
                        warn!(missed, "request watch lagged, rescanning");
                        if let Err(e) = self.scan_routed_requests().await {
                            warn!(error = %e, "rescan of routed requests failed");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(node_id = %self.node_id, "request routing loop stopped");
    }

    async fn scan_routed_requests(self: &Arc<Self>) -> Result<(), ClusterError> {
        for entry in self.kv.scan_all(ScanRequest::prefix(self.keys().requests_prefix())).await? {
            self.accept_routed(&entry.key, entry.value);
        }
        Ok(())
    }

    fn accept_routed(self: &Arc<Self>, key: &str, value: String) {
        let Some(KeyKind::Request {
            filesystem_id,
            request_id,
        }) = self.keys().parse(key)
        else {
            return;
        };
        if !self.routed_in_flight.lock().insert(request_id.clone()) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.serve_routed(&filesystem_id, &request_id, &value).await;
            this.routed_in_flight.lock().remove(&request_id);
        });
    }

    /// Serve one routed request if this node masters its filesystem.
    async fn serve_routed(&self, id: &FilesystemId, request_id: &str, value: &str) {
        match self.registry.current_master_node(id).await {
            Ok(master) if master == self.node_id => {}
            Ok(_) => return,
            Err(e) => {
                debug!(filesystem_id = %id, request_id, error = %e, "not serving routed request");
                return;
            }
        }

        let response = match serde_json::from_str::<RoutedRequest>(value) {
            Ok(routed) if routed.is_stale(now_unix_ms()) => {
                warn!(filesystem_id = %id, request_id, from = %routed.from, request = routed.request.name(), "dropping stale routed request");
                if let Err(e) = self.kv.delete(DeleteRequest::new(self.keys().request(id, request_id))).await {
                    debug!(filesystem_id = %id, request_id, error = %e, "could not remove request record");
                }
                return;
            }
            Ok(routed) => {
                debug!(filesystem_id = %id, request_id, from = %routed.from, request = routed.request.name(), "serving routed request");
                match self.dispatch_and_wait(id, routed.request).await {
                    Ok(response) => response,
                    Err(e) => Response::Error {
                        kind: ErrorKind::Transport,
                        message: e.to_string(),
                    },
                }
            }
            Err(e) => {
                warn!(filesystem_id = %id, request_id, error = %e, "unreadable routed request");
                Response::Error {
                    kind: ErrorKind::Transport,
                    message: format!("unreadable request: {e}"),
                }
            }
        };

        if let Err(e) = self.registry.write_json(&self.keys().response(request_id), &response).await {
            warn!(filesystem_id = %id, request_id, error = %e, "failed to write routed response");
            return;
        }
        if let Err(e) = self.kv.delete(DeleteRequest::new(self.keys().request(id, request_id))).await {
            debug!(filesystem_id = %id, request_id, error = %e, "could not remove request record");
        }
    }
}

/// Wait for the record at `key`. `None` if the watch ends or `cancel` fires.
async fn next_response(
    kv: &Arc<dyn KeyValueStore>,
    key: &str,
    responses: &mut WatchSubscription,
    cancel: &CancellationToken,
) -> Option<Response> {
    loop {
        let value = tokio::select! {
            _ = cancel.cancelled() => return None,
            notification = responses.next() => match notification {
                Some(WatchNotification::Event(event)) if event.key == key => event.value,
                Some(WatchNotification::Event(_)) => None,
                Some(WatchNotification::Lagged { .. }) => match kv.read(ReadRequest::new(key)).await {
                    Ok(result) => result.kv.map(|kv| kv.value),
                    Err(e) => {
                        debug!(%key, error = %e, "read after lag failed");
                        None
                    }
                },
                None => return None,
            },
        };
        let Some(value) = value else {
            continue;
        };
        return Some(serde_json::from_str(&value).unwrap_or_else(|e| Response::Error {
            kind: ErrorKind::Transport,
            message: format!("unreadable response: {e}"),
        }));
    }
}
