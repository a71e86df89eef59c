//! Filesystem creation and procurement.

use std::time::Duration;
use std::time::Instant;

use tracing::debug;
use tracing::info;
use tracing::instrument;
use volmesh_core::FilesystemId;
use volmesh_core::Principal;
use volmesh_core::RegistryEntry;
use volmesh_core::VolumeName;
use volmesh_core::VolumeRef;
use volmesh_core::constants::LATE_RESPONSE_DRAIN_MS;
use volmesh_fsm::MachineError;
use volmesh_fsm::MachineState;
use volmesh_fsm::Request;
use volmesh_fsm::Response;
use volmesh_registry::RegistryError;

use crate::coordinator::Coordinator;
use crate::error::ClusterError;
use crate::retry::RetryPolicy;

impl Coordinator {
    /// Create `name` with this node as its master.
    ///
    /// Safe to repeat after a crash between registering the name and
    /// claiming it: an ownerless registration is reused. The master claim is
    /// made before anything is created on disk.
    #[instrument(skip(self, principal), fields(user = %principal.user_id))]
    pub async fn create_filesystem(&self, principal: &Principal, name: &VolumeName) -> Result<FilesystemId, ClusterError> {
        let id = match self.registry.lookup_entry(name).await? {
            None => {
                let entry = RegistryEntry::new(FilesystemId::generate(), principal.user_id.clone());
                self.registry.register_filesystem(name, entry).await?.id
            }
            Some(entry) => match self.registry.current_master_node(&entry.id).await {
                Ok(master) => {
                    debug!(volume = %name, filesystem_id = %entry.id, %master, "volume already created");
                    return Err(ClusterError::AlreadyExists {
                        what: format!("volume {name}"),
                    });
                }
                Err(RegistryError::MasterUnknown { .. }) => {
                    info!(volume = %name, filesystem_id = %entry.id, "resuming interrupted creation");
                    entry.id
                }
                Err(e) => return Err(e.into()),
            },
        };

        self.registry.claim_master(&id, &self.node_id).await?;

        let response = self.dispatch_and_wait(&id, Request::Create).await?;
        match response {
            Response::Created => {
                info!(volume = %name, filesystem_id = %id, "created filesystem");
                Ok(id)
            }
            other => Err(ClusterError::from_response(id.as_str(), "create", other)),
        }
    }

    /// Make this node the master of `volume`, creating it if it does not
    /// exist yet, and return its id once it is active here.
    ///
    /// Transient failures are retried with backoff per the configured
    /// [`RetryPolicy`]; authorization and not-found failures are not.
    #[instrument(skip(self, principal), fields(user = %principal.user_id, volume = %volume.name))]
    pub async fn procure_filesystem(&self, principal: &Principal, volume: &VolumeRef) -> Result<FilesystemId, ClusterError> {
        let policy = RetryPolicy::from_config(&self.config);
        policy
            .run("procure", &self.cancel, move || self.procure_once(principal, volume))
            .await
    }

    async fn procure_once(&self, principal: &Principal, volume: &VolumeRef) -> Result<FilesystemId, ClusterError> {
        let id = match self.resolve(principal, volume, "procure").await {
            Ok((id, _)) => id,
            Err(ClusterError::NotFound { .. }) if volume.branch.is_none() => {
                match self.create_filesystem(principal, &volume.name).await {
                    Ok(id) => {
                        self.confirm_local_master(&id)?;
                        return Ok(id);
                    }
                    // Someone else created it first; procure theirs.
                    Err(ClusterError::AlreadyExists { .. }) => self.resolve(principal, volume, "procure").await?.0,
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let master = self.registry.current_master_node(&id).await?;
        if master == self.node_id {
            debug!(filesystem_id = %id, "already master here");
            let machine = self.init_filesystem_machine(&id);
            if machine.state() != MachineState::Active {
                self.await_active(&id, self.config.procure_timeout()).await?;
            }
            return Ok(id);
        }

        let deadline = Instant::now() + self.config.procure_timeout();
        info!(filesystem_id = %id, %master, "procuring filesystem");
        let pending = self
            .global_request(
                &id,
                Request::Move {
                    target: self.node_id.clone(),
                },
            )
            .await?;

        let timeout = self.config.procure_timeout();
        let response = match pending
            .wait_or_drain(timeout, Duration::from_millis(LATE_RESPONSE_DRAIN_MS))
            .await
        {
            Ok(response) => response,
            Err(MachineError::Timeout { .. }) => {
                return Err(ClusterError::ProcurementTimeout {
                    filesystem_id: id.to_string(),
                    timeout_ms: self.config.procure_timeout_ms,
                });
            }
            Err(e) => return Err(e.into()),
        };

        match response {
            Response::Moved { .. } => {}
            Response::Error { kind, message } => {
                return Err(ClusterError::ProcurementFailed {
                    filesystem_id: id.to_string(),
                    response: format!("error ({kind:?})"),
                    message,
                });
            }
            other => {
                return Err(ClusterError::ProcurementFailed {
                    filesystem_id: id.to_string(),
                    response: other.name().to_string(),
                    message: "expected moved".into(),
                });
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.await_active(&id, remaining).await?;
        self.confirm_local_master(&id)?;
        info!(filesystem_id = %id, from = %master, "procured filesystem");
        Ok(id)
    }

    /// Activate the local machine for `id` and wait until it is active.
    ///
    /// The watch loop activates it too on seeing the new master; activation
    /// is idempotent.
    async fn await_active(&self, id: &FilesystemId, within: Duration) -> Result<(), ClusterError> {
        let machine = self.init_filesystem_machine(id);
        if machine.state() == MachineState::Active {
            return Ok(());
        }
        let activation = machine.dispatch(Request::Activate).await?;
        let waited = machine.wait_for_state(MachineState::Active, within).await;
        match waited {
            Ok(_) => Ok(()),
            Err(MachineError::Timeout { .. }) => {
                // Surface the activation failure if that is why.
                if let Ok(Ok(response @ Response::Error { .. })) =
                    tokio::time::timeout(Duration::ZERO, activation.wait()).await
                {
                    return Err(ClusterError::from_response(id.as_str(), "activate", response));
                }
                Err(ClusterError::ProcurementTimeout {
                    filesystem_id: id.to_string(),
                    timeout_ms: within.as_millis() as u64,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The cache must agree with the store that this node is master.
    fn confirm_local_master(&self, id: &FilesystemId) -> Result<(), ClusterError> {
        match self.registry.cached_master_node(id) {
            Some(node) if node == self.node_id => Ok(()),
            other => Err(ClusterError::CasConflict {
                filesystem_id: id.to_string(),
                message: format!("master moved to {other:?} during procurement"),
            }),
        }
    }
}
