//! Lifecycle states of a filesystem state machine.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Inspecting the local store; no events are processed yet.
    Discovering,
    /// Present (or expected) locally but mastered elsewhere, or not yet created.
    Inactive,
    /// Mastered and mounted here.
    Active,
    /// Applying an inbound snapshot stream.
    Receiving,
    /// Sending history to a peer.
    Pushing,
    /// Handing mastership to another node.
    Moving,
    /// Cloning, rolling back or stashing.
    Cloning,
    /// Destroyed locally. Terminal.
    Deleted,
}

impl MachineState {
    pub fn as_str(self) -> &'static str {
        match self {
            MachineState::Discovering => "discovering",
            MachineState::Inactive => "inactive",
            MachineState::Active => "active",
            MachineState::Receiving => "receiving",
            MachineState::Pushing => "pushing",
            MachineState::Moving => "moving",
            MachineState::Cloning => "cloning",
            MachineState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub state: MachineState,
    pub status: String,
    pub transitioned_at_ms: u64,
}
