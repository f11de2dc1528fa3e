//! Table replica definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{ReplicaId, TableId, TabletId};

/// Replica state, tracked both per replica and per tablet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaState {
    None,
    Disabled,
    Disabling,
    Enabled,
    Enabling,
}

impl Default for ReplicaState {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaState::None => write!(f, "none"),
            ReplicaState::Disabled => write!(f, "disabled"),
            ReplicaState::Disabling => write!(f, "disabling"),
            ReplicaState::Enabled => write!(f, "enabled"),
            ReplicaState::Enabling => write!(f, "enabling"),
        }
    }
}

/// Replication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaMode {
    Sync,
    Async,
}

impl Default for ReplicaMode {
    fn default() -> Self {
        Self::Async
    }
}

/// Transaction atomicity of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atomicity {
    Full,
    None,
}

impl Default for Atomicity {
    fn default() -> Self {
        Self::Full
    }
}

/// One external replica of a replicated table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReplica {
    pub id: ReplicaId,
    pub table: Option<TableId>,
    pub cluster_name: String,
    pub replica_path: String,
    pub mode: ReplicaMode,
    pub atomicity: Atomicity,
    pub preserve_timestamps: bool,
    pub start_replication_timestamp: u64,
    pub state: ReplicaState,
    /// Tablets with an outstanding enable/disable handshake
    pub transitioning_tablets: BTreeSet<TabletId>,
}

impl TableReplica {
    pub fn is_transitioning(&self) -> bool {
        !self.transitioning_tablets.is_empty()
    }
}
