//! Tablet definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    ActionId, CellId, Key, ReplicaId, ReplicaState, TableId, TabletId, TabletNodeStatistics,
};

/// Tablet lifecycle state
///
/// ```text
/// Unmounted -> Mounting | FrozenMounting -> Mounted | Frozen
/// Mounted -> Freezing -> Frozen -> Unfreezing -> Mounted
/// Mounted | Frozen | Freezing -> Unmounting -> Unmounted
/// ```
///
/// Forced unmount may additionally leave any transient mount state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TabletState {
    Unmounted,
    Mounting,
    FrozenMounting,
    Mounted,
    Freezing,
    Frozen,
    Unfreezing,
    Unmounting,
}

impl TabletState {
    pub const ALL: [TabletState; 8] = [
        TabletState::Unmounted,
        TabletState::Mounting,
        TabletState::FrozenMounting,
        TabletState::Mounted,
        TabletState::Freezing,
        TabletState::Frozen,
        TabletState::Unfreezing,
        TabletState::Unmounting,
    ];

    /// Whether a completion from the hosting cell is still expected
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TabletState::Mounting
                | TabletState::FrozenMounting
                | TabletState::Freezing
                | TabletState::Unfreezing
                | TabletState::Unmounting
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, next: TabletState) -> bool {
        use TabletState::*;
        matches!(
            (self, next),
            (Unmounted, Mounting)
                | (Unmounted, FrozenMounting)
                | (Mounting, Mounted)
                | (Mounting, Frozen)
                | (FrozenMounting, Frozen)
                | (FrozenMounting, Mounted)
                | (Mounted, Freezing)
                | (Freezing, Frozen)
                | (Frozen, Unfreezing)
                | (Unfreezing, Mounted)
                | (Mounted, Unmounting)
                | (Frozen, Unmounting)
                | (Freezing, Unmounting)
                | (Mounting, Unmounting)
                | (FrozenMounting, Unmounting)
                | (Unfreezing, Unmounting)
                | (Unmounting, Unmounting)
                | (Unmounting, Unmounted)
        )
    }
}

impl Default for TabletState {
    fn default() -> Self {
        Self::Unmounted
    }
}

impl std::fmt::Display for TabletState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TabletState::Unmounted => write!(f, "unmounted"),
            TabletState::Mounting => write!(f, "mounting"),
            TabletState::FrozenMounting => write!(f, "frozen_mounting"),
            TabletState::Mounted => write!(f, "mounted"),
            TabletState::Freezing => write!(f, "freezing"),
            TabletState::Frozen => write!(f, "frozen"),
            TabletState::Unfreezing => write!(f, "unfreezing"),
            TabletState::Unmounting => write!(f, "unmounting"),
        }
    }
}

/// In-memory mode of a mounted tablet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InMemoryMode {
    None,
    Compressed,
    Uncompressed,
}

impl Default for InMemoryMode {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for InMemoryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InMemoryMode::None => write!(f, "none"),
            InMemoryMode::Compressed => write!(f, "compressed"),
            InMemoryMode::Uncompressed => write!(f, "uncompressed"),
        }
    }
}

/// Per-tablet view of one table replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReplicaInfo {
    pub state: ReplicaState,
    pub current_replication_row_index: i64,
    pub current_replication_timestamp: u64,
    pub error: Option<String>,
}

/// Tablet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tablet {
    pub id: TabletId,
    /// Owning table; cleared once the tablet is dropped by a reshard
    pub table: Option<TableId>,
    /// Position within the owning table
    pub index: usize,
    /// Hosting cell; `None` exactly when unmounted
    pub cell: Option<CellId>,
    /// Inclusive lower bound (sorted tables only)
    pub pivot_key: Key,
    pub state: TabletState,
    pub expected_state: TabletState,
    pub mount_revision: u64,
    pub in_memory_mode: InMemoryMode,
    pub replicas: BTreeMap<ReplicaId, TableReplicaInfo>,
    pub action: Option<ActionId>,
    pub trimmed_row_count: i64,
    pub retained_timestamp: u64,
    pub node_statistics: TabletNodeStatistics,
}

impl Tablet {
    pub fn new(id: TabletId, table: TableId) -> Self {
        Self {
            id,
            table: Some(table),
            index: 0,
            cell: None,
            pivot_key: Key::empty(),
            state: TabletState::Unmounted,
            expected_state: TabletState::Unmounted,
            mount_revision: 0,
            in_memory_mode: InMemoryMode::None,
            replicas: BTreeMap::new(),
            action: None,
            trimmed_row_count: 0,
            retained_timestamp: 0,
            node_statistics: TabletNodeStatistics::default(),
        }
    }

    /// Whether the tablet is mounted (or on its way) and may receive messages
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            TabletState::Mounting
                | TabletState::FrozenMounting
                | TabletState::Mounted
                | TabletState::Freezing
                | TabletState::Frozen
                | TabletState::Unfreezing
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_graph() {
        assert!(TabletState::Unmounted.can_transition_to(TabletState::Mounting));
        assert!(TabletState::Frozen.can_transition_to(TabletState::Unmounting));
        assert!(!TabletState::Unmounted.can_transition_to(TabletState::Frozen));
        assert!(!TabletState::Mounted.can_transition_to(TabletState::Unmounted));
        assert!(TabletState::Unmounting.is_transient());
        assert!(!TabletState::Frozen.is_transient());
    }

    #[test]
    fn test_new_tablet_is_unmounted() {
        let tablet = Tablet::new(TabletId(1), TableId(2));
        assert_eq!(tablet.state, TabletState::Unmounted);
        assert!(tablet.cell.is_none());
        assert!(!tablet.is_active());
        assert_eq!(tablet.state.to_string(), "unmounted");
    }
}
