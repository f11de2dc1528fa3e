//! Dynamic table mirror
//!
//! The namespace layer owns tables; this is the subset of table state the
//! tablet manager reads and maintains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{
    BundleId, CellTag, ChunkListId, DataStatistics, InMemoryMode, ReplicaId, TableId,
    TabletId, TabletResourceUsage, TabletState,
};

/// Aggregate tablet state of a whole table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableTabletState {
    Unmounted,
    Mounted,
    Frozen,
    Transient,
    Mixed,
}

impl Default for TableTabletState {
    fn default() -> Self {
        Self::Unmounted
    }
}

impl std::fmt::Display for TableTabletState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableTabletState::Unmounted => write!(f, "unmounted"),
            TableTabletState::Mounted => write!(f, "mounted"),
            TableTabletState::Frozen => write!(f, "frozen"),
            TableTabletState::Transient => write!(f, "transient"),
            TableTabletState::Mixed => write!(f, "mixed"),
        }
    }
}

/// Mount settings shipped with every mount/remount request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMountConfig {
    pub in_memory_mode: InMemoryMode,
    /// Opaque tablet node settings passed through verbatim
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Dynamic table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableNode {
    pub id: TableId,
    pub path: String,
    pub dynamic: bool,
    pub sorted: bool,
    pub replicated: bool,
    pub key_column_count: usize,
    pub bundle: Option<BundleId>,
    /// Master cell that owns the table's namespace node
    pub native_cell_tag: CellTag,
    pub tablets: Vec<TabletId>,
    pub chunk_list: ChunkListId,
    pub mount_config: TableMountConfig,
    pub actual_tablet_state: TableTabletState,
    pub expected_tablet_state: TableTabletState,
    pub tablet_count_by_state: BTreeMap<TabletState, i64>,
    pub tablet_count_by_expected_state: BTreeMap<TabletState, i64>,
    pub snapshot_statistics: DataStatistics,
    pub external_tablet_resource_usage: TabletResourceUsage,
    pub modification_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
    pub last_commit_timestamp: u64,
    pub replicas: BTreeSet<ReplicaId>,
}

impl TableNode {
    pub fn count_in_state(&self, state: TabletState) -> i64 {
        self.tablet_count_by_state.get(&state).copied().unwrap_or(0)
    }

    pub fn count_in_expected_state(&self, state: TabletState) -> i64 {
        self.tablet_count_by_expected_state
            .get(&state)
            .copied()
            .unwrap_or(0)
    }

    /// Whether rows are physically ordered by key (replicated sorted tables are not)
    pub fn is_physically_sorted(&self) -> bool {
        self.sorted && !self.replicated
    }

    pub fn compute_actual_tablet_state(&self) -> TableTabletState {
        let total = self.tablets.len() as i64;
        if self.count_in_state(TabletState::Unmounted) == total {
            return TableTabletState::Unmounted;
        }
        if self.count_in_state(TabletState::Mounted) == total {
            return TableTabletState::Mounted;
        }
        if self.count_in_state(TabletState::Frozen) == total {
            return TableTabletState::Frozen;
        }
        let transient: i64 = TabletState::ALL
            .iter()
            .filter(|state| state.is_transient())
            .map(|state| self.count_in_state(*state))
            .sum();
        if transient > 0 {
            TableTabletState::Transient
        } else {
            TableTabletState::Mixed
        }
    }
}
