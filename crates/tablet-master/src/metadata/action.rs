//! Tablet action definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActionId, BundleId, CellId, Key, TabletId};
use crate::error::{ErrorCode, TabletError};

/// Tablet action kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletActionKind {
    Move,
    Reshard,
}

impl std::fmt::Display for TabletActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TabletActionKind::Move => write!(f, "move"),
            TabletActionKind::Reshard => write!(f, "reshard"),
        }
    }
}

/// Tablet action state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletActionState {
    Preparing,
    Freezing,
    Frozen,
    Unmounting,
    Unmounted,
    Orphaned,
    Mounting,
    Mounted,
    Completed,
    Failing,
    Failed,
}

impl std::fmt::Display for TabletActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TabletActionState::Preparing => write!(f, "preparing"),
            TabletActionState::Freezing => write!(f, "freezing"),
            TabletActionState::Frozen => write!(f, "frozen"),
            TabletActionState::Unmounting => write!(f, "unmounting"),
            TabletActionState::Unmounted => write!(f, "unmounted"),
            TabletActionState::Orphaned => write!(f, "orphaned"),
            TabletActionState::Mounting => write!(f, "mounting"),
            TabletActionState::Mounted => write!(f, "mounted"),
            TabletActionState::Completed => write!(f, "completed"),
            TabletActionState::Failing => write!(f, "failing"),
            TabletActionState::Failed => write!(f, "failed"),
        }
    }
}

/// Error recorded on a tablet action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<TabletError> for ActionError {
    fn from(err: TabletError) -> Self {
        Self {
            code: err.code,
            message: err.message,
        }
    }
}

/// Automated move or reshard over a set of tablets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletAction {
    pub id: ActionId,
    pub kind: TabletActionKind,
    pub state: TabletActionState,
    pub tablets: Vec<TabletId>,
    /// Pinned destination cells; empty means "let the master choose"
    pub cells: Vec<CellId>,
    pub pivot_keys: Vec<Key>,
    pub tablet_count: Option<usize>,
    pub skip_freezing: bool,
    /// Whether tablets are mounted frozen at the end
    pub freeze: bool,
    pub error: Option<ActionError>,
    pub keep_finished: bool,
    pub correlation_id: Option<String>,
    pub expiration_time: DateTime<Utc>,
    pub bundle: Option<BundleId>,
}

impl TabletAction {
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            TabletActionState::Completed | TabletActionState::Failed
        )
    }
}

impl std::fmt::Display for TabletAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ActionId: {}, State: {}, Kind: {}, SkipFreezing: {}, Freeze: {}, TabletCount: {:?}, Tablets: {:?}, Cells: {:?}, PivotKeys: [",
            self.id,
            self.state,
            self.kind,
            self.skip_freezing,
            self.freeze,
            self.tablet_count,
            self.tablets.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            self.cells.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
        )?;
        for (index, key) in self.pivot_keys.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", key)?;
        }
        write!(f, "], KeepFinished: {}", self.keep_finished)
    }
}
