//! Tablet cell bundle definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{ActionId, BundleId, CellHealth, CellId};

/// Name of the bundle created at bootstrap
pub const DEFAULT_BUNDLE_NAME: &str = "default";

/// Placement options shared by all cells of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletCellOptions {
    pub peer_count: usize,
    pub snapshot_account: String,
    pub changelog_account: String,
    pub node_tag_filter: Option<String>,
}

impl Default for TabletCellOptions {
    fn default() -> Self {
        Self {
            peer_count: 1,
            snapshot_account: "sys".to_string(),
            changelog_account: "sys".to_string(),
            node_tag_filter: None,
        }
    }
}

/// Named group of tablet cells
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletCellBundle {
    pub id: BundleId,
    pub name: String,
    pub options: TabletCellOptions,
    pub cells: BTreeSet<CellId>,
    pub actions: BTreeSet<ActionId>,
    /// In-flight (not finished) actions
    pub active_action_count: usize,
    pub health: CellHealth,
}

impl TabletCellBundle {
    pub fn new(id: BundleId, name: String, options: TabletCellOptions) -> Self {
        Self {
            id,
            name,
            options,
            cells: BTreeSet::new(),
            actions: BTreeSet::new(),
            active_action_count: 0,
            health: CellHealth::Good,
        }
    }

    pub fn increase_active_action_count(&mut self) {
        self.active_action_count += 1;
    }

    pub fn decrease_active_action_count(&mut self) {
        self.active_action_count = self.active_action_count.saturating_sub(1);
    }
}
