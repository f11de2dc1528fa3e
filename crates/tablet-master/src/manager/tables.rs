//! Table mirror maintenance: creation, removal, chunk ingestion

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TabletManager;
use crate::error::{ErrorCode, Result, TabletError};
use crate::metadata::{
    BundleId, CellTag, ChunkId, ChunkListKind, ChunkSpec, ChunkTree, Key, TableId,
    TableMountConfig, TableNode, TableTabletState, TabletState, TabletResourceUsage,
};

/// Parameters of a new dynamic table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTableOptions {
    pub path: String,
    #[serde(default = "default_true")]
    pub dynamic: bool,
    #[serde(default = "default_true")]
    pub sorted: bool,
    #[serde(default)]
    pub replicated: bool,
    #[serde(default = "default_key_column_count")]
    pub key_column_count: usize,
    /// Defaults to the builtin bundle
    #[serde(default)]
    pub bundle_id: Option<BundleId>,
    /// Initial tablet count; ignored when pivot keys are given
    #[serde(default = "default_tablet_count")]
    pub tablet_count: usize,
    #[serde(default)]
    pub pivot_keys: Vec<Key>,
    #[serde(default)]
    pub mount_config: TableMountConfig,
    /// Defaults to this master cell
    #[serde(default)]
    pub native_cell_tag: Option<CellTag>,
}

fn default_true() -> bool {
    true
}

fn default_key_column_count() -> usize {
    1
}

fn default_tablet_count() -> usize {
    1
}

impl CreateTableOptions {
    pub fn sorted(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            dynamic: true,
            sorted: true,
            replicated: false,
            key_column_count: 1,
            bundle_id: None,
            tablet_count: 1,
            pivot_keys: Vec::new(),
            mount_config: TableMountConfig::default(),
            native_cell_tag: None,
        }
    }

    pub fn ordered(path: impl Into<String>, tablet_count: usize) -> Self {
        Self {
            sorted: false,
            key_column_count: 0,
            tablet_count,
            ..Self::sorted(path)
        }
    }
}

impl TabletManager {
    pub fn create_table(&mut self, options: CreateTableOptions) -> Result<TableId> {
        let bundle_id = match options.bundle_id.or(self.default_bundle) {
            Some(bundle_id) => bundle_id,
            None => return Err(TabletError::internal("No default tablet cell bundle")),
        };
        self.get_bundle_or_err(bundle_id)?;

        if options.path.is_empty() {
            return Err(TabletError::new(ErrorCode::InvalidName, "Table path cannot be empty"));
        }

        let pivot_keys = if options.sorted && !options.pivot_keys.is_empty() {
            self.validate_initial_pivot_keys(&options.pivot_keys, options.key_column_count)?;
            options.pivot_keys.clone()
        } else if options.sorted {
            if options.tablet_count != 1 {
                return Err(TabletError::invalid_pivots(
                    "Pivot keys must be provided to create a sorted table with several tablets",
                ));
            }
            vec![Key::empty()]
        } else {
            vec![Key::empty(); options.tablet_count]
        };
        if pivot_keys.is_empty() || pivot_keys.len() > self.config.max_tablet_count {
            return Err(TabletError::new(
                ErrorCode::TooManyTablets,
                format!(
                    "Tablet count must be in range [1, {}]",
                    self.config.max_tablet_count
                ),
            ));
        }
        if options.replicated && !options.sorted {
            return Err(TabletError::new(
                ErrorCode::InvalidTableType,
                "Replicated tables must be sorted",
            ));
        }

        let (root_kind, tablet_kind) = if options.sorted {
            (ChunkListKind::SortedDynamicRoot, ChunkListKind::SortedDynamicTablet)
        } else {
            (ChunkListKind::OrderedDynamicRoot, ChunkListKind::OrderedDynamicTablet)
        };
        let root = self.chunks.create_chunk_list(root_kind);
        self.chunks.ref_tree(ChunkTree::ChunkList(root));

        let id: TableId = self.ids.generate(self.cell_tag);
        let now = self.now();
        self.tables.insert(
            id,
            TableNode {
                id,
                path: options.path.clone(),
                dynamic: options.dynamic,
                sorted: options.sorted,
                replicated: options.replicated,
                key_column_count: options.key_column_count,
                bundle: Some(bundle_id),
                native_cell_tag: options.native_cell_tag.unwrap_or(self.cell_tag),
                tablets: Vec::new(),
                chunk_list: root,
                mount_config: options.mount_config,
                actual_tablet_state: TableTabletState::Unmounted,
                expected_tablet_state: TableTabletState::Unmounted,
                tablet_count_by_state: Default::default(),
                tablet_count_by_expected_state: Default::default(),
                snapshot_statistics: Default::default(),
                external_tablet_resource_usage: Default::default(),
                modification_time: now,
                access_time: now,
                last_commit_timestamp: 0,
                replicas: Default::default(),
            },
        );

        for (index, pivot_key) in pivot_keys.into_iter().enumerate() {
            let tablet_id = self.create_tablet(id);
            let list = self.chunks.create_chunk_list(tablet_kind);
            self.chunks.set_pivot_key(list, pivot_key.clone());
            self.chunks.attach(root, ChunkTree::ChunkList(list));
            if let Some(tablet) = self.tablets.get_mut(&tablet_id) {
                tablet.index = index;
                tablet.pivot_key = pivot_key;
            }
            if let Some(table) = self.tables.get_mut(&id) {
                table.tablets.push(tablet_id);
            }
        }
        self.update_tablet_state(id);

        log_unless_recovery!(self, info, table_id = %id, path = %options.path, sorted = options.sorted, "Table created");
        Ok(id)
    }

    fn validate_initial_pivot_keys(&self, pivot_keys: &[Key], key_column_count: usize) -> Result<()> {
        if pivot_keys.first().map(|key| !key.is_empty()).unwrap_or(true) {
            return Err(TabletError::invalid_pivots("First pivot key must be empty"));
        }
        for key in pivot_keys {
            key.validate_pivot(key_column_count)
                .map_err(TabletError::invalid_pivots)?;
        }
        for pair in pivot_keys.windows(2) {
            if pair[0] >= pair[1] {
                return Err(TabletError::invalid_pivots(
                    "Pivot keys must be strictly increasing",
                ));
            }
        }
        Ok(())
    }

    pub fn destroy_table(&mut self, table_id: TableId) -> Result<()> {
        let table = self.get_table_or_err(table_id)?;
        if let Some(tablet) = table
            .tablets
            .iter()
            .filter_map(|id| self.tablets.get(id))
            .find(|tablet| tablet.state != TabletState::Unmounted)
        {
            return Err(TabletError::invalid_state(format!(
                "Cannot remove table {} since tablet {} is in \"{}\" state",
                table_id, tablet.id, tablet.state
            )));
        }

        let tablet_count = table.tablets.len();
        if tablet_count > 0 {
            self.touch_affected_tablet_actions(table_id, 0, tablet_count - 1, "remove_table");
        }

        let table = match self.tables.get(&table_id) {
            Some(table) => table,
            None => return Ok(()),
        };
        let tablet_ids = table.tablets.clone();
        let replica_ids: Vec<_> = table.replicas.iter().copied().collect();
        let root = table.chunk_list;

        for tablet_id in tablet_ids {
            self.destroy_tablet(tablet_id);
        }
        for replica_id in replica_ids {
            self.replicas.remove(&replica_id);
        }
        self.chunks.unref_tree(ChunkTree::ChunkList(root));
        self.table_statistics_queue.remove(&table_id);
        self.tables.remove(&table_id);

        log_unless_recovery!(self, info, table_id = %table_id, "Table destroyed");
        Ok(())
    }

    /// Append chunks to one tablet of a table
    pub fn attach_chunks(
        &mut self,
        table_id: TableId,
        tablet_index: usize,
        specs: Vec<ChunkSpec>,
    ) -> Result<Vec<ChunkId>> {
        let table = self.get_table_or_err(table_id)?;
        let tablet_id = match table.tablets.get(tablet_index) {
            Some(tablet_id) => *tablet_id,
            None => {
                return Err(TabletError::invalid_range(format!(
                    "Tablet index {} is out of range [0, {})",
                    tablet_index,
                    table.tablets.len()
                )))
            }
        };

        if table.sorted {
            let tablet = self.get_tablet_or_err(tablet_id)?;
            let next_pivot_key = table
                .tablets
                .get(tablet_index + 1)
                .and_then(|id| self.tablets.get(id))
                .map(|next| next.pivot_key.clone())
                .unwrap_or_else(Key::max);
            for spec in &specs {
                if spec.min_key > spec.max_key
                    || spec.min_key < tablet.pivot_key
                    || spec.max_key >= next_pivot_key
                {
                    return Err(TabletError::invalid_pivots(format!(
                        "Chunk keys [{}, {}] are out of tablet {} range [{}, {})",
                        spec.min_key, spec.max_key, tablet_id, tablet.pivot_key, next_pivot_key
                    )));
                }
            }
        }

        self.copy_chunk_list_if_shared(table_id, tablet_index, tablet_index);

        let cell_id = self.tablets.get(&tablet_id).and_then(|tablet| tablet.cell);
        let old_statistics = self.tablet_statistics_by_id(tablet_id);

        let list = match self
            .tables
            .get(&table_id)
            .and_then(|table| self.chunks.tablet_lists(table.chunk_list).get(tablet_index).copied())
        {
            Some(list) => list,
            None => return Err(TabletError::internal("Tablet chunk list is missing")),
        };
        let mut chunk_ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let chunk_id = self.chunks.create_chunk(spec);
            self.chunks.attach(list, ChunkTree::Chunk(chunk_id));
            chunk_ids.push(chunk_id);
        }

        if let Some(cell) = cell_id.and_then(|id| self.cells.get(&id)) {
            let cell_id = cell.id;
            let new_statistics = self.tablet_statistics_by_id(tablet_id);
            if let Some(cell) = self.cells.get_mut(&cell_id) {
                cell.local_statistics -= &old_statistics;
                cell.local_statistics += &new_statistics;
            }
        }

        self.refresh_table_data_statistics(table_id);
        if let Some(table) = self.tables.get_mut(&table_id) {
            table.modification_time = table.modification_time.max(self.ctx.timestamp);
        }
        self.schedule_table_statistics_update(table_id, true, false);

        log_unless_recovery!(self, debug, table_id = %table_id, tablet_id = %tablet_id, chunk_count = chunk_ids.len(), "Chunks attached");
        Ok(chunk_ids)
    }

    pub fn set_table_statistics(
        &mut self,
        table_id: TableId,
        modification_time: Option<DateTime<Utc>>,
        access_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.get_table_or_err(table_id)?;
        if let Some(table) = self.tables.get_mut(&table_id) {
            if let Some(time) = modification_time {
                table.modification_time = table.modification_time.max(time);
            }
            if let Some(time) = access_time {
                table.access_time = table.access_time.max(time);
            }
        }
        self.schedule_table_statistics_update(table_id, false, false);
        Ok(())
    }

    pub(super) fn refresh_table_data_statistics(&mut self, table_id: TableId) {
        let statistics = match self.tables.get(&table_id) {
            Some(table) => self.chunks.list_statistics(table.chunk_list).to_data_statistics(),
            None => return,
        };
        if let Some(table) = self.tables.get_mut(&table_id) {
            table.snapshot_statistics = statistics;
        }
    }

    /// Tablet count and static memory charged to a table
    pub fn table_tablet_resource_usage(&self, table_id: TableId) -> TabletResourceUsage {
        let table = match self.tables.get(&table_id) {
            Some(table) => table,
            None => return TabletResourceUsage::default(),
        };
        let tablet_static_memory = table
            .tablets
            .iter()
            .filter_map(|id| self.tablets.get(id))
            .filter(|tablet| tablet.is_active())
            .map(|tablet| self.tablet_statistics(tablet).memory_size)
            .sum();
        TabletResourceUsage {
            tablet_count: table.tablets.len() as i64,
            tablet_static_memory,
        }
    }
}
