//! Tablet manager
//!
//! Owns bundles, cells, tablets, replicas and tablet actions together with
//! the table and chunk tree mirrors they operate on. All methods run on the
//! automaton task; nothing here is shared across threads.
//!
//! Operations come in two flavors. `prepare_*` methods only validate and
//! never mutate, so a failing request leaves no trace. The matching commit
//! methods call them first and then mutate state and post messages to the
//! hosting cells. Completions from cells re-enter as `on_*` methods.

/// Log unless the manager is replaying mutations
macro_rules! log_unless_recovery {
    ($manager:expr, $level:ident, $($arg:tt)+) => {
        if !$manager.recovery {
            tracing::$level!($($arg)+);
        }
    };
}

mod actions;
mod bundles;
mod gossip;
mod heartbeat;
mod mount;
mod replicas;
mod reshard;
mod snapshot;
mod tables;
#[cfg(test)]
pub(crate) mod testing;

pub use actions::CreateTabletActionRequest;
pub use heartbeat::{
    HeartbeatRequest, HeartbeatResponse, ReplicaReport, SlotReport, SlotToConfigure, SlotToCreate,
    TabletReport, TabletSlot,
};
pub use snapshot::{snapshot_threshold_id, TabletManagerSnapshot, SNAPSHOT_VERSION};
pub use tables::CreateTableOptions;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use tracing::error;

use crate::config::{MasterConfig, TabletManagerConfig};
use crate::error::{ErrorCode, Result, TabletError};
use crate::hive::HiveManager;
use crate::metadata::{
    ActionId, BundleId, CellHealth, CellId, CellTag, ChunkListId, ChunkStore, IdGenerator,
    InMemoryMode, PeerId, ReplicaId, TableId, TableNode, TableReplica, TableStatisticsUpdate,
    TableTabletState, Tablet, TabletAction, TabletCell, TabletCellBundle, TabletCellStatistics,
    TabletId, TabletState, TransactionId,
};
use crate::mutation::MutationContext;

/// Tablet manager automaton part
pub struct TabletManager {
    config: TabletManagerConfig,
    cell_tag: CellTag,
    primary_cell_tag: CellTag,
    secondary_cell_tags: Vec<CellTag>,

    ids: IdGenerator,
    bundles: BTreeMap<BundleId, TabletCellBundle>,
    cells: BTreeMap<CellId, TabletCell>,
    tablets: BTreeMap<TabletId, Tablet>,
    tables: BTreeMap<TableId, TableNode>,
    replicas: BTreeMap<ReplicaId, TableReplica>,
    actions: BTreeMap<ActionId, TabletAction>,
    chunks: ChunkStore,
    nodes: BTreeMap<String, Vec<TabletSlot>>,
    table_statistics_queue: BTreeMap<TableId, TableStatisticsUpdate>,
    hive: HiveManager,

    // Rebuilt after snapshot load.
    name_to_bundle: BTreeMap<String, BundleId>,
    address_to_cell: BTreeMap<String, Vec<(CellId, PeerId)>>,
    transaction_to_cell: BTreeMap<TransactionId, CellId>,
    default_bundle: Option<BundleId>,

    ctx: MutationContext,
    rng: StdRng,
    recovery: bool,
}

impl TabletManager {
    pub fn new(config: &MasterConfig) -> Self {
        let mut manager = Self {
            config: config.tablet_manager.clone(),
            cell_tag: config.cell_tag,
            primary_cell_tag: config.primary_cell_tag,
            secondary_cell_tags: config.secondary_cell_tags.clone(),
            ids: IdGenerator::default(),
            bundles: BTreeMap::new(),
            cells: BTreeMap::new(),
            tablets: BTreeMap::new(),
            tables: BTreeMap::new(),
            replicas: BTreeMap::new(),
            actions: BTreeMap::new(),
            chunks: ChunkStore::new(config.cell_tag),
            nodes: BTreeMap::new(),
            table_statistics_queue: BTreeMap::new(),
            hive: HiveManager::new(),
            name_to_bundle: BTreeMap::new(),
            address_to_cell: BTreeMap::new(),
            transaction_to_cell: BTreeMap::new(),
            default_bundle: None,
            ctx: MutationContext::default(),
            rng: StdRng::seed_from_u64(0),
            recovery: false,
        };
        manager.init_builtins();
        manager
    }

    /// Create the default bundle unless it exists
    fn init_builtins(&mut self) {
        if let Some(id) = self.name_to_bundle.get(crate::metadata::DEFAULT_BUNDLE_NAME) {
            self.default_bundle = Some(*id);
            return;
        }
        let id: BundleId = self.ids.generate(self.cell_tag);
        self.do_create_bundle(
            id,
            crate::metadata::DEFAULT_BUNDLE_NAME,
            crate::metadata::TabletCellOptions::default(),
        );
        self.default_bundle = Some(id);
    }

    pub(crate) fn begin_mutation(&mut self, ctx: MutationContext) {
        self.ctx = ctx;
        self.rng = StdRng::seed_from_u64(ctx.random_seed);
    }

    pub fn context(&self) -> &MutationContext {
        &self.ctx
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx.timestamp
    }

    pub fn config(&self) -> &TabletManagerConfig {
        &self.config
    }

    pub fn cell_tag(&self) -> CellTag {
        self.cell_tag
    }

    pub fn is_primary(&self) -> bool {
        self.cell_tag == self.primary_cell_tag
    }

    fn has_secondaries(&self) -> bool {
        self.is_primary() && !self.secondary_cell_tags.is_empty()
    }

    pub fn is_recovery(&self) -> bool {
        self.recovery
    }

    pub fn set_recovery(&mut self, recovery: bool) {
        self.recovery = recovery;
    }

    // Lookups

    pub fn find_bundle(&self, id: BundleId) -> Option<&TabletCellBundle> {
        self.bundles.get(&id)
    }

    pub fn find_bundle_by_name(&self, name: &str) -> Option<&TabletCellBundle> {
        self.name_to_bundle
            .get(name)
            .and_then(|id| self.bundles.get(id))
    }

    pub fn default_bundle_id(&self) -> Option<BundleId> {
        self.default_bundle
    }

    pub fn find_cell(&self, id: CellId) -> Option<&TabletCell> {
        self.cells.get(&id)
    }

    pub fn find_tablet(&self, id: TabletId) -> Option<&Tablet> {
        self.tablets.get(&id)
    }

    pub fn find_table(&self, id: TableId) -> Option<&TableNode> {
        self.tables.get(&id)
    }

    pub fn find_replica(&self, id: ReplicaId) -> Option<&TableReplica> {
        self.replicas.get(&id)
    }

    pub fn find_action(&self, id: ActionId) -> Option<&TabletAction> {
        self.actions.get(&id)
    }

    pub fn bundles(&self) -> impl Iterator<Item = &TabletCellBundle> {
        self.bundles.values()
    }

    pub fn cells(&self) -> impl Iterator<Item = &TabletCell> {
        self.cells.values()
    }

    pub fn tablets(&self) -> impl Iterator<Item = &Tablet> {
        self.tablets.values()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableNode> {
        self.tables.values()
    }

    pub fn replicas(&self) -> impl Iterator<Item = &TableReplica> {
        self.replicas.values()
    }

    pub fn actions(&self) -> impl Iterator<Item = &TabletAction> {
        self.actions.values()
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn hive(&self) -> &HiveManager {
        &self.hive
    }

    pub fn hive_mut(&mut self) -> &mut HiveManager {
        &mut self.hive
    }

    pub fn table_statistics_queue(&self) -> &BTreeMap<TableId, TableStatisticsUpdate> {
        &self.table_statistics_queue
    }

    /// Cells with a peer assigned to `address`
    pub fn cells_for_address(&self, address: &str) -> &[(CellId, PeerId)] {
        self.address_to_cell
            .get(address)
            .map(|cells| cells.as_slice())
            .unwrap_or(&[])
    }

    /// Tablets of a table in index order
    pub fn table_tablets(&self, table_id: TableId) -> Vec<&Tablet> {
        self.tables
            .get(&table_id)
            .map(|table| {
                table
                    .tablets
                    .iter()
                    .filter_map(|id| self.tablets.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Orphaned actions, for the periodic kicker
    pub fn orphaned_action_ids(&self) -> Vec<ActionId> {
        self.actions
            .values()
            .filter(|action| action.state == crate::metadata::TabletActionState::Orphaned)
            .map(|action| action.id)
            .collect()
    }

    fn get_bundle_or_err(&self, id: BundleId) -> Result<&TabletCellBundle> {
        self.bundles
            .get(&id)
            .ok_or_else(|| TabletError::no_such("tablet cell bundle", id))
    }

    fn get_cell_or_err(&self, id: CellId) -> Result<&TabletCell> {
        self.cells
            .get(&id)
            .ok_or_else(|| TabletError::no_such("tablet cell", id))
    }

    fn get_tablet_or_err(&self, id: TabletId) -> Result<&Tablet> {
        self.tablets
            .get(&id)
            .ok_or_else(|| TabletError::no_such("tablet", id))
    }

    fn get_table_or_err(&self, id: TableId) -> Result<&TableNode> {
        self.tables
            .get(&id)
            .ok_or_else(|| TabletError::no_such("table", id))
    }

    fn get_replica_or_err(&self, id: ReplicaId) -> Result<&TableReplica> {
        self.replicas
            .get(&id)
            .ok_or_else(|| TabletError::no_such("table replica", id))
    }

    // Tablet bookkeeping

    /// New unmounted tablet registered in the table's state counters
    fn create_tablet(&mut self, table_id: TableId) -> TabletId {
        let id: TabletId = self.ids.generate(self.cell_tag);
        self.tablets.insert(id, Tablet::new(id, table_id));
        if let Some(table) = self.tables.get_mut(&table_id) {
            *table
                .tablet_count_by_state
                .entry(TabletState::Unmounted)
                .or_insert(0) += 1;
            *table
                .tablet_count_by_expected_state
                .entry(TabletState::Unmounted)
                .or_insert(0) += 1;
        }
        id
    }

    /// Drop a tablet that no longer belongs to its table
    fn destroy_tablet(&mut self, tablet_id: TabletId) {
        let tablet = match self.tablets.remove(&tablet_id) {
            Some(tablet) => tablet,
            None => return,
        };
        if let Some(table) = tablet.table.and_then(|id| self.tables.get_mut(&id)) {
            *table.tablet_count_by_state.entry(tablet.state).or_insert(0) -= 1;
            *table
                .tablet_count_by_expected_state
                .entry(tablet.expected_state)
                .or_insert(0) -= 1;
        }
        if let Some(action_id) = tablet.action {
            if let Some(action) = self.actions.get_mut(&action_id) {
                action.tablets.retain(|id| *id != tablet_id);
            }
        }
    }

    fn set_tablet_state(&mut self, tablet_id: TabletId, state: TabletState) {
        let (table_id, old_state, has_action) = match self.tablets.get_mut(&tablet_id) {
            Some(tablet) => {
                let old_state = tablet.state;
                tablet.state = state;
                (tablet.table, old_state, tablet.action.is_some())
            }
            None => return,
        };

        if old_state != state && !old_state.can_transition_to(state) {
            error!(
                alert = true,
                tablet_id = %tablet_id,
                from = %old_state,
                to = %state,
                "Illegal tablet state transition"
            );
        }

        if let Some(table) = table_id.and_then(|id| self.tables.get_mut(&id)) {
            *table.tablet_count_by_state.entry(old_state).or_insert(0) -= 1;
            *table.tablet_count_by_state.entry(state).or_insert(0) += 1;
        }

        if !has_action {
            self.set_expected_state(tablet_id, state);
        }
    }

    fn set_expected_state(&mut self, tablet_id: TabletId, state: TabletState) {
        let (table_id, old_state) = match self.tablets.get_mut(&tablet_id) {
            Some(tablet) => {
                let old_state = tablet.expected_state;
                tablet.expected_state = state;
                (tablet.table, old_state)
            }
            None => return,
        };
        if let Some(table) = table_id.and_then(|id| self.tables.get_mut(&id)) {
            *table
                .tablet_count_by_expected_state
                .entry(old_state)
                .or_insert(0) -= 1;
            *table
                .tablet_count_by_expected_state
                .entry(state)
                .or_insert(0) += 1;
        }
    }

    /// Refresh the table's aggregate tablet state once no tablet is expected to move
    fn update_tablet_state(&mut self, table_id: TableId) {
        let table = match self.tables.get_mut(&table_id) {
            Some(table) => table,
            None => return,
        };

        let in_transition = TabletState::ALL
            .iter()
            .filter(|state| state.is_transient())
            .any(|state| table.count_in_expected_state(*state) > 0);
        if in_transition {
            return;
        }

        table.actual_tablet_state = table.compute_actual_tablet_state();
        table.expected_tablet_state = if table.count_in_expected_state(TabletState::Mounted) > 0 {
            TableTabletState::Mounted
        } else if table.count_in_expected_state(TabletState::Frozen) > 0 {
            TableTabletState::Frozen
        } else {
            TableTabletState::Unmounted
        };
    }

    fn tablet_chunk_list(&self, tablet: &Tablet) -> Option<ChunkListId> {
        let table = self.tables.get(&tablet.table?)?;
        self.chunks
            .tablet_lists(table.chunk_list)
            .get(tablet.index)
            .copied()
    }

    /// Contribution of one tablet to its cell's statistics
    fn tablet_statistics(&self, tablet: &Tablet) -> TabletCellStatistics {
        let tree = self
            .tablet_chunk_list(tablet)
            .map(|list| self.chunks.list_statistics(list))
            .unwrap_or_default();
        let node = &tablet.node_statistics;

        let mut statistics = TabletCellStatistics {
            unmerged_row_count: tree.row_count,
            uncompressed_data_size: tree.uncompressed_data_size,
            compressed_data_size: tree.compressed_data_size,
            chunk_count: tree.chunk_count,
            memory_size: match tablet.in_memory_mode {
                InMemoryMode::Compressed => tree.compressed_data_size,
                InMemoryMode::Uncompressed => tree.uncompressed_data_size,
                InMemoryMode::None => 0,
            },
            partition_count: node.partition_count,
            store_count: node.store_count,
            preload_pending_store_count: node.preload_pending_store_count,
            preload_completed_store_count: node.preload_completed_store_count,
            preload_failed_store_count: node.preload_failed_store_count,
            overlapping_store_count: node.overlapping_store_count,
            dynamic_memory_pool_size: node.dynamic_memory_pool_size,
            tablet_count: 1,
            ..Default::default()
        };
        statistics
            .tablet_count_per_memory_mode
            .insert(tablet.in_memory_mode, 1);
        statistics
    }

    fn tablet_statistics_by_id(&self, tablet_id: TabletId) -> TabletCellStatistics {
        self.tablets
            .get(&tablet_id)
            .map(|tablet| self.tablet_statistics(tablet))
            .unwrap_or_default()
    }

    // Cells

    pub fn is_cell_active(&self, cell_id: CellId) -> bool {
        self.cells
            .get(&cell_id)
            .map(|cell| !cell.decommission_started())
            .unwrap_or(false)
    }

    /// Whether the bundle has an active cell with good health
    pub fn check_has_healthy_cells(&self, bundle_id: BundleId) -> bool {
        self.bundles
            .get(&bundle_id)
            .map(|bundle| {
                bundle.cells.iter().any(|cell_id| {
                    self.cells
                        .get(cell_id)
                        .map(|cell| !cell.decommission_started() && cell.health() == CellHealth::Good)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    fn validate_has_healthy_cells(&self, bundle_id: BundleId) -> Result<()> {
        if self.check_has_healthy_cells(bundle_id) {
            return Ok(());
        }
        let name = self
            .bundles
            .get(&bundle_id)
            .map(|bundle| bundle.name.clone())
            .unwrap_or_default();
        Err(TabletError::new(
            ErrorCode::NoHealthyCells,
            format!("No healthy tablet cells in bundle \"{}\"", name),
        ))
    }

    /// Resolve an optional `[first, last]` tablet range; absent bounds cover the table
    fn parse_tablet_range(
        table: &TableNode,
        first: Option<usize>,
        last: Option<usize>,
    ) -> Result<(usize, usize)> {
        let count = table.tablets.len();
        if count == 0 {
            return Err(TabletError::invalid_range(format!(
                "Table {} has no tablets",
                table.id
            )));
        }
        let first = first.unwrap_or(0);
        let last = last.unwrap_or(count - 1);
        if first > last {
            return Err(TabletError::invalid_range(
                "First tablet index is greater than last tablet index",
            ));
        }
        if first >= count {
            return Err(TabletError::invalid_range(format!(
                "First tablet index is out of range [0, {}]",
                count - 1
            )));
        }
        if last >= count {
            return Err(TabletError::invalid_range(format!(
                "Last tablet index is out of range [0, {}]",
                count - 1
            )));
        }
        Ok((first, last))
    }

    fn tablet_ids_in_range(&self, table_id: TableId, first: usize, last: usize) -> Vec<TabletId> {
        self.tables
            .get(&table_id)
            .map(|table| {
                table
                    .tablets
                    .iter()
                    .skip(first)
                    .take(last + 1 - first)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }
}
