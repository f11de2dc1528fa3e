//! Snapshot save and load
//!
//! Entity maps are written as a keys section followed by a values section,
//! both in id order, so a reader can scan ids without decoding entities.
//! Transient indices are never persisted; they are rebuilt on load.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{TabletManager, TabletSlot};
use crate::error::{Result, TabletError};
use crate::hive::HiveManager;
use crate::metadata::{
    ActionId, BundleId, CellId, CellTag, ChunkStore, IdGenerator, ReplicaId, TableId, TableNode,
    TableReplica, TableStatisticsUpdate, Tablet, TabletAction, TabletCell, TabletCellBundle,
    TabletCellStatistics, TabletId, TabletState,
};

/// Current snapshot format
///
/// Version 1 did not carry derived counters; they are recomputed on load.
pub const SNAPSHOT_VERSION: u32 = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotKeys {
    pub bundles: Vec<BundleId>,
    pub cells: Vec<CellId>,
    pub tablets: Vec<TabletId>,
    pub tables: Vec<TableId>,
    pub replicas: Vec<ReplicaId>,
    pub actions: Vec<ActionId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotValues {
    pub bundles: Vec<TabletCellBundle>,
    pub cells: Vec<TabletCell>,
    pub tablets: Vec<Tablet>,
    pub tables: Vec<TableNode>,
    pub replicas: Vec<TableReplica>,
    pub actions: Vec<TabletAction>,
}

/// Persistent state of the tablet manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletManagerSnapshot {
    pub version: u32,
    pub cell_tag: CellTag,
    pub ids: IdGenerator,
    pub keys: SnapshotKeys,
    pub values: SnapshotValues,
    pub chunks: ChunkStore,
    #[serde(default)]
    pub nodes: BTreeMap<String, Vec<TabletSlot>>,
    pub hive: HiveManager,
    #[serde(default)]
    pub table_statistics_queue: BTreeMap<TableId, TableStatisticsUpdate>,
}

/// Lowest snapshot id to keep when at most `max_count` snapshots are retained
///
/// Ids below the threshold may be removed. Returns `None` when nothing has
/// to go.
pub fn snapshot_threshold_id(ids: &[u64], max_count: usize) -> Option<u64> {
    if ids.len() <= max_count {
        return None;
    }
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    let first_kept = sorted.len() - max_count;
    match sorted.get(first_kept) {
        Some(id) => Some(*id),
        // Nothing kept at all: everything goes.
        None => sorted.last().map(|id| id + 1),
    }
}

fn split<K: Copy, V: Clone>(map: &BTreeMap<K, V>) -> (Vec<K>, Vec<V>) {
    (map.keys().copied().collect(), map.values().cloned().collect())
}

fn join<K: Ord + Copy + std::fmt::Display, V>(
    section: &str,
    keys: Vec<K>,
    values: Vec<V>,
    id_of: impl Fn(&V) -> K,
) -> Result<BTreeMap<K, V>> {
    if keys.len() != values.len() {
        return Err(TabletError::internal(format!(
            "Snapshot section {} has {} keys and {} values",
            section,
            keys.len(),
            values.len()
        )));
    }
    let mut map = BTreeMap::new();
    for (key, value) in keys.into_iter().zip(values) {
        if id_of(&value) != key {
            return Err(TabletError::internal(format!(
                "Snapshot section {} is out of order at key {}",
                section, key
            )));
        }
        map.insert(key, value);
    }
    Ok(map)
}

impl TabletManager {
    pub fn save_snapshot(&self) -> TabletManagerSnapshot {
        let (bundle_keys, bundles) = split(&self.bundles);
        let (cell_keys, cells) = split(&self.cells);
        let (tablet_keys, tablets) = split(&self.tablets);
        let (table_keys, tables) = split(&self.tables);
        let (replica_keys, replicas) = split(&self.replicas);
        let (action_keys, actions) = split(&self.actions);

        TabletManagerSnapshot {
            version: SNAPSHOT_VERSION,
            cell_tag: self.cell_tag,
            ids: self.ids.clone(),
            keys: SnapshotKeys {
                bundles: bundle_keys,
                cells: cell_keys,
                tablets: tablet_keys,
                tables: table_keys,
                replicas: replica_keys,
                actions: action_keys,
            },
            values: SnapshotValues {
                bundles,
                cells,
                tablets,
                tables,
                replicas,
                actions,
            },
            chunks: self.chunks.clone(),
            nodes: self.nodes.clone(),
            hive: self.hive.clone(),
            table_statistics_queue: self.table_statistics_queue.clone(),
        }
    }

    /// Replace the whole state with `snapshot` and rebuild derived indices
    pub fn load_snapshot(&mut self, snapshot: TabletManagerSnapshot) -> Result<()> {
        if snapshot.version == 0 || snapshot.version > SNAPSHOT_VERSION {
            return Err(TabletError::internal(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.cell_tag != self.cell_tag {
            return Err(TabletError::internal(format!(
                "Snapshot belongs to cell tag {}, expected {}",
                snapshot.cell_tag, self.cell_tag
            )));
        }

        let TabletManagerSnapshot {
            version,
            ids,
            keys,
            values,
            chunks,
            nodes,
            hive,
            table_statistics_queue,
            ..
        } = snapshot;

        let bundles = join("bundles", keys.bundles, values.bundles, |b| b.id)?;
        let cells = join("cells", keys.cells, values.cells, |c| c.id)?;
        let tablets = join("tablets", keys.tablets, values.tablets, |t| t.id)?;
        let tables = join("tables", keys.tables, values.tables, |t| t.id)?;
        let replicas = join("replicas", keys.replicas, values.replicas, |r| r.id)?;
        let actions = join("actions", keys.actions, values.actions, |a| a.id)?;

        self.ids = ids;
        self.bundles = bundles;
        self.cells = cells;
        self.tablets = tablets;
        self.tables = tables;
        self.replicas = replicas;
        self.actions = actions;
        self.chunks = chunks;
        self.nodes = nodes;
        self.hive = hive;
        self.table_statistics_queue = table_statistics_queue;

        self.rebuild_indices();
        if version < SNAPSHOT_VERSION {
            self.recompute_derived_state();
        }
        self.init_builtins();

        log_unless_recovery!(
            self,
            info,
            version,
            bundles = self.bundles.len(),
            cells = self.cells.len(),
            tablets = self.tablets.len(),
            tables = self.tables.len(),
            actions = self.actions.len(),
            "Snapshot loaded"
        );
        Ok(())
    }

    fn rebuild_indices(&mut self) {
        self.name_to_bundle = self
            .bundles
            .values()
            .map(|bundle| (bundle.name.clone(), bundle.id))
            .collect();
        self.default_bundle = None;

        self.address_to_cell.clear();
        self.transaction_to_cell.clear();
        let mut peers = Vec::new();
        for cell in self.cells.values() {
            for (peer_id, peer) in cell.peers.iter().enumerate() {
                if let Some(address) = &peer.address {
                    peers.push((address.clone(), cell.id, peer_id));
                }
            }
            if let Some(transaction_id) = cell.prerequisite_transaction {
                self.transaction_to_cell.insert(transaction_id, cell.id);
            }
        }
        for (address, cell_id, peer_id) in peers {
            self.add_to_address_to_cell(&address, cell_id, peer_id);
        }
    }

    /// Counters that older snapshots did not persist
    fn recompute_derived_state(&mut self) {
        for tablet in self.tablets.values_mut() {
            if tablet.action.is_none() {
                tablet.expected_state = tablet.state;
            }
        }

        for table in self.tables.values_mut() {
            table.tablet_count_by_state.clear();
            table.tablet_count_by_expected_state.clear();
            for tablet in table.tablets.iter().filter_map(|id| self.tablets.get(id)) {
                *table.tablet_count_by_state.entry(tablet.state).or_insert(0) += 1;
                *table
                    .tablet_count_by_expected_state
                    .entry(tablet.expected_state)
                    .or_insert(0) += 1;
            }
        }
        let table_ids: Vec<_> = self.tables.keys().copied().collect();
        for table_id in table_ids {
            self.update_tablet_state(table_id);
        }

        let cell_statistics: Vec<(CellId, TabletCellStatistics)> = self
            .cells
            .values()
            .map(|cell| {
                let mut statistics = TabletCellStatistics::default();
                for tablet in cell.tablets.iter().filter_map(|id| self.tablets.get(id)) {
                    if tablet.state != TabletState::Unmounted {
                        statistics += &self.tablet_statistics(tablet);
                    }
                }
                statistics.health = cell.health();
                statistics.decommissioned = cell.decommission_started();
                (cell.id, statistics)
            })
            .collect();
        for (cell_id, statistics) in cell_statistics {
            if let Some(cell) = self.cells.get_mut(&cell_id) {
                cell.local_statistics = statistics;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::{chunk, TestCluster};
    use crate::manager::CreateTabletActionRequest;
    use crate::metadata::TabletCellOptions;

    fn populated() -> TestCluster {
        let mut cluster = TestCluster::with_cells(2);
        cluster
            .manager
            .create_bundle("analytics", TabletCellOptions::default())
            .unwrap();
        let table_id = cluster.sorted_table(&["k"]);
        cluster
            .manager
            .attach_chunks(table_id, 0, vec![chunk("a", "c", 100)])
            .unwrap();
        cluster.mount(table_id);
        let tablet_id = cluster.manager.table_tablets(table_id)[0].id;
        let mut request = CreateTabletActionRequest::move_tablets(vec![tablet_id], vec![]);
        request.keep_finished = true;
        cluster.manager.create_tablet_action(request).unwrap();
        cluster.deliver();
        cluster
    }

    #[test]
    fn test_snapshot_round_trip_rebuilds_indices() {
        let cluster = populated();
        let snapshot = cluster.manager.save_snapshot();
        assert_eq!(snapshot.keys.tablets.len(), snapshot.values.tablets.len());

        let json = serde_json::to_string(&snapshot).unwrap();
        let keys_at = json.find("\"keys\"").unwrap();
        let values_at = json.find("\"values\"").unwrap();
        assert!(keys_at < values_at);

        let mut restored = TestCluster::new();
        restored
            .manager
            .load_snapshot(serde_json::from_str(&json).unwrap())
            .unwrap();
        let manager = &restored.manager;

        assert_eq!(manager.tablets().count(), cluster.manager.tablets().count());
        assert_eq!(manager.actions().count(), 1);
        assert!(manager.find_bundle_by_name("analytics").is_some());
        assert_eq!(manager.default_bundle_id(), cluster.manager.default_bundle_id());
        assert_eq!(
            manager.cells_for_address("node-0"),
            cluster.manager.cells_for_address("node-0")
        );
        for cell in manager.cells() {
            let original = cluster.manager.find_cell(cell.id).unwrap();
            assert_eq!(cell.local_statistics, original.local_statistics);
            assert!(manager.hive().find_mailbox(cell.id).is_some());
        }
    }

    #[test]
    fn test_old_snapshot_recomputes_counters() {
        let cluster = populated();
        let mut snapshot = cluster.manager.save_snapshot();
        snapshot.version = 1;
        for table in snapshot.values.tables.iter_mut() {
            table.tablet_count_by_state.clear();
            table.tablet_count_by_expected_state.clear();
        }
        for cell in snapshot.values.cells.iter_mut() {
            cell.local_statistics = TabletCellStatistics::default();
        }

        let mut restored = TestCluster::new();
        restored.manager.load_snapshot(snapshot).unwrap();
        for table in restored.manager.tables() {
            assert_eq!(table.count_in_state(TabletState::Mounted), 2);
            assert_eq!(table.count_in_expected_state(TabletState::Mounted), 2);
        }
        for cell in restored.manager.cells() {
            let original = cluster.manager.find_cell(cell.id).unwrap();
            assert_eq!(
                cell.local_statistics.tablet_count,
                original.local_statistics.tablet_count
            );
            assert_eq!(
                cell.local_statistics.uncompressed_data_size,
                original.local_statistics.uncompressed_data_size
            );
        }
    }

    #[test]
    fn test_corrupt_snapshot_is_rejected() {
        let cluster = populated();
        let mut snapshot = cluster.manager.save_snapshot();
        snapshot.keys.tablets.pop();
        let mut restored = TestCluster::new();
        assert!(restored.manager.load_snapshot(snapshot).is_err());

        let mut snapshot = cluster.manager.save_snapshot();
        snapshot.version = SNAPSHOT_VERSION + 1;
        assert!(restored.manager.load_snapshot(snapshot).is_err());
    }

    #[test]
    fn test_snapshot_threshold() {
        assert_eq!(snapshot_threshold_id(&[1, 2, 3], 5), None);
        assert_eq!(snapshot_threshold_id(&[7, 3, 5, 1], 2), Some(5));
        assert_eq!(snapshot_threshold_id(&[4, 9], 0), Some(10));
    }
}
