//! Multicell statistics gossip
//!
//! Tables whose native cell is elsewhere queue statistics deltas that are
//! shipped in batches by [`TabletManager::send_table_statistics_updates`].
//! Cell statistics flow from secondaries to the primary, which aggregates
//! them and sends cluster totals back.

use std::collections::BTreeMap;
use tracing::error;

use super::TabletManager;
use crate::hive::MasterDestination;
use crate::metadata::{CellId, CellTag, TableId, TableStatisticsUpdate, TabletCellStatistics};
use crate::mutation::Mutation;

impl TabletManager {
    /// Queue a statistics update for a table owned by another master cell
    pub fn schedule_table_statistics_update(&mut self, table_id: TableId, data: bool, resource: bool) {
        let table = match self.tables.get(&table_id) {
            Some(table) if table.native_cell_tag != self.cell_tag => table,
            _ => return,
        };
        let data_statistics = data.then_some(table.snapshot_statistics);
        let modification_time = table.modification_time;
        let access_time = table.access_time;
        let tablet_resource_usage = resource.then(|| self.table_tablet_resource_usage(table_id));

        let entry = self.table_statistics_queue.entry(table_id).or_default();
        if data_statistics.is_some() {
            entry.data_statistics = data_statistics;
        }
        if tablet_resource_usage.is_some() {
            entry.tablet_resource_usage = tablet_resource_usage;
        }
        entry.modification_time = Some(modification_time);
        entry.access_time = Some(access_time);
        log_unless_recovery!(self, debug, table_id = %table_id, data, resource, "Table statistics update scheduled");
    }

    /// Pop up to `count` queued updates and post them to the tables' native cells
    pub fn send_table_statistics_updates(&mut self, count: usize) {
        let mut batches: BTreeMap<CellTag, Vec<(TableId, TableStatisticsUpdate)>> = BTreeMap::new();
        let mut sent = 0;
        while sent < count {
            let (table_id, update) = match self.table_statistics_queue.pop_first() {
                Some(entry) => entry,
                None => break,
            };
            sent += 1;
            let cell_tag = match self.tables.get(&table_id) {
                Some(table) => table.native_cell_tag,
                None => continue,
            };
            batches.entry(cell_tag).or_default().push((table_id, update));
        }
        if sent == 0 {
            return;
        }
        log_unless_recovery!(self, debug, requested = count, sent, remaining = self.table_statistics_queue.len(), "Sending table statistics updates");

        for (cell_tag, entries) in batches {
            self.hive.post_to_master(
                MasterDestination::Cell(cell_tag),
                Mutation::UpdateTableStatistics { entries },
            );
        }
    }

    /// Fold statistics received from an external cell; times only move forward
    pub fn update_table_statistics(&mut self, entries: Vec<(TableId, TableStatisticsUpdate)>) {
        log_unless_recovery!(self, debug, count = entries.len(), "Received table statistics update");
        for (table_id, update) in entries {
            let table = match self.tables.get_mut(&table_id) {
                Some(table) => table,
                None => continue,
            };
            if let Some(usage) = update.tablet_resource_usage {
                table.external_tablet_resource_usage = usage;
            }
            if let Some(statistics) = update.data_statistics {
                if table.dynamic {
                    table.snapshot_statistics = statistics;
                }
            }
            if let Some(time) = update.modification_time {
                table.modification_time = table.modification_time.max(time);
            }
            if let Some(time) = update.access_time {
                table.access_time = table.access_time.max(time);
            }
        }
    }

    /// Refresh health and exchange cell statistics with the other master cells
    pub fn gossip_cell_statistics(&mut self) {
        self.update_cell_health_statistics();

        let primary = self.is_primary();
        let cell_tag = self.cell_tag;
        let mut entries = Vec::with_capacity(self.cells.len());
        for cell in self.cells.values_mut() {
            if primary {
                cell.multicell_statistics
                    .insert(cell_tag, cell.local_statistics.clone());
                cell.recompute_cluster_statistics();
                entries.push((cell.id, cell.cluster_statistics.clone()));
            } else {
                entries.push((cell.id, cell.local_statistics.clone()));
            }
        }

        if primary {
            if !self.has_secondaries() {
                return;
            }
            self.hive.post_to_master(
                MasterDestination::Secondaries,
                Mutation::SetTabletCellStatistics { cell_tag, entries },
            );
        } else {
            self.hive.post_to_master(
                MasterDestination::Cell(self.primary_cell_tag),
                Mutation::SetTabletCellStatistics { cell_tag, entries },
            );
        }
        log_unless_recovery!(self, debug, cell_tag, primary, "Tablet cell statistics gossip sent");
    }

    pub fn set_tablet_cell_statistics(&mut self, cell_tag: CellTag, entries: Vec<(CellId, TabletCellStatistics)>) {
        let primary = self.is_primary();
        let known = if primary {
            self.secondary_cell_tags.contains(&cell_tag)
        } else {
            cell_tag == self.primary_cell_tag
        };
        if !known {
            if !self.recovery {
                error!(cell_tag, "Received tablet cell statistics gossip from unknown cell");
            }
            return;
        }
        log_unless_recovery!(self, debug, cell_tag, count = entries.len(), "Received tablet cell statistics gossip");

        for (cell_id, statistics) in entries {
            let cell = match self.cells.get_mut(&cell_id) {
                Some(cell) => cell,
                None => continue,
            };
            if primary {
                cell.multicell_statistics.insert(cell_tag, statistics);
                cell.recompute_cluster_statistics();
            } else {
                cell.cluster_statistics = statistics;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::manager::testing::{chunk, TestCluster};
    use crate::manager::CreateTableOptions;
    use crate::metadata::DataStatistics;

    fn secondary_config() -> MasterConfig {
        MasterConfig {
            cell_tag: 2,
            primary_cell_tag: 1,
            ..Default::default()
        }
    }

    fn primary_config() -> MasterConfig {
        MasterConfig {
            cell_tag: 1,
            primary_cell_tag: 1,
            secondary_cell_tags: vec![2, 3],
            ..Default::default()
        }
    }

    fn foreign_table(cluster: &mut TestCluster, path: &str) -> TableId {
        let mut options = CreateTableOptions::sorted(path);
        options.native_cell_tag = Some(1);
        cluster.manager.create_table(options).unwrap()
    }

    #[test]
    fn test_local_tables_are_not_queued() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = cluster.sorted_table(&[]);
        cluster.manager.attach_chunks(table_id, 0, vec![chunk("a", "b", 10)]).unwrap();
        cluster.mount(table_id);
        assert!(cluster.manager.table_statistics_queue().is_empty());
    }

    #[test]
    fn test_foreign_table_updates_are_batched() {
        let mut cluster = TestCluster::with_config(secondary_config());
        let first = foreign_table(&mut cluster, "//tmp/a");
        let second = foreign_table(&mut cluster, "//tmp/b");
        cluster.manager.attach_chunks(first, 0, vec![chunk("a", "b", 10)]).unwrap();
        cluster.manager.schedule_table_statistics_update(second, false, true);
        assert_eq!(cluster.manager.table_statistics_queue().len(), 2);
        let queued = &cluster.manager.table_statistics_queue()[&first];
        assert_eq!(queued.data_statistics.unwrap().uncompressed_data_size, 10);
        assert!(queued.tablet_resource_usage.is_none());

        cluster.manager.send_table_statistics_updates(1);
        assert_eq!(cluster.manager.table_statistics_queue().len(), 1);
        cluster.manager.send_table_statistics_updates(10);
        assert!(cluster.manager.table_statistics_queue().is_empty());

        let messages = cluster.manager.hive_mut().drain_master_outbox();
        assert_eq!(messages.len(), 2);
        assert!(messages
            .iter()
            .all(|m| m.destination == MasterDestination::Cell(1)));
        match &messages[1].mutation {
            Mutation::UpdateTableStatistics { entries } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].0, second);
                assert_eq!(entries[0].1.tablet_resource_usage.unwrap().tablet_count, 1);
            }
            other => panic!("unexpected mutation {}", other.name()),
        }
    }

    #[test]
    fn test_update_table_statistics_keeps_latest_times() {
        let mut cluster = TestCluster::new();
        let table_id = cluster.sorted_table(&[]);
        let before = cluster.manager.find_table(table_id).unwrap().modification_time;
        let earlier = before - chrono::Duration::seconds(60);

        let update = TableStatisticsUpdate {
            data_statistics: Some(DataStatistics {
                row_count: 5,
                chunk_count: 1,
                ..Default::default()
            }),
            tablet_resource_usage: None,
            modification_time: Some(earlier),
            access_time: Some(before + chrono::Duration::seconds(5)),
        };
        cluster.manager.update_table_statistics(vec![(table_id, update)]);

        let table = cluster.manager.find_table(table_id).unwrap();
        assert_eq!(table.snapshot_statistics.row_count, 5);
        assert_eq!(table.modification_time, before);
        assert_eq!(table.access_time, before + chrono::Duration::seconds(5));
    }

    #[test]
    fn test_primary_aggregates_cell_statistics() {
        let mut cluster = TestCluster::with_config(primary_config());
        let cell_id = cluster.add_cell();

        let remote = TabletCellStatistics {
            tablet_count: 3,
            uncompressed_data_size: 300,
            ..Default::default()
        };
        cluster
            .manager
            .set_tablet_cell_statistics(2, vec![(cell_id, remote.clone())]);
        cluster
            .manager
            .set_tablet_cell_statistics(9, vec![(cell_id, remote)]);
        let cell = cluster.manager.find_cell(cell_id).unwrap();
        assert_eq!(cell.cluster_statistics.tablet_count, 3);

        cluster.manager.gossip_cell_statistics();
        let messages = cluster.manager.hive_mut().drain_master_outbox();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].destination, MasterDestination::Secondaries);
        match &messages[0].mutation {
            Mutation::SetTabletCellStatistics { cell_tag, entries } => {
                assert_eq!(*cell_tag, 1);
                assert_eq!(entries[0].1.uncompressed_data_size, 300);
            }
            other => panic!("unexpected mutation {}", other.name()),
        }
    }

    #[test]
    fn test_secondary_reports_to_primary() {
        let mut cluster = TestCluster::with_config(secondary_config());
        let cell_id = cluster.add_cell();

        cluster.manager.gossip_cell_statistics();
        let messages = cluster.manager.hive_mut().drain_master_outbox();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].destination, MasterDestination::Cell(1));

        let totals = TabletCellStatistics {
            tablet_count: 7,
            ..Default::default()
        };
        cluster
            .manager
            .set_tablet_cell_statistics(1, vec![(cell_id, totals.clone())]);
        assert_eq!(
            cluster.manager.find_cell(cell_id).unwrap().cluster_statistics,
            totals
        );
    }
}
