//! Node heartbeats
//!
//! A tablet node reports the slots it runs and per-tablet runtime
//! statistics. The master reconciles the reported slots against peer
//! assignment and answers with the slots the node has to create, configure
//! or remove.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::TabletManager;
use crate::metadata::{
    CellDescriptor, CellId, PeerId, PeerState, ReplicaId, TabletCellOptions, TabletId,
    TabletNodeStatistics, TabletState, TransactionId,
};

/// Slot of a tablet node as last reported
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletSlot {
    pub cell: Option<CellId>,
    pub peer_state: PeerState,
    pub peer_id: Option<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReport {
    pub cell_id: Option<CellId>,
    pub peer_id: Option<PeerId>,
    pub peer_state: PeerState,
    pub config_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaReport {
    pub replica_id: ReplicaId,
    pub current_replication_row_index: i64,
    pub current_replication_timestamp: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletReport {
    pub tablet_id: TabletId,
    pub statistics: TabletNodeStatistics,
    #[serde(default)]
    pub replicas: Vec<ReplicaReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub address: String,
    #[serde(default)]
    pub slots: Vec<SlotReport>,
    #[serde(default)]
    pub tablets: Vec<TabletReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotToCreate {
    pub cell_id: CellId,
    pub peer_id: PeerId,
    pub options: TabletCellOptions,
    pub bundle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotToConfigure {
    pub descriptor: CellDescriptor,
    pub prerequisite_transaction_id: TransactionId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub slots_to_create: Vec<SlotToCreate>,
    pub slots_to_configure: Vec<SlotToConfigure>,
    pub slots_to_remove: Vec<CellId>,
}

impl TabletManager {
    pub fn on_incremental_heartbeat(&mut self, request: HeartbeatRequest) -> HeartbeatResponse {
        let address = request.address;
        let now = self.now();
        let mut response = HeartbeatResponse::default();

        let expected: BTreeSet<CellId> = self
            .nodes
            .get(&address)
            .map(|slots| slots.iter().filter_map(|slot| slot.cell).collect())
            .unwrap_or_default();

        let mut slots = Vec::with_capacity(request.slots.len());
        let mut actual = BTreeSet::new();

        for report in &request.slots {
            let cell_id = match report.cell_id {
                Some(cell_id) if report.peer_state != PeerState::None => cell_id,
                _ => {
                    slots.push(TabletSlot::default());
                    continue;
                }
            };

            let cell = match self.cells.get_mut(&cell_id) {
                Some(cell) => cell,
                None => {
                    log_unless_recovery!(self, debug, address = %address, cell_id = %cell_id, "Unknown cell reported, scheduling removal");
                    response.slots_to_remove.push(cell_id);
                    slots.push(TabletSlot::default());
                    continue;
                }
            };

            let peer_id = match cell.find_peer_id(&address) {
                Some(peer_id) if report.peer_id == Some(peer_id) => peer_id,
                _ => {
                    log_unless_recovery!(self, debug, address = %address, cell_id = %cell_id, "Peer is not assigned to node, scheduling removal");
                    response.slots_to_remove.push(cell_id);
                    slots.push(TabletSlot::default());
                    continue;
                }
            };

            if report.peer_state == PeerState::Stopped {
                response.slots_to_remove.push(cell_id);
                slots.push(TabletSlot::default());
                continue;
            }

            if !expected.contains(&cell_id) {
                cell.attach_peer(&address, peer_id);
                log_unless_recovery!(self, debug, address = %address, cell_id = %cell_id, peer_id, "Tablet cell peer online");
            }
            cell.update_peer_seen(peer_id, now, report.peer_state);

            if report.config_version != cell.config_version && self.cell_tag == self.primary_cell_tag {
                if let Some(transaction_id) = cell.prerequisite_transaction {
                    response.slots_to_configure.push(SlotToConfigure {
                        descriptor: cell.descriptor(),
                        prerequisite_transaction_id: transaction_id,
                    });
                }
            }

            slots.push(TabletSlot {
                cell: Some(cell_id),
                peer_state: report.peer_state,
                peer_id: Some(peer_id),
            });
            actual.insert(cell_id);
        }

        for cell_id in expected.difference(&actual) {
            if let Some(cell) = self.cells.get_mut(cell_id) {
                cell.detach_peer(&address);
                log_unless_recovery!(self, debug, address = %address, cell_id = %cell_id, "Tablet cell peer offline");
            }
        }

        if self.is_primary() {
            for (cell_id, peer_id) in self.cells_for_address(&address).to_vec() {
                if actual.contains(&cell_id) {
                    continue;
                }
                let cell = match self.cells.get(&cell_id) {
                    Some(cell) => cell,
                    None => continue,
                };
                let transaction_id = match cell.prerequisite_transaction {
                    Some(transaction_id) => transaction_id,
                    None => continue,
                };
                let bundle = match self.bundles.get(&cell.bundle) {
                    Some(bundle) => bundle,
                    None => continue,
                };
                response.slots_to_create.push(SlotToCreate {
                    cell_id,
                    peer_id,
                    options: bundle.options.clone(),
                    bundle: bundle.name.clone(),
                });
                response.slots_to_configure.push(SlotToConfigure {
                    descriptor: cell.descriptor(),
                    prerequisite_transaction_id: transaction_id,
                });
            }
        }

        for report in request.tablets {
            self.process_tablet_report(&slots, report);
        }

        self.nodes.insert(address, slots);
        response
    }

    fn process_tablet_report(&mut self, slots: &[TabletSlot], report: TabletReport) {
        let tablet = match self.tablets.get(&report.tablet_id) {
            Some(tablet) if tablet.state != TabletState::Unmounted => tablet,
            _ => return,
        };
        let (cell_id, table_id) = match (tablet.cell, tablet.table) {
            (Some(cell_id), Some(table_id)) => (cell_id, table_id),
            _ => return,
        };
        let leading = slots.iter().any(|slot| {
            slot.cell == Some(cell_id)
                && matches!(
                    slot.peer_state,
                    PeerState::Leading | PeerState::LeaderRecovery
                )
        });
        if !leading {
            return;
        }

        let old_statistics = self.tablet_statistics(tablet);
        if let Some(tablet) = self.tablets.get_mut(&report.tablet_id) {
            tablet.node_statistics = report.statistics.clone();
        }
        let new_statistics = self.tablet_statistics_by_id(report.tablet_id);
        if let Some(cell) = self.cells.get_mut(&cell_id) {
            cell.local_statistics -= &old_statistics;
            cell.local_statistics += &new_statistics;
        }

        if let Some(table) = self.tables.get_mut(&table_id) {
            let statistics = &report.statistics;
            table.last_commit_timestamp = table
                .last_commit_timestamp
                .max(statistics.last_commit_timestamp);
            if let Some(time) = statistics.modification_time {
                table.modification_time = table.modification_time.max(time);
            }
            if let Some(time) = statistics.access_time {
                table.access_time = table.access_time.max(time);
            }
        }
        self.schedule_table_statistics_update(table_id, true, false);

        if let Some(tablet) = self.tablets.get_mut(&report.tablet_id) {
            for replica in report.replicas {
                match tablet.replicas.get_mut(&replica.replica_id) {
                    Some(info) => {
                        info.current_replication_row_index = replica.current_replication_row_index;
                        info.current_replication_timestamp = replica.current_replication_timestamp;
                        info.error = replica.error;
                    }
                    None => {
                        log_unless_recovery!(self, warn, tablet_id = %report.tablet_id, replica_id = %replica.replica_id, "Unknown replica reported");
                    }
                }
            }
        }
    }

    pub fn on_node_unregistered(&mut self, address: &str) {
        let slots = match self.nodes.remove(address) {
            Some(slots) => slots,
            None => return,
        };
        for cell_id in slots.iter().filter_map(|slot| slot.cell) {
            if let Some(cell) = self.cells.get_mut(&cell_id) {
                cell.detach_peer(address);
            }
        }
        log_unless_recovery!(self, info, address, "Tablet node unregistered");
    }

    /// Forget the slot of `address` that runs `cell_id`
    pub(super) fn detach_cell_from_node(&mut self, address: &str, cell_id: CellId) {
        if let Some(slots) = self.nodes.get_mut(address) {
            for slot in slots.iter_mut().filter(|slot| slot.cell == Some(cell_id)) {
                *slot = TabletSlot::default();
            }
        }
        if let Some(cell) = self.cells.get_mut(&cell_id) {
            cell.detach_peer(address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::TestCluster;
    use crate::metadata::CellHealth;

    fn slot(cell_id: CellId, peer_id: PeerId, state: PeerState, version: u64) -> SlotReport {
        SlotReport {
            cell_id: Some(cell_id),
            peer_id: Some(peer_id),
            peer_state: state,
            config_version: version,
        }
    }

    #[test]
    fn test_assigned_cell_is_created_then_online() {
        let mut cluster = TestCluster::new();
        let cell_id = cluster.manager.create_cell(cluster.bundle_id).unwrap();
        cluster
            .manager
            .assign_peers(cell_id, &[(0, "n1".to_string())]);

        let response = cluster.manager.on_incremental_heartbeat(HeartbeatRequest {
            address: "n1".to_string(),
            slots: vec![],
            tablets: vec![],
        });
        assert_eq!(response.slots_to_create.len(), 1);
        assert_eq!(response.slots_to_create[0].cell_id, cell_id);
        assert_eq!(response.slots_to_configure.len(), 1);

        let version = cluster.manager.find_cell(cell_id).unwrap().config_version;
        let response = cluster.manager.on_incremental_heartbeat(HeartbeatRequest {
            address: "n1".to_string(),
            slots: vec![slot(cell_id, 0, PeerState::Leading, version)],
            tablets: vec![],
        });
        assert_eq!(response, HeartbeatResponse::default());
        assert_eq!(
            cluster.manager.find_cell(cell_id).unwrap().health(),
            CellHealth::Good
        );
    }

    #[test]
    fn test_foreign_and_stopped_slots_are_removed() {
        let mut cluster = TestCluster::with_cells(1);
        let cell_id = cluster.cells[0];
        let version = cluster.manager.find_cell(cell_id).unwrap().config_version;

        let response = cluster.manager.on_incremental_heartbeat(HeartbeatRequest {
            address: "intruder".to_string(),
            slots: vec![slot(cell_id, 0, PeerState::Following, version)],
            tablets: vec![],
        });
        assert_eq!(response.slots_to_remove, vec![cell_id]);

        let response = cluster.manager.on_incremental_heartbeat(HeartbeatRequest {
            address: "node-0".to_string(),
            slots: vec![slot(cell_id, 0, PeerState::Stopped, version)],
            tablets: vec![],
        });
        assert_eq!(response.slots_to_remove, vec![cell_id]);
        assert_ne!(
            cluster.manager.find_cell(cell_id).unwrap().health(),
            CellHealth::Good
        );
    }

    #[test]
    fn test_unknown_slots_are_removed_during_recovery() {
        let mut cluster = TestCluster::with_cells(1);
        let cell_id = cluster.cells[0];
        let version = cluster.manager.find_cell(cell_id).unwrap().config_version;
        let unknown = CellId(cell_id.0 + 1000);
        cluster.manager.set_recovery(true);

        let response = cluster.manager.on_incremental_heartbeat(HeartbeatRequest {
            address: "intruder".to_string(),
            slots: vec![
                slot(unknown, 0, PeerState::Leading, 1),
                slot(cell_id, 0, PeerState::Following, version),
            ],
            tablets: vec![],
        });
        assert_eq!(response.slots_to_remove, vec![unknown, cell_id]);
        assert!(cluster.manager.find_cell(unknown).is_none());
        assert_eq!(
            cluster.manager.find_cell(cell_id).unwrap().peers[0].address.as_deref(),
            Some("node-0")
        );
    }

    #[test]
    fn test_stale_config_version_is_reconfigured() {
        let mut cluster = TestCluster::with_cells(1);
        let cell_id = cluster.cells[0];
        let response = cluster.manager.on_incremental_heartbeat(HeartbeatRequest {
            address: "node-0".to_string(),
            slots: vec![slot(cell_id, 0, PeerState::Leading, 0)],
            tablets: vec![],
        });
        assert_eq!(response.slots_to_configure.len(), 1);
        assert_eq!(response.slots_to_configure[0].descriptor.cell_id, cell_id);
    }

    #[test]
    fn test_unregister_detaches_peers() {
        let mut cluster = TestCluster::with_cells(1);
        let cell_id = cluster.cells[0];
        cluster.manager.on_node_unregistered("node-0");
        let cell = cluster.manager.find_cell(cell_id).unwrap();
        assert!(cell.peers[0].node.is_none());
        assert_eq!(cell.health(), CellHealth::Failed);
    }
}
