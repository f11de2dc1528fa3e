//! Table replicas of replicated tables
//!
//! A replica's state is tracked per tablet. Enabling or disabling a replica
//! sends a request to every active tablet and marks it transitioning; the
//! replica settles once the last tablet answers.

use tracing::warn;

use super::TabletManager;
use crate::error::{ErrorCode, Result, TabletError};
use crate::hive::{ReplicaDescriptor, TabletCellMessage};
use crate::metadata::{
    Atomicity, ReplicaId, ReplicaMode, ReplicaState, TableId, TableReplica, TableReplicaInfo,
    TabletId, TabletState,
};

fn validate_atomicity(atomicity: Option<Atomicity>, preserve_timestamps: Option<bool>) -> Result<()> {
    if atomicity == Some(Atomicity::None) && preserve_timestamps == Some(false) {
        return Err(TabletError::new(
            ErrorCode::InvalidReplicaSettings,
            "Cannot set atomicity none without preserving timestamps",
        ));
    }
    Ok(())
}

impl TabletManager {
    #[allow(clippy::too_many_arguments)]
    pub fn create_table_replica(
        &mut self,
        table_id: TableId,
        cluster_name: &str,
        replica_path: &str,
        mode: Option<ReplicaMode>,
        atomicity: Option<Atomicity>,
        preserve_timestamps: Option<bool>,
        start_replication_timestamp: u64,
    ) -> Result<ReplicaId> {
        let table = self.get_table_or_err(table_id)?;
        if !table.replicated {
            return Err(TabletError::new(
                ErrorCode::InvalidTableType,
                format!("Table {} is not replicated", table_id),
            ));
        }
        if table
            .replicas
            .iter()
            .filter_map(|id| self.replicas.get(id))
            .any(|replica| replica.cluster_name == cluster_name && replica.replica_path == replica_path)
        {
            return Err(TabletError::new(
                ErrorCode::NameTaken,
                format!(
                    "Replica table {} at cluster \"{}\" already exists",
                    replica_path, cluster_name
                ),
            ));
        }
        let preserve_timestamps = preserve_timestamps.unwrap_or(true);
        let atomicity = atomicity.unwrap_or_default();
        validate_atomicity(Some(atomicity), Some(preserve_timestamps))?;

        let id: ReplicaId = self.ids.generate(self.cell_tag);
        self.replicas.insert(
            id,
            TableReplica {
                id,
                table: Some(table_id),
                cluster_name: cluster_name.to_string(),
                replica_path: replica_path.to_string(),
                mode: mode.unwrap_or_default(),
                atomicity,
                preserve_timestamps,
                start_replication_timestamp,
                state: ReplicaState::Disabled,
                transitioning_tablets: Default::default(),
            },
        );
        let tablet_ids = match self.tables.get_mut(&table_id) {
            Some(table) => {
                table.replicas.insert(id);
                table.tablets.clone()
            }
            None => Vec::new(),
        };
        log_unless_recovery!(self, debug, table_id = %table_id, replica_id = %id, start_replication_timestamp, "Table replica created");

        for tablet_id in tablet_ids {
            let (active, cell_id) = match self.tablets.get_mut(&tablet_id) {
                Some(tablet) => {
                    let active = tablet.is_active();
                    tablet.replicas.insert(
                        id,
                        TableReplicaInfo {
                            state: if active {
                                ReplicaState::Disabled
                            } else {
                                ReplicaState::None
                            },
                            ..Default::default()
                        },
                    );
                    (active, tablet.cell)
                }
                None => continue,
            };
            if !active {
                continue;
            }
            if let (Some(cell_id), Some(replica)) =
                (cell_id, self.replica_descriptor(id, ReplicaState::Disabled))
            {
                self.hive
                    .post_message(cell_id, TabletCellMessage::AddTableReplica { tablet_id, replica });
            }
        }
        Ok(id)
    }

    pub fn destroy_table_replica(&mut self, replica_id: ReplicaId) -> Result<()> {
        let table_id = self.get_replica_or_err(replica_id)?.table;

        if let Some(table_id) = table_id {
            let tablet_ids = match self.tables.get_mut(&table_id) {
                Some(table) => {
                    table.replicas.remove(&replica_id);
                    table.tablets.clone()
                }
                None => Vec::new(),
            };
            for tablet_id in tablet_ids {
                let cell_id = match self.tablets.get_mut(&tablet_id) {
                    Some(tablet) => {
                        tablet.replicas.remove(&replica_id);
                        if !tablet.is_active() {
                            continue;
                        }
                        tablet.cell
                    }
                    None => continue,
                };
                if let Some(cell_id) = cell_id {
                    self.hive.post_message(
                        cell_id,
                        TabletCellMessage::RemoveTableReplica {
                            tablet_id,
                            replica_id,
                        },
                    );
                }
            }
        }

        self.replicas.remove(&replica_id);
        log_unless_recovery!(self, debug, replica_id = %replica_id, "Table replica destroyed");
        Ok(())
    }

    pub fn alter_table_replica(
        &mut self,
        replica_id: ReplicaId,
        enabled: Option<bool>,
        mode: Option<ReplicaMode>,
        atomicity: Option<Atomicity>,
        preserve_timestamps: Option<bool>,
    ) -> Result<()> {
        let replica = self.get_replica_or_err(replica_id)?;
        let table_id = replica.table.ok_or_else(|| {
            TabletError::new(
                ErrorCode::TableNotAlive,
                format!("Table replica {} has no table", replica_id),
            )
        })?;
        let tablet_ids = self.get_table_or_err(table_id)?.tablets.clone();

        let enabled = match enabled {
            Some(true) => match replica.state {
                ReplicaState::Enabled | ReplicaState::Enabling => None,
                ReplicaState::Disabled => Some(true),
                state => return Err(invalid_replica_state(replica_id, state)),
            },
            Some(false) => match replica.state {
                ReplicaState::Disabled | ReplicaState::Disabling => None,
                ReplicaState::Enabled => Some(false),
                state => return Err(invalid_replica_state(replica_id, state)),
            },
            None => None,
        };
        if enabled.is_some() {
            if let Some(tablet) = tablet_ids
                .iter()
                .filter_map(|id| self.tablets.get(id))
                .find(|tablet| tablet.state == TabletState::Unmounting)
            {
                return Err(TabletError::invalid_state(format!(
                    "Cannot alter \"enabled\" replica flag since tablet {} is in \"{}\" state",
                    tablet.id, tablet.state
                )));
            }
        }
        validate_atomicity(atomicity, preserve_timestamps)?;

        let mode = mode.filter(|mode| *mode != replica.mode);
        let atomicity = atomicity.filter(|atomicity| *atomicity != replica.atomicity);
        let preserve_timestamps =
            preserve_timestamps.filter(|preserve| *preserve != replica.preserve_timestamps);

        log_unless_recovery!(self, debug, table_id = %table_id, replica_id = %replica_id, ?enabled, ?mode, ?atomicity, ?preserve_timestamps, "Table replica updated");

        if let Some(replica) = self.replicas.get_mut(&replica_id) {
            if let Some(mode) = mode {
                replica.mode = mode;
            }
            if let Some(atomicity) = atomicity {
                replica.atomicity = atomicity;
            }
            if let Some(preserve) = preserve_timestamps {
                replica.preserve_timestamps = preserve;
            }
            match enabled {
                Some(true) => replica.state = ReplicaState::Enabling,
                Some(false) => replica.state = ReplicaState::Disabling,
                None => {}
            }
        }

        if enabled.is_none() && mode.is_none() && atomicity.is_none() && preserve_timestamps.is_none() {
            return Ok(());
        }

        for tablet_id in tablet_ids {
            let (cell_id, mount_revision, info_state) = match self.tablets.get(&tablet_id) {
                Some(tablet) if tablet.is_active() => (
                    tablet.cell,
                    tablet.mount_revision,
                    tablet.replicas.get(&replica_id).map(|info| info.state).unwrap_or_default(),
                ),
                _ => continue,
            };
            let cell_id = match cell_id {
                Some(cell_id) => cell_id,
                None => continue,
            };

            let new_state = match enabled {
                Some(true) if info_state != ReplicaState::Enabled => Some(ReplicaState::Enabling),
                Some(false) if info_state != ReplicaState::Disabled => Some(ReplicaState::Disabling),
                _ => None,
            };
            if let Some(new_state) = new_state {
                self.start_replica_transition(tablet_id, replica_id, new_state);
            }

            self.hive.post_message(
                cell_id,
                TabletCellMessage::AlterTableReplica {
                    tablet_id,
                    replica_id,
                    enabled: new_state.map(|state| state == ReplicaState::Enabling),
                    mode,
                    atomicity,
                    preserve_timestamps,
                    mount_revision,
                },
            );
        }

        if enabled.is_some() {
            self.check_transitioning_replica_tablets(replica_id);
        }
        Ok(())
    }

    pub fn on_table_replica_enabled(&mut self, tablet_id: TabletId, replica_id: ReplicaId, mount_revision: u64) {
        self.on_replica_transition_done(tablet_id, replica_id, mount_revision, ReplicaState::Enabling, ReplicaState::Enabled);
    }

    pub fn on_table_replica_disabled(&mut self, tablet_id: TabletId, replica_id: ReplicaId, mount_revision: u64) {
        self.on_replica_transition_done(tablet_id, replica_id, mount_revision, ReplicaState::Disabling, ReplicaState::Disabled);
    }

    fn on_replica_transition_done(
        &mut self,
        tablet_id: TabletId,
        replica_id: ReplicaId,
        mount_revision: u64,
        expected: ReplicaState,
        next: ReplicaState,
    ) {
        if !self.replicas.contains_key(&replica_id) {
            return;
        }
        let state = match self.tablets.get(&tablet_id) {
            Some(tablet) if tablet.mount_revision == mount_revision => {
                match tablet.replicas.get(&replica_id) {
                    Some(info) => info.state,
                    None => return,
                }
            }
            _ => return,
        };
        if state != expected {
            if !self.recovery {
                warn!(tablet_id = %tablet_id, replica_id = %replica_id, state = %state, expected = %expected, "Replica notification received for a replica in a wrong state, ignored");
            }
            return;
        }
        self.stop_replica_transition(tablet_id, replica_id, next);
        self.check_transitioning_replica_tablets(replica_id);
    }

    pub fn update_table_replica_statistics(
        &mut self,
        tablet_id: TabletId,
        replica_id: ReplicaId,
        mount_revision: u64,
        current_replication_row_index: i64,
        current_replication_timestamp: u64,
    ) {
        if !self.replicas.contains_key(&replica_id) {
            return;
        }
        let info = match self.tablets.get_mut(&tablet_id) {
            Some(tablet) if tablet.mount_revision == mount_revision => {
                match tablet.replicas.get_mut(&replica_id) {
                    Some(info) => info,
                    None => return,
                }
            }
            _ => return,
        };
        info.current_replication_row_index = current_replication_row_index;
        info.current_replication_timestamp = current_replication_timestamp;
        log_unless_recovery!(self, debug, tablet_id = %tablet_id, replica_id = %replica_id, current_replication_row_index, current_replication_timestamp, "Table replica statistics updated");
    }

    pub(super) fn start_replica_transition(&mut self, tablet_id: TabletId, replica_id: ReplicaId, state: ReplicaState) {
        if let Some(info) = self
            .tablets
            .get_mut(&tablet_id)
            .and_then(|tablet| tablet.replicas.get_mut(&replica_id))
        {
            log_unless_recovery!(self, debug, tablet_id = %tablet_id, replica_id = %replica_id, from = %info.state, to = %state, "Table replica is now transitioning");
            info.state = state;
        }
        if let Some(replica) = self.replicas.get_mut(&replica_id) {
            replica.transitioning_tablets.insert(tablet_id);
        }
    }

    pub(super) fn stop_replica_transition(&mut self, tablet_id: TabletId, replica_id: ReplicaId, state: ReplicaState) {
        if let Some(info) = self
            .tablets
            .get_mut(&tablet_id)
            .and_then(|tablet| tablet.replicas.get_mut(&replica_id))
        {
            log_unless_recovery!(self, debug, tablet_id = %tablet_id, replica_id = %replica_id, from = %info.state, to = %state, "Table replica is no longer transitioning");
            info.state = state;
        }
        if let Some(replica) = self.replicas.get_mut(&replica_id) {
            replica.transitioning_tablets.remove(&tablet_id);
        }
    }

    /// Settle an enabling/disabling replica once no tablet is transitioning
    pub(super) fn check_transitioning_replica_tablets(&mut self, replica_id: ReplicaId) {
        let replica = match self.replicas.get_mut(&replica_id) {
            Some(replica) => replica,
            None => return,
        };
        if replica.is_transitioning() {
            return;
        }
        let next = match replica.state {
            ReplicaState::Enabling => ReplicaState::Enabled,
            ReplicaState::Disabling => ReplicaState::Disabled,
            _ => return,
        };
        replica.state = next;
        log_unless_recovery!(self, debug, replica_id = %replica_id, state = %next, "Table replica settled");
    }

    pub(super) fn replica_descriptor(&self, replica_id: ReplicaId, state: ReplicaState) -> Option<ReplicaDescriptor> {
        let replica = self.replicas.get(&replica_id)?;
        Some(ReplicaDescriptor {
            replica_id,
            cluster_name: replica.cluster_name.clone(),
            replica_path: replica.replica_path.clone(),
            start_replication_timestamp: replica.start_replication_timestamp,
            state,
            mode: replica.mode,
            atomicity: replica.atomicity,
            preserve_timestamps: replica.preserve_timestamps,
        })
    }
}

fn invalid_replica_state(replica_id: ReplicaId, state: ReplicaState) -> TabletError {
    TabletError::new(
        ErrorCode::InvalidReplicaState,
        format!("Table replica {} is in \"{}\" state", replica_id, state),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::PostedMessage;
    use crate::manager::testing::TestCluster;
    use crate::manager::CreateTableOptions;
    use crate::metadata::Key;

    fn replicated_table(cluster: &mut TestCluster) -> TableId {
        let mut options = CreateTableOptions::sorted("//tmp/replicated");
        options.replicated = true;
        options.pivot_keys = vec![Key::empty(), Key::from("m")];
        cluster.manager.create_table(options).unwrap()
    }

    fn create_replica(cluster: &mut TestCluster, table_id: TableId) -> ReplicaId {
        cluster
            .manager
            .create_table_replica(table_id, "remote", "//tmp/r", None, None, None, 0)
            .unwrap()
    }

    fn drain(cluster: &mut TestCluster) -> Vec<PostedMessage> {
        cluster.manager.hive_mut().drain_outbox()
    }

    #[test]
    fn test_create_replica_validation() {
        let mut cluster = TestCluster::new();
        let plain = cluster.sorted_table(&[]);
        let err = cluster
            .manager
            .create_table_replica(plain, "remote", "//tmp/r", None, None, None, 0)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTableType);

        let table_id = replicated_table(&mut cluster);
        create_replica(&mut cluster, table_id);
        let err = cluster
            .manager
            .create_table_replica(table_id, "remote", "//tmp/r", None, None, None, 0)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NameTaken);

        let err = cluster
            .manager
            .create_table_replica(table_id, "remote", "//tmp/other", None, Some(Atomicity::None), Some(false), 0)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidReplicaSettings);
    }

    #[test]
    fn test_create_replica_on_mounted_table() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = replicated_table(&mut cluster);
        cluster.mount(table_id);

        let replica_id = create_replica(&mut cluster, table_id);
        let replica = cluster.manager.find_replica(replica_id).unwrap();
        assert_eq!(replica.state, ReplicaState::Disabled);
        assert_eq!(replica.mode, ReplicaMode::Async);

        let messages = drain(&mut cluster);
        assert_eq!(messages.len(), 2);
        assert!(messages
            .iter()
            .all(|m| matches!(m.message, TabletCellMessage::AddTableReplica { .. })));
        for tablet in cluster.manager.table_tablets(table_id) {
            assert_eq!(tablet.replicas[&replica_id].state, ReplicaState::Disabled);
        }
    }

    #[test]
    fn test_enable_unmounted_replica_settles_immediately() {
        let mut cluster = TestCluster::new();
        let table_id = replicated_table(&mut cluster);
        let replica_id = create_replica(&mut cluster, table_id);

        cluster
            .manager
            .alter_table_replica(replica_id, Some(true), None, None, None)
            .unwrap();
        assert_eq!(
            cluster.manager.find_replica(replica_id).unwrap().state,
            ReplicaState::Enabled
        );
        assert!(drain(&mut cluster).is_empty());
    }

    #[test]
    fn test_enable_and_disable_handshake() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = replicated_table(&mut cluster);
        cluster.mount(table_id);
        let replica_id = create_replica(&mut cluster, table_id);
        drain(&mut cluster);

        cluster
            .manager
            .alter_table_replica(replica_id, Some(true), None, None, None)
            .unwrap();
        let replica = cluster.manager.find_replica(replica_id).unwrap();
        assert_eq!(replica.state, ReplicaState::Enabling);
        assert_eq!(replica.transitioning_tablets.len(), 2);

        let transitioning = replica.transitioning_tablets.clone();
        cluster
            .manager
            .alter_table_replica(replica_id, Some(true), None, None, None)
            .unwrap();
        let replica = cluster.manager.find_replica(replica_id).unwrap();
        assert_eq!(replica.state, ReplicaState::Enabling);
        assert_eq!(replica.transitioning_tablets, transitioning);

        cluster.deliver();
        let replica = cluster.manager.find_replica(replica_id).unwrap();
        assert_eq!(replica.state, ReplicaState::Enabled);
        assert!(!replica.is_transitioning());

        // Enabling an enabled replica sends nothing and changes nothing.
        let infos: Vec<_> = cluster
            .manager
            .table_tablets(table_id)
            .iter()
            .map(|t| t.replicas[&replica_id].clone())
            .collect();
        cluster
            .manager
            .alter_table_replica(replica_id, Some(true), None, None, None)
            .unwrap();
        assert!(cluster.manager.hive_mut().drain_outbox().is_empty());
        let replica = cluster.manager.find_replica(replica_id).unwrap();
        assert_eq!(replica.state, ReplicaState::Enabled);
        assert!(replica.transitioning_tablets.is_empty());
        let infos_after: Vec<_> = cluster
            .manager
            .table_tablets(table_id)
            .iter()
            .map(|t| t.replicas[&replica_id].clone())
            .collect();
        assert_eq!(infos_after, infos);

        cluster
            .manager
            .alter_table_replica(replica_id, Some(false), Some(ReplicaMode::Sync), None, None)
            .unwrap();
        let replica = cluster.manager.find_replica(replica_id).unwrap();
        assert_eq!(replica.state, ReplicaState::Disabling);
        assert_eq!(replica.mode, ReplicaMode::Sync);
        cluster.deliver();
        assert_eq!(
            cluster.manager.find_replica(replica_id).unwrap().state,
            ReplicaState::Disabled
        );
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = replicated_table(&mut cluster);
        cluster.mount(table_id);
        let replica_id = create_replica(&mut cluster, table_id);
        cluster
            .manager
            .alter_table_replica(replica_id, Some(true), None, None, None)
            .unwrap();
        drain(&mut cluster);

        let tablet = cluster.manager.table_tablets(table_id)[0];
        let (tablet_id, revision) = (tablet.id, tablet.mount_revision);
        cluster
            .manager
            .on_table_replica_enabled(tablet_id, replica_id, revision + 100);
        let tablet = cluster.manager.find_tablet(tablet_id).unwrap();
        assert_eq!(tablet.replicas[&replica_id].state, ReplicaState::Enabling);

        cluster.manager.on_table_replica_enabled(tablet_id, replica_id, revision);
        let tablet = cluster.manager.find_tablet(tablet_id).unwrap();
        assert_eq!(tablet.replicas[&replica_id].state, ReplicaState::Enabled);
        assert_eq!(
            cluster.manager.find_replica(replica_id).unwrap().state,
            ReplicaState::Enabling
        );
    }

    #[test]
    fn test_mount_enables_enabled_replica() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = replicated_table(&mut cluster);
        let replica_id = create_replica(&mut cluster, table_id);
        cluster
            .manager
            .alter_table_replica(replica_id, Some(true), None, None, None)
            .unwrap();

        cluster
            .manager
            .mount_table(table_id, None, None, None, &[], false)
            .unwrap();
        assert!(cluster.manager.find_replica(replica_id).unwrap().is_transitioning());
        cluster.deliver();

        for tablet in cluster.manager.table_tablets(table_id) {
            assert_eq!(tablet.state, TabletState::Mounted);
            assert_eq!(tablet.replicas[&replica_id].state, ReplicaState::Enabled);
        }
        assert!(!cluster.manager.find_replica(replica_id).unwrap().is_transitioning());
    }

    #[test]
    fn test_replica_statistics_and_destroy() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = replicated_table(&mut cluster);
        cluster.mount(table_id);
        let replica_id = create_replica(&mut cluster, table_id);
        drain(&mut cluster);

        let tablet = cluster.manager.table_tablets(table_id)[0];
        let (tablet_id, revision) = (tablet.id, tablet.mount_revision);
        cluster
            .manager
            .update_table_replica_statistics(tablet_id, replica_id, revision, 42, 7);
        let info = &cluster.manager.find_tablet(tablet_id).unwrap().replicas[&replica_id];
        assert_eq!(info.current_replication_row_index, 42);
        assert_eq!(info.current_replication_timestamp, 7);

        cluster.manager.destroy_table_replica(replica_id).unwrap();
        assert!(cluster.manager.find_replica(replica_id).is_none());
        assert!(cluster.manager.find_table(table_id).unwrap().replicas.is_empty());
        let messages = drain(&mut cluster);
        assert_eq!(messages.len(), 2);
        assert!(messages
            .iter()
            .all(|m| matches!(m.message, TabletCellMessage::RemoveTableReplica { .. })));
    }
}
