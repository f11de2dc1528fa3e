//! Mount, unmount, remount, freeze and unfreeze
//!
//! Every client operation is split into a side-effect free `prepare_*`
//! check and a commit that changes tablet states and posts requests to the
//! hosting cells. Completions arrive later as `on_tablet_*` mutations and
//! carry the mount revision of the request they answer; completions for a
//! superseded mount are dropped.

use std::collections::BTreeSet;
use tracing::error;

use super::TabletManager;
use crate::error::{ErrorCode, Result, TabletError};
use crate::hive::TabletCellMessage;
use crate::metadata::{
    CellId, ChunkTree, InMemoryMode, Key, ReplicaState, TableId, TableMountConfig, TableNode,
    TabletId, TabletState,
};

fn validate_dynamic(table: &TableNode, verb: &str) -> Result<()> {
    if table.dynamic {
        Ok(())
    } else {
        Err(TabletError::new(
            ErrorCode::InvalidTableType,
            format!("Cannot {} a static table", verb),
        ))
    }
}

fn validate_in_memory_mode(table: &TableNode, mode: InMemoryMode) -> Result<()> {
    if table.replicated && mode != InMemoryMode::None {
        return Err(TabletError::new(
            ErrorCode::InvalidTableType,
            "Cannot mount a replicated dynamic table in memory",
        ));
    }
    Ok(())
}

impl TabletManager {
    // Mount

    pub fn prepare_mount_table(
        &self,
        table_id: TableId,
        first: Option<usize>,
        last: Option<usize>,
        hint_cell_id: Option<CellId>,
        target_cell_ids: &[CellId],
        freeze: bool,
    ) -> Result<(usize, usize)> {
        let table = self.get_table_or_err(table_id)?;
        validate_dynamic(table, "mount")?;
        let (first, last) = Self::parse_tablet_range(table, first, last)?;

        let bundle_id = match table.bundle {
            Some(bundle_id) => bundle_id,
            None => {
                return Err(TabletError::new(
                    ErrorCode::InvalidOptions,
                    format!("Table {} has no tablet cell bundle", table_id),
                ))
            }
        };
        let bundle_name = self.get_bundle_or_err(bundle_id)?.name.clone();

        if hint_cell_id.is_some() && !target_cell_ids.is_empty() {
            return Err(TabletError::new(
                ErrorCode::InvalidOptions,
                "At most one of \"cell_id\" and \"target_cell_ids\" must be specified",
            ));
        }

        let check_bundle = |cell_id: CellId| -> Result<()> {
            let cell = self.get_cell_or_err(cell_id)?;
            if cell.bundle != bundle_id {
                let cell_bundle = self
                    .bundles
                    .get(&cell.bundle)
                    .map(|bundle| bundle.name.clone())
                    .unwrap_or_default();
                return Err(TabletError::new(
                    ErrorCode::InvalidCell,
                    format!(
                        "Cannot mount tablets into cell {} since it belongs to bundle \"{}\" while the table is configured to use bundle \"{}\"",
                        cell_id, cell_bundle, bundle_name
                    ),
                ));
            }
            Ok(())
        };

        if let Some(hint_cell_id) = hint_cell_id {
            check_bundle(hint_cell_id)?;
        } else if !target_cell_ids.is_empty() {
            if target_cell_ids.len() != last - first + 1 {
                return Err(TabletError::new(
                    ErrorCode::InvalidOptions,
                    "\"target_cell_ids\" must either be empty or contain exactly \"last_tablet_index\" - \"first_tablet_index\" + 1 entries",
                ));
            }
            for cell_id in target_cell_ids {
                if !self.is_cell_active(*cell_id) {
                    self.get_cell_or_err(*cell_id)?;
                    return Err(TabletError::new(
                        ErrorCode::InvalidCell,
                        format!("Cannot mount tablet into cell {} since it is not active", cell_id),
                    ));
                }
                check_bundle(*cell_id)?;
            }
        } else {
            self.validate_has_healthy_cells(bundle_id)?;
        }

        for tablet_id in &table.tablets[first..=last] {
            let tablet = self.get_tablet_or_err(*tablet_id)?;
            let allowed = tablet.state == TabletState::Unmounted
                || (freeze
                    && matches!(
                        tablet.state,
                        TabletState::Frozen | TabletState::Freezing | TabletState::FrozenMounting
                    ))
                || (!freeze
                    && matches!(
                        tablet.state,
                        TabletState::Mounted | TabletState::Mounting | TabletState::Unfreezing
                    ));
            if !allowed {
                return Err(TabletError::invalid_state(format!(
                    "Tablet {} is in \"{}\" state",
                    tablet.id, tablet.state
                )));
            }
        }

        validate_in_memory_mode(table, table.mount_config.in_memory_mode)?;

        for tablet_id in &table.tablets[first..=last] {
            let list = match self.tablets.get(tablet_id).and_then(|t| self.tablet_chunk_list(t)) {
                Some(list) => list,
                None => continue,
            };
            let mut seen = BTreeSet::new();
            for leaf in self.chunks.enumerate_chunks_and_views(list) {
                if !seen.insert(leaf) {
                    return Err(TabletError::internal(format!(
                        "Cannot mount table: tablet {} contains duplicate chunk {:?}",
                        tablet_id, leaf
                    )));
                }
            }
        }

        Ok((first, last))
    }

    pub fn mount_table(
        &mut self,
        table_id: TableId,
        first: Option<usize>,
        last: Option<usize>,
        hint_cell_id: Option<CellId>,
        target_cell_ids: &[CellId],
        freeze: bool,
    ) -> Result<()> {
        let (first, last) =
            self.prepare_mount_table(table_id, first, last, hint_cell_id, target_cell_ids, freeze)?;

        self.touch_affected_tablet_actions(table_id, first, last, "mount_table");

        let tablet_ids = self.tablet_ids_in_range(table_id, first, last);
        let unmounted = |manager: &Self, tablet_id: &TabletId| {
            manager
                .tablets
                .get(tablet_id)
                .map(|tablet| tablet.cell.is_none())
                .unwrap_or(false)
        };

        let assignment: Vec<(TabletId, Option<CellId>)> = if !target_cell_ids.is_empty() {
            tablet_ids
                .iter()
                .zip(target_cell_ids)
                .filter(|(tablet_id, _)| unmounted(self, tablet_id))
                .map(|(tablet_id, cell_id)| (*tablet_id, Some(*cell_id)))
                .collect()
        } else {
            let to_mount: Vec<TabletId> = tablet_ids
                .iter()
                .filter(|tablet_id| unmounted(self, tablet_id))
                .copied()
                .collect();
            self.compute_tablet_assignment(table_id, hint_cell_id, to_mount)
        };

        let in_memory_mode = self
            .tables
            .get(&table_id)
            .map(|table| table.mount_config.in_memory_mode)
            .unwrap_or_default();
        self.do_mount_tablets(table_id, &assignment, in_memory_mode, freeze);
        self.update_tablet_state(table_id);

        log_unless_recovery!(self, info, table_id = %table_id, first, last, freeze, mounted = assignment.len(), "Table mounted");
        Ok(())
    }

    /// Greedy placement: cells ranked by load, tablets by decreasing size, round robin
    ///
    /// An active hint cell takes every tablet. With no active cell in the
    /// bundle every tablet is assigned `None`.
    pub(super) fn compute_tablet_assignment(
        &mut self,
        table_id: TableId,
        hint_cell_id: Option<CellId>,
        tablet_ids: Vec<TabletId>,
    ) -> Vec<(TabletId, Option<CellId>)> {
        if let Some(hint_cell_id) = hint_cell_id.filter(|id| self.is_cell_active(*id)) {
            return tablet_ids
                .into_iter()
                .map(|tablet_id| (tablet_id, Some(hint_cell_id)))
                .collect();
        }

        let (bundle_id, in_memory_mode) = match self.tables.get(&table_id) {
            Some(table) => (table.bundle, table.mount_config.in_memory_mode),
            None => return Vec::new(),
        };
        let footprint = self.config.tablet_data_size_footprint;

        let candidates: Vec<CellId> = self
            .cells
            .values()
            .filter(|cell| !cell.decommission_started() && Some(cell.bundle) == bundle_id)
            .map(|cell| cell.id)
            .collect();

        let mut cell_keys: Vec<(i64, Option<CellId>)> = Vec::with_capacity(candidates.len());
        for cell_id in candidates {
            let size = match in_memory_mode {
                InMemoryMode::None => rand::Rng::gen::<i64>(&mut self.rng),
                InMemoryMode::Compressed | InMemoryMode::Uncompressed => {
                    let statistics = match self.cells.get(&cell_id) {
                        Some(cell) => &cell.local_statistics,
                        None => continue,
                    };
                    let in_memory_tablets = statistics
                        .tablet_count_in_mode(InMemoryMode::Uncompressed)
                        + statistics.tablet_count_in_mode(InMemoryMode::Compressed);
                    statistics.memory_size + in_memory_tablets * footprint
                }
            };
            cell_keys.push((size, Some(cell_id)));
        }
        if cell_keys.is_empty() {
            cell_keys.push((0, None));
        }
        cell_keys.sort();

        let mut sized: Vec<(i64, TabletId)> = tablet_ids
            .into_iter()
            .map(|tablet_id| {
                let statistics = self.tablet_statistics_by_id(tablet_id);
                let size = match in_memory_mode {
                    InMemoryMode::None | InMemoryMode::Uncompressed => {
                        statistics.uncompressed_data_size
                    }
                    InMemoryMode::Compressed => statistics.compressed_data_size,
                };
                (size + footprint, tablet_id)
            })
            .collect();
        sized.sort_by(|lhs, rhs| rhs.cmp(lhs));

        sized
            .into_iter()
            .zip(cell_keys.iter().cycle())
            .map(|((_, tablet_id), (_, cell_id))| (tablet_id, *cell_id))
            .collect()
    }

    /// Mount unmounted tablets; tablets without an active cell are handed to an orphaned action
    pub(super) fn do_mount_tablets(
        &mut self,
        table_id: TableId,
        assignment: &[(TabletId, Option<CellId>)],
        in_memory_mode: InMemoryMode,
        freeze: bool,
    ) {
        for (tablet_id, cell_id) in assignment {
            match self.tablets.get(tablet_id) {
                Some(tablet) if tablet.state == TabletState::Unmounted => {}
                Some(tablet) => {
                    error!(alert = true, tablet_id = %tablet_id, state = %tablet.state, "Attempted to mount a tablet that is not unmounted");
                    continue;
                }
                None => continue,
            }

            match cell_id.filter(|id| self.is_cell_active(*id)) {
                Some(cell_id) => self.do_mount_tablet_on_cell(*tablet_id, cell_id, in_memory_mode, freeze),
                None => self.mount_via_tablet_action(*tablet_id, freeze),
            }
        }
        self.schedule_table_statistics_update(table_id, false, true);
    }

    fn do_mount_tablet_on_cell(
        &mut self,
        tablet_id: TabletId,
        cell_id: CellId,
        in_memory_mode: InMemoryMode,
        freeze: bool,
    ) {
        let mount_revision = self.ctx.version;
        let replica_ids: Vec<_> = match self.tablets.get_mut(&tablet_id) {
            Some(tablet) => {
                tablet.cell = Some(cell_id);
                tablet.in_memory_mode = in_memory_mode;
                tablet.mount_revision = mount_revision;
                tablet.replicas.keys().copied().collect()
            }
            None => return,
        };
        self.set_tablet_state(
            tablet_id,
            if freeze {
                TabletState::FrozenMounting
            } else {
                TabletState::Mounting
            },
        );

        let statistics = self.tablet_statistics_by_id(tablet_id);
        if let Some(cell) = self.cells.get_mut(&cell_id) {
            cell.tablets.insert(tablet_id);
            cell.local_statistics += &statistics;
        }

        if let Some(message) = self.mount_tablet_message(tablet_id, freeze) {
            self.hive.post_message(cell_id, message);
        }
        log_unless_recovery!(self, debug, tablet_id = %tablet_id, cell_id = %cell_id, mount_revision, freeze, "Mounting tablet");

        for replica_id in replica_ids {
            let replica_state = match self.replicas.get(&replica_id) {
                Some(replica) => replica.state,
                None => continue,
            };
            match replica_state {
                ReplicaState::Enabled | ReplicaState::Enabling => {
                    self.hive.post_message(
                        cell_id,
                        TabletCellMessage::SetTableReplicaEnabled {
                            tablet_id,
                            replica_id,
                            enabled: true,
                            mount_revision,
                        },
                    );
                    self.start_replica_transition(tablet_id, replica_id, ReplicaState::Enabling);
                }
                ReplicaState::Disabled | ReplicaState::Disabling | ReplicaState::None => {
                    if let Some(info) = self
                        .tablets
                        .get_mut(&tablet_id)
                        .and_then(|tablet| tablet.replicas.get_mut(&replica_id))
                    {
                        info.state = ReplicaState::Disabled;
                    }
                }
            }
        }
    }

    fn mount_tablet_message(&self, tablet_id: TabletId, freeze: bool) -> Option<TabletCellMessage> {
        let tablet = self.tablets.get(&tablet_id)?;
        let table = self.tables.get(&tablet.table?)?;

        let (pivot_key, next_pivot_key, trimmed_row_count) = if table.is_physically_sorted() {
            let next_pivot_key = table
                .tablets
                .get(tablet.index + 1)
                .and_then(|id| self.tablets.get(id))
                .map(|next| next.pivot_key.clone())
                .unwrap_or_else(Key::max);
            (Some(tablet.pivot_key.clone()), Some(next_pivot_key), None)
        } else {
            (None, None, Some(tablet.trimmed_row_count))
        };

        let stores: Vec<ChunkTree> = self
            .tablet_chunk_list(tablet)
            .map(|list| self.chunks.enumerate_chunks_and_views(list))
            .unwrap_or_default();
        let replicas = tablet
            .replicas
            .iter()
            .filter_map(|(replica_id, info)| self.replica_descriptor(*replica_id, info.state))
            .collect();

        Some(TabletCellMessage::MountTablet {
            tablet_id,
            table_id: table.id,
            mount_revision: tablet.mount_revision,
            pivot_key,
            next_pivot_key,
            trimmed_row_count,
            retained_timestamp: tablet.retained_timestamp,
            mount_config: table.mount_config.clone(),
            freeze,
            stores,
            replicas,
        })
    }

    /// Mount a single tablet wherever the assignment puts it
    pub(super) fn do_mount_tablet(&mut self, tablet_id: TabletId, hint_cell_id: Option<CellId>, freeze: bool) {
        let table_id = match self.tablets.get(&tablet_id).and_then(|tablet| tablet.table) {
            Some(table_id) => table_id,
            None => return,
        };
        let in_memory_mode = self
            .tables
            .get(&table_id)
            .map(|table| table.mount_config.in_memory_mode)
            .unwrap_or_default();
        let assignment = self.compute_tablet_assignment(table_id, hint_cell_id, vec![tablet_id]);
        self.do_mount_tablets(table_id, &assignment, in_memory_mode, freeze);
        self.update_tablet_state(table_id);
    }

    // Unmount

    pub fn prepare_unmount_table(
        &self,
        table_id: TableId,
        force: bool,
        first: Option<usize>,
        last: Option<usize>,
    ) -> Result<(usize, usize)> {
        let table = self.get_table_or_err(table_id)?;
        validate_dynamic(table, "unmount")?;
        let (first, last) = Self::parse_tablet_range(table, first, last)?;

        if !force {
            for tablet_id in &table.tablets[first..=last] {
                let tablet = self.get_tablet_or_err(*tablet_id)?;
                if !matches!(
                    tablet.state,
                    TabletState::Mounted
                        | TabletState::Frozen
                        | TabletState::Freezing
                        | TabletState::Unmounted
                        | TabletState::Unmounting
                ) {
                    return Err(TabletError::invalid_state(format!(
                        "Tablet {} is in \"{}\" state",
                        tablet.id, tablet.state
                    )));
                }

                for replica_id in tablet.replicas.keys() {
                    if let Some(replica) = self.replicas.get(replica_id) {
                        if replica.transitioning_tablets.contains(tablet_id) {
                            return Err(TabletError::new(
                                ErrorCode::InvalidReplicaState,
                                format!(
                                    "Cannot unmount tablet {} since replica {} is in \"{}\" state",
                                    tablet_id, replica_id, replica.state
                                ),
                            ));
                        }
                    }
                }
            }
        }

        Ok((first, last))
    }

    pub fn unmount_table(
        &mut self,
        table_id: TableId,
        force: bool,
        first: Option<usize>,
        last: Option<usize>,
    ) -> Result<()> {
        let (first, last) = self.prepare_unmount_table(table_id, force, first, last)?;

        self.touch_affected_tablet_actions(table_id, first, last, "unmount_table");
        for tablet_id in self.tablet_ids_in_range(table_id, first, last) {
            self.do_unmount_tablet(tablet_id, force);
        }
        self.update_tablet_state(table_id);

        log_unless_recovery!(self, info, table_id = %table_id, first, last, force, "Table unmounted");
        Ok(())
    }

    pub(super) fn do_unmount_tablet(&mut self, tablet_id: TabletId, force: bool) {
        let (cell_id, mount_revision, replica_ids) = match self.tablets.get(&tablet_id) {
            Some(tablet) if tablet.state == TabletState::Unmounted => return,
            Some(tablet) => (
                tablet.cell,
                tablet.mount_revision,
                tablet.replicas.keys().copied().collect::<Vec<_>>(),
            ),
            None => return,
        };
        let cell_id = match cell_id {
            Some(cell_id) => cell_id,
            None => {
                error!(alert = true, tablet_id = %tablet_id, "Mounted tablet has no cell");
                return;
            }
        };

        self.set_tablet_state(tablet_id, TabletState::Unmounting);
        self.hive.post_message(
            cell_id,
            TabletCellMessage::UnmountTablet {
                tablet_id,
                mount_revision,
                force,
            },
        );
        log_unless_recovery!(self, debug, tablet_id = %tablet_id, cell_id = %cell_id, force, "Unmounting tablet");

        for replica_id in replica_ids {
            let transitioning = self
                .replicas
                .get(&replica_id)
                .map(|replica| replica.transitioning_tablets.contains(&tablet_id))
                .unwrap_or(false);
            if transitioning {
                self.stop_replica_transition(tablet_id, replica_id, ReplicaState::None);
            }
            self.check_transitioning_replica_tablets(replica_id);
        }

        if force {
            self.do_tablet_unmounted(tablet_id);
        }
    }

    /// Detach a tablet from its cell once it is gone from there
    fn do_tablet_unmounted(&mut self, tablet_id: TabletId) {
        let statistics = self.tablet_statistics_by_id(tablet_id);
        let (cell_id, table_id, replica_ids) = match self.tablets.get_mut(&tablet_id) {
            Some(tablet) => {
                let cell_id = tablet.cell.take();
                tablet.node_statistics = Default::default();
                tablet.in_memory_mode = InMemoryMode::None;
                (
                    cell_id,
                    tablet.table,
                    tablet.replicas.keys().copied().collect::<Vec<_>>(),
                )
            }
            None => return,
        };
        if let Some(cell) = cell_id.and_then(|id| self.cells.get_mut(&id)) {
            cell.local_statistics -= &statistics;
            cell.tablets.remove(&tablet_id);
        }
        self.set_tablet_state(tablet_id, TabletState::Unmounted);
        log_unless_recovery!(self, debug, tablet_id = %tablet_id, "Tablet unmounted");

        if let Some(table_id) = table_id {
            self.update_tablet_state(table_id);
            self.schedule_table_statistics_update(table_id, false, true);
        }

        for replica_id in replica_ids {
            let was_transitioning = self
                .replicas
                .get_mut(&replica_id)
                .map(|replica| replica.transitioning_tablets.remove(&tablet_id))
                .unwrap_or(false);
            if was_transitioning {
                error!(alert = true, tablet_id = %tablet_id, replica_id = %replica_id, "Table replica is still transitioning");
            }
            if let Some(info) = self
                .tablets
                .get_mut(&tablet_id)
                .and_then(|tablet| tablet.replicas.get_mut(&replica_id))
            {
                info.state = ReplicaState::None;
            }
            self.check_transitioning_replica_tablets(replica_id);
        }
    }

    // Remount

    pub fn prepare_remount_table(
        &self,
        table_id: TableId,
        first: Option<usize>,
        last: Option<usize>,
        mount_config: Option<&TableMountConfig>,
    ) -> Result<(usize, usize)> {
        let table = self.get_table_or_err(table_id)?;
        validate_dynamic(table, "remount")?;
        let range = Self::parse_tablet_range(table, first, last)?;
        let mode = mount_config
            .map(|config| config.in_memory_mode)
            .unwrap_or(table.mount_config.in_memory_mode);
        validate_in_memory_mode(table, mode)?;
        Ok(range)
    }

    pub fn remount_table(
        &mut self,
        table_id: TableId,
        first: Option<usize>,
        last: Option<usize>,
        mount_config: Option<TableMountConfig>,
    ) -> Result<()> {
        let (first, last) =
            self.prepare_remount_table(table_id, first, last, mount_config.as_ref())?;

        if let Some(mount_config) = mount_config {
            if let Some(table) = self.tables.get_mut(&table_id) {
                table.mount_config = mount_config;
            }
        }
        let mount_config = match self.tables.get(&table_id) {
            Some(table) => table.mount_config.clone(),
            None => return Ok(()),
        };

        for tablet_id in self.tablet_ids_in_range(table_id, first, last) {
            let cell_id = match self.tablets.get(&tablet_id) {
                Some(tablet) if tablet.state != TabletState::Unmounted => tablet.cell,
                _ => continue,
            };
            let cell_id = match cell_id {
                Some(cell_id) => cell_id,
                None => continue,
            };

            let old_statistics = self.tablet_statistics_by_id(tablet_id);
            if let Some(tablet) = self.tablets.get_mut(&tablet_id) {
                tablet.in_memory_mode = mount_config.in_memory_mode;
            }
            let new_statistics = self.tablet_statistics_by_id(tablet_id);
            if let Some(cell) = self.cells.get_mut(&cell_id) {
                cell.local_statistics -= &old_statistics;
                cell.local_statistics += &new_statistics;
            }

            self.hive.post_message(
                cell_id,
                TabletCellMessage::RemountTablet {
                    tablet_id,
                    mount_config: mount_config.clone(),
                },
            );
        }
        self.schedule_table_statistics_update(table_id, false, true);

        log_unless_recovery!(self, info, table_id = %table_id, first, last, "Table remounted");
        Ok(())
    }

    // Freeze

    pub fn prepare_freeze_table(
        &self,
        table_id: TableId,
        first: Option<usize>,
        last: Option<usize>,
    ) -> Result<(usize, usize)> {
        let table = self.get_table_or_err(table_id)?;
        validate_dynamic(table, "freeze")?;
        let (first, last) = Self::parse_tablet_range(table, first, last)?;
        for tablet_id in &table.tablets[first..=last] {
            let tablet = self.get_tablet_or_err(*tablet_id)?;
            if !matches!(
                tablet.state,
                TabletState::Mounted
                    | TabletState::FrozenMounting
                    | TabletState::Freezing
                    | TabletState::Frozen
            ) {
                return Err(TabletError::invalid_state(format!(
                    "Tablet {} is in \"{}\" state",
                    tablet.id, tablet.state
                )));
            }
        }
        Ok((first, last))
    }

    pub fn freeze_table(
        &mut self,
        table_id: TableId,
        first: Option<usize>,
        last: Option<usize>,
    ) -> Result<()> {
        let (first, last) = self.prepare_freeze_table(table_id, first, last)?;

        self.touch_affected_tablet_actions(table_id, first, last, "freeze_table");
        for tablet_id in self.tablet_ids_in_range(table_id, first, last) {
            self.do_freeze_tablet(tablet_id);
        }
        self.update_tablet_state(table_id);

        log_unless_recovery!(self, info, table_id = %table_id, first, last, "Table frozen");
        Ok(())
    }

    pub(super) fn do_freeze_tablet(&mut self, tablet_id: TabletId) {
        let (cell_id, mount_revision) = match self.tablets.get(&tablet_id) {
            Some(tablet) if tablet.state == TabletState::Mounted => (tablet.cell, tablet.mount_revision),
            _ => return,
        };
        self.set_tablet_state(tablet_id, TabletState::Freezing);
        if let Some(cell_id) = cell_id {
            self.hive.post_message(
                cell_id,
                TabletCellMessage::FreezeTablet {
                    tablet_id,
                    mount_revision,
                },
            );
        }
        log_unless_recovery!(self, debug, tablet_id = %tablet_id, "Freezing tablet");
    }

    // Unfreeze

    pub fn prepare_unfreeze_table(
        &self,
        table_id: TableId,
        first: Option<usize>,
        last: Option<usize>,
    ) -> Result<(usize, usize)> {
        let table = self.get_table_or_err(table_id)?;
        validate_dynamic(table, "unfreeze")?;
        let (first, last) = Self::parse_tablet_range(table, first, last)?;
        for tablet_id in &table.tablets[first..=last] {
            let tablet = self.get_tablet_or_err(*tablet_id)?;
            if !matches!(
                tablet.state,
                TabletState::Mounted | TabletState::Frozen | TabletState::Unfreezing
            ) {
                return Err(TabletError::invalid_state(format!(
                    "Tablet {} is in \"{}\" state",
                    tablet.id, tablet.state
                )));
            }
        }
        Ok((first, last))
    }

    pub fn unfreeze_table(
        &mut self,
        table_id: TableId,
        first: Option<usize>,
        last: Option<usize>,
    ) -> Result<()> {
        let (first, last) = self.prepare_unfreeze_table(table_id, first, last)?;

        self.touch_affected_tablet_actions(table_id, first, last, "unfreeze_table");
        for tablet_id in self.tablet_ids_in_range(table_id, first, last) {
            self.do_unfreeze_tablet(tablet_id);
        }
        self.update_tablet_state(table_id);

        log_unless_recovery!(self, info, table_id = %table_id, first, last, "Table unfrozen");
        Ok(())
    }

    pub(super) fn do_unfreeze_tablet(&mut self, tablet_id: TabletId) {
        let (cell_id, mount_revision) = match self.tablets.get(&tablet_id) {
            Some(tablet) if tablet.state == TabletState::Frozen => (tablet.cell, tablet.mount_revision),
            _ => return,
        };
        self.set_tablet_state(tablet_id, TabletState::Unfreezing);
        if let Some(cell_id) = cell_id {
            self.hive.post_message(
                cell_id,
                TabletCellMessage::UnfreezeTablet {
                    tablet_id,
                    mount_revision,
                },
            );
        }
        log_unless_recovery!(self, debug, tablet_id = %tablet_id, "Unfreezing tablet");
    }

    // Completions

    /// State, action and table of a live tablet whose revision matches
    fn completion_target(
        &self,
        tablet_id: TabletId,
        mount_revision: u64,
        event: &str,
    ) -> Option<(TabletState, Option<crate::metadata::ActionId>, Option<TableId>)> {
        let tablet = self.tablets.get(&tablet_id)?;
        if tablet.mount_revision != mount_revision {
            log_unless_recovery!(self, debug, tablet_id = %tablet_id, event, expected = tablet.mount_revision, actual = mount_revision, "Stale completion ignored");
            return None;
        }
        Some((tablet.state, tablet.action, tablet.table))
    }

    pub fn on_tablet_mounted(&mut self, tablet_id: TabletId, mount_revision: u64, frozen: bool) {
        let (state, action, table_id) =
            match self.completion_target(tablet_id, mount_revision, "mounted") {
                Some(target) => target,
                None => return,
            };
        if !matches!(state, TabletState::Mounting | TabletState::FrozenMounting) {
            log_unless_recovery!(self, debug, tablet_id = %tablet_id, state = %state, "Mounted notification received for a tablet in wrong state, ignored");
            return;
        }

        self.set_tablet_state(
            tablet_id,
            if frozen {
                TabletState::Frozen
            } else {
                TabletState::Mounted
            },
        );
        log_unless_recovery!(self, debug, tablet_id = %tablet_id, frozen, "Tablet mounted");

        self.on_tablet_action_state_changed(action);
        if let Some(table_id) = table_id {
            self.update_tablet_state(table_id);
        }
    }

    pub fn on_tablet_unmounted(&mut self, tablet_id: TabletId, mount_revision: u64) {
        let (state, action, _) =
            match self.completion_target(tablet_id, mount_revision, "unmounted") {
                Some(target) => target,
                None => return,
            };
        if state != TabletState::Unmounting {
            log_unless_recovery!(self, warn, tablet_id = %tablet_id, state = %state, "Unmounted notification received for a tablet in wrong state, ignored");
            return;
        }

        self.do_tablet_unmounted(tablet_id);
        self.on_tablet_action_state_changed(action);
    }

    pub fn on_tablet_frozen(&mut self, tablet_id: TabletId, mount_revision: u64) {
        let (state, action, table_id) =
            match self.completion_target(tablet_id, mount_revision, "frozen") {
                Some(target) => target,
                None => return,
            };
        if state != TabletState::Freezing {
            log_unless_recovery!(self, debug, tablet_id = %tablet_id, state = %state, "Frozen notification received for a tablet in wrong state, ignored");
            return;
        }

        self.set_tablet_state(tablet_id, TabletState::Frozen);
        log_unless_recovery!(self, debug, tablet_id = %tablet_id, "Tablet frozen");

        self.on_tablet_action_state_changed(action);
        if let Some(table_id) = table_id {
            self.update_tablet_state(table_id);
        }
    }

    pub fn on_tablet_unfrozen(&mut self, tablet_id: TabletId, mount_revision: u64) {
        let (state, action, table_id) =
            match self.completion_target(tablet_id, mount_revision, "unfrozen") {
                Some(target) => target,
                None => return,
            };
        if state != TabletState::Unfreezing {
            log_unless_recovery!(self, debug, tablet_id = %tablet_id, state = %state, "Unfrozen notification received for a tablet in wrong state, ignored");
            return;
        }

        self.set_tablet_state(tablet_id, TabletState::Mounted);
        log_unless_recovery!(self, debug, tablet_id = %tablet_id, "Tablet unfrozen");

        self.on_tablet_action_state_changed(action);
        if let Some(table_id) = table_id {
            self.update_tablet_state(table_id);
        }
    }

    pub fn update_tablet_trimmed_row_count(
        &mut self,
        tablet_id: TabletId,
        mount_revision: u64,
        trimmed_row_count: i64,
    ) {
        match self.tablets.get_mut(&tablet_id) {
            Some(tablet) if tablet.mount_revision == mount_revision => {
                tablet.trimmed_row_count = trimmed_row_count;
            }
            _ => return,
        }
        log_unless_recovery!(self, debug, tablet_id = %tablet_id, trimmed_row_count, "Tablet trimmed row count updated");
    }
}
