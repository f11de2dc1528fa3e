//! Tablet actions
//!
//! A tablet action moves or reshards a set of tablets on behalf of the
//! balancer. It freezes the tablets, unmounts them, optionally reshards them,
//! mounts them again and finishes. Every tablet completion re-enters the
//! state machine through [`TabletManager::on_tablet_action_state_changed`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::error;

use super::TabletManager;
use crate::error::{ErrorCode, Result, TabletError};
use crate::metadata::{
    ActionError, ActionId, BundleId, CellHealth, CellId, Key, TabletAction, TabletActionKind,
    TabletActionState, TabletId, TabletState,
};

/// Parameters of a balancer-issued tablet action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTabletActionRequest {
    pub kind: TabletActionKind,
    pub tablet_ids: Vec<TabletId>,
    #[serde(default)]
    pub cell_ids: Vec<CellId>,
    #[serde(default)]
    pub pivot_keys: Vec<Key>,
    #[serde(default)]
    pub tablet_count: Option<usize>,
    #[serde(default)]
    pub skip_freezing: bool,
    #[serde(default)]
    pub keep_finished: bool,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,
}

impl CreateTabletActionRequest {
    pub fn move_tablets(tablet_ids: Vec<TabletId>, cell_ids: Vec<CellId>) -> Self {
        Self {
            kind: TabletActionKind::Move,
            tablet_ids,
            cell_ids,
            pivot_keys: Vec::new(),
            tablet_count: None,
            skip_freezing: false,
            keep_finished: false,
            correlation_id: None,
            expiration_time: None,
        }
    }

    pub fn reshard(tablet_ids: Vec<TabletId>, pivot_keys: Vec<Key>, tablet_count: Option<usize>) -> Self {
        Self {
            kind: TabletActionKind::Reshard,
            pivot_keys,
            tablet_count,
            ..Self::move_tablets(tablet_ids, Vec::new())
        }
    }
}

fn invalid_action(message: impl Into<String>) -> TabletError {
    TabletError::new(ErrorCode::InvalidAction, message)
}

/// Fields of a freshly created action
struct NewAction {
    kind: TabletActionKind,
    state: TabletActionState,
    tablets: Vec<TabletId>,
    cells: Vec<CellId>,
    pivot_keys: Vec<Key>,
    tablet_count: Option<usize>,
    freeze: bool,
    skip_freezing: bool,
    keep_finished: bool,
    correlation_id: Option<String>,
    expiration_time: DateTime<Utc>,
}

impl TabletManager {
    /// Validate an action request; returns whether the tablets are frozen
    pub fn prepare_tablet_action(&self, request: &CreateTabletActionRequest) -> Result<bool> {
        if request.tablet_ids.is_empty() {
            return Err(invalid_action(
                "Invalid number of tablets: expected more than zero",
            ));
        }

        let first = self.get_tablet_or_err(request.tablet_ids[0])?;
        let table_id = first
            .table
            .ok_or_else(|| invalid_action(format!("Tablet {} has no table", first.id)))?;

        let mut tablets = Vec::with_capacity(request.tablet_ids.len());
        for tablet_id in &request.tablet_ids {
            let tablet = self.get_tablet_or_err(*tablet_id)?;
            if tablet.table != Some(table_id) {
                return Err(invalid_action(format!(
                    "Tablets {} and {} belong to different tables",
                    first.id, tablet.id
                )));
            }
            if let Some(action_id) = tablet.action {
                return Err(invalid_action(format!(
                    "Tablet {} already participating in action {}",
                    tablet.id, action_id
                )));
            }
            if !matches!(tablet.state, TabletState::Mounted | TabletState::Frozen) {
                return Err(invalid_action(format!(
                    "Tablet {} is in state \"{}\"",
                    tablet.id, tablet.state
                )));
            }
            tablets.push(tablet);
        }

        if tablets.iter().any(|tablet| tablet.state != first.state) {
            return Err(invalid_action("Tablets are in mixed state"));
        }
        let freeze = first.state == TabletState::Frozen;

        let bundle_id = self.get_table_or_err(table_id)?.bundle;
        for cell_id in &request.cell_ids {
            let cell = self.get_cell_or_err(*cell_id)?;
            if cell.decommission_started() {
                return Err(invalid_action(format!("Tablet cell {} is not active", cell_id)));
            }
            if Some(cell.bundle) != bundle_id {
                return Err(invalid_action(format!(
                    "Table {} and tablet cell {} belong to different bundles",
                    table_id, cell_id
                )));
            }
        }

        match request.kind {
            TabletActionKind::Move => {
                if !request.cell_ids.is_empty() && request.cell_ids.len() != tablets.len() {
                    return Err(invalid_action(format!(
                        "Number of destination cells and tablets mismatch: {} tablets, {} cells",
                        tablets.len(),
                        request.cell_ids.len()
                    )));
                }
                if !request.pivot_keys.is_empty() {
                    return Err(invalid_action(format!(
                        "Invalid number of pivot keys: expected 0, actual {}",
                        request.pivot_keys.len()
                    )));
                }
                if let Some(count) = request.tablet_count {
                    return Err(invalid_action(format!(
                        "Invalid number of tablets: expected none, actual {}",
                        count
                    )));
                }
            }
            TabletActionKind::Reshard => {
                if request.pivot_keys.is_empty() && request.tablet_count.unwrap_or(0) < 1 {
                    return Err(invalid_action(
                        "Invalid number of new tablets: expected pivot keys or tablet count greater than zero",
                    ));
                }
                if !request.cell_ids.is_empty() {
                    if request.pivot_keys.is_empty() {
                        let count = request.tablet_count.unwrap_or(0);
                        if request.cell_ids.len() != count {
                            return Err(invalid_action(format!(
                                "Number of destination cells and tablet count mismatch: tablet count {}, cells {}",
                                count,
                                request.cell_ids.len()
                            )));
                        }
                    } else if request.cell_ids.len() != request.pivot_keys.len() {
                        return Err(invalid_action(format!(
                            "Number of destination cells and pivot keys mismatch: pivot keys {}, cells {}",
                            request.pivot_keys.len(),
                            request.cell_ids.len()
                        )));
                    }
                }
                for pair in tablets.windows(2) {
                    if pair[0].index + 1 != pair[1].index {
                        return Err(invalid_action(format!(
                            "Tablets {} and {} are not consequent",
                            pair[0].id, pair[1].id
                        )));
                    }
                }
            }
        }

        Ok(freeze)
    }

    pub fn create_tablet_action(&mut self, request: CreateTabletActionRequest) -> Result<ActionId> {
        let freeze = self.prepare_tablet_action(&request)?;

        let expiration_time = match request.expiration_time {
            Some(time) => time,
            None if request.keep_finished => {
                self.now() + self.config.tablet_action_expiration_timeout()
            }
            None => Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
        };

        let action_id = self.do_create_tablet_action(NewAction {
            kind: request.kind,
            state: TabletActionState::Preparing,
            tablets: request.tablet_ids,
            cells: request.cell_ids,
            pivot_keys: request.pivot_keys,
            tablet_count: request.tablet_count,
            freeze,
            skip_freezing: request.skip_freezing,
            keep_finished: request.keep_finished,
            correlation_id: request.correlation_id,
            expiration_time,
        });
        self.on_tablet_action_state_changed(Some(action_id));
        Ok(action_id)
    }

    fn do_create_tablet_action(&mut self, new: NewAction) -> ActionId {
        let id: ActionId = self.ids.generate(self.cell_tag);
        let bundle_id: Option<BundleId> = new
            .tablets
            .first()
            .and_then(|tablet_id| self.tablets.get(tablet_id))
            .and_then(|tablet| tablet.table)
            .and_then(|table_id| self.tables.get(&table_id))
            .and_then(|table| table.bundle);

        let expected_state = if new.freeze {
            TabletState::Frozen
        } else {
            TabletState::Mounted
        };
        for tablet_id in &new.tablets {
            if let Some(tablet) = self.tablets.get_mut(tablet_id) {
                tablet.action = Some(id);
            }
            if new.state == TabletActionState::Orphaned {
                self.set_expected_state(*tablet_id, expected_state);
            }
        }
        for cell_id in &new.cells {
            if let Some(cell) = self.cells.get_mut(cell_id) {
                cell.actions.insert(id);
            }
        }
        if let Some(bundle) = bundle_id.and_then(|id| self.bundles.get_mut(&id)) {
            bundle.actions.insert(id);
            bundle.increase_active_action_count();
        }

        let action = TabletAction {
            id,
            kind: new.kind,
            state: new.state,
            tablets: new.tablets,
            cells: new.cells,
            pivot_keys: new.pivot_keys,
            tablet_count: new.tablet_count,
            skip_freezing: new.skip_freezing,
            freeze: new.freeze,
            error: None,
            keep_finished: new.keep_finished,
            correlation_id: new.correlation_id,
            expiration_time: new.expiration_time,
            bundle: bundle_id,
        };
        log_unless_recovery!(self, debug, action_id = %id, action = %action, "Tablet action created");
        self.actions.insert(id, action);
        id
    }

    /// Park a tablet that has no active cell in an orphaned move action
    pub(super) fn mount_via_tablet_action(&mut self, tablet_id: TabletId, freeze: bool) {
        if let Some(old_action) = self.tablets.get(&tablet_id).and_then(|tablet| tablet.action) {
            if let Some(action) = self.actions.get_mut(&old_action) {
                action.tablets.retain(|id| *id != tablet_id);
            }
            if let Some(tablet) = self.tablets.get_mut(&tablet_id) {
                tablet.action = None;
            }
        }

        let action_id = self.do_create_tablet_action(NewAction {
            kind: TabletActionKind::Move,
            state: TabletActionState::Orphaned,
            tablets: vec![tablet_id],
            cells: Vec::new(),
            pivot_keys: Vec::new(),
            tablet_count: None,
            freeze,
            skip_freezing: false,
            keep_finished: false,
            correlation_id: None,
            expiration_time: Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
        });
        log_unless_recovery!(self, info, tablet_id = %tablet_id, action_id = %action_id, "Tablet has no active cell, waiting in orphaned action");
    }

    pub(super) fn change_tablet_action_state(
        &mut self,
        action_id: ActionId,
        state: TabletActionState,
        recursive: bool,
    ) {
        match self.actions.get_mut(&action_id) {
            Some(action) => action.state = state,
            None => return,
        }
        log_unless_recovery!(self, debug, action_id = %action_id, state = %state, "Tablet action state changed");
        if recursive {
            self.on_tablet_action_state_changed(Some(action_id));
        }
    }

    /// Advance an action as far as it can go right now
    pub(super) fn on_tablet_action_state_changed(&mut self, action_id: Option<ActionId>) {
        let action_id = match action_id {
            Some(action_id) => action_id,
            None => return,
        };

        loop {
            let err = match self.tablet_action_step(action_id) {
                Ok(()) => return,
                Err(err) => err,
            };
            let state = match self.actions.get_mut(&action_id) {
                Some(action) => {
                    action.error = Some(ActionError::from(err.clone()));
                    action.state
                }
                None => return,
            };
            if state == TabletActionState::Failing {
                error!(alert = true, action_id = %action_id, error = %err, "Tablet action failed while failing");
                return;
            }
            log_unless_recovery!(self, warn, action_id = %action_id, state = %state, error = %err, "Tablet action failed");
            if state != TabletActionState::Unmounting {
                self.change_tablet_action_state(action_id, TabletActionState::Failing, false);
            }
        }
    }

    fn tablet_action_step(&mut self, action_id: ActionId) -> Result<()> {
        let action = match self.actions.get(&action_id) {
            Some(action) => action,
            None => return Ok(()),
        };
        let state = action.state;
        let tablet_ids = action.tablets.clone();
        let has_error = action.error.is_some();

        let count_in = |manager: &Self, states: &[TabletState]| {
            tablet_ids
                .iter()
                .filter_map(|id| manager.tablets.get(id))
                .filter(|tablet| states.contains(&tablet.state))
                .count()
        };

        match state {
            TabletActionState::Preparing => {
                if action.skip_freezing {
                    self.change_tablet_action_state(action_id, TabletActionState::Frozen, true);
                    return Ok(());
                }
                for tablet_id in &tablet_ids {
                    self.do_freeze_tablet(*tablet_id);
                }
                self.change_tablet_action_state(action_id, TabletActionState::Freezing, true);
            }

            TabletActionState::Freezing => {
                if count_in(self, &[TabletState::Freezing]) == 0 {
                    let next = if has_error {
                        TabletActionState::Failing
                    } else {
                        TabletActionState::Frozen
                    };
                    self.change_tablet_action_state(action_id, next, true);
                }
            }

            TabletActionState::Frozen => {
                for tablet_id in &tablet_ids {
                    self.do_unmount_tablet(*tablet_id, false);
                }
                self.change_tablet_action_state(action_id, TabletActionState::Unmounting, true);
            }

            TabletActionState::Unmounting => {
                if count_in(self, &[TabletState::Unmounting]) == 0 {
                    let next = if has_error {
                        TabletActionState::Failing
                    } else {
                        TabletActionState::Unmounted
                    };
                    self.change_tablet_action_state(action_id, next, true);
                }
            }

            TabletActionState::Unmounted => self.tablet_action_mount(action_id)?,

            TabletActionState::Orphaned => {}

            TabletActionState::Mounting => {
                let mounted = count_in(self, &[TabletState::Mounted, TabletState::Frozen]);
                if mounted == tablet_ids.len() {
                    self.change_tablet_action_state(action_id, TabletActionState::Mounted, true);
                }
            }

            TabletActionState::Mounted => {
                self.change_tablet_action_state(action_id, TabletActionState::Completed, true);
            }

            TabletActionState::Failing => {
                self.mount_missed_in_action_tablets(action_id);
                self.unbind_tablet_action(action_id);
                self.change_tablet_action_state(action_id, TabletActionState::Failed, true);
            }

            TabletActionState::Completed | TabletActionState::Failed => {
                if state == TabletActionState::Completed && has_error {
                    self.change_tablet_action_state(action_id, TabletActionState::Failed, false);
                }
                self.finish_tablet_action(action_id);
            }
        }
        Ok(())
    }

    /// Reshard if needed, then mount the action's tablets
    fn tablet_action_mount(&mut self, action_id: ActionId) -> Result<()> {
        let action = match self.actions.get(&action_id) {
            Some(action) => action.clone(),
            None => return Ok(()),
        };

        let table_id = action
            .tablets
            .first()
            .and_then(|id| self.tablets.get(id))
            .and_then(|tablet| tablet.table)
            .filter(|table_id| self.tables.contains_key(table_id))
            .ok_or_else(|| TabletError::new(ErrorCode::TableNotAlive, "Table is not alive"))?;

        if action.kind == TabletActionKind::Reshard {
            self.tablet_action_reshard(&action, table_id)?;
        }

        let bundle_id = self.tables.get(&table_id).and_then(|table| table.bundle);
        if !bundle_id.map(|id| self.check_has_healthy_cells(id)).unwrap_or(false) {
            self.change_tablet_action_state(action_id, TabletActionState::Orphaned, false);
            return Ok(());
        }

        let tablet_ids = self
            .actions
            .get(&action_id)
            .map(|action| action.tablets.clone())
            .unwrap_or_default();
        let assignment = if action.cells.is_empty() {
            self.compute_tablet_assignment(table_id, None, tablet_ids)
        } else {
            let all_healthy = action.cells.iter().all(|cell_id| {
                self.cells
                    .get(cell_id)
                    .map(|cell| !cell.decommission_started() && cell.health() == CellHealth::Good)
                    .unwrap_or(false)
            });
            if !all_healthy {
                self.change_tablet_action_state(action_id, TabletActionState::Orphaned, false);
                return Ok(());
            }
            tablet_ids
                .into_iter()
                .zip(action.cells.iter().copied().map(Some))
                .collect()
        };

        let in_memory_mode = self
            .tables
            .get(&table_id)
            .map(|table| table.mount_config.in_memory_mode)
            .unwrap_or_default();
        self.do_mount_tablets(table_id, &assignment, in_memory_mode, action.freeze);
        self.update_tablet_state(table_id);
        self.change_tablet_action_state(action_id, TabletActionState::Mounting, true);
        Ok(())
    }

    /// Swap the action's tablets for the result of resharding them
    fn tablet_action_reshard(&mut self, action: &TabletAction, table_id: crate::metadata::TableId) -> Result<()> {
        let indexes: Vec<usize> = action
            .tablets
            .iter()
            .filter_map(|id| self.tablets.get(id))
            .map(|tablet| tablet.index)
            .collect();
        let (first, last) = match (indexes.first(), indexes.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(TabletError::internal("Reshard action has no tablets")),
        };
        let expected_state = if action.freeze {
            TabletState::Frozen
        } else {
            TabletState::Mounted
        };

        let old_tablets = action.tablets.clone();
        for tablet_id in &old_tablets {
            if let Some(tablet) = self.tablets.get_mut(tablet_id) {
                tablet.action = None;
            }
        }
        if let Some(action) = self.actions.get_mut(&action.id) {
            action.tablets.clear();
        }

        let resharded = self
            .prepare_reshard_table(
                table_id,
                Some(first),
                Some(last),
                action.tablet_count,
                &action.pivot_keys,
            )
            .and_then(|(first, last, count)| {
                self.do_reshard_table(table_id, first, last, count, action.pivot_keys.clone())
            });

        let new_tablets = match resharded {
            Ok(new_tablets) => new_tablets,
            Err(err) => {
                for tablet_id in &old_tablets {
                    if let Some(tablet) = self.tablets.get_mut(tablet_id) {
                        tablet.action = Some(action.id);
                    }
                }
                if let Some(action) = self.actions.get_mut(&action.id) {
                    action.tablets = old_tablets;
                }
                return Err(err);
            }
        };

        for tablet_id in &new_tablets {
            if let Some(tablet) = self.tablets.get_mut(tablet_id) {
                tablet.action = Some(action.id);
            }
            self.set_expected_state(*tablet_id, expected_state);
        }
        if let Some(action) = self.actions.get_mut(&action.id) {
            action.tablets = new_tablets;
        }
        Ok(())
    }

    /// Put tablets of a failed action back into service
    fn mount_missed_in_action_tablets(&mut self, action_id: ActionId) {
        let (tablet_ids, freeze) = match self.actions.get(&action_id) {
            Some(action) => (action.tablets.clone(), action.freeze),
            None => return,
        };
        for tablet_id in tablet_ids {
            let state = match self.tablets.get(&tablet_id) {
                Some(tablet)
                    if tablet
                        .table
                        .map(|table_id| self.tables.contains_key(&table_id))
                        .unwrap_or(false) =>
                {
                    tablet.state
                }
                _ => continue,
            };
            match state {
                TabletState::Mounted => {}
                TabletState::Unmounted => self.do_mount_tablet(tablet_id, None, freeze),
                TabletState::Frozen => {
                    if !freeze {
                        self.do_unfreeze_tablet(tablet_id);
                    }
                }
                other => {
                    log_unless_recovery!(self, error, tablet_id = %tablet_id, action_id = %action_id, state = %other, "Error mounting missed in action tablet: unrecognized state");
                }
            }
        }
    }

    /// Account for a finished action; drop it unless it must be kept
    fn finish_tablet_action(&mut self, action_id: ActionId) {
        self.unbind_tablet_action(action_id);
        let (expired, bundle_id) = match self.actions.get(&action_id) {
            Some(action) => (action.expiration_time <= self.now(), action.bundle),
            None => return,
        };
        if let Some(bundle) = bundle_id.and_then(|id| self.bundles.get_mut(&id)) {
            bundle.decrease_active_action_count();
        }
        if expired {
            self.remove_tablet_action(action_id);
        }
        log_unless_recovery!(self, info, action_id = %action_id, removed = expired, "Tablet action finished");
    }

    fn remove_tablet_action(&mut self, action_id: ActionId) {
        if let Some(action) = self.actions.remove(&action_id) {
            if let Some(bundle) = action.bundle.and_then(|id| self.bundles.get_mut(&id)) {
                bundle.actions.remove(&action_id);
            }
        }
    }

    // Disturbances

    pub(super) fn on_tablet_action_disturbed(&mut self, action_id: ActionId, error: ActionError) {
        let (state, empty) = match self.actions.get(&action_id) {
            Some(action) => (action.state, action.tablets.is_empty()),
            None => return,
        };
        log_unless_recovery!(self, debug, action_id = %action_id, state = %state, error = %error.message, "Tablet action disturbed");

        let set_error = |manager: &mut Self| {
            if let Some(action) = manager.actions.get_mut(&action_id) {
                action.error = Some(error.clone());
            }
        };

        if empty {
            set_error(self);
            self.change_tablet_action_state(action_id, TabletActionState::Failed, true);
            return;
        }

        match state {
            TabletActionState::Unmounting | TabletActionState::Freezing => set_error(self),
            TabletActionState::Mounting | TabletActionState::Orphaned => {
                set_error(self);
                self.change_tablet_action_state(action_id, TabletActionState::Failed, true);
            }
            TabletActionState::Completed | TabletActionState::Failed => {}
            TabletActionState::Preparing
            | TabletActionState::Frozen
            | TabletActionState::Unmounted
            | TabletActionState::Mounted
            | TabletActionState::Failing => {
                error!(alert = true, action_id = %action_id, state = %state, "Tablet action disturbed in a transient state");
            }
        }
    }

    /// Release tablets `[first, last]` of a table from any action driving them
    pub(super) fn touch_affected_tablet_actions(
        &mut self,
        table_id: crate::metadata::TableId,
        first: usize,
        last: usize,
        request: &str,
    ) {
        let touched: BTreeSet<TabletId> = self
            .tablet_ids_in_range(table_id, first, last)
            .into_iter()
            .collect();
        let error = ActionError {
            code: ErrorCode::InvalidAction,
            message: format!("User request \"{}\" interfered with the action", request),
        };
        for tablet_id in &touched {
            if let Some(action_id) = self.tablets.get(tablet_id).and_then(|tablet| tablet.action) {
                self.on_tablet_action_tablets_touched(action_id, &touched, error.clone());
            }
        }
    }

    fn on_tablet_action_tablets_touched(
        &mut self,
        action_id: ActionId,
        touched: &BTreeSet<TabletId>,
        error: ActionError,
    ) {
        let released: Vec<TabletId> = match self.actions.get(&action_id) {
            Some(action) => action
                .tablets
                .iter()
                .filter(|id| touched.contains(id))
                .copied()
                .collect(),
            None => return,
        };
        if released.is_empty() {
            return;
        }

        for tablet_id in &released {
            let state = match self.tablets.get_mut(tablet_id) {
                Some(tablet) => {
                    tablet.action = None;
                    tablet.state
                }
                None => continue,
            };
            self.set_expected_state(*tablet_id, state);
        }
        if let Some(action) = self.actions.get_mut(&action_id) {
            action.tablets.retain(|id| !touched.contains(id));
        }

        self.unbind_tablet_action_from_cells(action_id);
        self.on_tablet_action_disturbed(action_id, error);
    }

    // Unbinding

    fn unbind_tablet_action_from_tablets(&mut self, action_id: ActionId) {
        let tablet_ids = match self.actions.get_mut(&action_id) {
            Some(action) => std::mem::take(&mut action.tablets),
            None => return,
        };
        for tablet_id in tablet_ids {
            let state = match self.tablets.get_mut(&tablet_id) {
                Some(tablet) if tablet.action == Some(action_id) => {
                    tablet.action = None;
                    tablet.state
                }
                _ => continue,
            };
            self.set_expected_state(tablet_id, state);
        }
    }

    pub(super) fn unbind_tablet_action_from_cells(&mut self, action_id: ActionId) {
        let cell_ids = match self.actions.get(&action_id) {
            Some(action) => action.cells.clone(),
            None => return,
        };
        for cell_id in cell_ids {
            if let Some(cell) = self.cells.get_mut(&cell_id) {
                cell.actions.remove(&action_id);
            }
        }
    }

    pub(super) fn unbind_tablet_action(&mut self, action_id: ActionId) {
        self.unbind_tablet_action_from_tablets(action_id);
        self.unbind_tablet_action_from_cells(action_id);
    }

    // Lifecycle

    pub fn destroy_tablet_action(&mut self, action_id: ActionId) {
        self.unbind_tablet_action(action_id);
        let (finished, bundle_id) = match self.actions.get(&action_id) {
            Some(action) => (action.is_finished(), action.bundle),
            None => return,
        };
        if !finished {
            if let Some(bundle) = bundle_id.and_then(|id| self.bundles.get_mut(&id)) {
                bundle.decrease_active_action_count();
            }
        }
        self.remove_tablet_action(action_id);
        log_unless_recovery!(self, debug, action_id = %action_id, "Tablet action destroyed");
    }

    pub fn destroy_tablet_actions(&mut self, action_ids: &[ActionId]) {
        for action_id in action_ids {
            self.destroy_tablet_action(*action_id);
        }
    }

    /// Retry orphaned actions whose bundle has healthy cells again
    pub fn kick_orphaned_tablet_actions(&mut self, action_ids: &[ActionId]) {
        for action_id in action_ids {
            let (bundle_id, cells) = match self.actions.get(action_id) {
                Some(action) if action.state == TabletActionState::Orphaned => {
                    (action.bundle, action.cells.clone())
                }
                _ => continue,
            };
            if !bundle_id.map(|id| self.check_has_healthy_cells(id)).unwrap_or(false) {
                continue;
            }

            let pins_healthy = cells.iter().all(|cell_id| {
                self.cells
                    .get(cell_id)
                    .map(|cell| !cell.decommission_started() && cell.health() == CellHealth::Good)
                    .unwrap_or(false)
            });
            if !pins_healthy {
                self.unbind_tablet_action_from_cells(*action_id);
                if let Some(action) = self.actions.get_mut(action_id) {
                    action.cells.clear();
                }
            }

            log_unless_recovery!(self, info, action_id = %action_id, "Kicking orphaned tablet action");
            self.change_tablet_action_state(*action_id, TabletActionState::Unmounted, true);
        }
    }

    pub fn remove_expired_tablet_actions(&mut self) {
        let now = self.now();
        let expired: Vec<ActionId> = self
            .actions
            .values()
            .filter(|action| action.is_finished() && action.expiration_time <= now)
            .map(|action| action.id)
            .collect();
        for action_id in expired {
            self.destroy_tablet_action(action_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::{chunk, TestCluster};
    use crate::metadata::PeerState;

    fn run_action(cluster: &mut TestCluster, request: CreateTabletActionRequest) -> ActionId {
        let action_id = cluster.manager.create_tablet_action(request).unwrap();
        cluster.deliver();
        action_id
    }

    #[test]
    fn test_move_action() {
        let mut cluster = TestCluster::with_cells(2);
        let table_id = cluster.sorted_table(&[]);
        let (a, b) = (cluster.cells[0], cluster.cells[1]);
        cluster
            .manager
            .mount_table(table_id, None, None, Some(a), &[], false)
            .unwrap();
        cluster.deliver();
        let tablet_id = cluster.manager.table_tablets(table_id)[0].id;

        let mut request = CreateTabletActionRequest::move_tablets(vec![tablet_id], vec![b]);
        request.keep_finished = true;
        let action_id = run_action(&mut cluster, request);

        let tablet = cluster.manager.find_tablet(tablet_id).unwrap();
        assert_eq!(tablet.state, TabletState::Mounted);
        assert_eq!(tablet.cell, Some(b));
        assert!(tablet.action.is_none());

        let action = cluster.manager.find_action(action_id).unwrap();
        assert_eq!(action.state, TabletActionState::Completed);
        assert!(action.error.is_none());
        assert!(cluster.manager.find_cell(b).unwrap().actions.is_empty());
        let bundle = cluster.manager.find_bundle(cluster.bundle_id).unwrap();
        assert_eq!(bundle.active_action_count, 0);
        assert!(bundle.actions.contains(&action_id));
    }

    #[test]
    fn test_finished_action_without_keep_is_removed() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = cluster.sorted_table(&[]);
        cluster.mount(table_id);
        let tablet_id = cluster.manager.table_tablets(table_id)[0].id;

        let action_id = run_action(
            &mut cluster,
            CreateTabletActionRequest::move_tablets(vec![tablet_id], vec![]),
        );
        assert!(cluster.manager.find_action(action_id).is_none());
        let bundle = cluster.manager.find_bundle(cluster.bundle_id).unwrap();
        assert!(bundle.actions.is_empty());
        assert_eq!(bundle.active_action_count, 0);
    }

    #[test]
    fn test_validation() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = cluster.sorted_table(&["c", "k"]);

        let err = cluster
            .manager
            .create_tablet_action(CreateTabletActionRequest::move_tablets(vec![], vec![]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidAction);

        let ids: Vec<_> = cluster
            .manager
            .table_tablets(table_id)
            .iter()
            .map(|t| t.id)
            .collect();
        let err = cluster
            .manager
            .create_tablet_action(CreateTabletActionRequest::move_tablets(vec![ids[0]], vec![]))
            .unwrap_err();
        assert!(err.message.contains("is in state \"unmounted\""));

        cluster.mount(table_id);
        let err = cluster
            .manager
            .create_tablet_action(CreateTabletActionRequest::reshard(
                vec![ids[0], ids[2]],
                vec![],
                Some(1),
            ))
            .unwrap_err();
        assert!(err.message.contains("are not consequent"));

        let err = cluster
            .manager
            .create_tablet_action(CreateTabletActionRequest::reshard(vec![ids[0]], vec![], None))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidAction);

        let err = cluster
            .manager
            .create_tablet_action(CreateTabletActionRequest::move_tablets(
                vec![ids[0], ids[1]],
                vec![cluster.cells[0]],
            ))
            .unwrap_err();
        assert!(err.message.contains("mismatch"));
    }

    #[test]
    fn test_reshard_action() {
        let mut cluster = TestCluster::with_cells(2);
        let table_id = cluster.sorted_table(&["k"]);
        cluster
            .manager
            .attach_chunks(table_id, 0, vec![chunk("a", "e", 100), chunk("f", "j", 100)])
            .unwrap();
        cluster
            .manager
            .attach_chunks(table_id, 1, vec![chunk("k", "z", 100)])
            .unwrap();
        cluster.mount(table_id);
        let ids: Vec<_> = cluster
            .manager
            .table_tablets(table_id)
            .iter()
            .map(|t| t.id)
            .collect();

        let mut request = CreateTabletActionRequest::reshard(
            ids.clone(),
            vec![Key::empty(), Key::from("f"), Key::from("k")],
            None,
        );
        request.keep_finished = true;
        let action_id = run_action(&mut cluster, request);

        let action = cluster.manager.find_action(action_id).unwrap();
        assert_eq!(action.state, TabletActionState::Completed, "{:?}", action.error);
        let tablets = cluster.manager.table_tablets(table_id);
        assert_eq!(tablets.len(), 3);
        assert!(tablets.iter().all(|t| t.state == TabletState::Mounted));
        assert!(tablets.iter().all(|t| !ids.contains(&t.id)));
        assert_eq!(tablets[1].pivot_key, Key::from("f"));
        assert_eq!(
            cluster.manager.find_table(table_id).unwrap().snapshot_statistics.uncompressed_data_size,
            300
        );
    }

    #[test]
    fn test_user_request_fails_action() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = cluster.sorted_table(&[]);
        cluster.mount(table_id);
        let tablet_id = cluster.manager.table_tablets(table_id)[0].id;

        let mut request = CreateTabletActionRequest::move_tablets(vec![tablet_id], vec![]);
        request.keep_finished = true;
        let action_id = cluster.manager.create_tablet_action(request).unwrap();
        assert_eq!(
            cluster.manager.find_action(action_id).unwrap().state,
            TabletActionState::Freezing
        );

        cluster.manager.unmount_table(table_id, true, None, None).unwrap();

        let action = cluster.manager.find_action(action_id).unwrap();
        assert_eq!(action.state, TabletActionState::Failed);
        let message = &action.error.as_ref().unwrap().message;
        assert!(message.contains("unmount_table"), "{}", message);
        let tablet = cluster.manager.find_tablet(tablet_id).unwrap();
        assert!(tablet.action.is_none());
        assert_eq!(tablet.state, TabletState::Unmounted);
        assert_eq!(tablet.expected_state, TabletState::Unmounted);
    }

    #[test]
    fn test_orphaned_action_is_kicked() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = cluster.sorted_table(&[]);
        cluster.mount(table_id);
        let tablet_id = cluster.manager.table_tablets(table_id)[0].id;
        let old_cell = cluster.cells[0];

        let mut request = CreateTabletActionRequest::move_tablets(vec![tablet_id], vec![]);
        request.keep_finished = true;
        let action_id = cluster.manager.create_tablet_action(request).unwrap();
        cluster.deliver();
        assert_eq!(
            cluster.manager.find_action(action_id).unwrap().state,
            TabletActionState::Completed
        );

        // Take the only cell down, then move again: nowhere to go.
        let mut request = CreateTabletActionRequest::move_tablets(vec![tablet_id], vec![]);
        request.keep_finished = true;
        let action_id = cluster.manager.create_tablet_action(request).unwrap();
        cluster.set_peer_state(old_cell, PeerState::None);
        cluster.deliver();
        let action = cluster.manager.find_action(action_id).unwrap();
        assert_eq!(action.state, TabletActionState::Orphaned);
        assert_eq!(
            cluster.manager.find_tablet(tablet_id).unwrap().state,
            TabletState::Unmounted
        );
        assert!(cluster.manager.orphaned_action_ids().contains(&action_id));

        // Nothing happens while the bundle is still unhealthy.
        cluster.manager.kick_orphaned_tablet_actions(&[action_id]);
        assert_eq!(
            cluster.manager.find_action(action_id).unwrap().state,
            TabletActionState::Orphaned
        );

        let new_cell = cluster.add_cell();
        cluster.manager.kick_orphaned_tablet_actions(&[action_id]);
        cluster.deliver();

        let action = cluster.manager.find_action(action_id).unwrap();
        assert_eq!(action.state, TabletActionState::Completed);
        let tablet = cluster.manager.find_tablet(tablet_id).unwrap();
        assert_eq!(tablet.state, TabletState::Mounted);
        assert_eq!(tablet.cell, Some(new_cell));
    }

    #[test]
    fn test_unhealthy_pinned_destination_orphans_move() {
        let mut cluster = TestCluster::with_cells(2);
        let table_id = cluster.sorted_table(&[]);
        let (a, b) = (cluster.cells[0], cluster.cells[1]);
        cluster
            .manager
            .mount_table(table_id, None, None, Some(a), &[], false)
            .unwrap();
        cluster.deliver();
        let tablet_id = cluster.manager.table_tablets(table_id)[0].id;

        let mut request = CreateTabletActionRequest::move_tablets(vec![tablet_id], vec![b]);
        request.keep_finished = true;
        let action_id = cluster.manager.create_tablet_action(request).unwrap();
        cluster.set_peer_state(b, PeerState::None);
        cluster.deliver();

        let action = cluster.manager.find_action(action_id).unwrap();
        assert_eq!(action.state, TabletActionState::Orphaned);
        assert!(action.error.is_none());
        assert_eq!(
            cluster.manager.find_tablet(tablet_id).unwrap().state,
            TabletState::Unmounted
        );

        cluster.set_peer_state(b, PeerState::Leading);
        cluster.manager.kick_orphaned_tablet_actions(&[action_id]);
        cluster.deliver();

        let action = cluster.manager.find_action(action_id).unwrap();
        assert_eq!(action.state, TabletActionState::Completed);
        let tablet = cluster.manager.find_tablet(tablet_id).unwrap();
        assert_eq!(tablet.state, TabletState::Mounted);
        assert_eq!(tablet.cell, Some(b));
        assert!(tablet.action.is_none());
    }

    #[test]
    fn test_failed_reshard_action_remounts_tablets() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = cluster.sorted_table(&["k"]);
        cluster.mount(table_id);
        let ids: Vec<_> = cluster
            .manager
            .table_tablets(table_id)
            .iter()
            .map(|t| t.id)
            .collect();

        // Valid at creation; the reshard itself rejects the non-empty first pivot.
        let mut request = CreateTabletActionRequest::reshard(
            ids.clone(),
            vec![Key::from("c"), Key::from("m")],
            None,
        );
        request.keep_finished = true;
        let action_id = run_action(&mut cluster, request);

        let action = cluster.manager.find_action(action_id).unwrap();
        assert_eq!(action.state, TabletActionState::Failed);
        assert_eq!(
            action.error.as_ref().unwrap().code,
            ErrorCode::InvalidPivotKeys
        );

        let tablets = cluster.manager.table_tablets(table_id);
        assert_eq!(tablets.iter().map(|t| t.id).collect::<Vec<_>>(), ids);
        assert!(tablets
            .iter()
            .all(|t| t.state == TabletState::Mounted && t.action.is_none()));
        assert_eq!(
            cluster.manager.find_bundle(cluster.bundle_id).unwrap().active_action_count,
            0
        );
    }

    #[test]
    fn test_expired_actions_are_removed() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = cluster.sorted_table(&[]);
        cluster.mount(table_id);
        let tablet_id = cluster.manager.table_tablets(table_id)[0].id;

        let mut request = CreateTabletActionRequest::move_tablets(vec![tablet_id], vec![]);
        request.keep_finished = true;
        let action_id = run_action(&mut cluster, request);
        assert!(cluster.manager.find_action(action_id).is_some());

        cluster.manager.remove_expired_tablet_actions();
        assert!(cluster.manager.find_action(action_id).is_some());

        cluster.advance_time(chrono::Duration::seconds(
            cluster.manager.config().tablet_action_expiration_timeout_secs + 1,
        ));
        cluster.apply(crate::mutation::Mutation::RemoveExpiredTabletActions).unwrap();
        assert!(cluster.manager.find_action(action_id).is_none());
    }

    #[test]
    fn test_destroy_running_action_releases_tablets() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = cluster.sorted_table(&[]);
        cluster.mount(table_id);
        let tablet_id = cluster.manager.table_tablets(table_id)[0].id;

        let action_id = cluster
            .manager
            .create_tablet_action(CreateTabletActionRequest::move_tablets(vec![tablet_id], vec![]))
            .unwrap();
        assert_eq!(
            cluster.manager.find_bundle(cluster.bundle_id).unwrap().active_action_count,
            1
        );

        cluster.manager.destroy_tablet_actions(&[action_id]);
        assert!(cluster.manager.find_action(action_id).is_none());
        assert!(cluster.manager.find_tablet(tablet_id).unwrap().action.is_none());
        assert_eq!(
            cluster.manager.find_bundle(cluster.bundle_id).unwrap().active_action_count,
            0
        );
    }
}
