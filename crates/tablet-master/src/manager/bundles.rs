//! Bundles, cells, peers and prerequisite leases

use super::TabletManager;
use crate::error::{ErrorCode, Result, TabletError};
use crate::hive::{MasterDestination, TabletCellMessage};
use crate::metadata::{
    ActionError, BundleId, CellHealth, CellId, CellLifeStage, Peer, PeerId, TabletCell,
    TabletCellBundle, TabletCellOptions, TransactionId, DEFAULT_BUNDLE_NAME,
};
use crate::mutation::Mutation;

impl TabletManager {
    pub(super) fn do_create_bundle(&mut self, id: BundleId, name: &str, options: TabletCellOptions) {
        self.bundles
            .insert(id, TabletCellBundle::new(id, name.to_string(), options));
        self.name_to_bundle.insert(name.to_string(), id);
    }

    pub fn create_bundle(&mut self, name: &str, options: TabletCellOptions) -> Result<BundleId> {
        if name.is_empty() {
            return Err(TabletError::new(
                ErrorCode::InvalidName,
                "Tablet cell bundle name cannot be empty",
            ));
        }
        if self.name_to_bundle.contains_key(name) {
            return Err(TabletError::new(
                ErrorCode::NameTaken,
                format!("Tablet cell bundle \"{}\" already exists", name),
            ));
        }
        if options.peer_count == 0 {
            return Err(TabletError::new(
                ErrorCode::InvalidOptions,
                "Peer count must be positive",
            ));
        }

        let id: BundleId = self.ids.generate(self.cell_tag);
        self.do_create_bundle(id, name, options);
        log_unless_recovery!(self, info, bundle_id = %id, name, "Tablet cell bundle created");
        Ok(id)
    }

    pub fn destroy_bundle(&mut self, bundle_id: BundleId) -> Result<()> {
        let bundle = self.get_bundle_or_err(bundle_id)?;
        if bundle.name == DEFAULT_BUNDLE_NAME {
            return Err(TabletError::new(
                ErrorCode::InvalidOptions,
                "Cannot remove builtin tablet cell bundle",
            ));
        }
        if !bundle.cells.is_empty() {
            return Err(TabletError::new(
                ErrorCode::InvalidOptions,
                format!(
                    "Cannot remove tablet cell bundle \"{}\" since it has {} active tablet cell(s)",
                    bundle.name,
                    bundle.cells.len()
                ),
            ));
        }
        if let Some(table) = self.tables.values().find(|t| t.bundle == Some(bundle_id)) {
            return Err(TabletError::new(
                ErrorCode::InvalidOptions,
                format!(
                    "Cannot remove tablet cell bundle \"{}\" since table {} uses it",
                    bundle.name, table.id
                ),
            ));
        }

        let action_ids: Vec<_> = bundle.actions.iter().copied().collect();
        for action_id in action_ids {
            self.unbind_tablet_action(action_id);
            self.actions.remove(&action_id);
        }

        if let Some(bundle) = self.bundles.remove(&bundle_id) {
            self.name_to_bundle.remove(&bundle.name);
            log_unless_recovery!(self, info, bundle_id = %bundle_id, name = %bundle.name, "Tablet cell bundle destroyed");
        }
        Ok(())
    }

    pub fn set_bundle_options(
        &mut self,
        bundle_id: BundleId,
        options: TabletCellOptions,
    ) -> Result<()> {
        let bundle = self.get_bundle_or_err(bundle_id)?;
        if options.peer_count == 0 {
            return Err(TabletError::new(
                ErrorCode::InvalidOptions,
                "Peer count must be positive",
            ));
        }
        if options.peer_count != bundle.options.peer_count && !bundle.cells.is_empty() {
            return Err(TabletError::new(
                ErrorCode::InvalidOptions,
                "Cannot change peer count since tablet cell bundle has some tablet cells",
            ));
        }

        let cell_ids: Vec<_> = bundle.cells.iter().copied().collect();
        if let Some(bundle) = self.bundles.get_mut(&bundle_id) {
            bundle.options = options;
        }
        for cell_id in cell_ids {
            self.restart_prerequisite_transaction(cell_id);
            self.reconfigure_cell(cell_id);
        }
        Ok(())
    }

    pub fn create_cell(&mut self, bundle_id: BundleId) -> Result<CellId> {
        let peer_count = self.get_bundle_or_err(bundle_id)?.options.peer_count;

        let id: CellId = self.ids.generate(self.cell_tag);
        self.cells
            .insert(id, TabletCell::new(id, bundle_id, peer_count));
        if let Some(bundle) = self.bundles.get_mut(&bundle_id) {
            bundle.cells.insert(id);
        }
        self.hive.create_mailbox(id);

        self.restart_prerequisite_transaction(id);
        self.reconfigure_cell(id);

        log_unless_recovery!(self, info, cell_id = %id, bundle_id = %bundle_id, peer_count, "Tablet cell created");
        Ok(id)
    }

    pub fn destroy_cell(&mut self, cell_id: CellId) -> Result<()> {
        let cell = self.get_cell_or_err(cell_id)?;
        if !cell.tablets.is_empty() {
            return Err(TabletError::new(
                ErrorCode::InvalidCell,
                format!(
                    "Cannot remove tablet cell {} since it has {} active tablet(s)",
                    cell_id,
                    cell.tablets.len()
                ),
            ));
        }

        let action_ids: Vec<_> = cell.actions.iter().copied().collect();
        let bundle_id = cell.bundle;
        let error = ActionError::from(TabletError::new(
            ErrorCode::InvalidCell,
            format!("Tablet cell {} has been removed", cell_id),
        ));
        for action_id in action_ids {
            self.unbind_tablet_action_from_cells(action_id);
            self.on_tablet_action_disturbed(action_id, error.clone());
        }

        self.hive.remove_mailbox(cell_id);

        let peer_count = self.cells.get(&cell_id).map(|c| c.peers.len()).unwrap_or(0);
        for peer_id in 0..peer_count {
            self.do_revoke_peer(cell_id, peer_id);
        }
        self.abort_prerequisite_transaction(cell_id);

        if let Some(bundle) = self.bundles.get_mut(&bundle_id) {
            bundle.cells.remove(&cell_id);
        }
        self.cells.remove(&cell_id);
        log_unless_recovery!(self, info, cell_id = %cell_id, "Tablet cell destroyed");
        Ok(())
    }

    // Peers

    pub fn assign_peers(&mut self, cell_id: CellId, peers: &[(PeerId, String)]) {
        let cell = match self.cells.get(&cell_id) {
            Some(cell) => cell,
            None => return,
        };
        let leading_peer_id = cell.leading_peer_id;
        let has_transaction = cell.prerequisite_transaction.is_some();

        let mut leading_peer_assigned = false;
        for (peer_id, address) in peers {
            let assigned = match self.cells.get_mut(&cell_id).and_then(|c| c.peers.get_mut(*peer_id)) {
                Some(peer) if peer.address.is_none() => {
                    peer.address = Some(address.clone());
                    peer.last_seen_time = Some(self.ctx.timestamp);
                    true
                }
                Some(_) => false,
                None => {
                    log_unless_recovery!(self, warn, cell_id = %cell_id, peer_id, "Peer id out of range");
                    false
                }
            };
            if !assigned {
                continue;
            }
            if *peer_id == leading_peer_id {
                leading_peer_assigned = true;
            }
            self.add_to_address_to_cell(address, cell_id, *peer_id);
            log_unless_recovery!(self, info, cell_id = %cell_id, peer_id, address = %address, "Tablet cell peer assigned");
        }

        if self.is_primary() {
            if leading_peer_assigned || !has_transaction {
                self.restart_prerequisite_transaction(cell_id);
            }
            if self.has_secondaries() {
                self.hive.post_to_master(
                    MasterDestination::Secondaries,
                    Mutation::AssignPeers {
                        cell_id,
                        peers: peers.to_vec(),
                    },
                );
            }
        }

        self.reconfigure_cell(cell_id);
    }

    pub fn revoke_peers(&mut self, cell_id: CellId, peer_ids: &[PeerId]) {
        let leading_peer_id = match self.cells.get(&cell_id) {
            Some(cell) => cell.leading_peer_id,
            None => return,
        };

        let mut leading_peer_revoked = false;
        for peer_id in peer_ids {
            if *peer_id == leading_peer_id {
                leading_peer_revoked = true;
            }
            self.do_revoke_peer(cell_id, *peer_id);
        }

        if self.is_primary() {
            if leading_peer_revoked {
                self.abort_prerequisite_transaction(cell_id);
            }
            if self.has_secondaries() {
                self.hive.post_to_master(
                    MasterDestination::Secondaries,
                    Mutation::RevokePeers {
                        cell_id,
                        peer_ids: peer_ids.to_vec(),
                    },
                );
            }
        }

        self.reconfigure_cell(cell_id);
    }

    pub fn set_leading_peer(&mut self, cell_id: CellId, peer_id: PeerId) {
        match self.cells.get_mut(&cell_id) {
            Some(cell) if peer_id < cell.peers.len() => cell.leading_peer_id = peer_id,
            Some(_) => {
                log_unless_recovery!(self, warn, cell_id = %cell_id, peer_id, "Leading peer id out of range");
                return;
            }
            None => return,
        }
        log_unless_recovery!(self, info, cell_id = %cell_id, peer_id, "Tablet cell leading peer updated");

        if self.is_primary() {
            self.restart_prerequisite_transaction(cell_id);
            if self.has_secondaries() {
                self.hive.post_to_master(
                    MasterDestination::Secondaries,
                    Mutation::SetLeadingPeer { cell_id, peer_id },
                );
            }
        }

        self.reconfigure_cell(cell_id);
    }

    fn do_revoke_peer(&mut self, cell_id: CellId, peer_id: PeerId) {
        let address = match self
            .cells
            .get(&cell_id)
            .and_then(|cell| cell.peers.get(peer_id))
            .and_then(|peer| peer.address.clone())
        {
            Some(address) => address,
            None => return,
        };

        self.detach_cell_from_node(&address, cell_id);
        self.remove_from_address_to_cell(&address, cell_id);
        if let Some(peer) = self
            .cells
            .get_mut(&cell_id)
            .and_then(|cell| cell.peers.get_mut(peer_id))
        {
            *peer = Peer::default();
        }
        log_unless_recovery!(self, info, cell_id = %cell_id, peer_id, address = %address, "Tablet cell peer revoked");
    }

    /// Bump the config version so hosting nodes notice the change
    pub(super) fn reconfigure_cell(&mut self, cell_id: CellId) {
        if let Some(cell) = self.cells.get_mut(&cell_id) {
            cell.config_version += 1;
            log_unless_recovery!(self, debug, cell_id = %cell_id, config_version = cell.config_version, "Tablet cell reconfigured");
        }
    }

    pub(super) fn add_to_address_to_cell(&mut self, address: &str, cell_id: CellId, peer_id: PeerId) {
        let cells = self.address_to_cell.entry(address.to_string()).or_default();
        if !cells.iter().any(|(id, _)| *id == cell_id) {
            cells.push((cell_id, peer_id));
        }
    }

    pub(super) fn remove_from_address_to_cell(&mut self, address: &str, cell_id: CellId) {
        if let Some(cells) = self.address_to_cell.get_mut(address) {
            cells.retain(|(id, _)| *id != cell_id);
            if cells.is_empty() {
                self.address_to_cell.remove(address);
            }
        }
    }

    // Prerequisite leases

    fn restart_prerequisite_transaction(&mut self, cell_id: CellId) {
        if !self.is_primary() {
            return;
        }
        self.abort_prerequisite_transaction(cell_id);
        self.start_prerequisite_transaction(cell_id);
    }

    fn start_prerequisite_transaction(&mut self, cell_id: CellId) {
        if !self.cells.contains_key(&cell_id) {
            return;
        }
        let transaction_id: TransactionId = self.ids.generate(self.cell_tag);
        self.on_prerequisite_transaction_started(cell_id, transaction_id);

        if self.has_secondaries() {
            self.hive.post_to_master(
                MasterDestination::Secondaries,
                Mutation::StartPrerequisiteTransaction {
                    cell_id,
                    transaction_id,
                },
            );
        }
    }

    fn abort_prerequisite_transaction(&mut self, cell_id: CellId) {
        let transaction_id = match self
            .cells
            .get_mut(&cell_id)
            .and_then(|cell| cell.prerequisite_transaction.take())
        {
            Some(transaction_id) => transaction_id,
            None => return,
        };
        self.transaction_to_cell.remove(&transaction_id);
        log_unless_recovery!(self, info, cell_id = %cell_id, transaction_id = %transaction_id, "Tablet cell prerequisite transaction aborted");

        if self.is_primary() && self.has_secondaries() {
            self.hive.post_to_master(
                MasterDestination::Secondaries,
                Mutation::AbortPrerequisiteTransaction {
                    cell_id,
                    transaction_id,
                },
            );
        }
    }

    pub fn on_prerequisite_transaction_started(
        &mut self,
        cell_id: CellId,
        transaction_id: TransactionId,
    ) {
        let cell = match self.cells.get_mut(&cell_id) {
            Some(cell) => cell,
            None => return,
        };
        if let Some(old) = cell.prerequisite_transaction.replace(transaction_id) {
            self.transaction_to_cell.remove(&old);
        }
        self.transaction_to_cell.insert(transaction_id, cell_id);
        log_unless_recovery!(self, info, cell_id = %cell_id, transaction_id = %transaction_id, "Tablet cell prerequisite transaction started");
    }

    pub fn on_prerequisite_transaction_aborted(
        &mut self,
        cell_id: CellId,
        transaction_id: TransactionId,
    ) {
        if let Some(cell) = self.cells.get_mut(&cell_id) {
            if cell.prerequisite_transaction == Some(transaction_id) {
                cell.prerequisite_transaction = None;
            }
        }
        self.transaction_to_cell.remove(&transaction_id);
    }

    /// Lease loss: the cell loses every peer
    pub fn on_transaction_finished(&mut self, transaction_id: TransactionId) {
        let cell_id = match self.transaction_to_cell.remove(&transaction_id) {
            Some(cell_id) => cell_id,
            None => return,
        };
        let peer_count = match self.cells.get_mut(&cell_id) {
            Some(cell) => {
                cell.prerequisite_transaction = None;
                cell.peers.len()
            }
            None => return,
        };
        log_unless_recovery!(self, info, cell_id = %cell_id, transaction_id = %transaction_id, "Tablet cell prerequisite transaction finished, revoking peers");

        let peer_ids: Vec<PeerId> = (0..peer_count).collect();
        self.revoke_peers(cell_id, &peer_ids);
    }

    // Decommission

    pub fn decommission_cell(&mut self, cell_id: CellId) {
        let action_ids: Vec<_> = match self.cells.get_mut(&cell_id) {
            Some(cell) if !cell.decommission_started() => {
                cell.life_stage = CellLifeStage::DecommissioningOnMaster;
                cell.local_statistics.decommissioned = true;
                cell.actions.iter().copied().collect()
            }
            _ => return,
        };
        log_unless_recovery!(self, info, cell_id = %cell_id, "Tablet cell decommission started");

        let error = ActionError::from(TabletError::new(
            ErrorCode::InvalidCell,
            format!("Tablet cell {} has been decommissioned", cell_id),
        ));
        for action_id in action_ids {
            self.unbind_tablet_action_from_cells(action_id);
            self.on_tablet_action_disturbed(action_id, error.clone());
        }
    }

    /// Cells whose tablets are gone and may be released on the hosting node
    pub fn cells_ready_for_node_decommission(&self) -> Vec<CellId> {
        self.cells
            .values()
            .filter(|cell| {
                cell.life_stage == CellLifeStage::DecommissioningOnMaster && cell.tablets.is_empty()
            })
            .map(|cell| cell.id)
            .collect()
    }

    pub fn on_cell_decommissioned_on_master(&mut self, cell_id: CellId) {
        match self.cells.get_mut(&cell_id) {
            Some(cell)
                if cell.life_stage == CellLifeStage::DecommissioningOnMaster
                    && cell.tablets.is_empty() =>
            {
                cell.life_stage = CellLifeStage::DecommissioningOnNode;
            }
            _ => return,
        }
        self.hive
            .post_message(cell_id, TabletCellMessage::DecommissionTabletCell);
        log_unless_recovery!(self, info, cell_id = %cell_id, "Tablet cell decommissioned on master");
    }

    pub fn on_cell_decommissioned_on_node(&mut self, cell_id: CellId) {
        match self.cells.get_mut(&cell_id) {
            Some(cell) if cell.life_stage == CellLifeStage::DecommissioningOnNode => {
                cell.life_stage = CellLifeStage::Decommissioned;
            }
            _ => return,
        }
        log_unless_recovery!(self, info, cell_id = %cell_id, "Tablet cell decommissioned on node");
    }

    /// Fold cell health into bundle health, worst wins
    pub fn update_cell_health_statistics(&mut self) {
        for cell in self.cells.values_mut() {
            cell.local_statistics.health = cell.health();
            cell.local_statistics.decommissioned = cell.decommission_started();
        }

        let healths: Vec<(BundleId, CellHealth)> = self
            .bundles
            .values()
            .map(|bundle| {
                let health = bundle
                    .cells
                    .iter()
                    .filter_map(|id| self.cells.get(id))
                    .fold(CellHealth::Good, |health, cell| health.combine(cell.health()));
                (bundle.id, health)
            })
            .collect();
        for (bundle_id, health) in healths {
            if let Some(bundle) = self.bundles.get_mut(&bundle_id) {
                if bundle.health != health {
                    log_unless_recovery!(self, debug, bundle_id = %bundle_id, health = %health, "Tablet cell bundle health changed");
                }
                bundle.health = health;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorCode;
    use crate::manager::testing::TestCluster;
    use crate::metadata::{CellHealth, CellLifeStage, TabletCellOptions};

    #[test]
    fn test_bundle_name_rules() {
        let mut cluster = TestCluster::new();
        let manager = &mut cluster.manager;

        let err = manager.create_bundle("", TabletCellOptions::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidName);

        let err = manager
            .create_bundle("default", TabletCellOptions::default())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NameTaken);

        let id = manager
            .create_bundle("analytics", TabletCellOptions::default())
            .unwrap();
        assert_eq!(manager.find_bundle_by_name("analytics").unwrap().id, id);
        manager.destroy_bundle(id).unwrap();
        assert!(manager.find_bundle_by_name("analytics").is_none());

        let default = manager.default_bundle_id().unwrap();
        assert!(manager.destroy_bundle(default).is_err());
    }

    #[test]
    fn test_peer_count_frozen_while_cells_exist() {
        let mut cluster = TestCluster::with_cells(1);
        let bundle_id = cluster.bundle_id;
        let options = TabletCellOptions {
            peer_count: 3,
            ..Default::default()
        };
        let err = cluster
            .manager
            .set_bundle_options(bundle_id, options)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidOptions);
    }

    #[test]
    fn test_new_cell_has_lease_and_mailbox() {
        let mut cluster = TestCluster::new();
        let cell_id = cluster.manager.create_cell(cluster.bundle_id).unwrap();
        let cell = cluster.manager.find_cell(cell_id).unwrap();
        assert!(cell.prerequisite_transaction.is_some());
        assert!(cell.config_version > 0);
        assert!(cluster.manager.hive().find_mailbox(cell_id).is_some());
    }

    #[test]
    fn test_lease_loss_revokes_peers() {
        let mut cluster = TestCluster::with_cells(1);
        let cell_id = cluster.cells[0];
        let transaction_id = cluster
            .manager
            .find_cell(cell_id)
            .unwrap()
            .prerequisite_transaction
            .unwrap();
        let version = cluster.manager.find_cell(cell_id).unwrap().config_version;

        cluster.manager.on_transaction_finished(transaction_id);

        let cell = cluster.manager.find_cell(cell_id).unwrap();
        assert!(cell.peers.iter().all(|peer| peer.address.is_none()));
        assert!(cell.config_version > version);
        assert_eq!(cell.health(), CellHealth::Initializing);
        assert!(cluster.manager.cells_for_address("node-0").is_empty());
    }

    #[test]
    fn test_out_of_range_peers_are_ignored_during_recovery() {
        let mut cluster = TestCluster::with_cells(1);
        let cell_id = cluster.cells[0];
        cluster.manager.set_recovery(true);

        cluster
            .manager
            .assign_peers(cell_id, &[(7, "node-x".to_string())]);
        cluster.manager.set_leading_peer(cell_id, 7);

        let cell = cluster.manager.find_cell(cell_id).unwrap();
        assert_eq!(cell.peers.len(), 1);
        assert_eq!(cell.peers[0].address.as_deref(), Some("node-0"));
        assert_eq!(cell.leading_peer_id, 0);
        assert!(cluster.manager.cells_for_address("node-x").is_empty());
    }

    #[test]
    fn test_decommission_stages() {
        let mut cluster = TestCluster::with_cells(2);
        let cell_id = cluster.cells[1];
        cluster.manager.decommission_cell(cell_id);
        assert!(!cluster.manager.is_cell_active(cell_id));
        assert_eq!(
            cluster.manager.cells_ready_for_node_decommission(),
            vec![cell_id]
        );

        cluster.manager.on_cell_decommissioned_on_master(cell_id);
        cluster.manager.on_cell_decommissioned_on_node(cell_id);
        let cell = cluster.manager.find_cell(cell_id).unwrap();
        assert_eq!(cell.life_stage, CellLifeStage::Decommissioned);
        assert!(cluster
            .manager
            .hive_mut()
            .drain_outbox()
            .iter()
            .any(|m| m.cell_id == cell_id && m.message.name() == "decommission_tablet_cell"));
    }

    #[test]
    fn test_bundle_health_is_worst_cell() {
        let mut cluster = TestCluster::with_cells(2);
        cluster.manager.update_cell_health_statistics();
        assert_eq!(
            cluster.manager.find_bundle(cluster.bundle_id).unwrap().health,
            CellHealth::Good
        );

        cluster.manager.revoke_peers(cluster.cells[0], &[0]);
        cluster.manager.update_cell_health_statistics();
        assert_eq!(
            cluster.manager.find_bundle(cluster.bundle_id).unwrap().health,
            CellHealth::Initializing
        );
    }
}
