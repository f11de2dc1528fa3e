//! Replicated mutations
//!
//! Every state change enters the tablet manager as a [`Mutation`] applied
//! under a [`MutationContext`]. Applying the same sequence of mutations with
//! the same contexts yields the same state on every replica.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::manager::{
    CreateTableOptions, CreateTabletActionRequest, HeartbeatRequest, HeartbeatResponse,
    TabletManager,
};
use crate::metadata::{
    ActionId, Atomicity, BundleId, CellId, CellTag, ChunkId, ChunkSpec, Key, PeerId, ReplicaId,
    ReplicaMode, TableId, TableMountConfig, TableStatisticsUpdate, TabletCellOptions,
    TabletCellStatistics, TabletId, TransactionId,
};

/// Deterministic inputs of one mutation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationContext {
    /// Monotonic mutation number; doubles as the mount revision
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub random_seed: u64,
}

impl MutationContext {
    pub fn new(version: u64, timestamp: DateTime<Utc>, random_seed: u64) -> Self {
        Self {
            version,
            timestamp,
            random_seed,
        }
    }
}

/// Tablet manager mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
    CreateBundle {
        name: String,
        #[serde(default)]
        options: TabletCellOptions,
    },
    DestroyBundle {
        bundle_id: BundleId,
    },
    SetBundleOptions {
        bundle_id: BundleId,
        options: TabletCellOptions,
    },
    CreateCell {
        bundle_id: BundleId,
    },
    DestroyCell {
        cell_id: CellId,
    },
    AssignPeers {
        cell_id: CellId,
        peers: Vec<(PeerId, String)>,
    },
    RevokePeers {
        cell_id: CellId,
        peer_ids: Vec<PeerId>,
    },
    SetLeadingPeer {
        cell_id: CellId,
        peer_id: PeerId,
    },
    StartPrerequisiteTransaction {
        cell_id: CellId,
        transaction_id: TransactionId,
    },
    AbortPrerequisiteTransaction {
        cell_id: CellId,
        transaction_id: TransactionId,
    },
    OnTransactionFinished {
        transaction_id: TransactionId,
    },
    DecommissionCell {
        cell_id: CellId,
    },
    OnCellDecommissionedOnMaster {
        cell_id: CellId,
    },
    OnCellDecommissionedOnNode {
        cell_id: CellId,
    },
    UpdateCellHealthStatistics,

    CreateTable(CreateTableOptions),
    DestroyTable {
        table_id: TableId,
    },
    AttachChunks {
        table_id: TableId,
        tablet_index: usize,
        chunks: Vec<ChunkSpec>,
    },
    SetTableStatistics {
        table_id: TableId,
        modification_time: Option<DateTime<Utc>>,
        access_time: Option<DateTime<Utc>>,
    },

    MountTable {
        table_id: TableId,
        first_tablet_index: Option<usize>,
        last_tablet_index: Option<usize>,
        hint_cell_id: Option<CellId>,
        #[serde(default)]
        target_cell_ids: Vec<CellId>,
        #[serde(default)]
        freeze: bool,
    },
    UnmountTable {
        table_id: TableId,
        first_tablet_index: Option<usize>,
        last_tablet_index: Option<usize>,
        #[serde(default)]
        force: bool,
    },
    RemountTable {
        table_id: TableId,
        first_tablet_index: Option<usize>,
        last_tablet_index: Option<usize>,
        mount_config: Option<TableMountConfig>,
    },
    FreezeTable {
        table_id: TableId,
        first_tablet_index: Option<usize>,
        last_tablet_index: Option<usize>,
    },
    UnfreezeTable {
        table_id: TableId,
        first_tablet_index: Option<usize>,
        last_tablet_index: Option<usize>,
    },
    ReshardTable {
        table_id: TableId,
        first_tablet_index: Option<usize>,
        last_tablet_index: Option<usize>,
        tablet_count: Option<usize>,
        #[serde(default)]
        pivot_keys: Vec<Key>,
    },

    OnTabletMounted {
        tablet_id: TabletId,
        mount_revision: u64,
        frozen: bool,
    },
    OnTabletUnmounted {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    OnTabletFrozen {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    OnTabletUnfrozen {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    UpdateTabletTrimmedRowCount {
        tablet_id: TabletId,
        mount_revision: u64,
        trimmed_row_count: i64,
    },

    CreateTableReplica {
        table_id: TableId,
        cluster_name: String,
        replica_path: String,
        mode: Option<ReplicaMode>,
        atomicity: Option<Atomicity>,
        preserve_timestamps: Option<bool>,
        #[serde(default)]
        start_replication_timestamp: u64,
    },
    DestroyTableReplica {
        replica_id: ReplicaId,
    },
    AlterTableReplica {
        replica_id: ReplicaId,
        enabled: Option<bool>,
        mode: Option<ReplicaMode>,
        atomicity: Option<Atomicity>,
        preserve_timestamps: Option<bool>,
    },
    OnTableReplicaEnabled {
        tablet_id: TabletId,
        replica_id: ReplicaId,
        mount_revision: u64,
    },
    OnTableReplicaDisabled {
        tablet_id: TabletId,
        replica_id: ReplicaId,
        mount_revision: u64,
    },
    UpdateTableReplicaStatistics {
        tablet_id: TabletId,
        replica_id: ReplicaId,
        mount_revision: u64,
        current_replication_row_index: i64,
        current_replication_timestamp: u64,
    },

    CreateTabletAction(CreateTabletActionRequest),
    DestroyTabletActions {
        action_ids: Vec<ActionId>,
    },
    KickOrphanedTabletActions {
        action_ids: Vec<ActionId>,
    },
    RemoveExpiredTabletActions,

    SendTableStatisticsUpdates {
        count: usize,
    },
    UpdateTableStatistics {
        entries: Vec<(TableId, TableStatisticsUpdate)>,
    },
    GossipCellStatistics,
    SetTabletCellStatistics {
        cell_tag: CellTag,
        entries: Vec<(CellId, TabletCellStatistics)>,
    },

    IncrementalHeartbeat(HeartbeatRequest),
    UnregisterNode {
        address: String,
    },
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::CreateBundle { .. } => "create_bundle",
            Mutation::DestroyBundle { .. } => "destroy_bundle",
            Mutation::SetBundleOptions { .. } => "set_bundle_options",
            Mutation::CreateCell { .. } => "create_cell",
            Mutation::DestroyCell { .. } => "destroy_cell",
            Mutation::AssignPeers { .. } => "assign_peers",
            Mutation::RevokePeers { .. } => "revoke_peers",
            Mutation::SetLeadingPeer { .. } => "set_leading_peer",
            Mutation::StartPrerequisiteTransaction { .. } => "start_prerequisite_transaction",
            Mutation::AbortPrerequisiteTransaction { .. } => "abort_prerequisite_transaction",
            Mutation::OnTransactionFinished { .. } => "on_transaction_finished",
            Mutation::DecommissionCell { .. } => "decommission_cell",
            Mutation::OnCellDecommissionedOnMaster { .. } => "on_cell_decommissioned_on_master",
            Mutation::OnCellDecommissionedOnNode { .. } => "on_cell_decommissioned_on_node",
            Mutation::UpdateCellHealthStatistics => "update_cell_health_statistics",
            Mutation::CreateTable(_) => "create_table",
            Mutation::DestroyTable { .. } => "destroy_table",
            Mutation::AttachChunks { .. } => "attach_chunks",
            Mutation::SetTableStatistics { .. } => "set_table_statistics",
            Mutation::MountTable { .. } => "mount_table",
            Mutation::UnmountTable { .. } => "unmount_table",
            Mutation::RemountTable { .. } => "remount_table",
            Mutation::FreezeTable { .. } => "freeze_table",
            Mutation::UnfreezeTable { .. } => "unfreeze_table",
            Mutation::ReshardTable { .. } => "reshard_table",
            Mutation::OnTabletMounted { .. } => "on_tablet_mounted",
            Mutation::OnTabletUnmounted { .. } => "on_tablet_unmounted",
            Mutation::OnTabletFrozen { .. } => "on_tablet_frozen",
            Mutation::OnTabletUnfrozen { .. } => "on_tablet_unfrozen",
            Mutation::UpdateTabletTrimmedRowCount { .. } => "update_tablet_trimmed_row_count",
            Mutation::CreateTableReplica { .. } => "create_table_replica",
            Mutation::DestroyTableReplica { .. } => "destroy_table_replica",
            Mutation::AlterTableReplica { .. } => "alter_table_replica",
            Mutation::OnTableReplicaEnabled { .. } => "on_table_replica_enabled",
            Mutation::OnTableReplicaDisabled { .. } => "on_table_replica_disabled",
            Mutation::UpdateTableReplicaStatistics { .. } => "update_table_replica_statistics",
            Mutation::CreateTabletAction(_) => "create_tablet_action",
            Mutation::DestroyTabletActions { .. } => "destroy_tablet_actions",
            Mutation::KickOrphanedTabletActions { .. } => "kick_orphaned_tablet_actions",
            Mutation::RemoveExpiredTabletActions => "remove_expired_tablet_actions",
            Mutation::SendTableStatisticsUpdates { .. } => "send_table_statistics_updates",
            Mutation::UpdateTableStatistics { .. } => "update_table_statistics",
            Mutation::GossipCellStatistics => "gossip_cell_statistics",
            Mutation::SetTabletCellStatistics { .. } => "set_tablet_cell_statistics",
            Mutation::IncrementalHeartbeat(_) => "incremental_heartbeat",
            Mutation::UnregisterNode { .. } => "unregister_node",
        }
    }
}

/// Result of applying a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MutationResponse {
    Ok,
    Bundle(BundleId),
    Cell(CellId),
    Table(TableId),
    Tablets(Vec<TabletId>),
    Chunks(Vec<ChunkId>),
    Replica(ReplicaId),
    Action(ActionId),
    Heartbeat(HeartbeatResponse),
}

impl TabletManager {
    /// Apply one mutation
    ///
    /// A failed mutation leaves no partial changes behind: every operation
    /// validates before it mutates.
    pub fn apply_mutation(
        &mut self,
        ctx: MutationContext,
        mutation: Mutation,
    ) -> Result<MutationResponse> {
        self.begin_mutation(ctx);

        match mutation {
            Mutation::CreateBundle { name, options } => {
                self.create_bundle(&name, options).map(MutationResponse::Bundle)
            }
            Mutation::DestroyBundle { bundle_id } => {
                self.destroy_bundle(bundle_id)?;
                Ok(MutationResponse::Ok)
            }
            Mutation::SetBundleOptions { bundle_id, options } => {
                self.set_bundle_options(bundle_id, options)?;
                Ok(MutationResponse::Ok)
            }
            Mutation::CreateCell { bundle_id } => {
                self.create_cell(bundle_id).map(MutationResponse::Cell)
            }
            Mutation::DestroyCell { cell_id } => {
                self.destroy_cell(cell_id)?;
                Ok(MutationResponse::Ok)
            }
            Mutation::AssignPeers { cell_id, peers } => {
                self.assign_peers(cell_id, &peers);
                Ok(MutationResponse::Ok)
            }
            Mutation::RevokePeers { cell_id, peer_ids } => {
                self.revoke_peers(cell_id, &peer_ids);
                Ok(MutationResponse::Ok)
            }
            Mutation::SetLeadingPeer { cell_id, peer_id } => {
                self.set_leading_peer(cell_id, peer_id);
                Ok(MutationResponse::Ok)
            }
            Mutation::StartPrerequisiteTransaction {
                cell_id,
                transaction_id,
            } => {
                self.on_prerequisite_transaction_started(cell_id, transaction_id);
                Ok(MutationResponse::Ok)
            }
            Mutation::AbortPrerequisiteTransaction {
                cell_id,
                transaction_id,
            } => {
                self.on_prerequisite_transaction_aborted(cell_id, transaction_id);
                Ok(MutationResponse::Ok)
            }
            Mutation::OnTransactionFinished { transaction_id } => {
                self.on_transaction_finished(transaction_id);
                Ok(MutationResponse::Ok)
            }
            Mutation::DecommissionCell { cell_id } => {
                self.decommission_cell(cell_id);
                Ok(MutationResponse::Ok)
            }
            Mutation::OnCellDecommissionedOnMaster { cell_id } => {
                self.on_cell_decommissioned_on_master(cell_id);
                Ok(MutationResponse::Ok)
            }
            Mutation::OnCellDecommissionedOnNode { cell_id } => {
                self.on_cell_decommissioned_on_node(cell_id);
                Ok(MutationResponse::Ok)
            }
            Mutation::UpdateCellHealthStatistics => {
                self.update_cell_health_statistics();
                Ok(MutationResponse::Ok)
            }

            Mutation::CreateTable(options) => {
                self.create_table(options).map(MutationResponse::Table)
            }
            Mutation::DestroyTable { table_id } => {
                self.destroy_table(table_id)?;
                Ok(MutationResponse::Ok)
            }
            Mutation::AttachChunks {
                table_id,
                tablet_index,
                chunks,
            } => self
                .attach_chunks(table_id, tablet_index, chunks)
                .map(MutationResponse::Chunks),
            Mutation::SetTableStatistics {
                table_id,
                modification_time,
                access_time,
            } => {
                self.set_table_statistics(table_id, modification_time, access_time)?;
                Ok(MutationResponse::Ok)
            }

            Mutation::MountTable {
                table_id,
                first_tablet_index,
                last_tablet_index,
                hint_cell_id,
                target_cell_ids,
                freeze,
            } => {
                self.mount_table(
                    table_id,
                    first_tablet_index,
                    last_tablet_index,
                    hint_cell_id,
                    &target_cell_ids,
                    freeze,
                )?;
                Ok(MutationResponse::Ok)
            }
            Mutation::UnmountTable {
                table_id,
                first_tablet_index,
                last_tablet_index,
                force,
            } => {
                self.unmount_table(table_id, force, first_tablet_index, last_tablet_index)?;
                Ok(MutationResponse::Ok)
            }
            Mutation::RemountTable {
                table_id,
                first_tablet_index,
                last_tablet_index,
                mount_config,
            } => {
                self.remount_table(table_id, first_tablet_index, last_tablet_index, mount_config)?;
                Ok(MutationResponse::Ok)
            }
            Mutation::FreezeTable {
                table_id,
                first_tablet_index,
                last_tablet_index,
            } => {
                self.freeze_table(table_id, first_tablet_index, last_tablet_index)?;
                Ok(MutationResponse::Ok)
            }
            Mutation::UnfreezeTable {
                table_id,
                first_tablet_index,
                last_tablet_index,
            } => {
                self.unfreeze_table(table_id, first_tablet_index, last_tablet_index)?;
                Ok(MutationResponse::Ok)
            }
            Mutation::ReshardTable {
                table_id,
                first_tablet_index,
                last_tablet_index,
                tablet_count,
                pivot_keys,
            } => self
                .reshard_table(
                    table_id,
                    first_tablet_index,
                    last_tablet_index,
                    tablet_count,
                    pivot_keys,
                )
                .map(MutationResponse::Tablets),

            Mutation::OnTabletMounted {
                tablet_id,
                mount_revision,
                frozen,
            } => {
                self.on_tablet_mounted(tablet_id, mount_revision, frozen);
                Ok(MutationResponse::Ok)
            }
            Mutation::OnTabletUnmounted {
                tablet_id,
                mount_revision,
            } => {
                self.on_tablet_unmounted(tablet_id, mount_revision);
                Ok(MutationResponse::Ok)
            }
            Mutation::OnTabletFrozen {
                tablet_id,
                mount_revision,
            } => {
                self.on_tablet_frozen(tablet_id, mount_revision);
                Ok(MutationResponse::Ok)
            }
            Mutation::OnTabletUnfrozen {
                tablet_id,
                mount_revision,
            } => {
                self.on_tablet_unfrozen(tablet_id, mount_revision);
                Ok(MutationResponse::Ok)
            }
            Mutation::UpdateTabletTrimmedRowCount {
                tablet_id,
                mount_revision,
                trimmed_row_count,
            } => {
                self.update_tablet_trimmed_row_count(tablet_id, mount_revision, trimmed_row_count);
                Ok(MutationResponse::Ok)
            }

            Mutation::CreateTableReplica {
                table_id,
                cluster_name,
                replica_path,
                mode,
                atomicity,
                preserve_timestamps,
                start_replication_timestamp,
            } => self
                .create_table_replica(
                    table_id,
                    &cluster_name,
                    &replica_path,
                    mode,
                    atomicity,
                    preserve_timestamps,
                    start_replication_timestamp,
                )
                .map(MutationResponse::Replica),
            Mutation::DestroyTableReplica { replica_id } => {
                self.destroy_table_replica(replica_id)?;
                Ok(MutationResponse::Ok)
            }
            Mutation::AlterTableReplica {
                replica_id,
                enabled,
                mode,
                atomicity,
                preserve_timestamps,
            } => {
                self.alter_table_replica(replica_id, enabled, mode, atomicity, preserve_timestamps)?;
                Ok(MutationResponse::Ok)
            }
            Mutation::OnTableReplicaEnabled {
                tablet_id,
                replica_id,
                mount_revision,
            } => {
                self.on_table_replica_enabled(tablet_id, replica_id, mount_revision);
                Ok(MutationResponse::Ok)
            }
            Mutation::OnTableReplicaDisabled {
                tablet_id,
                replica_id,
                mount_revision,
            } => {
                self.on_table_replica_disabled(tablet_id, replica_id, mount_revision);
                Ok(MutationResponse::Ok)
            }
            Mutation::UpdateTableReplicaStatistics {
                tablet_id,
                replica_id,
                mount_revision,
                current_replication_row_index,
                current_replication_timestamp,
            } => {
                self.update_table_replica_statistics(
                    tablet_id,
                    replica_id,
                    mount_revision,
                    current_replication_row_index,
                    current_replication_timestamp,
                );
                Ok(MutationResponse::Ok)
            }

            Mutation::CreateTabletAction(request) => self
                .create_tablet_action(request)
                .map(MutationResponse::Action),
            Mutation::DestroyTabletActions { action_ids } => {
                self.destroy_tablet_actions(&action_ids);
                Ok(MutationResponse::Ok)
            }
            Mutation::KickOrphanedTabletActions { action_ids } => {
                self.kick_orphaned_tablet_actions(&action_ids);
                Ok(MutationResponse::Ok)
            }
            Mutation::RemoveExpiredTabletActions => {
                self.remove_expired_tablet_actions();
                Ok(MutationResponse::Ok)
            }

            Mutation::SendTableStatisticsUpdates { count } => {
                self.send_table_statistics_updates(count);
                Ok(MutationResponse::Ok)
            }
            Mutation::UpdateTableStatistics { entries } => {
                self.update_table_statistics(entries);
                Ok(MutationResponse::Ok)
            }
            Mutation::GossipCellStatistics => {
                self.gossip_cell_statistics();
                Ok(MutationResponse::Ok)
            }
            Mutation::SetTabletCellStatistics { cell_tag, entries } => {
                self.set_tablet_cell_statistics(cell_tag, entries);
                Ok(MutationResponse::Ok)
            }

            Mutation::IncrementalHeartbeat(request) => Ok(MutationResponse::Heartbeat(
                self.on_incremental_heartbeat(request),
            )),
            Mutation::UnregisterNode { address } => {
                self.on_node_unregistered(&address);
                Ok(MutationResponse::Ok)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_json_shape() {
        let mutation = Mutation::MountTable {
            table_id: TableId(5),
            first_tablet_index: None,
            last_tablet_index: None,
            hint_cell_id: None,
            target_cell_ids: vec![],
            freeze: true,
        };
        let json = serde_json::to_value(&mutation).unwrap();
        assert_eq!(json["type"], "mount_table");
        assert_eq!(json["freeze"], true);

        let parsed: Mutation =
            serde_json::from_str(r#"{"type": "unmount_table", "table_id": 5, "first_tablet_index": null, "last_tablet_index": null}"#)
                .unwrap();
        assert_eq!(parsed.name(), "unmount_table");
        assert!(matches!(parsed, Mutation::UnmountTable { force: false, .. }));
    }
}
