//! Cross-cell messaging
//!
//! Every tablet cell has a mailbox; messages posted to it are numbered and
//! queued in an outbox that the automaton drains after each mutation and
//! hands to the transport. Messages addressed to other master cells go
//! through a separate outbox. Nothing here waits for replies: completions
//! come back as ordinary mutations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::metadata::{
    Atomicity, CellId, CellTag, ChunkTree, Key, ReplicaId, ReplicaMode, ReplicaState, TableId,
    TableMountConfig, TabletId,
};
use crate::mutation::Mutation;

/// Replica description shipped with mount and add-replica requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub replica_id: ReplicaId,
    pub cluster_name: String,
    pub replica_path: String,
    pub start_replication_timestamp: u64,
    pub state: ReplicaState,
    pub mode: ReplicaMode,
    pub atomicity: Atomicity,
    pub preserve_timestamps: bool,
}

/// Request sent to a tablet cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TabletCellMessage {
    MountTablet {
        tablet_id: TabletId,
        table_id: TableId,
        mount_revision: u64,
        /// Sorted tables only
        pivot_key: Option<Key>,
        next_pivot_key: Option<Key>,
        /// Ordered tables only
        trimmed_row_count: Option<i64>,
        retained_timestamp: u64,
        mount_config: TableMountConfig,
        freeze: bool,
        stores: Vec<ChunkTree>,
        replicas: Vec<ReplicaDescriptor>,
    },
    UnmountTablet {
        tablet_id: TabletId,
        mount_revision: u64,
        force: bool,
    },
    FreezeTablet {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    UnfreezeTablet {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    RemountTablet {
        tablet_id: TabletId,
        mount_config: TableMountConfig,
    },
    SetTableReplicaEnabled {
        tablet_id: TabletId,
        replica_id: ReplicaId,
        enabled: bool,
        mount_revision: u64,
    },
    AddTableReplica {
        tablet_id: TabletId,
        replica: ReplicaDescriptor,
    },
    RemoveTableReplica {
        tablet_id: TabletId,
        replica_id: ReplicaId,
    },
    AlterTableReplica {
        tablet_id: TabletId,
        replica_id: ReplicaId,
        enabled: Option<bool>,
        mode: Option<ReplicaMode>,
        atomicity: Option<Atomicity>,
        preserve_timestamps: Option<bool>,
        mount_revision: u64,
    },
    DecommissionTabletCell,
}

impl TabletCellMessage {
    pub fn name(&self) -> &'static str {
        match self {
            TabletCellMessage::MountTablet { .. } => "mount_tablet",
            TabletCellMessage::UnmountTablet { .. } => "unmount_tablet",
            TabletCellMessage::FreezeTablet { .. } => "freeze_tablet",
            TabletCellMessage::UnfreezeTablet { .. } => "unfreeze_tablet",
            TabletCellMessage::RemountTablet { .. } => "remount_tablet",
            TabletCellMessage::SetTableReplicaEnabled { .. } => "set_table_replica_enabled",
            TabletCellMessage::AddTableReplica { .. } => "add_table_replica",
            TabletCellMessage::RemoveTableReplica { .. } => "remove_table_replica",
            TabletCellMessage::AlterTableReplica { .. } => "alter_table_replica",
            TabletCellMessage::DecommissionTabletCell => "decommission_tablet_cell",
        }
    }
}

/// Message accepted by a cell mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedMessage {
    pub cell_id: CellId,
    pub seq: u64,
    pub message: TabletCellMessage,
}

/// Where a master message goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterDestination {
    Cell(CellTag),
    /// Every secondary master cell
    Secondaries,
}

/// Mutation forwarded to other master cells
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterMessage {
    pub destination: MasterDestination,
    pub mutation: Mutation,
}

/// Outgoing queue position of one tablet cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mailbox {
    pub cell_id: CellId,
    pub next_seq: u64,
}

/// Mailbox registry and outbound queues
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HiveManager {
    mailboxes: BTreeMap<CellId, Mailbox>,
    #[serde(skip)]
    outbox: Vec<PostedMessage>,
    #[serde(skip)]
    master_outbox: Vec<MasterMessage>,
}

impl HiveManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_mailbox(&mut self, cell_id: CellId) -> &Mailbox {
        self.mailboxes.entry(cell_id).or_insert(Mailbox {
            cell_id,
            next_seq: 0,
        })
    }

    pub fn remove_mailbox(&mut self, cell_id: CellId) -> bool {
        self.mailboxes.remove(&cell_id).is_some()
    }

    pub fn find_mailbox(&self, cell_id: CellId) -> Option<&Mailbox> {
        self.mailboxes.get(&cell_id)
    }

    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.len()
    }

    /// Queue `message` for `cell_id`; returns its sequence number
    pub fn post_message(&mut self, cell_id: CellId, message: TabletCellMessage) -> Option<u64> {
        let mailbox = match self.mailboxes.get_mut(&cell_id) {
            Some(mailbox) => mailbox,
            None => {
                warn!(
                    cell_id = %cell_id,
                    message = message.name(),
                    "Dropping message for cell without mailbox"
                );
                return None;
            }
        };
        let seq = mailbox.next_seq;
        mailbox.next_seq += 1;
        debug!(cell_id = %cell_id, seq, message = message.name(), "Message posted");
        self.outbox.push(PostedMessage {
            cell_id,
            seq,
            message,
        });
        Some(seq)
    }

    pub fn post_to_master(&mut self, destination: MasterDestination, mutation: Mutation) {
        self.master_outbox.push(MasterMessage {
            destination,
            mutation,
        });
    }

    pub fn drain_outbox(&mut self) -> Vec<PostedMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_master_outbox(&mut self) -> Vec<MasterMessage> {
        std::mem::take(&mut self.master_outbox)
    }

    /// Drop queued messages without delivering them (replay)
    pub fn discard_outboxes(&mut self) {
        self.outbox.clear();
        self.master_outbox.clear();
    }
}
