//! In-process cluster for manager tests
//!
//! Cells are backed by fake single-peer nodes named `node-<n>`. Messages
//! posted to cells are answered immediately by [`TestCluster::deliver`].

use chrono::{DateTime, TimeZone, Utc};

use super::{HeartbeatRequest, SlotReport, TabletManager};
use crate::config::MasterConfig;
use crate::error::Result;
use crate::hive::TabletCellMessage;
use crate::metadata::{BundleId, CellId, ChunkSpec, Key, PeerState, TableId};
use crate::mutation::{Mutation, MutationContext, MutationResponse};

pub(crate) fn chunk(min: &str, max: &str, size: i64) -> ChunkSpec {
    ChunkSpec {
        min_key: Key::from(min),
        max_key: Key::from(max),
        row_count: size,
        uncompressed_data_size: size,
        compressed_data_size: size / 2,
        data_weight: size,
        eden: false,
    }
}

pub(crate) struct TestCluster {
    pub manager: TabletManager,
    pub bundle_id: BundleId,
    pub cells: Vec<CellId>,
    version: u64,
    now: DateTime<Utc>,
    next_node: usize,
    next_table: usize,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(MasterConfig::default())
    }

    pub fn with_config(config: MasterConfig) -> Self {
        let mut manager = TabletManager::new(&config);
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        manager.begin_mutation(MutationContext::new(1, now, 1));
        let bundle_id = manager.default_bundle_id().unwrap();
        Self {
            manager,
            bundle_id,
            cells: Vec::new(),
            version: 1,
            now,
            next_node: 0,
            next_table: 0,
        }
    }

    pub fn with_cells(count: usize) -> Self {
        let mut cluster = Self::new();
        for _ in 0..count {
            cluster.add_cell();
        }
        cluster
    }

    /// Create a cell in the default bundle with a leading peer
    pub fn add_cell(&mut self) -> CellId {
        let cell_id = self.manager.create_cell(self.bundle_id).unwrap();
        let address = format!("node-{}", self.next_node);
        self.next_node += 1;
        self.manager.assign_peers(cell_id, &[(0, address)]);
        self.cells.push(cell_id);
        self.set_peer_state(cell_id, PeerState::Leading);
        cell_id
    }

    /// Report the cell's only peer in `state` from its node
    pub fn set_peer_state(&mut self, cell_id: CellId, state: PeerState) {
        let cell = self.manager.find_cell(cell_id).unwrap();
        let address = cell.peers[0].address.clone().unwrap();
        let config_version = cell.config_version;
        self.manager.on_incremental_heartbeat(HeartbeatRequest {
            address,
            slots: vec![SlotReport {
                cell_id: Some(cell_id),
                peer_id: Some(0),
                peer_state: state,
                config_version,
            }],
            tablets: vec![],
        });
    }

    /// Sorted table with pivots `["", pivots...]` in the default bundle
    pub fn sorted_table(&mut self, pivots: &[&str]) -> TableId {
        let mut options = super::CreateTableOptions::sorted(format!("//tmp/t{}", self.next_table));
        self.next_table += 1;
        options.pivot_keys = std::iter::once(Key::empty())
            .chain(pivots.iter().map(|pivot| Key::from(*pivot)))
            .collect();
        self.manager.create_table(options).unwrap()
    }

    pub fn mount(&mut self, table_id: TableId) {
        self.apply(Mutation::MountTable {
            table_id,
            first_tablet_index: None,
            last_tablet_index: None,
            hint_cell_id: None,
            target_cell_ids: vec![],
            freeze: false,
        })
        .unwrap();
        self.deliver();
    }

    pub fn unmount(&mut self, table_id: TableId) {
        self.apply(Mutation::UnmountTable {
            table_id,
            first_tablet_index: None,
            last_tablet_index: None,
            force: false,
        })
        .unwrap();
        self.deliver();
    }

    pub fn advance_time(&mut self, delta: chrono::Duration) {
        self.now += delta;
        self.manager
            .begin_mutation(MutationContext::new(self.version, self.now, self.version));
    }

    /// Apply under a fresh context: next version, one second later
    pub fn apply(&mut self, mutation: Mutation) -> Result<MutationResponse> {
        self.version += 1;
        self.now += chrono::Duration::seconds(1);
        let ctx = MutationContext::new(self.version, self.now, self.version);
        self.manager.apply_mutation(ctx, mutation)
    }

    /// Answer every queued cell message until the cells go quiet
    pub fn deliver(&mut self) {
        loop {
            let messages = self.manager.hive_mut().drain_outbox();
            self.manager.hive_mut().drain_master_outbox();
            if messages.is_empty() {
                break;
            }
            for posted in messages {
                if let Some(reply) = reply_to(posted.message) {
                    self.apply(reply).unwrap();
                }
            }
        }
    }
}

fn reply_to(message: TabletCellMessage) -> Option<Mutation> {
    let reply = match message {
        TabletCellMessage::MountTablet {
            tablet_id,
            mount_revision,
            freeze,
            ..
        } => Mutation::OnTabletMounted {
            tablet_id,
            mount_revision,
            frozen: freeze,
        },
        TabletCellMessage::UnmountTablet {
            tablet_id,
            mount_revision,
            ..
        } => Mutation::OnTabletUnmounted {
            tablet_id,
            mount_revision,
        },
        TabletCellMessage::FreezeTablet {
            tablet_id,
            mount_revision,
        } => Mutation::OnTabletFrozen {
            tablet_id,
            mount_revision,
        },
        TabletCellMessage::UnfreezeTablet {
            tablet_id,
            mount_revision,
        } => Mutation::OnTabletUnfrozen {
            tablet_id,
            mount_revision,
        },
        TabletCellMessage::SetTableReplicaEnabled {
            tablet_id,
            replica_id,
            enabled,
            mount_revision,
        }
        | TabletCellMessage::AlterTableReplica {
            tablet_id,
            replica_id,
            enabled: Some(enabled),
            mount_revision,
            ..
        } => {
            if enabled {
                Mutation::OnTableReplicaEnabled {
                    tablet_id,
                    replica_id,
                    mount_revision,
                }
            } else {
                Mutation::OnTableReplicaDisabled {
                    tablet_id,
                    replica_id,
                    mount_revision,
                }
            }
        }
        _ => return None,
    };
    Some(reply)
}
