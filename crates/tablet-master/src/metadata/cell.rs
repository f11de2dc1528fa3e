//! Tablet cell definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{ActionId, BundleId, CellId, CellTag, TabletCellStatistics, TabletId, TransactionId};

/// Peer id within a cell
pub type PeerId = usize;

/// Hydra peer state reported by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    None,
    Stopped,
    Elections,
    FollowerRecovery,
    Following,
    LeaderRecovery,
    Leading,
}

impl Default for PeerState {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::None => write!(f, "none"),
            PeerState::Stopped => write!(f, "stopped"),
            PeerState::Elections => write!(f, "elections"),
            PeerState::FollowerRecovery => write!(f, "follower_recovery"),
            PeerState::Following => write!(f, "following"),
            PeerState::LeaderRecovery => write!(f, "leader_recovery"),
            PeerState::Leading => write!(f, "leading"),
        }
    }
}

/// Cell health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellHealth {
    Initializing,
    Good,
    Degraded,
    Failed,
}

impl CellHealth {
    fn severity(self) -> u8 {
        match self {
            CellHealth::Good => 0,
            CellHealth::Initializing => 1,
            CellHealth::Degraded => 2,
            CellHealth::Failed => 3,
        }
    }

    /// Worst of two healths
    pub fn combine(self, other: CellHealth) -> CellHealth {
        if self.severity() >= other.severity() {
            self
        } else {
            other
        }
    }
}

impl Default for CellHealth {
    fn default() -> Self {
        Self::Initializing
    }
}

impl std::fmt::Display for CellHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellHealth::Initializing => write!(f, "initializing"),
            CellHealth::Good => write!(f, "good"),
            CellHealth::Degraded => write!(f, "degraded"),
            CellHealth::Failed => write!(f, "failed"),
        }
    }
}

/// Decommission progress of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellLifeStage {
    Running,
    DecommissioningOnMaster,
    DecommissioningOnNode,
    Decommissioned,
}

impl Default for CellLifeStage {
    fn default() -> Self {
        Self::Running
    }
}

impl std::fmt::Display for CellLifeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellLifeStage::Running => write!(f, "running"),
            CellLifeStage::DecommissioningOnMaster => write!(f, "decommissioning_on_master"),
            CellLifeStage::DecommissioningOnNode => write!(f, "decommissioning_on_node"),
            CellLifeStage::Decommissioned => write!(f, "decommissioned"),
        }
    }
}

/// One peer slot of a cell
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Node address the peer is assigned to
    pub address: Option<String>,
    /// Node currently running the peer (set by heartbeats)
    pub node: Option<String>,
    pub last_seen_time: Option<DateTime<Utc>>,
    pub last_seen_state: PeerState,
}

/// Configuration shipped to nodes hosting the cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDescriptor {
    pub cell_id: CellId,
    pub config_version: u64,
    pub peers: Vec<Option<String>>,
}

/// Tablet cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletCell {
    pub id: CellId,
    pub bundle: BundleId,
    pub peers: Vec<Peer>,
    pub leading_peer_id: PeerId,
    pub config_version: u64,
    pub prerequisite_transaction: Option<TransactionId>,
    pub life_stage: CellLifeStage,
    pub tablets: BTreeSet<TabletId>,
    pub actions: BTreeSet<ActionId>,
    /// Statistics of tablets registered at this master cell
    pub local_statistics: TabletCellStatistics,
    /// Cluster-wide aggregate (computed at the primary, gossiped to secondaries)
    pub cluster_statistics: TabletCellStatistics,
    /// Per master cell statistics (primary only)
    pub multicell_statistics: BTreeMap<CellTag, TabletCellStatistics>,
}

impl TabletCell {
    pub fn new(id: CellId, bundle: BundleId, peer_count: usize) -> Self {
        Self {
            id,
            bundle,
            peers: vec![Peer::default(); peer_count],
            leading_peer_id: 0,
            config_version: 0,
            prerequisite_transaction: None,
            life_stage: CellLifeStage::Running,
            tablets: BTreeSet::new(),
            actions: BTreeSet::new(),
            local_statistics: TabletCellStatistics::default(),
            cluster_statistics: TabletCellStatistics::default(),
            multicell_statistics: BTreeMap::new(),
        }
    }

    pub fn find_peer_id(&self, address: &str) -> Option<PeerId> {
        self.peers
            .iter()
            .position(|peer| peer.address.as_deref() == Some(address))
    }

    pub fn attach_peer(&mut self, address: &str, peer_id: PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.node = Some(address.to_string());
        }
    }

    pub fn detach_peer(&mut self, address: &str) {
        for peer in self.peers.iter_mut() {
            if peer.node.as_deref() == Some(address) {
                peer.node = None;
                peer.last_seen_state = PeerState::None;
            }
        }
    }

    pub fn update_peer_seen(&mut self, peer_id: PeerId, time: DateTime<Utc>, state: PeerState) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_seen_time = Some(time);
            peer.last_seen_state = state;
        }
    }

    /// Addresses of assigned peers
    pub fn peer_addresses(&self) -> Vec<Option<String>> {
        self.peers.iter().map(|peer| peer.address.clone()).collect()
    }

    pub fn descriptor(&self) -> CellDescriptor {
        CellDescriptor {
            cell_id: self.id,
            config_version: self.config_version,
            peers: self.peer_addresses(),
        }
    }

    pub fn decommission_started(&self) -> bool {
        self.life_stage != CellLifeStage::Running
    }

    pub fn decommission_completed(&self) -> bool {
        self.life_stage == CellLifeStage::Decommissioned
    }

    /// Health derived from the latest peer states
    pub fn health(&self) -> CellHealth {
        if self.peers.iter().all(|peer| peer.address.is_none()) {
            return CellHealth::Initializing;
        }

        let leader = match self.peers.get(self.leading_peer_id) {
            Some(leader) => leader,
            None => return CellHealth::Failed,
        };
        if leader.node.is_none() || leader.last_seen_state != PeerState::Leading {
            return CellHealth::Failed;
        }

        let followers_ok = self
            .peers
            .iter()
            .enumerate()
            .filter(|(peer_id, _)| *peer_id != self.leading_peer_id)
            .all(|(_, peer)| peer.node.is_some() && peer.last_seen_state == PeerState::Following);

        if followers_ok {
            CellHealth::Good
        } else {
            CellHealth::Degraded
        }
    }

    /// Rebuild the cluster aggregate from per master cell statistics
    pub fn recompute_cluster_statistics(&mut self) {
        let mut total = TabletCellStatistics::default();
        for statistics in self.multicell_statistics.values() {
            total += statistics;
        }
        total.decommissioned = self.decommission_completed();
        total.health = self.health();
        self.cluster_statistics = total;
    }
}
