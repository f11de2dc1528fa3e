//! Tablet metadata definitions
//!
//! Entities (bundles, cells, tablets, replicas, actions), their value types,
//! and the table and chunk tree mirrors the tablet manager operates on.

mod action;
mod bundle;
mod cell;
mod chunk;
mod ids;
mod key;
mod replica;
mod statistics;
mod table;
mod tablet;

pub use action::{ActionError, TabletAction, TabletActionKind, TabletActionState};
pub use bundle::{TabletCellBundle, TabletCellOptions, DEFAULT_BUNDLE_NAME};
pub use cell::{
    CellDescriptor, CellHealth, CellLifeStage, Peer, PeerId, PeerState, TabletCell,
};
pub use chunk::{
    Chunk, ChunkList, ChunkListKind, ChunkSpec, ChunkStore, ChunkTree, ChunkTreeStatistics,
    ChunkView,
};
pub use ids::{
    ActionId, BundleId, CellId, CellTag, ChunkId, ChunkListId, ChunkViewId, EntityId,
    IdGenerator, ObjectType, ReplicaId, TableId, TabletId, TransactionId,
};
pub use key::{Key, KeyValue, ReadRange};
pub use replica::{Atomicity, ReplicaMode, ReplicaState, TableReplica};
pub use statistics::{
    DataStatistics, TableStatisticsUpdate, TabletCellStatistics, TabletNodeStatistics,
    TabletResourceUsage,
};
pub use table::{TableMountConfig, TableNode, TableTabletState};
pub use tablet::{InMemoryMode, TableReplicaInfo, Tablet, TabletState};
