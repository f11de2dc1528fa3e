//! Object identifiers
//!
//! Every entity is addressed by a typed 64-bit handle. The layout is
//! `[cell tag: 16 bits][object type: 8 bits][counter: 40 bits]`, so an id
//! alone tells which master cell created it.

use serde::{Deserialize, Serialize};

/// Master cell tag
pub type CellTag = u16;

/// Object type encoded into ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    TabletCellBundle,
    TabletCell,
    Tablet,
    TableReplica,
    TabletAction,
    Table,
    Chunk,
    ChunkView,
    ChunkList,
    Transaction,
}

impl ObjectType {
    fn code(self) -> u64 {
        match self {
            ObjectType::TabletCellBundle => 1,
            ObjectType::TabletCell => 2,
            ObjectType::Tablet => 3,
            ObjectType::TableReplica => 4,
            ObjectType::TabletAction => 5,
            ObjectType::Table => 6,
            ObjectType::Chunk => 7,
            ObjectType::ChunkView => 8,
            ObjectType::ChunkList => 9,
            ObjectType::Transaction => 10,
        }
    }
}

const COUNTER_BITS: u32 = 40;
const TYPE_BITS: u32 = 8;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;
const TYPE_MASK: u64 = (1 << TYPE_BITS) - 1;

/// Typed entity id
pub trait EntityId: Copy + Ord {
    const OBJECT_TYPE: ObjectType;

    fn from_raw(raw: u64) -> Self;
    fn raw(&self) -> u64;

    fn cell_tag(&self) -> CellTag {
        (self.raw() >> (COUNTER_BITS + TYPE_BITS)) as CellTag
    }
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident => $ty:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl EntityId for $name {
            const OBJECT_TYPE: ObjectType = $ty;

            fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            fn raw(&self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(
                    f,
                    "{:x}-{:x}-{:x}",
                    self.0 >> (COUNTER_BITS + TYPE_BITS),
                    (self.0 >> COUNTER_BITS) & TYPE_MASK,
                    self.0 & COUNTER_MASK
                )
            }
        }
    };
}

define_id!(
    /// Tablet cell bundle id
    BundleId => ObjectType::TabletCellBundle
);
define_id!(
    /// Tablet cell id
    CellId => ObjectType::TabletCell
);
define_id!(
    /// Tablet id
    TabletId => ObjectType::Tablet
);
define_id!(
    /// Table replica id
    ReplicaId => ObjectType::TableReplica
);
define_id!(
    /// Tablet action id
    ActionId => ObjectType::TabletAction
);
define_id!(
    /// Dynamic table id
    TableId => ObjectType::Table
);
define_id!(ChunkId => ObjectType::Chunk);
define_id!(ChunkViewId => ObjectType::ChunkView);
define_id!(ChunkListId => ObjectType::ChunkList);
define_id!(
    /// Transaction id (prerequisite leases, bulk-insert chunk views)
    TransactionId => ObjectType::Transaction
);

/// Deterministic id generator
///
/// Persisted with the snapshot so that replay produces identical ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdGenerator {
    counter: u64,
}

impl IdGenerator {
    pub fn generate<I: EntityId>(&mut self, cell_tag: CellTag) -> I {
        self.counter += 1;
        let raw = ((cell_tag as u64) << (COUNTER_BITS + TYPE_BITS))
            | (I::OBJECT_TYPE.code() << COUNTER_BITS)
            | (self.counter & COUNTER_MASK);
        I::from_raw(raw)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_layout() {
        let mut generator = IdGenerator::default();
        let first: TabletId = generator.generate(0x10);
        let second: CellId = generator.generate(0x10);

        assert_eq!(first.cell_tag(), 0x10);
        assert_eq!(second.cell_tag(), 0x10);
        assert!(first.0 < second.0 || first.0 & COUNTER_MASK < second.0 & COUNTER_MASK);
        assert_eq!(first.to_string(), "10-3-1");
        assert_eq!(second.to_string(), "10-2-2");
    }
}
