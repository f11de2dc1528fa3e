//! Chunk tree mirror
//!
//! Chunks are immutable data blocks owned by the chunk layer. Chunk views
//! restrict a chunk to a key range without copying it. Chunk lists compose
//! chunks and views into per-tablet trees hanging off a table's root list.
//! Chunk lists and views are reference counted; a list whose count drops to
//! zero is destroyed together with its unreferenced descendants.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::AddAssign;
use tracing::error;

use super::{CellTag, ChunkId, ChunkListId, ChunkViewId, IdGenerator, Key, ReadRange, TransactionId};

/// Immutable chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    /// Inclusive boundary keys of the rows stored in the chunk
    pub min_key: Key,
    pub max_key: Key,
    pub row_count: i64,
    pub uncompressed_data_size: i64,
    pub compressed_data_size: i64,
    pub data_weight: i64,
    /// Chunk lives in the eden partition (not yet compacted)
    pub eden: bool,
}

impl Chunk {
    /// Key range `[min_key, successor(max_key))`
    pub fn read_range(&self) -> ReadRange {
        ReadRange::between(self.min_key.clone(), self.max_key.successor())
    }
}

/// Chunk parameters supplied by the chunk layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub min_key: Key,
    pub max_key: Key,
    pub row_count: i64,
    pub uncompressed_data_size: i64,
    pub compressed_data_size: i64,
    pub data_weight: i64,
    #[serde(default)]
    pub eden: bool,
}

/// Range-restricted reference to a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkView {
    pub id: ChunkViewId,
    pub chunk: ChunkId,
    pub read_range: ReadRange,
    /// Set for views produced by bulk insert
    pub transaction_id: Option<TransactionId>,
    pub ref_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkListKind {
    SortedDynamicRoot,
    SortedDynamicTablet,
    OrderedDynamicRoot,
    OrderedDynamicTablet,
}

/// Node of a chunk tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChunkTree {
    Chunk(ChunkId),
    ChunkView(ChunkViewId),
    ChunkList(ChunkListId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkList {
    pub id: ChunkListId,
    pub kind: ChunkListKind,
    pub children: Vec<ChunkTree>,
    pub pivot_key: Key,
    pub ref_count: usize,
}

/// Aggregate statistics of a chunk tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTreeStatistics {
    pub row_count: i64,
    pub uncompressed_data_size: i64,
    pub compressed_data_size: i64,
    pub data_weight: i64,
    pub chunk_count: i64,
    pub chunk_list_count: i64,
}

impl ChunkTreeStatistics {
    /// Equality that tolerates a different number of intermediate lists
    pub fn matches_ignoring_lists(&self, other: &ChunkTreeStatistics) -> bool {
        let mut other = *other;
        other.chunk_list_count = self.chunk_list_count;
        *self == other
    }

    pub fn to_data_statistics(&self) -> super::DataStatistics {
        super::DataStatistics {
            row_count: self.row_count,
            uncompressed_data_size: self.uncompressed_data_size,
            compressed_data_size: self.compressed_data_size,
            data_weight: self.data_weight,
            chunk_count: self.chunk_count,
        }
    }
}

impl AddAssign for ChunkTreeStatistics {
    fn add_assign(&mut self, rhs: ChunkTreeStatistics) {
        self.row_count += rhs.row_count;
        self.uncompressed_data_size += rhs.uncompressed_data_size;
        self.compressed_data_size += rhs.compressed_data_size;
        self.data_weight += rhs.data_weight;
        self.chunk_count += rhs.chunk_count;
        self.chunk_list_count += rhs.chunk_list_count;
    }
}

impl std::fmt::Display for ChunkTreeStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{rows: {}, uncompressed: {}, compressed: {}, chunks: {}, lists: {}}}",
            self.row_count,
            self.uncompressed_data_size,
            self.compressed_data_size,
            self.chunk_count,
            self.chunk_list_count
        )
    }
}

/// Arena of chunks, chunk views and chunk lists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkStore {
    cell_tag: CellTag,
    ids: IdGenerator,
    chunks: BTreeMap<ChunkId, Chunk>,
    views: BTreeMap<ChunkViewId, ChunkView>,
    lists: BTreeMap<ChunkListId, ChunkList>,
}

impl ChunkStore {
    pub fn new(cell_tag: CellTag) -> Self {
        Self {
            cell_tag,
            ids: IdGenerator::default(),
            chunks: BTreeMap::new(),
            views: BTreeMap::new(),
            lists: BTreeMap::new(),
        }
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&id)
    }

    pub fn view(&self, id: ChunkViewId) -> Option<&ChunkView> {
        self.views.get(&id)
    }

    pub fn list(&self, id: ChunkListId) -> Option<&ChunkList> {
        self.lists.get(&id)
    }

    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn create_chunk(&mut self, spec: ChunkSpec) -> ChunkId {
        let id: ChunkId = self.ids.generate(self.cell_tag);
        self.chunks.insert(
            id,
            Chunk {
                id,
                min_key: spec.min_key,
                max_key: spec.max_key,
                row_count: spec.row_count,
                uncompressed_data_size: spec.uncompressed_data_size,
                compressed_data_size: spec.compressed_data_size,
                data_weight: spec.data_weight,
                eden: spec.eden,
            },
        );
        id
    }

    pub fn create_chunk_list(&mut self, kind: ChunkListKind) -> ChunkListId {
        let id: ChunkListId = self.ids.generate(self.cell_tag);
        self.lists.insert(
            id,
            ChunkList {
                id,
                kind,
                children: Vec::new(),
                pivot_key: Key::empty(),
                ref_count: 0,
            },
        );
        id
    }

    pub fn set_pivot_key(&mut self, list: ChunkListId, pivot_key: Key) {
        if let Some(list) = self.lists.get_mut(&list) {
            list.pivot_key = pivot_key;
        }
    }

    /// View over `chunk` restricted to `read_range`
    pub fn create_chunk_view(
        &mut self,
        chunk: ChunkId,
        read_range: ReadRange,
        transaction_id: Option<TransactionId>,
    ) -> ChunkViewId {
        let id: ChunkViewId = self.ids.generate(self.cell_tag);
        self.views.insert(
            id,
            ChunkView {
                id,
                chunk,
                read_range,
                transaction_id,
                ref_count: 0,
            },
        );
        id
    }

    /// Narrow an existing chunk or view further
    pub fn restrict(&mut self, tree: ChunkTree, read_range: ReadRange) -> ChunkViewId {
        match tree {
            ChunkTree::ChunkView(view_id) => match self.views.get(&view_id).cloned() {
                Some(view) => {
                    let range = view.read_range.intersect(&read_range);
                    self.create_chunk_view(view.chunk, range, view.transaction_id)
                }
                None => {
                    error!(alert = true, view_id = %view_id, "Restricting unknown chunk view");
                    self.create_chunk_view(ChunkId(0), read_range, None)
                }
            },
            ChunkTree::Chunk(chunk_id) => self.create_chunk_view(chunk_id, read_range, None),
            ChunkTree::ChunkList(list_id) => {
                error!(alert = true, list_id = %list_id, "Cannot restrict a chunk list");
                self.create_chunk_view(ChunkId(0), read_range, None)
            }
        }
    }

    /// Copy of `view` with a replaced read range
    pub fn clone_chunk_view(&mut self, view_id: ChunkViewId, read_range: ReadRange) -> ChunkViewId {
        let (chunk, transaction_id) = match self.views.get(&view_id) {
            Some(view) => (view.chunk, view.transaction_id),
            None => (ChunkId(0), None),
        };
        self.create_chunk_view(chunk, read_range, transaction_id)
    }

    pub fn ref_tree(&mut self, tree: ChunkTree) {
        match tree {
            ChunkTree::ChunkList(id) => {
                if let Some(list) = self.lists.get_mut(&id) {
                    list.ref_count += 1;
                }
            }
            ChunkTree::ChunkView(id) => {
                if let Some(view) = self.views.get_mut(&id) {
                    view.ref_count += 1;
                }
            }
            ChunkTree::Chunk(_) => {}
        }
    }

    pub fn unref_tree(&mut self, tree: ChunkTree) {
        match tree {
            ChunkTree::ChunkList(id) => {
                let destroy = match self.lists.get_mut(&id) {
                    Some(list) => {
                        list.ref_count = list.ref_count.saturating_sub(1);
                        list.ref_count == 0
                    }
                    None => false,
                };
                if destroy {
                    if let Some(list) = self.lists.remove(&id) {
                        for child in list.children {
                            self.unref_tree(child);
                        }
                    }
                }
            }
            ChunkTree::ChunkView(id) => {
                let destroy = match self.views.get_mut(&id) {
                    Some(view) => {
                        view.ref_count = view.ref_count.saturating_sub(1);
                        view.ref_count == 0
                    }
                    None => false,
                };
                if destroy {
                    self.views.remove(&id);
                }
            }
            ChunkTree::Chunk(_) => {}
        }
    }

    pub fn ref_count(&self, list: ChunkListId) -> usize {
        self.lists.get(&list).map(|l| l.ref_count).unwrap_or(0)
    }

    pub fn attach(&mut self, parent: ChunkListId, child: ChunkTree) {
        self.ref_tree(child);
        if let Some(list) = self.lists.get_mut(&parent) {
            list.children.push(child);
        }
    }

    pub fn attach_all(&mut self, parent: ChunkListId, children: &[ChunkTree]) {
        for child in children {
            self.attach(parent, *child);
        }
    }

    pub fn replace_child(&mut self, parent: ChunkListId, index: usize, child: ChunkTree) {
        let old = match self.lists.get_mut(&parent) {
            Some(list) if index < list.children.len() => {
                let old = list.children[index];
                list.children[index] = child;
                old
            }
            _ => return,
        };
        self.ref_tree(child);
        self.unref_tree(old);
    }

    pub fn children(&self, list: ChunkListId) -> Vec<ChunkTree> {
        self.lists
            .get(&list)
            .map(|l| l.children.clone())
            .unwrap_or_default()
    }

    /// Tablet chunk list ids under a root list
    pub fn tablet_lists(&self, root: ChunkListId) -> Vec<ChunkListId> {
        self.children(root)
            .into_iter()
            .filter_map(|child| match child {
                ChunkTree::ChunkList(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Leaves (chunks and views) in tree order
    pub fn enumerate_chunks_and_views(&self, list: ChunkListId) -> Vec<ChunkTree> {
        let mut result = Vec::new();
        self.collect_leaves(list, &mut result);
        result
    }

    fn collect_leaves(&self, list: ChunkListId, result: &mut Vec<ChunkTree>) {
        if let Some(list) = self.lists.get(&list) {
            for child in &list.children {
                match child {
                    ChunkTree::ChunkList(id) => self.collect_leaves(*id, result),
                    leaf => result.push(*leaf),
                }
            }
        }
    }

    /// Underlying chunks in tree order
    pub fn enumerate_chunks(&self, list: ChunkListId) -> Vec<ChunkId> {
        self.enumerate_chunks_and_views(list)
            .into_iter()
            .filter_map(|leaf| self.underlying_chunk(leaf))
            .collect()
    }

    pub fn underlying_chunk(&self, tree: ChunkTree) -> Option<ChunkId> {
        match tree {
            ChunkTree::Chunk(id) => Some(id),
            ChunkTree::ChunkView(id) => self.views.get(&id).map(|v| v.chunk),
            ChunkTree::ChunkList(_) => None,
        }
    }

    /// New tablet list holding the flattened leaves of `list`
    pub fn clone_tablet_chunk_list(&mut self, list: ChunkListId) -> ChunkListId {
        let (kind, pivot_key) = match self.lists.get(&list) {
            Some(l) => (l.kind, l.pivot_key.clone()),
            None => (ChunkListKind::SortedDynamicTablet, Key::empty()),
        };
        let leaves = self.enumerate_chunks_and_views(list);
        let new_list = self.create_chunk_list(kind);
        self.set_pivot_key(new_list, pivot_key);
        self.attach_all(new_list, &leaves);
        new_list
    }

    /// Effective key range of a chunk or view
    pub fn complete_read_range(&self, tree: ChunkTree) -> ReadRange {
        match tree {
            ChunkTree::Chunk(id) => self
                .chunks
                .get(&id)
                .map(|c| c.read_range())
                .unwrap_or_default(),
            ChunkTree::ChunkView(id) => match self.views.get(&id) {
                Some(view) => match self.chunks.get(&view.chunk) {
                    Some(chunk) => view.read_range.intersect(&chunk.read_range()),
                    None => view.read_range.clone(),
                },
                None => ReadRange::default(),
            },
            ChunkTree::ChunkList(_) => ReadRange::default(),
        }
    }

    pub fn statistics(&self, tree: ChunkTree) -> ChunkTreeStatistics {
        match tree {
            ChunkTree::Chunk(id) => self.chunk_statistics(id),
            ChunkTree::ChunkView(id) => self
                .views
                .get(&id)
                .map(|v| self.chunk_statistics(v.chunk))
                .unwrap_or_default(),
            ChunkTree::ChunkList(id) => {
                let mut total = ChunkTreeStatistics {
                    chunk_list_count: 1,
                    ..Default::default()
                };
                if let Some(list) = self.lists.get(&id) {
                    for child in &list.children {
                        total += self.statistics(*child);
                    }
                }
                total
            }
        }
    }

    pub fn list_statistics(&self, list: ChunkListId) -> ChunkTreeStatistics {
        self.statistics(ChunkTree::ChunkList(list))
    }

    fn chunk_statistics(&self, id: ChunkId) -> ChunkTreeStatistics {
        match self.chunks.get(&id) {
            Some(chunk) => ChunkTreeStatistics {
                row_count: chunk.row_count,
                uncompressed_data_size: chunk.uncompressed_data_size,
                compressed_data_size: chunk.compressed_data_size,
                data_weight: chunk.data_weight,
                chunk_count: 1,
                chunk_list_count: 0,
            },
            None => ChunkTreeStatistics::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(min: &str, max: &str, size: i64) -> ChunkSpec {
        ChunkSpec {
            min_key: Key::from(min),
            max_key: Key::from(max),
            row_count: 10,
            uncompressed_data_size: size,
            compressed_data_size: size / 2,
            data_weight: size,
            eden: false,
        }
    }

    #[test]
    fn test_statistics_and_clone() {
        let mut store = ChunkStore::new(1);
        let root = store.create_chunk_list(ChunkListKind::SortedDynamicRoot);
        store.ref_tree(ChunkTree::ChunkList(root));
        let tablet = store.create_chunk_list(ChunkListKind::SortedDynamicTablet);
        store.attach(root, ChunkTree::ChunkList(tablet));

        let a = store.create_chunk(spec("a", "c", 100));
        let b = store.create_chunk(spec("d", "f", 50));
        store.attach(tablet, ChunkTree::Chunk(a));
        store.attach(tablet, ChunkTree::Chunk(b));

        let stats = store.list_statistics(root);
        assert_eq!(stats.row_count, 20);
        assert_eq!(stats.uncompressed_data_size, 150);
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.chunk_list_count, 2);

        let clone = store.clone_tablet_chunk_list(tablet);
        assert_eq!(store.enumerate_chunks(clone), vec![a, b]);
        assert!(store
            .list_statistics(clone)
            .matches_ignoring_lists(&store.list_statistics(tablet)));
    }

    #[test]
    fn test_view_range_and_gc() {
        let mut store = ChunkStore::new(1);
        let chunk = store.create_chunk(spec("a", "m", 100));
        let list = store.create_chunk_list(ChunkListKind::SortedDynamicTablet);
        store.ref_tree(ChunkTree::ChunkList(list));

        let view = store.restrict(
            ChunkTree::Chunk(chunk),
            ReadRange::between(Key::from("f"), Key::max()),
        );
        store.attach(list, ChunkTree::ChunkView(view));

        let range = store.complete_read_range(ChunkTree::ChunkView(view));
        assert_eq!(range.lower_key(), Key::from("f"));
        assert_eq!(range.upper_key(), Key::from("m").successor());

        store.unref_tree(ChunkTree::ChunkList(list));
        assert!(store.list(list).is_none());
        assert!(store.view(view).is_none());
        assert!(store.chunk(chunk).is_some());
    }
}
