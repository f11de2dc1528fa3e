//! Resharding
//!
//! Replaces a contiguous range of unmounted tablets with a new set. For
//! physically sorted tables the chunks of the old range are redistributed
//! among the new tablets by key, clipping with chunk views where a chunk
//! straddles a new pivot. Ordered tables keep their per-tablet chunk
//! sequences; shrinking appends the trailing tablets' chunks to the last
//! surviving tablet.

use std::cmp::{max, min};
use tracing::error;

use super::TabletManager;
use crate::error::{ErrorCode, Result, TabletError};
use crate::metadata::{
    ChunkListId, ChunkListKind, ChunkTree, ChunkView, ChunkViewId, Key, ReadRange, TableId,
    TableReplicaInfo, TabletId, TabletState,
};

impl TabletManager {
    /// Validate a reshard request; returns `(first, last, new_tablet_count)`
    pub fn prepare_reshard_table(
        &self,
        table_id: TableId,
        first: Option<usize>,
        last: Option<usize>,
        tablet_count: Option<usize>,
        pivot_keys: &[Key],
    ) -> Result<(usize, usize, usize)> {
        let table = self.get_table_or_err(table_id)?;
        if !table.dynamic {
            return Err(TabletError::new(
                ErrorCode::InvalidTableType,
                "Cannot reshard a static table",
            ));
        }
        if table.replicated && self.chunks.list_statistics(table.chunk_list).chunk_count > 0 {
            return Err(TabletError::new(
                ErrorCode::InvalidTableType,
                "Cannot reshard non-empty replicated table",
            ));
        }

        let new_tablet_count = tablet_count.unwrap_or(pivot_keys.len());
        if new_tablet_count == 0 {
            return Err(TabletError::new(
                ErrorCode::InvalidOptions,
                "Tablet count must be positive",
            ));
        }
        let max_tablet_count = self.config.max_tablet_count;
        if new_tablet_count > max_tablet_count {
            return Err(TabletError::new(
                ErrorCode::TooManyTablets,
                format!("Tablet count cannot exceed the limit of {}", max_tablet_count),
            ));
        }

        let (first, last) = Self::parse_tablet_range(table, first, last)?;

        if table.sorted {
            if !pivot_keys.is_empty() {
                if pivot_keys.len() != new_tablet_count {
                    return Err(TabletError::invalid_pivots(format!(
                        "Wrong pivot key count: {} instead of {}",
                        pivot_keys.len(),
                        new_tablet_count
                    )));
                }
                if first == 0 && !pivot_keys[0].is_empty() {
                    return Err(TabletError::invalid_pivots("First pivot key must be empty"));
                }
                for pair in pivot_keys.windows(2) {
                    if pair[0] >= pair[1] {
                        return Err(TabletError::invalid_pivots(
                            "Pivot keys must be strictly increasing",
                        ));
                    }
                }
                for key in pivot_keys {
                    key.validate_pivot(table.key_column_count)
                        .map_err(TabletError::invalid_pivots)?;
                }
            } else if !table.is_physically_sorted() {
                return Err(TabletError::invalid_pivots(
                    "Pivot keys must be porovided to reshard a replicated table",
                ));
            }
        } else if !pivot_keys.is_empty() {
            return Err(TabletError::invalid_pivots(
                "Table is ordered; must provide tablet count",
            ));
        }

        let old_tablet_count = last - first + 1;
        if table.tablets.len() - old_tablet_count + new_tablet_count > max_tablet_count {
            return Err(TabletError::new(
                ErrorCode::TooManyTablets,
                format!(
                    "Tablet count cannot exceed the limit of {}",
                    max_tablet_count
                ),
            ));
        }

        let tablets: Vec<_> = table.tablets[first..=last]
            .iter()
            .filter_map(|id| self.tablets.get(id))
            .collect();

        if !pivot_keys.is_empty() {
            if let Some(first_tablet) = tablets.first() {
                if pivot_keys[0] != first_tablet.pivot_key {
                    return Err(TabletError::invalid_pivots(
                        "First pivot key must match that of the first tablet in the resharded range",
                    ));
                }
            }
            if let Some(next) = table.tablets.get(last + 1).and_then(|id| self.tablets.get(id)) {
                if pivot_keys[pivot_keys.len() - 1] >= next.pivot_key {
                    return Err(TabletError::invalid_pivots(
                        "Last pivot key must be strictly less than that of the tablet which follows the resharded range",
                    ));
                }
            }
        }

        for tablet in &tablets {
            if tablet.state != TabletState::Unmounted {
                return Err(TabletError::invalid_state(format!(
                    "Cannot reshard table since tablet {} is not unmounted",
                    tablet.id
                )));
            }
        }

        // Dropped ordered tablets lose their trimmed prefix; it must end on a chunk boundary.
        if !table.sorted && old_tablet_count > new_tablet_count {
            for tablet in &tablets[new_tablet_count..] {
                let list = match self.tablet_chunk_list(tablet) {
                    Some(list) => list,
                    None => continue,
                };
                if self.trimmed_chunk_prefix(list, tablet.trimmed_row_count).is_none() {
                    return Err(TabletError::invalid_state(format!(
                        "Some chunks of tablet {} are not fully trimmed; such a tablet cannot participate in resharding",
                        tablet.id
                    )));
                }
            }
        }

        Ok((first, last, new_tablet_count))
    }

    pub fn reshard_table(
        &mut self,
        table_id: TableId,
        first: Option<usize>,
        last: Option<usize>,
        tablet_count: Option<usize>,
        pivot_keys: Vec<Key>,
    ) -> Result<Vec<TabletId>> {
        let (first, last, tablet_count) =
            self.prepare_reshard_table(table_id, first, last, tablet_count, &pivot_keys)?;

        self.touch_affected_tablet_actions(table_id, first, last, "reshard_table");

        let new_tablets = self.do_reshard_table(table_id, first, last, tablet_count, pivot_keys)?;
        log_unless_recovery!(self, info, table_id = %table_id, first, last, new_tablet_count = new_tablets.len(), "Table resharded");
        Ok(new_tablets)
    }

    /// Reshard a validated range; computes pivots by data size when none are given
    pub(super) fn do_reshard_table(
        &mut self,
        table_id: TableId,
        first: usize,
        last: usize,
        tablet_count: usize,
        pivot_keys: Vec<Key>,
    ) -> Result<Vec<TabletId>> {
        let physically_sorted = self.get_table_or_err(table_id)?.is_physically_sorted();

        let (tablet_count, pivot_keys) = if pivot_keys.is_empty() && physically_sorted {
            let pivot_keys = self.calculate_pivot_keys(table_id, first, last, tablet_count);
            (pivot_keys.len(), pivot_keys)
        } else {
            (tablet_count, pivot_keys)
        };

        let new_tablets = self.reshard_table_impl(table_id, first, last, tablet_count, &pivot_keys);
        self.update_tablet_state(table_id);
        Ok(new_tablets)
    }

    /// Split `[first, last]` into at most `tablet_count` parts of similar data size
    fn calculate_pivot_keys(
        &self,
        table_id: TableId,
        first: usize,
        last: usize,
        tablet_count: usize,
    ) -> Vec<Key> {
        let table = match self.tables.get(&table_id) {
            Some(table) => table,
            None => return Vec::new(),
        };
        let first_pivot_key = table
            .tablets
            .get(first)
            .and_then(|id| self.tablets.get(id))
            .map(|tablet| tablet.pivot_key.clone())
            .unwrap_or_default();

        let mut entries: Vec<(Key, Key, i64)> = Vec::new();
        let mut total_size = 0;
        let lists = self.chunks.tablet_lists(table.chunk_list);
        for list in lists.iter().skip(first).take(last + 1 - first) {
            for leaf in self.chunks.enumerate_chunks_and_views(*list) {
                let chunk = match self
                    .chunks
                    .underlying_chunk(leaf)
                    .and_then(|id| self.chunks.chunk(id))
                {
                    Some(chunk) if !chunk.eden => chunk,
                    _ => continue,
                };
                let range = self.chunks.complete_read_range(leaf);
                entries.push((range.lower_key(), range.upper_key(), chunk.uncompressed_data_size));
                total_size += chunk.uncompressed_data_size;
            }
        }
        entries.sort_by(|lhs, rhs| lhs.0.cmp(&rhs.0));

        let desired = total_size / tablet_count.max(1) as i64;
        let mut pivot_keys = vec![first_pivot_key];
        let mut last_key: Option<Key> = None;
        let mut current = 0;
        for (min_key, upper_key, size) in entries {
            let disjoint = last_key.as_ref().map_or(false, |last| *last <= min_key);
            if disjoint {
                if current >= desired {
                    current = 0;
                    pivot_keys.push(min_key);
                    last_key = Some(upper_key);
                }
            } else if last_key.as_ref().map_or(true, |last| upper_key > *last) {
                last_key = Some(upper_key);
            }
            current += size;
        }
        pivot_keys
    }

    fn reshard_table_impl(
        &mut self,
        table_id: TableId,
        first: usize,
        last: usize,
        tablet_count: usize,
        pivot_keys: &[Key],
    ) -> Vec<TabletId> {
        let (old_tablets, sorted, physically_sorted, replica_ids) = match self.tables.get(&table_id) {
            Some(table) => (
                table.tablets[first..=last].to_vec(),
                table.sorted,
                table.is_physically_sorted(),
                table.replicas.iter().copied().collect::<Vec<_>>(),
            ),
            None => return Vec::new(),
        };
        let old_tablet_count = old_tablets.len();
        log_unless_recovery!(self, debug, table_id = %table_id, first, last, tablet_count, "Resharding table");

        let retained_timestamp = old_tablets
            .iter()
            .filter_map(|id| self.tablets.get(id))
            .map(|tablet| tablet.retained_timestamp)
            .max()
            .unwrap_or(0);
        let old_trimmed: Vec<i64> = old_tablets
            .iter()
            .map(|id| self.tablets.get(id).map(|t| t.trimmed_row_count).unwrap_or(0))
            .collect();

        let mut new_tablets = Vec::with_capacity(tablet_count);
        for index in 0..tablet_count {
            let tablet_id = self.create_tablet(table_id);
            if let Some(tablet) = self.tablets.get_mut(&tablet_id) {
                if sorted {
                    tablet.pivot_key = pivot_keys.get(index).cloned().unwrap_or_default();
                } else if index < old_tablet_count {
                    tablet.trimmed_row_count = old_trimmed[index];
                }
                tablet.retained_timestamp = retained_timestamp;
                for replica_id in &replica_ids {
                    tablet.replicas.insert(*replica_id, TableReplicaInfo::default());
                }
            }
            new_tablets.push(tablet_id);
        }

        let mut old_pivot_keys: Vec<Key> = old_tablets
            .iter()
            .map(|id| self.tablets.get(id).map(|t| t.pivot_key.clone()).unwrap_or_default())
            .collect();
        let upper_pivot_key = self
            .tables
            .get(&table_id)
            .and_then(|table| table.tablets.get(last + 1))
            .and_then(|id| self.tablets.get(id))
            .map(|tablet| tablet.pivot_key.clone())
            .unwrap_or_else(Key::max);
        old_pivot_keys.push(upper_pivot_key);

        for tablet_id in &old_tablets {
            self.destroy_tablet(*tablet_id);
        }
        if let Some(table) = self.tables.get_mut(&table_id) {
            table.tablets.splice(first..=last, new_tablets.iter().copied());
        }
        self.reindex_tablets(table_id);

        self.copy_chunk_list_if_shared(table_id, first, last);

        let old_root = match self.tables.get(&table_id) {
            Some(table) => table.chunk_list,
            None => return new_tablets,
        };
        let old_children = self.chunks.children(old_root);
        let old_lists: Vec<ChunkListId> = old_children[first..=last]
            .iter()
            .filter_map(|child| match child {
                ChunkTree::ChunkList(id) => Some(*id),
                _ => None,
            })
            .collect();

        let new_lists = if physically_sorted {
            self.redistribute_sorted_chunks(&old_lists, &old_pivot_keys, pivot_keys)
        } else {
            self.redistribute_ordered_chunks(&old_lists, &old_trimmed, tablet_count)
        };

        let root_kind = self
            .chunks
            .list(old_root)
            .map(|list| list.kind)
            .unwrap_or(ChunkListKind::SortedDynamicRoot);
        let new_root = self.chunks.create_chunk_list(root_kind);
        self.chunks.attach_all(new_root, &old_children[..first]);
        for list in &new_lists {
            self.chunks.attach(new_root, ChunkTree::ChunkList(*list));
        }
        self.chunks.attach_all(new_root, &old_children[last + 1..]);

        self.chunks.ref_tree(ChunkTree::ChunkList(new_root));
        if let Some(table) = self.tables.get_mut(&table_id) {
            table.chunk_list = new_root;
        }
        self.chunks.unref_tree(ChunkTree::ChunkList(old_root));

        self.refresh_table_data_statistics(table_id);
        self.schedule_table_statistics_update(table_id, true, true);
        new_tablets
    }

    fn reindex_tablets(&mut self, table_id: TableId) {
        let tablet_ids = match self.tables.get(&table_id) {
            Some(table) => table.tablets.clone(),
            None => return,
        };
        for (index, tablet_id) in tablet_ids.into_iter().enumerate() {
            if let Some(tablet) = self.tablets.get_mut(&tablet_id) {
                tablet.index = index;
            }
        }
    }

    /// New tablet lists for a physically sorted table, one per pivot key
    fn redistribute_sorted_chunks(
        &mut self,
        old_lists: &[ChunkListId],
        old_pivot_keys: &[Key],
        pivot_keys: &[Key],
    ) -> Vec<ChunkListId> {
        let mut leaves = Vec::new();
        let mut scratch_views = Vec::new();
        for (offset, list) in old_lists.iter().enumerate() {
            let lower_pivot = &old_pivot_keys[offset];
            let upper_pivot = &old_pivot_keys[offset + 1];
            for leaf in self.chunks.enumerate_chunks_and_views(*list) {
                let leaf = match leaf {
                    ChunkTree::ChunkView(view_id) => {
                        let range = self.chunks.complete_read_range(leaf);
                        if range.lower_key() < *lower_pivot || *upper_pivot < range.upper_key() {
                            let from_bulk_insert = self
                                .chunks
                                .view(view_id)
                                .map(|view| view.transaction_id.is_some())
                                .unwrap_or(false);
                            if !from_bulk_insert {
                                error!(
                                    alert = true,
                                    view_id = %view_id,
                                    range = %range,
                                    pivot_key = %lower_pivot,
                                    next_pivot_key = %upper_pivot,
                                    "Chunk view without transaction id is not fully inside its tablet"
                                );
                            }
                            let clipped = self.chunks.restrict(
                                leaf,
                                ReadRange::between(lower_pivot.clone(), upper_pivot.clone()),
                            );
                            scratch_views.push(clipped);
                            ChunkTree::ChunkView(clipped)
                        } else {
                            leaf
                        }
                    }
                    other => other,
                };
                leaves.push(leaf);
            }
        }
        leaves.sort();
        leaves.dedup();

        let tablet_count = pivot_keys.len();
        let upper_pivot_keys: Vec<Key> = (0..tablet_count)
            .map(|index| {
                pivot_keys
                    .get(index + 1)
                    .cloned()
                    .unwrap_or_else(|| old_pivot_keys[old_pivot_keys.len() - 1].clone())
            })
            .collect();

        let new_lists: Vec<ChunkListId> = pivot_keys
            .iter()
            .map(|pivot_key| {
                let list = self.chunks.create_chunk_list(ChunkListKind::SortedDynamicTablet);
                self.chunks.set_pivot_key(list, pivot_key.clone());
                list
            })
            .collect();

        let mut views_to_merge: Vec<Vec<ChunkViewId>> = vec![Vec::new(); tablet_count];
        for leaf in leaves {
            let range = self.chunks.complete_read_range(leaf);
            let (lower_key, upper_key) = (range.lower_key(), range.upper_key());
            for index in 0..tablet_count {
                let lower_pivot = &pivot_keys[index];
                let upper_pivot = &upper_pivot_keys[index];
                if !(lower_key < *upper_pivot && *lower_pivot < upper_key) {
                    continue;
                }
                match leaf {
                    ChunkTree::ChunkView(view_id) => views_to_merge[index].push(view_id),
                    _ if *lower_pivot <= lower_key && upper_key <= *upper_pivot => {
                        self.chunks.attach(new_lists[index], leaf);
                    }
                    _ => {
                        let view = self.chunks.restrict(
                            leaf,
                            ReadRange::between(lower_pivot.clone(), upper_pivot.clone()),
                        );
                        self.chunks.attach(new_lists[index], ChunkTree::ChunkView(view));
                    }
                }
            }
        }

        for (index, views) in views_to_merge.into_iter().enumerate() {
            let merged =
                self.merge_chunk_view_ranges(views, &pivot_keys[index], &upper_pivot_keys[index]);
            self.chunks.attach_all(new_lists[index], &merged);
        }

        // Clipped views that ended up merged into clones are referenced by nobody.
        for view_id in scratch_views {
            if self.chunks.view(view_id).map(|view| view.ref_count) == Some(0) {
                self.chunks.unref_tree(ChunkTree::ChunkView(view_id));
            }
        }

        new_lists
    }

    /// Collapse views of the same chunk with adjacent ranges, clipped to `[lower_pivot, upper_pivot)`
    fn merge_chunk_view_ranges(
        &mut self,
        view_ids: Vec<ChunkViewId>,
        lower_pivot: &Key,
        upper_pivot: &Key,
    ) -> Vec<ChunkTree> {
        let mut views: Vec<ChunkView> = view_ids
            .iter()
            .filter_map(|id| self.chunks.view(*id).cloned())
            .collect();
        views.sort_by(|lhs, rhs| {
            (lhs.chunk, lhs.read_range.lower_key()).cmp(&(rhs.chunk, rhs.read_range.lower_key()))
        });

        let mut groups: Vec<(ChunkView, ChunkView)> = Vec::new();
        for view in views {
            if let Some((_, last)) = groups.last_mut() {
                if last.chunk == view.chunk
                    && last.transaction_id == view.transaction_id
                    && last.read_range.upper_key() == view.read_range.lower_key()
                {
                    *last = view;
                    continue;
                }
            }
            groups.push((view.clone(), view));
        }

        let mut result = Vec::with_capacity(groups.len());
        for (first_view, last_view) in groups {
            let lower = first_view.read_range.lower_key();
            let upper = last_view.read_range.upper_key();
            if first_view.id == last_view.id && *lower_pivot <= lower && upper <= *upper_pivot {
                result.push(ChunkTree::ChunkView(first_view.id));
                continue;
            }
            let adjusted_lower = max(lower, lower_pivot.clone());
            let adjusted_upper = min(upper, upper_pivot.clone());
            if adjusted_lower >= adjusted_upper {
                error!(alert = true, view_id = %first_view.id, "Failed to merge chunk view ranges");
                continue;
            }
            let view = self
                .chunks
                .clone_chunk_view(first_view.id, ReadRange::between(adjusted_lower, adjusted_upper));
            result.push(ChunkTree::ChunkView(view));
        }
        result
    }

    /// New tablet lists for an ordered table
    fn redistribute_ordered_chunks(
        &mut self,
        old_lists: &[ChunkListId],
        old_trimmed: &[i64],
        tablet_count: usize,
    ) -> Vec<ChunkListId> {
        let kept = min(old_lists.len(), tablet_count);
        let mut new_lists: Vec<ChunkListId> = old_lists[..kept]
            .iter()
            .map(|list| self.chunks.clone_tablet_chunk_list(*list))
            .collect();

        if old_lists.len() > tablet_count {
            let target = new_lists[tablet_count - 1];
            for (list, trimmed_row_count) in old_lists[tablet_count..]
                .iter()
                .zip(&old_trimmed[tablet_count..])
            {
                let skip = self.trimmed_chunk_prefix(*list, *trimmed_row_count).unwrap_or(0);
                for chunk_id in self.chunks.enumerate_chunks(*list).into_iter().skip(skip) {
                    self.chunks.attach(target, ChunkTree::Chunk(chunk_id));
                }
            }
        } else {
            for _ in old_lists.len()..tablet_count {
                new_lists.push(self.chunks.create_chunk_list(ChunkListKind::OrderedDynamicTablet));
            }
        }
        new_lists
    }

    /// Number of leading chunks covered exactly by `trimmed_row_count` rows
    fn trimmed_chunk_prefix(&self, list: ChunkListId, trimmed_row_count: i64) -> Option<usize> {
        let mut rows = 0;
        for (index, chunk_id) in self.chunks.enumerate_chunks(list).into_iter().enumerate() {
            if rows == trimmed_row_count {
                return Some(index);
            }
            if rows > trimmed_row_count {
                return None;
            }
            rows += self.chunks.chunk(chunk_id).map(|c| c.row_count).unwrap_or(0);
        }
        if rows == trimmed_row_count {
            Some(self.chunks.enumerate_chunks(list).len())
        } else {
            None
        }
    }

    /// Give the table a private copy of the tablet lists `[first, last]` if they are shared
    pub(super) fn copy_chunk_list_if_shared(&mut self, table_id: TableId, first: usize, last: usize) {
        let old_root = match self.tables.get(&table_id) {
            Some(table) => table.chunk_list,
            None => return,
        };
        let children = self.chunks.children(old_root);
        let statistics = self.chunks.list_statistics(old_root);

        if self.chunks.ref_count(old_root) > 1 {
            let kind = self
                .chunks
                .list(old_root)
                .map(|list| list.kind)
                .unwrap_or(ChunkListKind::SortedDynamicRoot);
            let new_root = self.chunks.create_chunk_list(kind);
            for (index, child) in children.into_iter().enumerate() {
                let child = match child {
                    ChunkTree::ChunkList(list) if (first..=last).contains(&index) => {
                        ChunkTree::ChunkList(self.chunks.clone_tablet_chunk_list(list))
                    }
                    other => other,
                };
                self.chunks.attach(new_root, child);
            }

            self.chunks.ref_tree(ChunkTree::ChunkList(new_root));
            if let Some(table) = self.tables.get_mut(&table_id) {
                table.chunk_list = new_root;
            }
            self.chunks.unref_tree(ChunkTree::ChunkList(old_root));

            let new_statistics = self.chunks.list_statistics(new_root);
            if !new_statistics.matches_ignoring_lists(&statistics) {
                log_unless_recovery!(self, error, alert = true, table_id = %table_id, new_statistics = %new_statistics, statistics = %statistics, "Invalid new root chunk list statistics");
            }
            log_unless_recovery!(self, debug, table_id = %table_id, old_root = %old_root, new_root = %new_root, "Shared root chunk list copied");
        } else {
            for index in first..=last {
                let list = match children.get(index) {
                    Some(ChunkTree::ChunkList(list)) => *list,
                    _ => continue,
                };
                if self.chunks.ref_count(list) > 1 {
                    let clone = self.chunks.clone_tablet_chunk_list(list);
                    self.chunks.replace_child(old_root, index, ChunkTree::ChunkList(clone));
                }
            }

            let new_statistics = self.chunks.list_statistics(old_root);
            if !new_statistics.matches_ignoring_lists(&statistics) {
                log_unless_recovery!(self, error, alert = true, table_id = %table_id, new_statistics = %new_statistics, statistics = %statistics, "Invalid old root chunk list statistics");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::{chunk, TestCluster};
    use crate::manager::CreateTableOptions;

    fn pivots(keys: &[&str]) -> Vec<Key> {
        std::iter::once(Key::empty())
            .chain(keys.iter().map(|key| Key::from(*key)))
            .collect()
    }

    fn tablet_leaves(cluster: &TestCluster, table_id: TableId) -> Vec<Vec<ChunkTree>> {
        let table = cluster.manager.find_table(table_id).unwrap();
        let store = cluster.manager.chunk_store();
        store
            .tablet_lists(table.chunk_list)
            .into_iter()
            .map(|list| store.enumerate_chunks_and_views(list))
            .collect()
    }

    #[test]
    fn test_split_with_pivot_keys() {
        let mut cluster = TestCluster::new();
        let table_id = cluster.sorted_table(&[]);
        cluster
            .manager
            .attach_chunks(
                table_id,
                0,
                vec![chunk("a", "c", 100), chunk("d", "f", 100), chunk("g", "z", 100)],
            )
            .unwrap();

        let new_tablets = cluster
            .manager
            .reshard_table(table_id, None, None, None, pivots(&["d", "g"]))
            .unwrap();
        assert_eq!(new_tablets.len(), 3);

        let tablets = cluster.manager.table_tablets(table_id);
        assert_eq!(tablets.iter().map(|t| t.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(tablets[2].pivot_key, Key::from("g"));
        assert_eq!(cluster.manager.chunk_store().view_count(), 0);
        assert!(tablet_leaves(&cluster, table_id).iter().all(|leaves| leaves.len() == 1));

        let table = cluster.manager.find_table(table_id).unwrap();
        assert_eq!(table.snapshot_statistics.uncompressed_data_size, 300);
        assert_eq!(table.count_in_state(TabletState::Unmounted), 3);
    }

    #[test]
    fn test_four_into_two_conserves_statistics() {
        let mut cluster = TestCluster::new();
        let table_id = cluster.sorted_table(&["c", "k", "q"]);
        let chunks = [("a", "b", 10), ("d", "e", 20), ("l", "m", 30), ("r", "s", 40)];
        for (index, (min, max, size)) in chunks.into_iter().enumerate() {
            cluster
                .manager
                .attach_chunks(table_id, index, vec![chunk(min, max, size)])
                .unwrap();
        }
        let before = cluster.manager.find_table(table_id).unwrap().snapshot_statistics;
        assert_eq!(before.row_count, 100);
        assert_eq!(before.uncompressed_data_size, 100);

        cluster
            .manager
            .reshard_table(table_id, None, None, None, pivots(&["k"]))
            .unwrap();

        let after = cluster.manager.find_table(table_id).unwrap().snapshot_statistics;
        assert_eq!(after.row_count, before.row_count);
        assert_eq!(after.uncompressed_data_size, before.uncompressed_data_size);

        let tablets = cluster.manager.table_tablets(table_id);
        let pivot_keys: Vec<_> = tablets.iter().map(|t| t.pivot_key.clone()).collect();
        assert_eq!(pivot_keys, pivots(&["k"]));

        // Every chunk lands whole in exactly one tablet.
        let leaves = tablet_leaves(&cluster, table_id);
        assert_eq!(leaves.len(), 2);
        assert!(leaves
            .iter()
            .all(|leaves| leaves.len() == 2 && leaves.iter().all(|leaf| matches!(leaf, ChunkTree::Chunk(_)))));
        let store = cluster.manager.chunk_store();
        let rows: Vec<i64> = leaves
            .iter()
            .map(|leaves| leaves.iter().map(|leaf| store.statistics(*leaf).row_count).sum())
            .collect();
        assert_eq!(rows, vec![30, 70]);
    }

    #[test]
    fn test_straddling_chunk_is_clipped_and_merged_back() {
        let mut cluster = TestCluster::new();
        let table_id = cluster.sorted_table(&[]);
        cluster
            .manager
            .attach_chunks(table_id, 0, vec![chunk("a", "z", 100)])
            .unwrap();

        cluster
            .manager
            .reshard_table(table_id, None, None, None, pivots(&["m"]))
            .unwrap();
        let leaves = tablet_leaves(&cluster, table_id);
        assert_eq!(leaves.len(), 2);
        assert!(leaves
            .iter()
            .all(|leaves| matches!(leaves.as_slice(), [ChunkTree::ChunkView(_)])));
        assert_eq!(cluster.manager.chunk_store().view_count(), 2);

        cluster
            .manager
            .reshard_table(table_id, None, None, None, pivots(&[]))
            .unwrap();
        let leaves = tablet_leaves(&cluster, table_id);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].len(), 1);
        assert_eq!(cluster.manager.chunk_store().view_count(), 1);

        let view = match leaves[0][0] {
            ChunkTree::ChunkView(view_id) => cluster.manager.chunk_store().view(view_id).unwrap(),
            other => panic!("unexpected leaf {:?}", other),
        };
        assert_eq!(view.read_range, ReadRange::default());
    }

    #[test]
    fn test_computed_pivot_keys() {
        let mut cluster = TestCluster::new();
        let table_id = cluster.sorted_table(&[]);
        cluster
            .manager
            .attach_chunks(
                table_id,
                0,
                vec![
                    chunk("a", "b", 100),
                    chunk("c", "d", 100),
                    chunk("e", "f", 100),
                    chunk("g", "h", 100),
                ],
            )
            .unwrap();

        let new_tablets = cluster
            .manager
            .reshard_table(table_id, None, None, Some(2), vec![])
            .unwrap();
        assert_eq!(new_tablets.len(), 2);
        let tablets = cluster.manager.table_tablets(table_id);
        assert_eq!(tablets[1].pivot_key, Key::from("e"));
    }

    #[test]
    fn test_reshard_subrange() {
        let mut cluster = TestCluster::new();
        let table_id = cluster.sorted_table(&["c", "k", "t"]);
        let before: Vec<_> = cluster
            .manager
            .table_tablets(table_id)
            .iter()
            .map(|t| t.id)
            .collect();

        let err = cluster
            .manager
            .reshard_table(table_id, Some(1), Some(2), None, vec![Key::from("d"), Key::from("p")])
            .unwrap_err();
        assert!(err.message.contains("First pivot key must match"));

        let err = cluster
            .manager
            .reshard_table(table_id, Some(1), Some(2), None, vec![Key::from("c"), Key::from("t")])
            .unwrap_err();
        assert!(err.message.contains("Last pivot key must be strictly less"));

        cluster
            .manager
            .reshard_table(table_id, Some(1), Some(1), None, vec![Key::from("c"), Key::from("f")])
            .unwrap();
        let tablets = cluster.manager.table_tablets(table_id);
        assert_eq!(tablets.len(), 5);
        assert_eq!(tablets[0].id, before[0]);
        assert_eq!(tablets[3].id, before[2]);
        assert_eq!(tablets[3].index, 3);
        assert_eq!(tablets[2].pivot_key, Key::from("f"));
    }

    #[test]
    fn test_mounted_tablets_cannot_be_resharded() {
        let mut cluster = TestCluster::with_cells(1);
        let table_id = cluster.sorted_table(&[]);
        cluster.mount(table_id);

        let err = cluster
            .manager
            .reshard_table(table_id, None, None, None, pivots(&["m"]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTabletState);
        assert!(err.message.contains("is not unmounted"));
    }

    #[test]
    fn test_invalid_pivot_keys() {
        let mut cluster = TestCluster::new();
        let table_id = cluster.sorted_table(&[]);

        let err = cluster
            .manager
            .reshard_table(table_id, None, None, None, vec![Key::from("a"), Key::from("b")])
            .unwrap_err();
        assert_eq!(err.message, "First pivot key must be empty");

        let err = cluster
            .manager
            .reshard_table(table_id, None, None, None, pivots(&["m", "c"]))
            .unwrap_err();
        assert_eq!(err.message, "Pivot keys must be strictly increasing");

        let err = cluster
            .manager
            .reshard_table(table_id, None, None, Some(3), pivots(&["m"]))
            .unwrap_err();
        assert_eq!(err.message, "Wrong pivot key count: 2 instead of 3");

        let err = cluster
            .manager
            .reshard_table(table_id, None, None, Some(0), vec![])
            .unwrap_err();
        assert_eq!(err.message, "Tablet count must be positive");
    }

    #[test]
    fn test_replicated_table_needs_pivot_keys() {
        let mut cluster = TestCluster::new();
        let mut options = CreateTableOptions::sorted("//tmp/replicated");
        options.replicated = true;
        let table_id = cluster.manager.create_table(options).unwrap();

        let err = cluster
            .manager
            .reshard_table(table_id, None, None, Some(2), vec![])
            .unwrap_err();
        assert!(err.message.contains("must be porovided"));

        cluster
            .manager
            .reshard_table(table_id, None, None, None, pivots(&["m"]))
            .unwrap();

        cluster
            .manager
            .attach_chunks(table_id, 0, vec![chunk("a", "b", 10)])
            .unwrap();
        let err = cluster
            .manager
            .reshard_table(table_id, None, None, None, pivots(&[]))
            .unwrap_err();
        assert_eq!(err.message, "Cannot reshard non-empty replicated table");
    }

    #[test]
    fn test_ordered_grow_and_shrink() {
        let mut cluster = TestCluster::new();
        let table_id = cluster
            .manager
            .create_table(CreateTableOptions::ordered("//tmp/queue", 2))
            .unwrap();
        cluster
            .manager
            .attach_chunks(table_id, 1, vec![chunk("", "", 100), chunk("", "", 100)])
            .unwrap();

        let err = cluster
            .manager
            .reshard_table(table_id, None, None, None, pivots(&["a"]))
            .unwrap_err();
        assert_eq!(err.message, "Table is ordered; must provide tablet count");

        cluster
            .manager
            .reshard_table(table_id, None, None, Some(4), vec![])
            .unwrap();
        assert_eq!(tablet_leaves(&cluster, table_id).iter().map(Vec::len).collect::<Vec<_>>(), vec![0, 2, 0, 0]);

        // Half-trimmed chunk blocks the merge.
        let dropped = cluster.manager.find_table(table_id).unwrap().tablets[1];
        cluster.manager.tablets.get_mut(&dropped).unwrap().trimmed_row_count = 50;
        let err = cluster
            .manager
            .reshard_table(table_id, Some(0), Some(1), Some(1), vec![])
            .unwrap_err();
        assert!(err.message.contains("are not fully trimmed"));

        cluster.manager.tablets.get_mut(&dropped).unwrap().trimmed_row_count = 100;
        cluster
            .manager
            .reshard_table(table_id, Some(0), Some(1), Some(1), vec![])
            .unwrap();
        assert_eq!(tablet_leaves(&cluster, table_id).iter().map(Vec::len).collect::<Vec<_>>(), vec![1, 0, 0]);
    }

    #[test]
    fn test_shared_root_is_copied() {
        let mut cluster = TestCluster::new();
        let table_id = cluster.sorted_table(&[]);
        cluster
            .manager
            .attach_chunks(table_id, 0, vec![chunk("a", "z", 100)])
            .unwrap();

        let old_root = cluster.manager.find_table(table_id).unwrap().chunk_list;
        cluster.manager.chunks.ref_tree(ChunkTree::ChunkList(old_root));

        cluster
            .manager
            .attach_chunks(table_id, 0, vec![chunk("b", "c", 10)])
            .unwrap();
        let new_root = cluster.manager.find_table(table_id).unwrap().chunk_list;
        assert_ne!(old_root, new_root);

        let store = cluster.manager.chunk_store();
        assert_eq!(store.list_statistics(old_root).chunk_count, 1);
        assert_eq!(store.list_statistics(new_root).chunk_count, 2);
        assert_eq!(store.ref_count(old_root), 1);
    }

    #[test]
    fn test_tablet_limit() {
        let mut cluster = TestCluster::new();
        let table_id = cluster
            .manager
            .create_table(CreateTableOptions::ordered("//tmp/queue", 1))
            .unwrap();
        let limit = cluster.manager.config().max_tablet_count;
        let err = cluster
            .manager
            .reshard_table(table_id, None, None, Some(limit + 1), vec![])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TooManyTablets);
    }
}
