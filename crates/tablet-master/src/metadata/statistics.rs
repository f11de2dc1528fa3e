//! Statistics exchanged between tablets, cells, tables and master cells

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{AddAssign, SubAssign};

use super::{CellHealth, InMemoryMode};

/// Runtime statistics reported by the hosting node for one tablet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletNodeStatistics {
    pub partition_count: i64,
    pub store_count: i64,
    pub preload_pending_store_count: i64,
    pub preload_completed_store_count: i64,
    pub preload_failed_store_count: i64,
    pub overlapping_store_count: i64,
    pub dynamic_memory_pool_size: i64,
    pub unflushed_timestamp: u64,
    pub last_commit_timestamp: u64,
    pub modification_time: Option<DateTime<Utc>>,
    pub access_time: Option<DateTime<Utc>>,
}

/// Aggregated statistics of a tablet, or of all tablets hosted by a cell
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletCellStatistics {
    pub unmerged_row_count: i64,
    pub uncompressed_data_size: i64,
    pub compressed_data_size: i64,
    pub memory_size: i64,
    pub chunk_count: i64,
    pub partition_count: i64,
    pub store_count: i64,
    pub preload_pending_store_count: i64,
    pub preload_completed_store_count: i64,
    pub preload_failed_store_count: i64,
    pub overlapping_store_count: i64,
    pub dynamic_memory_pool_size: i64,
    pub tablet_count: i64,
    pub tablet_count_per_memory_mode: BTreeMap<InMemoryMode, i64>,
    pub decommissioned: bool,
    pub health: CellHealth,
}

impl TabletCellStatistics {
    pub fn tablet_count_in_mode(&self, mode: InMemoryMode) -> i64 {
        self.tablet_count_per_memory_mode.get(&mode).copied().unwrap_or(0)
    }
}

impl AddAssign<&TabletCellStatistics> for TabletCellStatistics {
    fn add_assign(&mut self, rhs: &TabletCellStatistics) {
        self.unmerged_row_count += rhs.unmerged_row_count;
        self.uncompressed_data_size += rhs.uncompressed_data_size;
        self.compressed_data_size += rhs.compressed_data_size;
        self.memory_size += rhs.memory_size;
        self.chunk_count += rhs.chunk_count;
        self.partition_count += rhs.partition_count;
        self.store_count += rhs.store_count;
        self.preload_pending_store_count += rhs.preload_pending_store_count;
        self.preload_completed_store_count += rhs.preload_completed_store_count;
        self.preload_failed_store_count += rhs.preload_failed_store_count;
        self.overlapping_store_count += rhs.overlapping_store_count;
        self.dynamic_memory_pool_size += rhs.dynamic_memory_pool_size;
        self.tablet_count += rhs.tablet_count;
        for (mode, count) in &rhs.tablet_count_per_memory_mode {
            *self.tablet_count_per_memory_mode.entry(*mode).or_insert(0) += count;
        }
    }
}

impl SubAssign<&TabletCellStatistics> for TabletCellStatistics {
    fn sub_assign(&mut self, rhs: &TabletCellStatistics) {
        self.unmerged_row_count -= rhs.unmerged_row_count;
        self.uncompressed_data_size -= rhs.uncompressed_data_size;
        self.compressed_data_size -= rhs.compressed_data_size;
        self.memory_size -= rhs.memory_size;
        self.chunk_count -= rhs.chunk_count;
        self.partition_count -= rhs.partition_count;
        self.store_count -= rhs.store_count;
        self.preload_pending_store_count -= rhs.preload_pending_store_count;
        self.preload_completed_store_count -= rhs.preload_completed_store_count;
        self.preload_failed_store_count -= rhs.preload_failed_store_count;
        self.overlapping_store_count -= rhs.overlapping_store_count;
        self.dynamic_memory_pool_size -= rhs.dynamic_memory_pool_size;
        self.tablet_count -= rhs.tablet_count;
        for (mode, count) in &rhs.tablet_count_per_memory_mode {
            *self.tablet_count_per_memory_mode.entry(*mode).or_insert(0) -= count;
        }
    }
}

/// Data statistics of a table's chunk tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStatistics {
    pub row_count: i64,
    pub uncompressed_data_size: i64,
    pub compressed_data_size: i64,
    pub data_weight: i64,
    pub chunk_count: i64,
}

/// Tablet-related resource usage charged to a table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletResourceUsage {
    pub tablet_count: i64,
    pub tablet_static_memory: i64,
}

/// Pending table statistics delta queued for the native master cell
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStatisticsUpdate {
    pub data_statistics: Option<DataStatistics>,
    pub tablet_resource_usage: Option<TabletResourceUsage>,
    pub modification_time: Option<DateTime<Utc>>,
    pub access_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_statistics_arithmetic() {
        let mut tablet = TabletCellStatistics {
            uncompressed_data_size: 100,
            memory_size: 40,
            tablet_count: 1,
            ..Default::default()
        };
        tablet
            .tablet_count_per_memory_mode
            .insert(InMemoryMode::Compressed, 1);

        let mut cell = TabletCellStatistics::default();
        cell += &tablet;
        cell += &tablet;
        assert_eq!(cell.uncompressed_data_size, 200);
        assert_eq!(cell.tablet_count_in_mode(InMemoryMode::Compressed), 2);

        cell -= &tablet;
        assert_eq!(cell.memory_size, 40);
        assert_eq!(cell.tablet_count, 1);
        assert_eq!(cell.tablet_count_in_mode(InMemoryMode::Uncompressed), 0);
    }
}
