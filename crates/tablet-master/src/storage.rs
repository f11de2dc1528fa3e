//! File persistent storage
//!
//! Master state is a snapshot file plus a changelog of mutations applied
//! since. Tablet cells keep their own snapshots and changelogs under
//! `cells/<cell_id>/`, which the master trims during cleanup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::manager::{snapshot_threshold_id, TabletManagerSnapshot};
use crate::metadata::CellId;
use crate::mutation::{Mutation, MutationContext};

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Corrupt changelog {path:?} at line {line}: {message}")]
    CorruptChangelog {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// One applied mutation as written to the changelog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogRecord {
    pub ctx: MutationContext,
    pub mutation: Mutation,
}

/// Files removed by a cell storage cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub snapshots_removed: Vec<(CellId, u64)>,
    pub changelogs_removed: Vec<(CellId, u64)>,
}

/// File storage
pub struct FileStorage {
    data_dir: PathBuf,
    snapshot_path: PathBuf,
    changelog_path: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let snapshot_path = data_dir.join("snapshot.json");
        let changelog_path = data_dir.join("changelog.jsonl");
        Self {
            data_dir,
            snapshot_path,
            changelog_path,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Ensure data directory exists
    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir).await?;
            info!("Created data directory: {:?}", self.data_dir);
        }
        Ok(())
    }

    pub async fn load_snapshot(&self) -> Result<Option<TabletManagerSnapshot>, StorageError> {
        if !self.snapshot_path.exists() {
            info!("Snapshot not found, starting from empty state");
            return Ok(None);
        }

        let content = fs::read_to_string(&self.snapshot_path).await?;
        let snapshot: TabletManagerSnapshot = serde_json::from_str(&content)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        info!(
            version = snapshot.version,
            tablets = snapshot.keys.tablets.len(),
            actions = snapshot.keys.actions.len(),
            "Loaded snapshot"
        );
        Ok(Some(snapshot))
    }

    /// Write `snapshot` taken at mutation `version` and truncate the changelog
    pub async fn save_snapshot(
        &self,
        snapshot: &TabletManagerSnapshot,
        version: u64,
    ) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then atomically rename
        let temp_path = self.snapshot_path.with_extension("json.tmp");
        let content = serde_json::to_string(&SnapshotFile {
            mutation_version: version,
            snapshot,
        })
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.snapshot_path).await?;

        if self.changelog_path.exists() {
            fs::remove_file(&self.changelog_path).await?;
        }
        info!(version, "Saved snapshot");
        Ok(())
    }

    /// Mutation version the saved snapshot was taken at
    pub async fn snapshot_version(&self) -> Result<u64, StorageError> {
        if !self.snapshot_path.exists() {
            return Ok(0);
        }
        let content = fs::read_to_string(&self.snapshot_path).await?;
        let header: SnapshotHeader = serde_json::from_str(&content)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(header.mutation_version)
    }

    pub async fn append(&self, record: &ChangelogRecord) -> Result<(), StorageError> {
        self.ensure_dir().await?;
        let mut line = serde_json::to_string(record)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.changelog_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn read_changelog(&self) -> Result<Vec<ChangelogRecord>, StorageError> {
        if !self.changelog_path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.changelog_path).await?;
        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|e| StorageError::CorruptChangelog {
                path: self.changelog_path.clone(),
                line: index + 1,
                message: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    fn cell_dir(&self, cell_id: CellId, kind: &str) -> PathBuf {
        self.data_dir
            .join("cells")
            .join(cell_id.to_string())
            .join(kind)
    }

    /// Remove cell snapshots and changelogs beyond the keep limits
    ///
    /// Changelogs older than the oldest kept snapshot are never needed, so
    /// they go regardless of their own limit.
    pub async fn cleanup_cell_storage(
        &self,
        cell_ids: &[CellId],
        max_snapshots: usize,
        max_changelogs: usize,
    ) -> Result<CleanupReport, StorageError> {
        let mut report = CleanupReport::default();
        for cell_id in cell_ids {
            let snapshots_dir = self.cell_dir(*cell_id, "snapshots");
            let snapshot_ids = match list_numbered(&snapshots_dir).await? {
                Some(ids) => ids,
                None => continue,
            };
            let snapshot_threshold = snapshot_threshold_id(&snapshot_ids, max_snapshots);
            if let Some(threshold) = snapshot_threshold {
                for id in snapshot_ids.iter().filter(|id| **id < threshold) {
                    fs::remove_file(snapshots_dir.join(id.to_string())).await?;
                    info!(cell_id = %cell_id, snapshot_id = id, "Removed tablet cell snapshot");
                    report.snapshots_removed.push((*cell_id, *id));
                }
            }

            let changelogs_dir = self.cell_dir(*cell_id, "changelogs");
            let changelog_ids = match list_numbered(&changelogs_dir).await? {
                Some(ids) => ids,
                None => continue,
            };
            let kept_snapshot = snapshot_ids
                .iter()
                .copied()
                .filter(|id| snapshot_threshold.map_or(true, |threshold| *id >= threshold))
                .min();
            let changelog_threshold = snapshot_threshold_id(&changelog_ids, max_changelogs)
                .into_iter()
                .chain(kept_snapshot)
                .max();
            if let Some(threshold) = changelog_threshold {
                for id in changelog_ids.iter().filter(|id| **id < threshold) {
                    fs::remove_file(changelogs_dir.join(id.to_string())).await?;
                    info!(cell_id = %cell_id, changelog_id = id, "Removed tablet cell changelog");
                    report.changelogs_removed.push((*cell_id, *id));
                }
            }
        }
        Ok(report)
    }
}

#[derive(Serialize)]
struct SnapshotFile<'a> {
    mutation_version: u64,
    #[serde(flatten)]
    snapshot: &'a TabletManagerSnapshot,
}

#[derive(Deserialize)]
struct SnapshotHeader {
    mutation_version: u64,
}

/// Numeric file names in `dir`; `None` when the directory does not exist
async fn list_numbered(dir: &Path) -> Result<Option<Vec<u64>>, StorageError> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut ids = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        match name.parse::<u64>() {
            Ok(id) => ids.push(id),
            Err(_) => warn!(dir = ?dir, name = %name, "Unrecognized item in cell storage"),
        }
    }
    ids.sort_unstable();
    Ok(Some(ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::TestCluster;
    use chrono::Utc;

    #[tokio::test]
    async fn test_snapshot_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage.load_snapshot().await.unwrap().is_none());

        let cluster = TestCluster::with_cells(1);
        storage
            .append(&ChangelogRecord {
                ctx: MutationContext::new(3, Utc::now(), 3),
                mutation: Mutation::GossipCellStatistics,
            })
            .await
            .unwrap();
        storage
            .save_snapshot(&cluster.manager.save_snapshot(), 3)
            .await
            .unwrap();

        let loaded = storage.load_snapshot().await.unwrap().unwrap();
        assert_eq!(loaded.keys.cells, cluster.cells);
        assert_eq!(storage.snapshot_version().await.unwrap(), 3);
        assert!(storage.read_changelog().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_changelog_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        for version in 1..=3 {
            storage
                .append(&ChangelogRecord {
                    ctx: MutationContext::new(version, Utc::now(), version),
                    mutation: Mutation::RemoveExpiredTabletActions,
                })
                .await
                .unwrap();
        }
        let records = storage.read_changelog().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].ctx.version, 3);

        std::fs::write(dir.path().join("changelog.jsonl"), "{not json}\n").unwrap();
        assert!(matches!(
            storage.read_changelog().await,
            Err(StorageError::CorruptChangelog { line: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_cell_storage_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let cell_id = CellId(7);
        let cell_dir = dir.path().join("cells").join(cell_id.to_string());
        let snapshots = cell_dir.join("snapshots");
        let changelogs = cell_dir.join("changelogs");
        std::fs::create_dir_all(&snapshots).unwrap();
        std::fs::create_dir_all(&changelogs).unwrap();
        for id in [10, 20, 30] {
            std::fs::write(snapshots.join(id.to_string()), b"").unwrap();
        }
        std::fs::write(snapshots.join("garbage"), b"").unwrap();
        for id in [5, 15, 25, 35] {
            std::fs::write(changelogs.join(id.to_string()), b"").unwrap();
        }

        let report = storage
            .cleanup_cell_storage(&[cell_id, CellId(8)], 2, 10)
            .await
            .unwrap();
        assert_eq!(report.snapshots_removed, vec![(cell_id, 10)]);
        assert_eq!(report.changelogs_removed, vec![(cell_id, 5), (cell_id, 15)]);
        assert!(snapshots.join("20").exists());
        assert!(changelogs.join("25").exists());
    }
}
