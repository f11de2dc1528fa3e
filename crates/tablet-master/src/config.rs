//! Configuration module for the tablet master
//!
//! Supports YAML configuration files; every field has a default so partial
//! files are accepted.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::metadata::CellTag;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Cluster name
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Data directory (snapshots)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// HTTP API listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Tag of this master cell
    #[serde(default = "default_cell_tag")]
    pub cell_tag: CellTag,
    /// Tag of the primary master cell
    #[serde(default = "default_cell_tag")]
    pub primary_cell_tag: CellTag,
    /// Tags of secondary master cells (primary only)
    #[serde(default)]
    pub secondary_cell_tags: Vec<CellTag>,
    /// Tablet manager configuration
    #[serde(default)]
    pub tablet_manager: TabletManagerConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            data_dir: default_data_dir(),
            http_addr: default_http_addr(),
            cell_tag: default_cell_tag(),
            primary_cell_tag: default_cell_tag(),
            secondary_cell_tags: Vec::new(),
            tablet_manager: TabletManagerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl MasterConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to YAML file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Whether this master is the primary (statistics aggregator)
    pub fn is_primary(&self) -> bool {
        self.cell_tag == self.primary_cell_tag
    }
}

/// Tablet manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletManagerConfig {
    /// Upper bound on tablets per table
    #[serde(default = "default_max_tablet_count")]
    pub max_tablet_count: usize,
    /// Fixed per-tablet memory overhead used by in-memory placement
    #[serde(default = "default_tablet_data_size_footprint")]
    pub tablet_data_size_footprint: i64,
    #[serde(default = "default_gossip_period_ms")]
    pub cell_statistics_gossip_period_ms: u64,
    #[serde(default = "default_gossip_period_ms")]
    pub table_statistics_gossip_period_ms: u64,
    /// Max queued table statistics entries sent per gossip round
    #[serde(default = "default_table_statistics_gossip_batch_size")]
    pub table_statistics_gossip_batch_size: usize,
    #[serde(default = "default_cleanup_period_ms")]
    pub cleanup_period_ms: u64,
    #[serde(default = "default_orphaned_action_kick_period_ms")]
    pub orphaned_action_kick_period_ms: u64,
    /// How long finished tablet actions are kept around
    #[serde(default = "default_tablet_action_expiration_timeout_secs")]
    pub tablet_action_expiration_timeout_secs: i64,
    #[serde(default = "default_max_snapshot_count_to_keep")]
    pub max_snapshot_count_to_keep: usize,
    #[serde(default = "default_max_changelog_count_to_keep")]
    pub max_changelog_count_to_keep: usize,
}

impl Default for TabletManagerConfig {
    fn default() -> Self {
        Self {
            max_tablet_count: default_max_tablet_count(),
            tablet_data_size_footprint: default_tablet_data_size_footprint(),
            cell_statistics_gossip_period_ms: default_gossip_period_ms(),
            table_statistics_gossip_period_ms: default_gossip_period_ms(),
            table_statistics_gossip_batch_size: default_table_statistics_gossip_batch_size(),
            cleanup_period_ms: default_cleanup_period_ms(),
            orphaned_action_kick_period_ms: default_orphaned_action_kick_period_ms(),
            tablet_action_expiration_timeout_secs: default_tablet_action_expiration_timeout_secs(),
            max_snapshot_count_to_keep: default_max_snapshot_count_to_keep(),
            max_changelog_count_to_keep: default_max_changelog_count_to_keep(),
        }
    }
}

impl TabletManagerConfig {
    pub fn cell_statistics_gossip_period(&self) -> Duration {
        Duration::from_millis(self.cell_statistics_gossip_period_ms)
    }

    pub fn table_statistics_gossip_period(&self) -> Duration {
        Duration::from_millis(self.table_statistics_gossip_period_ms)
    }

    pub fn cleanup_period(&self) -> Duration {
        Duration::from_millis(self.cleanup_period_ms)
    }

    pub fn orphaned_action_kick_period(&self) -> Duration {
        Duration::from_millis(self.orphaned_action_kick_period_ms)
    }

    pub fn tablet_action_expiration_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.tablet_action_expiration_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./tablet_master_data")
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_cell_tag() -> CellTag {
    1
}

fn default_max_tablet_count() -> usize {
    10000
}

fn default_tablet_data_size_footprint() -> i64 {
    64 * 1024 * 1024 // 64MB
}

fn default_gossip_period_ms() -> u64 {
    1000 // 1 second
}

fn default_table_statistics_gossip_batch_size() -> usize {
    100
}

fn default_cleanup_period_ms() -> u64 {
    10000 // 10 seconds
}

fn default_orphaned_action_kick_period_ms() -> u64 {
    1000 // 1 second
}

fn default_tablet_action_expiration_timeout_secs() -> i64 {
    60
}

fn default_max_snapshot_count_to_keep() -> usize {
    10
}

fn default_max_changelog_count_to_keep() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
cluster_name: prod
cell_tag: 2
tablet_manager:
  max_tablet_count: 500
"#;
        let config = MasterConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.cluster_name, "prod");
        assert_eq!(config.cell_tag, 2);
        assert_eq!(config.primary_cell_tag, 1);
        assert!(!config.is_primary());
        assert_eq!(config.tablet_manager.max_tablet_count, 500);
        assert_eq!(
            config.tablet_manager.tablet_data_size_footprint,
            64 * 1024 * 1024
        );
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.yaml");
        let mut config = MasterConfig::default();
        config.tablet_manager.cleanup_period_ms = 250;
        config.to_file(&path).unwrap();

        let loaded = MasterConfig::from_file(&path).unwrap();
        assert_eq!(loaded.tablet_manager.cleanup_period(), Duration::from_millis(250));
        assert!(loaded.is_primary());
    }

    #[test]
    fn test_bad_yaml() {
        assert!(matches!(
            MasterConfig::from_yaml("cell_tag: [1, 2"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
