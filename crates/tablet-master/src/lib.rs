//! Tablet master
//!
//! Tablet lifecycle and tablet action orchestration for a dynamic-table
//! master: tablet cell bundles and cells, mount/unmount/freeze/reshard of
//! table tablets, replicated table replicas and multi-step tablet actions.
//!
//! # Usage Example
//! ```ignore
//! use tablet_master::{MasterConfig, TabletMaster};
//!
//! let master = TabletMaster::start(MasterConfig::default()).await?;
//! master.automaton().leader_active().await?;
//! ```

pub mod api;
pub mod automaton;
pub mod config;
pub mod error;
pub mod hive;
pub mod manager;
pub mod metadata;
pub mod mutation;
pub mod periodic;
pub mod storage;

pub use automaton::{Automaton, AutomatonHandle, LoggingTransport, MessageTransport};
pub use config::MasterConfig;
pub use error::{ErrorCode, Result, TabletError};
pub use manager::TabletManager;
pub use mutation::{Mutation, MutationResponse};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use storage::FileStorage;

/// Running tablet master: the automaton task plus its handle
pub struct TabletMaster {
    config: MasterConfig,
    automaton: AutomatonHandle,
    task: JoinHandle<()>,
}

impl TabletMaster {
    /// Recover from the data directory and start the automaton
    pub async fn start(config: MasterConfig) -> anyhow::Result<Self> {
        Self::start_with_transport(config, Arc::new(LoggingTransport)).await
    }

    pub async fn start_with_transport(
        config: MasterConfig,
        transport: Arc<dyn MessageTransport>,
    ) -> anyhow::Result<Self> {
        let storage = Arc::new(FileStorage::new(&config.data_dir));
        storage.ensure_dir().await?;

        let (mut automaton, handle) = Automaton::new(&config, Some(storage), transport);
        automaton.recover().await?;
        info!(
            cluster = %config.cluster_name,
            cell_tag = config.cell_tag,
            version = automaton.version(),
            "Tablet master initialized"
        );

        Ok(Self {
            config,
            automaton: handle,
            task: automaton.spawn(),
        })
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn automaton(&self) -> &AutomatonHandle {
        &self.automaton
    }

    pub fn router(&self) -> axum::Router {
        api::HttpApi::new(self.automaton.clone()).router()
    }

    /// Snapshot and wait for the automaton to drain
    ///
    /// Other handles (HTTP server state) must be dropped first or this
    /// waits for them.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.automaton.stop_leading().await?;
        let version = self.automaton.build_snapshot().await?;
        info!(version, "Final snapshot saved");
        drop(self.automaton);
        self.task.await?;
        Ok(())
    }
}
