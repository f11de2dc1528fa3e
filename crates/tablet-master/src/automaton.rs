//! Automaton task
//!
//! The tablet manager lives on a single tokio task. Everything that touches
//! it, including reads, is queued through [`AutomatonHandle`] and runs in
//! arrival order. After each mutation the outboxes are drained and handed
//! to the [`MessageTransport`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::config::MasterConfig;
use crate::error::{Result, TabletError};
use crate::hive::{MasterMessage, PostedMessage};
use crate::manager::TabletManager;
use crate::mutation::{Mutation, MutationContext, MutationResponse};
use crate::periodic::PeriodicExecutors;
use crate::storage::{ChangelogRecord, FileStorage};

const QUEUE_SIZE: usize = 1024;

type ReadFn = Box<dyn FnOnce(&TabletManager) + Send>;

/// Work item for the automaton task
pub enum AutomatonTask {
    Mutate {
        mutation: Mutation,
        reply: oneshot::Sender<Result<MutationResponse>>,
    },
    Read(ReadFn),
    BuildSnapshot {
        reply: oneshot::Sender<Result<u64>>,
    },
    LeaderActive,
    StopLeading,
}

/// Delivery of messages produced by mutations
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send_to_cells(&self, messages: Vec<PostedMessage>);
    async fn send_to_masters(&self, messages: Vec<MasterMessage>);
}

/// Transport that only logs; used when no cells are wired up
pub struct LoggingTransport;

#[async_trait]
impl MessageTransport for LoggingTransport {
    async fn send_to_cells(&self, messages: Vec<PostedMessage>) {
        for posted in messages {
            debug!(cell_id = %posted.cell_id, seq = posted.seq, message = posted.message.name(), "Cell message");
        }
    }

    async fn send_to_masters(&self, messages: Vec<MasterMessage>) {
        for message in messages {
            debug!(destination = ?message.destination, mutation = message.mutation.name(), "Master message");
        }
    }
}

/// Transport that keeps everything it is given
#[derive(Default)]
pub struct RecordingTransport {
    cells: Mutex<Vec<PostedMessage>>,
    masters: Mutex<Vec<MasterMessage>>,
}

impl RecordingTransport {
    pub fn take_cell_messages(&self) -> Vec<PostedMessage> {
        std::mem::take(&mut *self.cells.lock())
    }

    pub fn take_master_messages(&self) -> Vec<MasterMessage> {
        std::mem::take(&mut *self.masters.lock())
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn send_to_cells(&self, messages: Vec<PostedMessage>) {
        self.cells.lock().extend(messages);
    }

    async fn send_to_masters(&self, messages: Vec<MasterMessage>) {
        self.masters.lock().extend(messages);
    }
}

fn stopped() -> TabletError {
    TabletError::internal("Automaton is stopped")
}

/// Cloneable entry point to the automaton
#[derive(Clone)]
pub struct AutomatonHandle {
    tx: mpsc::Sender<AutomatonTask>,
}

impl AutomatonHandle {
    async fn send(&self, task: AutomatonTask) -> Result<()> {
        self.tx.send(task).await.map_err(|_| stopped())
    }

    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(AutomatonTask::Mutate { mutation, reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Run `f` against the manager between mutations
    pub async fn read<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TabletManager) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(AutomatonTask::Read(Box::new(move |manager| {
            let _ = tx.send(f(manager));
        })))
        .await?;
        rx.await.map_err(|_| stopped())
    }

    /// Persist a snapshot; returns the mutation version it covers
    pub async fn build_snapshot(&self) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(AutomatonTask::BuildSnapshot { reply }).await?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn leader_active(&self) -> Result<()> {
        self.send(AutomatonTask::LeaderActive).await
    }

    pub async fn stop_leading(&self) -> Result<()> {
        self.send(AutomatonTask::StopLeading).await
    }

    pub fn downgrade(&self) -> WeakAutomatonHandle {
        WeakAutomatonHandle {
            tx: self.tx.downgrade(),
        }
    }
}

/// Handle that does not keep the automaton alive
#[derive(Clone)]
pub struct WeakAutomatonHandle {
    tx: mpsc::WeakSender<AutomatonTask>,
}

impl WeakAutomatonHandle {
    pub fn upgrade(&self) -> Option<AutomatonHandle> {
        self.tx.upgrade().map(|tx| AutomatonHandle { tx })
    }
}

pub struct Automaton {
    config: MasterConfig,
    manager: TabletManager,
    storage: Option<Arc<FileStorage>>,
    transport: Arc<dyn MessageTransport>,
    rx: mpsc::Receiver<AutomatonTask>,
    weak: WeakAutomatonHandle,
    version: u64,
    last_timestamp: DateTime<Utc>,
    periodic: Option<PeriodicExecutors>,
}

impl Automaton {
    pub fn new(
        config: &MasterConfig,
        storage: Option<Arc<FileStorage>>,
        transport: Arc<dyn MessageTransport>,
    ) -> (Self, AutomatonHandle) {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        let handle = AutomatonHandle { tx };
        let automaton = Self {
            config: config.clone(),
            manager: TabletManager::new(config),
            storage,
            transport,
            rx,
            weak: handle.downgrade(),
            version: 0,
            last_timestamp: DateTime::<Utc>::MIN_UTC,
            periodic: None,
        };
        (automaton, handle)
    }

    pub fn manager(&self) -> &TabletManager {
        &self.manager
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Load the last snapshot and replay the changelog written after it
    pub async fn recover(&mut self) -> anyhow::Result<()> {
        let storage = match &self.storage {
            Some(storage) => storage.clone(),
            None => return Ok(()),
        };

        if let Some(snapshot) = storage.load_snapshot().await? {
            self.manager.load_snapshot(snapshot)?;
            self.version = storage.snapshot_version().await?;
        }

        let records = storage.read_changelog().await?;
        let mut replayed = 0;
        self.manager.set_recovery(true);
        for record in records {
            if record.ctx.version <= self.version {
                continue;
            }
            if let Err(e) = self.manager.apply_mutation(record.ctx, record.mutation) {
                error!(alert = true, version = record.ctx.version, error = %e, "Logged mutation failed on replay");
            }
            self.version = record.ctx.version;
            self.last_timestamp = record.ctx.timestamp;
            replayed += 1;
        }
        self.manager.set_recovery(false);
        self.manager.hive_mut().discard_outboxes();

        info!(version = self.version, replayed, "Automaton recovered");
        Ok(())
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process tasks until every strong handle is dropped
    pub async fn run(mut self) {
        while let Some(task) = self.rx.recv().await {
            match task {
                AutomatonTask::Mutate { mutation, reply } => {
                    let result = self.apply(mutation).await;
                    let _ = reply.send(result);
                }
                AutomatonTask::Read(f) => f(&self.manager),
                AutomatonTask::BuildSnapshot { reply } => {
                    let _ = reply.send(self.build_snapshot().await);
                }
                AutomatonTask::LeaderActive => self.on_leader_active(),
                AutomatonTask::StopLeading => self.on_stop_leading(),
            }
        }
        self.on_stop_leading();
        info!(version = self.version, "Automaton stopped");
    }

    async fn apply(&mut self, mutation: Mutation) -> Result<MutationResponse> {
        self.version += 1;
        // Timestamps never go backwards across mutations.
        let timestamp = Utc::now().max(self.last_timestamp);
        self.last_timestamp = timestamp;
        let ctx = MutationContext::new(self.version, timestamp, rand::random());

        let record = self.storage.as_ref().map(|_| ChangelogRecord {
            ctx,
            mutation: mutation.clone(),
        });
        let name = mutation.name();
        let result = self.manager.apply_mutation(ctx, mutation);
        match &result {
            Ok(_) => {
                if let (Some(storage), Some(record)) = (&self.storage, record) {
                    if let Err(e) = storage.append(&record).await {
                        error!(alert = true, version = self.version, error = %e, "Failed to write changelog record");
                    }
                }
            }
            Err(e) => debug!(mutation = name, error = %e, "Mutation rejected"),
        }

        let cell_messages = self.manager.hive_mut().drain_outbox();
        if !cell_messages.is_empty() {
            self.transport.send_to_cells(cell_messages).await;
        }
        let master_messages = self.manager.hive_mut().drain_master_outbox();
        if !master_messages.is_empty() {
            self.transport.send_to_masters(master_messages).await;
        }
        result
    }

    async fn build_snapshot(&mut self) -> Result<u64> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| TabletError::internal("Snapshots need a data directory"))?;
        let snapshot = self.manager.save_snapshot();
        storage
            .save_snapshot(&snapshot, self.version)
            .await
            .map_err(|e| TabletError::internal(e.to_string()))?;
        Ok(self.version)
    }

    fn on_leader_active(&mut self) {
        if self.periodic.is_some() {
            return;
        }
        info!("Leader active, starting periodic executors");
        self.periodic = Some(PeriodicExecutors::start(
            self.weak.clone(),
            &self.config.tablet_manager,
            self.storage.clone(),
        ));
    }

    fn on_stop_leading(&mut self) {
        if let Some(periodic) = self.periodic.take() {
            info!("Stopped leading, stopping periodic executors");
            periodic.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::CreateTableOptions;
    use crate::metadata::{CellId, PeerId, PeerState, TabletState};
    use crate::manager::{HeartbeatRequest, SlotReport};

    async fn healthy_cell(handle: &AutomatonHandle) -> CellId {
        let bundle_id = handle
            .read(|manager| manager.default_bundle_id())
            .await
            .unwrap()
            .unwrap();
        let cell_id = match handle.mutate(Mutation::CreateCell { bundle_id }).await.unwrap() {
            MutationResponse::Cell(cell_id) => cell_id,
            other => panic!("unexpected response {:?}", other),
        };
        let peer: (PeerId, String) = (0, "n1".to_string());
        handle
            .mutate(Mutation::AssignPeers {
                cell_id,
                peers: vec![peer],
            })
            .await
            .unwrap();
        let config_version = handle
            .read(move |manager| manager.find_cell(cell_id).unwrap().config_version)
            .await
            .unwrap();
        handle
            .mutate(Mutation::IncrementalHeartbeat(HeartbeatRequest {
                address: "n1".to_string(),
                slots: vec![SlotReport {
                    cell_id: Some(cell_id),
                    peer_id: Some(0),
                    peer_state: PeerState::Leading,
                    config_version,
                }],
                tablets: vec![],
            }))
            .await
            .unwrap();
        cell_id
    }

    async fn create_table(handle: &AutomatonHandle, path: &str) -> crate::metadata::TableId {
        match handle
            .mutate(Mutation::CreateTable(CreateTableOptions::sorted(path)))
            .await
            .unwrap()
        {
            MutationResponse::Table(table_id) => table_id,
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mutations_flow_to_transport() {
        let transport = Arc::new(RecordingTransport::default());
        let (automaton, handle) = Automaton::new(&MasterConfig::default(), None, transport.clone());
        let task = automaton.spawn();

        healthy_cell(&handle).await;
        let table_id = create_table(&handle, "//tmp/t").await;
        transport.take_cell_messages();
        handle
            .mutate(Mutation::MountTable {
                table_id,
                first_tablet_index: None,
                last_tablet_index: None,
                hint_cell_id: None,
                target_cell_ids: vec![],
                freeze: false,
            })
            .await
            .unwrap();

        let messages = transport.take_cell_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message.name(), "mount_tablet");
        let state = handle
            .read(move |manager| manager.table_tablets(table_id)[0].state)
            .await
            .unwrap();
        assert_eq!(state, TabletState::Mounting);

        let err = handle
            .mutate(Mutation::DestroyTable { table_id })
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidTabletState);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_from_snapshot_and_changelog() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path()));
        let config = MasterConfig::default();

        let (automaton, handle) =
            Automaton::new(&config, Some(storage.clone()), Arc::new(LoggingTransport));
        let task = automaton.spawn();
        healthy_cell(&handle).await;
        create_table(&handle, "//tmp/a").await;
        let snapshot_version = handle.build_snapshot().await.unwrap();
        create_table(&handle, "//tmp/b").await;
        let tables = handle
            .read(|manager| manager.tables().map(|table| table.id).collect::<Vec<_>>())
            .await
            .unwrap();
        drop(handle);
        task.await.unwrap();

        let (mut automaton, _handle) =
            Automaton::new(&config, Some(storage), Arc::new(LoggingTransport));
        automaton.recover().await.unwrap();
        assert_eq!(automaton.version(), snapshot_version + 1);
        let recovered: Vec<_> = automaton.manager().tables().map(|table| table.id).collect();
        assert_eq!(recovered, tables);
        assert_eq!(automaton.manager().cells().count(), 1);
        assert!(!automaton.manager().is_recovery());
    }
}
