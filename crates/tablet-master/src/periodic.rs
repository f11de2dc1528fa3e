//! Leader-only periodic executors
//!
//! Started when the automaton becomes an active leader and aborted when it
//! stops leading. Every tick goes through the automaton queue like any
//! other request.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::automaton::{AutomatonHandle, WeakAutomatonHandle};
use crate::config::TabletManagerConfig;
use crate::mutation::Mutation;
use crate::storage::FileStorage;

pub struct PeriodicExecutors {
    handles: Vec<JoinHandle<()>>,
}

impl PeriodicExecutors {
    pub fn start(
        automaton: WeakAutomatonHandle,
        config: &TabletManagerConfig,
        storage: Option<Arc<FileStorage>>,
    ) -> Self {
        let mut handles = Vec::new();

        handles.push(spawn_periodic(
            "cell_statistics_gossip",
            config.cell_statistics_gossip_period(),
            automaton.clone(),
            |handle| async move {
                handle.mutate(Mutation::GossipCellStatistics).await?;
                Ok(())
            },
        ));

        let batch_size = config.table_statistics_gossip_batch_size;
        handles.push(spawn_periodic(
            "table_statistics_gossip",
            config.table_statistics_gossip_period(),
            automaton.clone(),
            move |handle| async move {
                let queued = handle
                    .read(|manager| manager.table_statistics_queue().len())
                    .await?;
                let count = queued.min(batch_size);
                if count > 0 {
                    handle
                        .mutate(Mutation::SendTableStatisticsUpdates { count })
                        .await?;
                }
                Ok(())
            },
        ));

        handles.push(spawn_periodic(
            "orphaned_action_kick",
            config.orphaned_action_kick_period(),
            automaton.clone(),
            |handle| async move {
                let action_ids = handle.read(|manager| manager.orphaned_action_ids()).await?;
                if !action_ids.is_empty() {
                    debug!(count = action_ids.len(), "Kicking orphaned tablet actions");
                    handle
                        .mutate(Mutation::KickOrphanedTabletActions { action_ids })
                        .await?;
                }
                Ok(())
            },
        ));

        let max_snapshots = config.max_snapshot_count_to_keep;
        let max_changelogs = config.max_changelog_count_to_keep;
        handles.push(spawn_periodic(
            "cleanup",
            config.cleanup_period(),
            automaton,
            move |handle| {
                let storage = storage.clone();
                async move {
                    handle.mutate(Mutation::RemoveExpiredTabletActions).await?;
                    if let Some(storage) = storage {
                        let cell_ids = handle
                            .read(|manager| manager.cells().map(|cell| cell.id).collect::<Vec<_>>())
                            .await?;
                        let report = storage
                            .cleanup_cell_storage(&cell_ids, max_snapshots, max_changelogs)
                            .await?;
                        if !report.snapshots_removed.is_empty() || !report.changelogs_removed.is_empty() {
                            info!(
                                snapshots = report.snapshots_removed.len(),
                                changelogs = report.changelogs_removed.len(),
                                "Tablet cell storage cleaned up"
                            );
                        }
                    }
                    Ok(())
                }
            },
        ));

        Self { handles }
    }

    pub fn stop(self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Run `tick` every `period` until the automaton goes away
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    automaton: WeakAutomatonHandle,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(AutomatonHandle) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let handle = match automaton.upgrade() {
                Some(handle) => handle,
                None => break,
            };
            if let Err(e) = tick(handle).await {
                warn!(executor = name, error = %e, "Periodic task failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::automaton::{Automaton, RecordingTransport};
    use crate::config::MasterConfig;
    use crate::hive::MasterDestination;
    use crate::manager::CreateTableOptions;
    use crate::mutation::{Mutation, MutationResponse};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_secondary() -> MasterConfig {
        let mut config = MasterConfig {
            cell_tag: 2,
            primary_cell_tag: 1,
            ..Default::default()
        };
        config.tablet_manager.cell_statistics_gossip_period_ms = 10;
        config.tablet_manager.table_statistics_gossip_period_ms = 10;
        config.tablet_manager.cleanup_period_ms = 10;
        config.tablet_manager.orphaned_action_kick_period_ms = 10;
        config
    }

    #[tokio::test]
    async fn test_executors_run_only_while_leading() {
        let transport = Arc::new(RecordingTransport::default());
        let (automaton, handle) = Automaton::new(&fast_secondary(), None, transport.clone());
        let task = automaton.spawn();

        let mut options = CreateTableOptions::sorted("//tmp/foreign");
        options.native_cell_tag = Some(1);
        let table_id = match handle.mutate(Mutation::CreateTable(options)).await.unwrap() {
            MutationResponse::Table(table_id) => table_id,
            other => panic!("unexpected response {:?}", other),
        };
        handle
            .mutate(Mutation::SetTableStatistics {
                table_id,
                modification_time: None,
                access_time: None,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.take_master_messages().is_empty());

        handle.leader_active().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let queued = handle
            .read(|manager| manager.table_statistics_queue().len())
            .await
            .unwrap();
        assert_eq!(queued, 0);
        let messages = transport.take_master_messages();
        assert!(messages
            .iter()
            .any(|m| matches!(m.mutation, Mutation::UpdateTableStatistics { .. })));
        assert!(messages
            .iter()
            .all(|m| m.destination == MasterDestination::Cell(1)));

        handle.stop_leading().await.unwrap();
        // Let in-flight ticks settle before checking for silence.
        tokio::time::sleep(Duration::from_millis(30)).await;
        transport.take_master_messages();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.take_master_messages().is_empty());

        drop(handle);
        task.await.unwrap();
    }
}
