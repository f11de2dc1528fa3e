//! HTTP management API
//!
//! RESTful endpoints over the automaton. Writes become mutations, reads run
//! as closures on the automaton task.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::automaton::AutomatonHandle;
use crate::error::{ErrorCode, Result, TabletError};
use crate::manager::{CreateTableOptions, CreateTabletActionRequest, HeartbeatRequest};
use crate::metadata::{
    ActionId, Atomicity, BundleId, CellId, CellTag, Key, PeerId, ReplicaId, ReplicaMode,
    TableId, TableMountConfig, TableNode, TableReplica, Tablet, TabletAction, TabletCell,
    TabletCellBundle, TabletCellOptions,
};
use crate::mutation::{Mutation, MutationResponse};

/// HTTP API service
pub struct HttpApi {
    automaton: AutomatonHandle,
}

impl HttpApi {
    pub fn new(automaton: AutomatonHandle) -> Self {
        Self { automaton }
    }

    pub fn router(self) -> Router {
        Router::new()
            // Cluster
            .route("/api/v1/cluster", get(get_cluster))
            .route("/api/v1/snapshot", post(build_snapshot))
            .route("/api/v1/heartbeat", post(node_heartbeat))

            // Bundles
            .route("/api/v1/bundles", get(list_bundles).post(create_bundle))
            .route("/api/v1/bundles/:bundle_id", get(get_bundle).delete(destroy_bundle))
            .route("/api/v1/bundles/:bundle_id/options", post(set_bundle_options))

            // Cells
            .route("/api/v1/cells", get(list_cells).post(create_cell))
            .route("/api/v1/cells/:cell_id", get(get_cell).delete(destroy_cell))
            .route("/api/v1/cells/:cell_id/peers", post(assign_peers))
            .route("/api/v1/cells/:cell_id/decommission", post(decommission_cell))

            // Tables
            .route("/api/v1/tables", get(list_tables).post(create_table))
            .route("/api/v1/tables/:table_id", get(get_table).delete(destroy_table))
            .route("/api/v1/tables/:table_id/mount", post(mount_table))
            .route("/api/v1/tables/:table_id/unmount", post(unmount_table))
            .route("/api/v1/tables/:table_id/remount", post(remount_table))
            .route("/api/v1/tables/:table_id/freeze", post(freeze_table))
            .route("/api/v1/tables/:table_id/unfreeze", post(unfreeze_table))
            .route("/api/v1/tables/:table_id/reshard", post(reshard_table))

            // Replicas
            .route("/api/v1/replicas", get(list_replicas).post(create_replica))
            .route(
                "/api/v1/replicas/:replica_id",
                get(get_replica).patch(alter_replica).delete(destroy_replica),
            )

            // Tablet actions
            .route("/api/v1/actions", get(list_actions).post(create_action))
            .route("/api/v1/actions/:action_id", get(get_action).delete(destroy_action))

            .with_state(self.automaton)
    }
}

// ==================== Response types ====================

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<ErrorCode>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        })
    }

    fn err(error: TabletError) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(error.message),
            code: Some(error.code),
        })
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NoSuchEntity => StatusCode::NOT_FOUND,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn reply<T: Serialize>(result: Result<T>, success: StatusCode) -> (StatusCode, Json<ApiResponse<T>>) {
    match result {
        Ok(data) => (success, ApiResponse::ok(data)),
        Err(e) => (status_for(e.code), ApiResponse::err(e)),
    }
}

async fn mutate(automaton: &AutomatonHandle, mutation: Mutation) -> impl IntoResponse {
    let created = matches!(
        mutation,
        Mutation::CreateBundle { .. }
            | Mutation::CreateCell { .. }
            | Mutation::CreateTable(_)
            | Mutation::CreateTableReplica { .. }
            | Mutation::CreateTabletAction(_)
    );
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    reply(automaton.mutate(mutation).await, status)
}

/// Look up a single entity on the automaton task
async fn lookup<T, F>(automaton: &AutomatonHandle, kind: &'static str, id: u64, f: F) -> impl IntoResponse
where
    T: Serialize + Send + 'static,
    F: FnOnce(&crate::manager::TabletManager) -> Option<T> + Send + 'static,
{
    let result = automaton
        .read(f)
        .await
        .and_then(|found| found.ok_or_else(|| TabletError::no_such(kind, id)));
    reply(result, StatusCode::OK)
}

// ==================== Request types ====================

#[derive(Deserialize, Default)]
struct TabletRange {
    #[serde(default)]
    first_tablet_index: Option<usize>,
    #[serde(default)]
    last_tablet_index: Option<usize>,
}

#[derive(Deserialize)]
struct CreateBundleRequest {
    name: String,
    #[serde(default)]
    options: TabletCellOptions,
}

#[derive(Deserialize)]
struct CreateCellRequest {
    /// Defaults to the builtin bundle
    bundle_id: Option<BundleId>,
}

#[derive(Deserialize)]
struct AssignPeersRequest {
    peers: Vec<(PeerId, String)>,
}

#[derive(Deserialize)]
struct MountRequest {
    #[serde(flatten)]
    range: TabletRange,
    #[serde(default)]
    hint_cell_id: Option<CellId>,
    #[serde(default)]
    target_cell_ids: Vec<CellId>,
    #[serde(default)]
    freeze: bool,
}

#[derive(Deserialize)]
struct UnmountRequest {
    #[serde(flatten)]
    range: TabletRange,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct RemountRequest {
    #[serde(flatten)]
    range: TabletRange,
    #[serde(default)]
    mount_config: Option<TableMountConfig>,
}

#[derive(Deserialize)]
struct ReshardRequest {
    #[serde(flatten)]
    range: TabletRange,
    #[serde(default)]
    tablet_count: Option<usize>,
    #[serde(default)]
    pivot_keys: Vec<Key>,
}

#[derive(Deserialize)]
struct CreateReplicaRequest {
    table_id: TableId,
    cluster_name: String,
    replica_path: String,
    #[serde(default)]
    mode: Option<ReplicaMode>,
    #[serde(default)]
    atomicity: Option<Atomicity>,
    #[serde(default)]
    preserve_timestamps: Option<bool>,
    #[serde(default)]
    start_replication_timestamp: u64,
}

#[derive(Deserialize)]
struct AlterReplicaRequest {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    mode: Option<ReplicaMode>,
    #[serde(default)]
    atomicity: Option<Atomicity>,
    #[serde(default)]
    preserve_timestamps: Option<bool>,
}

// ==================== Handlers ====================

// Cluster
#[derive(Serialize)]
struct ClusterOverview {
    cell_tag: CellTag,
    primary: bool,
    bundle_count: usize,
    cell_count: usize,
    table_count: usize,
    tablet_count: usize,
    action_count: usize,
    queued_table_statistics: usize,
}

async fn get_cluster(State(automaton): State<AutomatonHandle>) -> impl IntoResponse {
    let overview = automaton
        .read(|manager| ClusterOverview {
            cell_tag: manager.cell_tag(),
            primary: manager.is_primary(),
            bundle_count: manager.bundles().count(),
            cell_count: manager.cells().count(),
            table_count: manager.tables().count(),
            tablet_count: manager.tablets().count(),
            action_count: manager.actions().count(),
            queued_table_statistics: manager.table_statistics_queue().len(),
        })
        .await;
    reply(overview, StatusCode::OK)
}

#[derive(Serialize)]
struct SnapshotResult {
    version: u64,
}

async fn build_snapshot(State(automaton): State<AutomatonHandle>) -> impl IntoResponse {
    let result = automaton.build_snapshot().await;
    if let Ok(version) = &result {
        info!(version, "Snapshot built via HTTP API");
    }
    reply(result.map(|version| SnapshotResult { version }), StatusCode::OK)
}

async fn node_heartbeat(
    State(automaton): State<AutomatonHandle>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    mutate(&automaton, Mutation::IncrementalHeartbeat(req)).await
}

// Bundles
async fn list_bundles(State(automaton): State<AutomatonHandle>) -> impl IntoResponse {
    let bundles = automaton
        .read(|manager| manager.bundles().cloned().collect::<Vec<TabletCellBundle>>())
        .await;
    reply(bundles, StatusCode::OK)
}

async fn get_bundle(
    State(automaton): State<AutomatonHandle>,
    Path(bundle_id): Path<u64>,
) -> impl IntoResponse {
    lookup(&automaton, "bundle", bundle_id, move |manager| {
        manager.find_bundle(BundleId(bundle_id)).cloned()
    })
    .await
}

async fn create_bundle(
    State(automaton): State<AutomatonHandle>,
    Json(req): Json<CreateBundleRequest>,
) -> impl IntoResponse {
    info!(name = %req.name, "Creating tablet cell bundle via HTTP API");
    mutate(
        &automaton,
        Mutation::CreateBundle {
            name: req.name,
            options: req.options,
        },
    )
    .await
}

async fn destroy_bundle(
    State(automaton): State<AutomatonHandle>,
    Path(bundle_id): Path<u64>,
) -> impl IntoResponse {
    mutate(&automaton, Mutation::DestroyBundle { bundle_id: BundleId(bundle_id) }).await
}

async fn set_bundle_options(
    State(automaton): State<AutomatonHandle>,
    Path(bundle_id): Path<u64>,
    Json(options): Json<TabletCellOptions>,
) -> impl IntoResponse {
    mutate(
        &automaton,
        Mutation::SetBundleOptions {
            bundle_id: BundleId(bundle_id),
            options,
        },
    )
    .await
}

// Cells
async fn list_cells(State(automaton): State<AutomatonHandle>) -> impl IntoResponse {
    let cells = automaton
        .read(|manager| manager.cells().cloned().collect::<Vec<TabletCell>>())
        .await;
    reply(cells, StatusCode::OK)
}

async fn get_cell(
    State(automaton): State<AutomatonHandle>,
    Path(cell_id): Path<u64>,
) -> impl IntoResponse {
    lookup(&automaton, "tablet cell", cell_id, move |manager| {
        manager.find_cell(CellId(cell_id)).cloned()
    })
    .await
}

async fn create_cell(
    State(automaton): State<AutomatonHandle>,
    Json(req): Json<CreateCellRequest>,
) -> impl IntoResponse {
    let bundle_id = match req.bundle_id {
        Some(bundle_id) => Ok(bundle_id),
        None => automaton
            .read(|manager| manager.default_bundle_id())
            .await
            .and_then(|id| id.ok_or_else(|| TabletError::internal("Default bundle is missing"))),
    };
    match bundle_id {
        Ok(bundle_id) => mutate(&automaton, Mutation::CreateCell { bundle_id })
            .await
            .into_response(),
        Err(e) => reply::<MutationResponse>(Err(e), StatusCode::CREATED).into_response(),
    }
}

async fn destroy_cell(
    State(automaton): State<AutomatonHandle>,
    Path(cell_id): Path<u64>,
) -> impl IntoResponse {
    mutate(&automaton, Mutation::DestroyCell { cell_id: CellId(cell_id) }).await
}

async fn assign_peers(
    State(automaton): State<AutomatonHandle>,
    Path(cell_id): Path<u64>,
    Json(req): Json<AssignPeersRequest>,
) -> impl IntoResponse {
    mutate(
        &automaton,
        Mutation::AssignPeers {
            cell_id: CellId(cell_id),
            peers: req.peers,
        },
    )
    .await
}

async fn decommission_cell(
    State(automaton): State<AutomatonHandle>,
    Path(cell_id): Path<u64>,
) -> impl IntoResponse {
    mutate(&automaton, Mutation::DecommissionCell { cell_id: CellId(cell_id) }).await
}

// Tables
#[derive(Serialize)]
struct TableView {
    table: TableNode,
    tablets: Vec<Tablet>,
}

async fn list_tables(State(automaton): State<AutomatonHandle>) -> impl IntoResponse {
    let tables = automaton
        .read(|manager| manager.tables().cloned().collect::<Vec<TableNode>>())
        .await;
    reply(tables, StatusCode::OK)
}

async fn get_table(
    State(automaton): State<AutomatonHandle>,
    Path(table_id): Path<u64>,
) -> impl IntoResponse {
    lookup(&automaton, "table", table_id, move |manager| {
        let table_id = TableId(table_id);
        manager.find_table(table_id).map(|table| TableView {
            table: table.clone(),
            tablets: manager.table_tablets(table_id).into_iter().cloned().collect(),
        })
    })
    .await
}

async fn create_table(
    State(automaton): State<AutomatonHandle>,
    Json(options): Json<CreateTableOptions>,
) -> impl IntoResponse {
    info!(path = %options.path, "Creating table via HTTP API");
    mutate(&automaton, Mutation::CreateTable(options)).await
}

async fn destroy_table(
    State(automaton): State<AutomatonHandle>,
    Path(table_id): Path<u64>,
) -> impl IntoResponse {
    mutate(&automaton, Mutation::DestroyTable { table_id: TableId(table_id) }).await
}

async fn mount_table(
    State(automaton): State<AutomatonHandle>,
    Path(table_id): Path<u64>,
    Json(req): Json<MountRequest>,
) -> impl IntoResponse {
    mutate(
        &automaton,
        Mutation::MountTable {
            table_id: TableId(table_id),
            first_tablet_index: req.range.first_tablet_index,
            last_tablet_index: req.range.last_tablet_index,
            hint_cell_id: req.hint_cell_id,
            target_cell_ids: req.target_cell_ids,
            freeze: req.freeze,
        },
    )
    .await
}

async fn unmount_table(
    State(automaton): State<AutomatonHandle>,
    Path(table_id): Path<u64>,
    Json(req): Json<UnmountRequest>,
) -> impl IntoResponse {
    mutate(
        &automaton,
        Mutation::UnmountTable {
            table_id: TableId(table_id),
            first_tablet_index: req.range.first_tablet_index,
            last_tablet_index: req.range.last_tablet_index,
            force: req.force,
        },
    )
    .await
}

async fn remount_table(
    State(automaton): State<AutomatonHandle>,
    Path(table_id): Path<u64>,
    Json(req): Json<RemountRequest>,
) -> impl IntoResponse {
    mutate(
        &automaton,
        Mutation::RemountTable {
            table_id: TableId(table_id),
            first_tablet_index: req.range.first_tablet_index,
            last_tablet_index: req.range.last_tablet_index,
            mount_config: req.mount_config,
        },
    )
    .await
}

async fn freeze_table(
    State(automaton): State<AutomatonHandle>,
    Path(table_id): Path<u64>,
    Json(range): Json<TabletRange>,
) -> impl IntoResponse {
    mutate(
        &automaton,
        Mutation::FreezeTable {
            table_id: TableId(table_id),
            first_tablet_index: range.first_tablet_index,
            last_tablet_index: range.last_tablet_index,
        },
    )
    .await
}

async fn unfreeze_table(
    State(automaton): State<AutomatonHandle>,
    Path(table_id): Path<u64>,
    Json(range): Json<TabletRange>,
) -> impl IntoResponse {
    mutate(
        &automaton,
        Mutation::UnfreezeTable {
            table_id: TableId(table_id),
            first_tablet_index: range.first_tablet_index,
            last_tablet_index: range.last_tablet_index,
        },
    )
    .await
}

async fn reshard_table(
    State(automaton): State<AutomatonHandle>,
    Path(table_id): Path<u64>,
    Json(req): Json<ReshardRequest>,
) -> impl IntoResponse {
    info!(
        table_id,
        tablet_count = ?req.tablet_count,
        pivot_count = req.pivot_keys.len(),
        "Resharding table via HTTP API"
    );
    mutate(
        &automaton,
        Mutation::ReshardTable {
            table_id: TableId(table_id),
            first_tablet_index: req.range.first_tablet_index,
            last_tablet_index: req.range.last_tablet_index,
            tablet_count: req.tablet_count,
            pivot_keys: req.pivot_keys,
        },
    )
    .await
}

// Replicas
async fn list_replicas(State(automaton): State<AutomatonHandle>) -> impl IntoResponse {
    let replicas = automaton
        .read(|manager| manager.replicas().cloned().collect::<Vec<TableReplica>>())
        .await;
    reply(replicas, StatusCode::OK)
}

async fn get_replica(
    State(automaton): State<AutomatonHandle>,
    Path(replica_id): Path<u64>,
) -> impl IntoResponse {
    lookup(&automaton, "table replica", replica_id, move |manager| {
        manager.find_replica(ReplicaId(replica_id)).cloned()
    })
    .await
}

async fn create_replica(
    State(automaton): State<AutomatonHandle>,
    Json(req): Json<CreateReplicaRequest>,
) -> impl IntoResponse {
    mutate(
        &automaton,
        Mutation::CreateTableReplica {
            table_id: req.table_id,
            cluster_name: req.cluster_name,
            replica_path: req.replica_path,
            mode: req.mode,
            atomicity: req.atomicity,
            preserve_timestamps: req.preserve_timestamps,
            start_replication_timestamp: req.start_replication_timestamp,
        },
    )
    .await
}

async fn alter_replica(
    State(automaton): State<AutomatonHandle>,
    Path(replica_id): Path<u64>,
    Json(req): Json<AlterReplicaRequest>,
) -> impl IntoResponse {
    mutate(
        &automaton,
        Mutation::AlterTableReplica {
            replica_id: ReplicaId(replica_id),
            enabled: req.enabled,
            mode: req.mode,
            atomicity: req.atomicity,
            preserve_timestamps: req.preserve_timestamps,
        },
    )
    .await
}

async fn destroy_replica(
    State(automaton): State<AutomatonHandle>,
    Path(replica_id): Path<u64>,
) -> impl IntoResponse {
    mutate(
        &automaton,
        Mutation::DestroyTableReplica {
            replica_id: ReplicaId(replica_id),
        },
    )
    .await
}

// Tablet actions
async fn list_actions(State(automaton): State<AutomatonHandle>) -> impl IntoResponse {
    let actions = automaton
        .read(|manager| manager.actions().cloned().collect::<Vec<TabletAction>>())
        .await;
    reply(actions, StatusCode::OK)
}

async fn get_action(
    State(automaton): State<AutomatonHandle>,
    Path(action_id): Path<u64>,
) -> impl IntoResponse {
    lookup(&automaton, "tablet action", action_id, move |manager| {
        manager.find_action(ActionId(action_id)).cloned()
    })
    .await
}

async fn create_action(
    State(automaton): State<AutomatonHandle>,
    Json(req): Json<CreateTabletActionRequest>,
) -> impl IntoResponse {
    info!(kind = ?req.kind, tablets = req.tablet_ids.len(), "Creating tablet action via HTTP API");
    mutate(&automaton, Mutation::CreateTabletAction(req)).await
}

async fn destroy_action(
    State(automaton): State<AutomatonHandle>,
    Path(action_id): Path<u64>,
) -> impl IntoResponse {
    mutate(
        &automaton,
        Mutation::DestroyTabletActions {
            action_ids: vec![ActionId(action_id)],
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(ErrorCode::NoSuchEntity), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::Internal), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(ErrorCode::InvalidTabletState), StatusCode::BAD_REQUEST);

        let (status, Json(body)) = reply::<u64>(
            Err(TabletError::invalid_state("Tablet is mounted")),
            StatusCode::OK,
        );
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
        assert_eq!(body.code, Some(ErrorCode::InvalidTabletState));

        let (status, Json(body)) = reply(Ok(7u64), StatusCode::CREATED);
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body.data, Some(7));
    }

    #[test]
    fn test_mount_request_accepts_empty_body() {
        let req: MountRequest = serde_json::from_str("{}").unwrap();
        assert!(req.range.first_tablet_index.is_none());
        assert!(req.target_cell_ids.is_empty());
        assert!(!req.freeze);

        let req: ReshardRequest =
            serde_json::from_str(r#"{"first_tablet_index": 0, "last_tablet_index": 1, "tablet_count": 3}"#)
                .unwrap();
        assert_eq!(req.range.last_tablet_index, Some(1));
        assert_eq!(req.tablet_count, Some(3));
    }
}
