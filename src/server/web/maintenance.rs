//! Worker pool control surface.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::server::workers::WorkerPool;

use super::paths::{
    PathMaintenanceAddWorkers, PathMaintenanceInfoWorkers, PathMaintenanceReloadWorkers,
    PathMaintenanceTerminateWorkers,
};

#[derive(Debug, Deserialize)]
pub struct AddWorkersRequest {
    pub count: usize,
}

fn no_pool() -> Response {
    (
        StatusCode::OK,
        Json(json!({ "message": "no worker pool on this node" })),
    )
        .into_response()
}

pub async fn post_maintenance_add_workers(
    _path: PathMaintenanceAddWorkers,
    State(pool): State<Option<Arc<WorkerPool>>>,
    Json(request): Json<AddWorkersRequest>,
) -> Response {
    let Some(pool) = pool else { return no_pool() };
    pool.add_workers(request.count);
    Json(json!({ "added": request.count })).into_response()
}

pub async fn reload_workers(
    _path: PathMaintenanceReloadWorkers,
    State(pool): State<Option<Arc<WorkerPool>>>,
) -> Response {
    let Some(pool) = pool else { return no_pool() };
    // The reload drains slot by slot; answer once it is underway and let
    // info_workers report progress. A concurrent reload is rejected inside
    // reload_all.
    tokio::spawn(async move {
        pool.reload_all().await;
    });
    Json(json!({ "message": "rolling reload started" })).into_response()
}

pub async fn terminate_workers(
    _path: PathMaintenanceTerminateWorkers,
    State(pool): State<Option<Arc<WorkerPool>>>,
) -> Response {
    let Some(pool) = pool else { return no_pool() };
    pool.terminate_all().await;
    Json(json!({ "message": "workers terminated" })).into_response()
}

pub async fn get_maintenance_info_workers(
    _path: PathMaintenanceInfoWorkers,
    State(pool): State<Option<Arc<WorkerPool>>>,
) -> Response {
    let Some(pool) = pool else {
        return Json(Vec::<crate::server::workers::SlotInfo>::new()).into_response();
    };
    Json(pool.info()).into_response()
}
