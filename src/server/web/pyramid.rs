//! Pyramid-build scheduling.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::info;
use uuid::Uuid;

use crate::{
    queue::{JobDetail, JobQueue},
    registry::Registry,
    server::workers::WorkerPool,
    somehow,
};

use super::paths::PathApiPyramid;

#[derive(Debug, Deserialize)]
pub struct PyramidRequest {
    pub datasource_id: String,
    /// RFC 3339 start time; immediate when absent.
    pub scheduled_for: Option<String>,
}

/// Enqueue a pyramid build, or run it when this node has no queue.
///
/// Idempotent per datasource: while a pyramid job for the id is pending or
/// running, repeated posts answer with the existing job.
pub async fn post_api_pyramid(
    _path: PathApiPyramid,
    State(registry): State<Arc<Registry>>,
    State(queue): State<Option<JobQueue>>,
    State(pool): State<Option<Arc<WorkerPool>>>,
    Json(request): Json<PyramidRequest>,
) -> somehow::Result<Response> {
    let id = &request.datasource_id;
    if !registry.contains(id) {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": StatusCode::NOT_FOUND.as_u16(),
                "message": format!("DataSource '{id}' not found"),
            })),
        )
            .into_response());
    }

    let Some(queue) = queue else {
        // Worker node: execute directly through the local pool. Masters
        // forward here only for datasources this node owns.
        let Some(pool) = pool else {
            return Ok((
                StatusCode::SERVICE_UNAVAILABLE,
                "no worker pool on this node",
            )
                .into_response());
        };
        let pyramid_id = Uuid::new_v4();
        if let Err(e) = pool.pyramid(id).await {
            return Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("500 Internal Server Error\n\n{e}"),
            )
                .into_response());
        }
        return Ok(accepted(pyramid_id, false));
    };

    if let Some(existing) = queue.active_pyramid(id).await.map_err(somehow::Error)? {
        return Ok(accepted(existing, true));
    }

    let scheduled_for = match &request.scheduled_for {
        Some(text) => Some(OffsetDateTime::parse(text, &Rfc3339)?),
        None => None,
    };
    let detail = JobDetail::Pyramid {
        datasource_id: id.clone(),
    };
    let pyramid_id = queue.enqueue(detail, scheduled_for).await.map_err(somehow::Error)?;
    info!("Scheduled pyramid {pyramid_id} for datasource {id}");
    Ok(accepted(pyramid_id, false))
}

fn accepted(pyramid_id: Uuid, already_running: bool) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "pyramid_id": pyramid_id,
            "already_running": already_running,
        })),
    )
        .into_response()
}
