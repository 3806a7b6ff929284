//! Queue listing and cancellation.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    queue::{JobQueue, JobStatus},
    somehow,
};

use super::paths::{PathApiJobById, PathApiJobs};

#[derive(Debug, Deserialize)]
pub struct JobsFilter {
    pub status: Option<i32>,
}

pub async fn get_api_jobs(
    _path: PathApiJobs,
    State(queue): State<Option<JobQueue>>,
    Query(filter): Query<JobsFilter>,
) -> somehow::Result<Response> {
    let Some(queue) = queue else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let status = match filter.status {
        Some(value) => match JobStatus::try_from(value) {
            Ok(status) => Some(status),
            Err(_) => {
                return Ok((StatusCode::BAD_REQUEST, "unknown status filter").into_response())
            }
        },
        None => None,
    };
    let jobs = queue.list(status).await.map_err(somehow::Error)?;
    Ok(Json(jobs).into_response())
}

pub async fn delete_api_job_by_id(
    path: PathApiJobById,
    State(queue): State<Option<JobQueue>>,
) -> somehow::Result<Response> {
    let Some(queue) = queue else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let Ok(job_id) = Uuid::parse_str(&path.job_id) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    if queue.cancel(job_id).await.map_err(somehow::Error)? {
        Ok(Json(json!({ "job_id": job_id, "status": "cancelled" })).into_response())
    } else {
        Ok(StatusCode::NOT_FOUND.into_response())
    }
}
