//! Datasource CRUD and file ingest endpoints.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::info;

use crate::{
    cache::TileCache,
    datasource::Descriptor,
    registry::{Registry, RegistryError},
    somehow,
};

use super::paths::{
    PathApiDatasourceById, PathApiDatasources, PathApiDatasourcesLoadFiles,
    PathApiDatasourcesReloadFiles,
};

fn registry_error_response(error: RegistryError) -> somehow::Result<Response> {
    match error {
        RegistryError::NotFound => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": StatusCode::NOT_FOUND.as_u16(),
                "message": "datasource not found",
            })),
        )
            .into_response()),
        RegistryError::Invalid(errors) => Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "detail": errors })),
        )
            .into_response()),
        RegistryError::Other(e) => Err(somehow::Error(e)),
    }
}

pub async fn get_api_datasources(
    _path: PathApiDatasources,
    State(registry): State<Arc<Registry>>,
) -> Json<Vec<Descriptor>> {
    Json(registry.list())
}

pub async fn get_api_datasource_by_id(
    path: PathApiDatasourceById,
    State(registry): State<Arc<Registry>>,
) -> Response {
    match registry.get(&path.id) {
        Some(descriptor) => Json(descriptor).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn post_api_datasources(
    _path: PathApiDatasources,
    State(registry): State<Arc<Registry>>,
    Json(descriptor): Json<Descriptor>,
) -> somehow::Result<Response> {
    match registry.create(descriptor).await {
        Ok(id) => {
            info!("Created datasource {id}");
            Ok(Json(json!({
                "datasource_id": id,
                "message": "DataSource successfully saved",
            }))
            .into_response())
        }
        Err(error) => registry_error_response(error),
    }
}

pub async fn put_api_datasources(
    _path: PathApiDatasources,
    State(registry): State<Arc<Registry>>,
    Json(descriptor): Json<Descriptor>,
) -> somehow::Result<Response> {
    let Some(id) = descriptor.id.clone() else {
        return registry_error_response(RegistryError::Invalid(vec![
            crate::datasource::ValidationError::new(&["id"], "required for updates", "missing"),
        ]));
    };
    match registry.update(&id, descriptor).await {
        Ok(()) => {
            info!("Updated datasource {id}");
            Ok(Json(json!({
                "datasource_id": id,
                "message": "DataSource successfully updated",
            }))
            .into_response())
        }
        Err(error) => registry_error_response(error),
    }
}

pub async fn delete_api_datasource_by_id(
    path: PathApiDatasourceById,
    State(registry): State<Arc<Registry>>,
    State(cache): State<Arc<TileCache>>,
) -> somehow::Result<Response> {
    match registry.delete(&path.id).await {
        Ok(()) => {
            // Outstanding cached tiles of the id now simply miss.
            cache.evict(&path.id).await;
            Ok(Json(json!({
                "status": StatusCode::OK.as_u16(),
                "message": format!("DataSource '{}' successfully deleted", path.id),
            }))
            .into_response())
        }
        Err(error) => registry_error_response(error),
    }
}

pub async fn post_api_datasources_load_files(
    _path: PathApiDatasourcesLoadFiles,
    State(registry): State<Arc<Registry>>,
) -> Response {
    let report = registry.load_files(None).await;
    Json(report).into_response()
}

pub async fn post_api_datasources_reload_files(
    _path: PathApiDatasourcesReloadFiles,
    State(registry): State<Arc<Registry>>,
    Json(ids): Json<Vec<String>>,
) -> Response {
    let report = registry.load_files(Some(&ids)).await;
    Json(report).into_response()
}
