//! The tile hot path.

use std::{io::Write, time::Duration};

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use tracing::{debug, warn};

use crate::{
    cache::TileArtifact,
    datasource::Descriptor,
    generate::{GenerateError, GenerateOutcome, RemoteNode, TileGenerator},
    server::singleflight::{Flight, FlightResult},
    somehow,
    state::AppState,
    tile::{TileCoord, TileExt, TileRange},
};

use super::paths::PathApiTile;

fn split_y_ext(y_ext: &str) -> Option<(u32, TileExt)> {
    let (y, ext) = y_ext.split_once('.')?;
    Some((y.parse().ok()?, ext.parse().ok()?))
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("404 Not Found\n\n{message}")).into_response()
}

fn no_content() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            ),
            (header::CACHE_CONTROL, HeaderValue::from_static("max-age=0")),
        ],
    )
        .into_response()
}

fn error_status(error: &GenerateError) -> StatusCode {
    match error {
        GenerateError::Timeout | GenerateError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        GenerateError::Backend(_) | GenerateError::Transport(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn tile_response(bytes: Bytes, ext: TileExt, descriptor: &Descriptor) -> somehow::Result<Response> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, ext.content_type())
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");

    let body = if ext.is_vector() && descriptor.compress_tiles {
        builder = builder.header(header::CONTENT_ENCODING, "gzip");
        Bytes::from(gzip(&bytes)?)
    } else {
        bytes
    };

    Ok(builder.body(axum::body::boxed(axum::body::Full::from(body)))?)
}

fn flight_response(
    result: FlightResult,
    ext: TileExt,
    descriptor: &Descriptor,
) -> somehow::Result<Response> {
    Ok(match result {
        Ok(GenerateOutcome::Present(bytes)) => tile_response(bytes, ext, descriptor)?,
        Ok(GenerateOutcome::Empty) => no_content(),
        Err(error) => (error_status(&error), error.to_string()).into_response(),
    })
}

/// Resolve one tile miss-or-hit to its final outcome. Runs detached from the
/// requesting connection so attached waiters always get an answer, even when
/// the leading client disconnects.
async fn resolve(state: AppState, descriptor: Descriptor, coord: TileCoord) -> FlightResult {
    match state.cache.lookup(&coord).await {
        Ok(TileArtifact::Present(bytes)) => return Ok(GenerateOutcome::Present(bytes)),
        Ok(TileArtifact::Empty) => return Ok(GenerateOutcome::Empty),
        Ok(TileArtifact::Absent) => {}
        Err(e) => {
            warn!("Cache lookup for {coord} failed: {e:?}");
            return Err(GenerateError::Transport(format!("cache lookup failed: {e}")));
        }
    }

    if descriptor.use_cache_only {
        return Ok(GenerateOutcome::Empty);
    }

    // Only a master fans out; a worker node assumes every datasource it is
    // asked about lives on it.
    if let Some((host, port)) = descriptor.upstream() {
        if state.config.is_master() && !state.config.is_self_address(host, port) {
            debug!("Forwarding {coord} to {host}:{port}");
            let remote = RemoteNode::new(
                host,
                port,
                state.client.clone(),
                Duration::from_secs(state.config.timeout_worker_response),
            );
            return remote.generate(&coord).await;
        }
    }

    let Some(generator) = &state.generator else {
        // Cache-only node: a miss is terminal.
        return Ok(GenerateOutcome::Empty);
    };

    let Ok(_permit) = state.gate.try_acquire() else {
        return Err(GenerateError::Unavailable);
    };
    generator.generate(&coord).await
}

pub async fn get_api_tile(
    path: PathApiTile,
    State(state): State<AppState>,
) -> somehow::Result<Response> {
    let Some((y, ext)) = split_y_ext(&path.y_ext) else {
        return Ok(not_found("unknown tile extension"));
    };
    let Some(descriptor) = state.registry.get(&path.id) else {
        return Ok(not_found("unknown datasource"));
    };

    let coord = TileCoord {
        datasource_id: path.id,
        z: path.z,
        x: path.x,
        y,
        ext,
    };

    if !coord.on_grid() {
        return Ok(not_found("coordinate is outside the tile grid"));
    }
    let (minzoom, maxzoom) = descriptor.zoom_range();
    if coord.z < minzoom || coord.z > maxzoom {
        return Ok(not_found("zoom is outside the datasource's range"));
    }
    if !ext.matches_kind(descriptor.kind) {
        return Ok(not_found("extension does not match the datasource kind"));
    }
    if let Some(bounds) = &descriptor.bounds {
        if !TileRange::of(bounds, coord.z).contains(coord.x, coord.y) {
            return Ok(no_content());
        }
    }

    let result = match state.flights.join(coord.fingerprint()) {
        Flight::Follower(mut rx) => rx.recv().await,
        Flight::Leader(ticket) => {
            let mut rx = ticket.subscribe();
            let task_state = state.clone();
            let task_descriptor = descriptor.clone();
            tokio::spawn(async move {
                let result = resolve(task_state, task_descriptor, coord).await;
                ticket.complete(result);
            });
            rx.recv().await
        }
    };

    match result {
        Ok(result) => flight_response(result, ext, &descriptor),
        // The leader died without completing; nothing to salvage.
        Err(_) => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            "500 Internal Server Error\n\ntile generation aborted",
        )
            .into_response()),
    }
}
