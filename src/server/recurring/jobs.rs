//! Claim due jobs and execute them.

use std::{future, time::Duration};

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    generate::{GenerateError, RemoteNode, TileGenerator},
    queue::{retry_backoff, Job, JobDetail, JobOutcome, JobQueue, JobStatus, MAX_ATTEMPTS},
    state::AppState,
    tile::{TileCoord, TileExt, TileRange},
};

/// Jobs claimed per tick. Pyramid builds are heavy, one at a time is plenty.
const CLAIM_LIMIT: i64 = 1;

pub async fn run(state: AppState) {
    let Some(queue) = state.queue.clone() else {
        return future::pending().await;
    };

    loop {
        match queue.claim_due(CLAIM_LIMIT).await {
            Ok(jobs) => {
                for job in jobs {
                    let id = job.job_id;
                    execute(&state, &queue, &job)
                        .instrument(info_span!("job", %id))
                        .await;
                }
            }
            Err(e) => error!("Error claiming due jobs:\n{e:?}"),
        }
        tokio::time::sleep(Duration::from_secs(state.config.timeout_pull_job)).await;
    }
}

async fn execute(state: &AppState, queue: &JobQueue, job: &Job) {
    info!("Executing job (attempt {})", job.failed_attempts + 1);
    let outcome = match &job.detail {
        JobDetail::Pyramid { datasource_id } => {
            run_pyramid(state, queue, job, datasource_id).await
        }
    };

    // A cancelled job already carries its final status.
    let Some(outcome) = outcome else { return };
    if let Err(e) = queue.complete(job.job_id, outcome).await {
        error!("Error completing job:\n{e:?}");
    }
}

/// Retry under backoff until the attempt budget is spent.
fn transient(job: &Job) -> JobOutcome {
    if job.failed_attempts + 1 >= MAX_ATTEMPTS {
        JobOutcome::Failed
    } else {
        JobOutcome::Retry(retry_backoff(job.failed_attempts))
    }
}

/// Tile extension a pyramid build writes, from the configured tile driver.
fn raster_ext(tiledriver: &str) -> TileExt {
    match tiledriver.to_ascii_uppercase().as_str() {
        "JPEG" | "JPG" => TileExt::Jpg,
        "WEBP" => TileExt::Webp,
        _ => TileExt::Png,
    }
}

async fn run_pyramid(
    state: &AppState,
    queue: &JobQueue,
    job: &Job,
    datasource_id: &str,
) -> Option<JobOutcome> {
    let Some(descriptor) = state.registry.get(datasource_id) else {
        error!("Pyramid for unknown datasource {datasource_id}");
        return Some(JobOutcome::Failed);
    };

    // Remote datasource: the owning node builds the pyramid.
    if let Some((host, port)) = descriptor.upstream() {
        if !state.config.is_self_address(host, port) {
            let remote = RemoteNode::new(
                host,
                port,
                state.client.clone(),
                Duration::from_secs(state.config.timeout_worker_response),
            );
            return Some(match remote.pyramid(datasource_id).await {
                Ok(()) => JobOutcome::Succeeded,
                Err(GenerateError::Backend(message)) => {
                    error!("Remote pyramid failed: {message}");
                    JobOutcome::Failed
                }
                Err(e) => {
                    warn!("Remote pyramid failed transiently: {e}");
                    transient(job)
                }
            });
        }
    }

    // The archive is rebuilt underneath us; drop the pooled connection.
    state.cache.evict(datasource_id).await;

    let Some(generator) = state.generator.clone() else {
        warn!("No generation capability on this node");
        return Some(transient(job));
    };

    let ext = match descriptor.kind {
        crate::datasource::Kind::Raster => raster_ext(&descriptor.pyramid.tiledriver),
        crate::datasource::Kind::Vector => TileExt::Pbf,
    };
    let (minzoom, maxzoom) = descriptor.zoom_range();

    for z in minzoom..=maxzoom {
        // Cancellation is observed between zoom levels.
        match queue.status_of(job.job_id).await {
            Ok(Some(JobStatus::Cancelled)) => {
                info!("Pyramid cancelled at zoom {z}");
                return None;
            }
            Ok(_) => {}
            Err(e) => warn!("Error checking job status:\n{e:?}"),
        }

        let range = match &descriptor.bounds {
            Some(bounds) => TileRange::of(bounds, z),
            None => TileRange::full(z),
        };
        debug!("Building zoom {z} ({} tiles)", range.count());

        for (x, y) in range.iter() {
            let coord = TileCoord {
                datasource_id: datasource_id.to_string(),
                z,
                x,
                y,
                ext,
            };
            match generator.generate(&coord).await {
                Ok(_) => {}
                Err(GenerateError::Backend(message)) => {
                    error!("Generator failed on {coord}: {message}");
                    return Some(JobOutcome::Failed);
                }
                Err(e) => {
                    warn!("Pyramid interrupted on {coord}: {e}");
                    return Some(transient(job));
                }
            }
        }
    }

    info!("Pyramid for {datasource_id} finished");
    Some(JobOutcome::Succeeded)
}
