//! Globally accessible application state.

use std::sync::Arc;

use axum::extract::FromRef;
use sqlx::PgPool;
use tokio::sync::Semaphore;

use crate::{
    cache::TileCache,
    config::Config,
    generate::TileGenerator,
    queue::JobQueue,
    registry::Registry,
    server::{singleflight::SingleFlight, workers::WorkerPool},
};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub config: &'static Config,
    pub db: Option<PgPool>,
    pub registry: Arc<Registry>,
    pub cache: Arc<TileCache>,
    pub flights: Arc<SingleFlight>,
    /// Admission gate bounding concurrent generation across the process.
    pub gate: Arc<Semaphore>,
    /// Local generation capability; absent on cache-only nodes.
    pub generator: Option<Arc<dyn TileGenerator>>,
    pub pool: Option<Arc<WorkerPool>>,
    /// Job queue; present on masters only.
    pub queue: Option<JobQueue>,
    pub client: reqwest::Client,
}

impl AppState {
    pub async fn shut_down(self) {
        if let Some(pool) = &self.pool {
            pool.terminate_all().await;
        }
        if let Some(db) = &self.db {
            db.close().await;
        }
    }
}
