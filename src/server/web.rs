mod datasources;
mod jobs;
mod maintenance;
mod paths;
mod pyramid;
mod tile;

use axum::{Json, Router};
use axum_extra::routing::RouterExt;
use serde_json::json;
use tracing::info;

use crate::{somehow, state::AppState};

use self::paths::PathHealth;

async fn get_health(_path: PathHealth) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .typed_get(tile::get_api_tile)
        .typed_post(pyramid::post_api_pyramid)
        .typed_get(datasources::get_api_datasources)
        .typed_post(datasources::post_api_datasources)
        .typed_put(datasources::put_api_datasources)
        .typed_get(datasources::get_api_datasource_by_id)
        .typed_delete(datasources::delete_api_datasource_by_id)
        .typed_post(datasources::post_api_datasources_load_files)
        .typed_post(datasources::post_api_datasources_reload_files)
        .typed_get(jobs::get_api_jobs)
        .typed_delete(jobs::delete_api_job_by_id)
        .typed_post(maintenance::post_maintenance_add_workers)
        .typed_get(maintenance::reload_workers)
        .typed_post(maintenance::reload_workers)
        .typed_get(maintenance::terminate_workers)
        .typed_post(maintenance::terminate_workers)
        .typed_get(maintenance::get_maintenance_info_workers)
        .typed_get(get_health)
        .with_state(state)
}

pub async fn run(state: AppState) -> somehow::Result<()> {
    let address = format!("{}:{}", state.config.host, state.config.port).parse()?;
    info!("Listening on {address}");

    let app = router(state);
    axum::Server::bind(&address)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use axum::http::{header, Request, StatusCode};
    use bytes::Bytes;
    use hyper::Body;
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    use crate::{
        cache::TileCache,
        config::Config,
        generate::{GenerateError, GenerateOutcome, TileGenerator},
        registry::Registry,
        server::singleflight::SingleFlight,
        state::AppState,
        tile::TileCoord,
    };

    use super::router;

    const RASTER_ID: &str = "6f2b56da-5f4f-4f95-9f0a-6b1e6f6ddc01";
    const VECTOR_ID: &str = "0b0e2b60-9d4e-4cf6-a9cd-3e87fb3cbb02";

    struct FakeGenerator {
        calls: AtomicUsize,
        /// When present, every call waits for a permit before answering.
        hold: Option<Arc<Semaphore>>,
    }

    impl FakeGenerator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                hold: None,
            })
        }

        fn held(hold: Arc<Semaphore>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                hold: Some(hold),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TileGenerator for FakeGenerator {
        async fn generate(&self, _coord: &TileCoord) -> Result<GenerateOutcome, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hold) = &self.hold {
                let _permit = hold.acquire().await;
            }
            Ok(GenerateOutcome::Present(Bytes::from_static(b"generated")))
        }
    }

    fn test_config() -> &'static Config {
        let config: Config = serde_json::from_value(serde_json::json!({
            "type": "granian",
            "port": 0,
            "processes_workers": 1,
            "max_concurrent_tile_requests": 32
        }))
        .unwrap();
        Box::leak(Box::new(config))
    }

    struct TestNode {
        state: AppState,
        _tiles: tempfile::TempDir,
    }

    fn node(generator: Option<Arc<FakeGenerator>>, gate: usize) -> TestNode {
        let tiles = tempfile::tempdir().unwrap();
        let state = AppState {
            config: test_config(),
            db: None,
            registry: Arc::new(Registry::new(None, tiles.path().join("datasources"))),
            cache: Arc::new(TileCache::new(tiles.path().to_path_buf())),
            flights: Arc::new(SingleFlight::new()),
            gate: Arc::new(Semaphore::new(gate)),
            generator: generator.map(|g| g as Arc<dyn TileGenerator>),
            pool: None,
            queue: None,
            client: reqwest::Client::new(),
        };
        TestNode {
            state,
            _tiles: tiles,
        }
    }

    async fn add_raster(node: &TestNode) {
        let descriptor = serde_json::from_value(serde_json::json!({
            "id": RASTER_ID,
            "type": "raster",
            "dataStore": {"store": "internal", "file": "dem.tif"},
            "maxzoom": 12,
            "bounds": {"lng_w": 5.0, "lat_s": 45.0, "lng_e": 15.0, "lat_n": 55.0}
        }))
        .unwrap();
        node.state.registry.create(descriptor).await.unwrap();
    }

    async fn get(node: &TestNode, uri: &str) -> (StatusCode, Bytes) {
        let response = router(node.state.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, body)
    }

    // Tile within the raster's bounds at zoom 10 (central Europe).
    const HIT: &str = "/api/tile/6f2b56da-5f4f-4f95-9f0a-6b1e6f6ddc01/10/545/354.png";

    #[tokio::test]
    async fn cache_hit_never_touches_the_generator() {
        let generator = FakeGenerator::new();
        let node = node(Some(generator.clone()), 32);
        add_raster(&node).await;

        let dir = node._tiles.path().join(RASTER_ID).join("10").join("545");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("354.png"), b"cached-bytes").unwrap();

        let (status, body) = get(&node, HIT).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"cached-bytes");
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn miss_generates_and_replies_with_the_bytes() {
        let generator = FakeGenerator::new();
        let node = node(Some(generator.clone()), 32);
        add_raster(&node).await;

        let (status, body) = get(&node, HIT).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"generated");
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_for_one_coordinate_coalesce() {
        let hold = Arc::new(Semaphore::new(0));
        let generator = FakeGenerator::held(hold.clone());
        let node = node(Some(generator.clone()), 32);
        add_raster(&node).await;

        let mut requests = Vec::new();
        for _ in 0..100 {
            let app = router(node.state.clone());
            requests.push(async move {
                let response = app
                    .oneshot(Request::get(HIT).body(Body::empty()).unwrap())
                    .await
                    .unwrap();
                let status = response.status();
                let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
                (status, body)
            });
        }

        // Release the leader once every request has attached to the flight.
        let release = hold.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            release.add_permits(1);
        });

        for (status, body) in futures::future::join_all(requests).await {
            assert_eq!(status, StatusCode::OK);
            assert_eq!(&body[..], b"generated");
        }
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn admission_gate_rejects_the_overflowing_request() {
        let hold = Arc::new(Semaphore::new(0));
        let generator = FakeGenerator::held(hold.clone());
        let node = node(Some(generator.clone()), 2);
        add_raster(&node).await;

        let mut held_requests = Vec::new();
        for uri in [
            "/api/tile/6f2b56da-5f4f-4f95-9f0a-6b1e6f6ddc01/10/545/354.png",
            "/api/tile/6f2b56da-5f4f-4f95-9f0a-6b1e6f6ddc01/10/546/354.png",
        ] {
            let app = router(node.state.clone());
            held_requests.push(tokio::spawn(async move {
                app.oneshot(Request::get(uri).body(Body::empty()).unwrap())
                    .await
                    .unwrap()
                    .status()
            }));
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let (status, _) = get(
            &node,
            "/api/tile/6f2b56da-5f4f-4f95-9f0a-6b1e6f6ddc01/10/547/354.png",
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        hold.add_permits(10);
        for request in held_requests {
            assert_eq!(request.await.unwrap(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn out_of_bounds_is_204_and_skips_the_generator() {
        let generator = FakeGenerator::new();
        let node = node(Some(generator.clone()), 32);
        add_raster(&node).await;

        let (status, body) = get(
            &node,
            "/api/tile/6f2b56da-5f4f-4f95-9f0a-6b1e6f6ddc01/10/0/0.png",
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn grid_zoom_kind_and_id_errors_are_404() {
        let generator = FakeGenerator::new();
        let node = node(Some(generator.clone()), 32);
        add_raster(&node).await;

        // Unknown datasource.
        let unknown = "/api/tile/11111111-2222-4333-8444-555555555555/3/1/1.png";
        assert_eq!(get(&node, unknown).await.0, StatusCode::NOT_FOUND);
        // Zoom above the descriptor's range.
        let deep = "/api/tile/6f2b56da-5f4f-4f95-9f0a-6b1e6f6ddc01/13/0/0.png";
        assert_eq!(get(&node, deep).await.0, StatusCode::NOT_FOUND);
        // Off the grid.
        let off = "/api/tile/6f2b56da-5f4f-4f95-9f0a-6b1e6f6ddc01/3/9/1.png";
        assert_eq!(get(&node, off).await.0, StatusCode::NOT_FOUND);
        // Vector extension on a raster datasource.
        let wrong = "/api/tile/6f2b56da-5f4f-4f95-9f0a-6b1e6f6ddc01/10/545/354.pbf";
        assert_eq!(get(&node, wrong).await.0, StatusCode::NOT_FOUND);

        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn cache_only_datasources_never_generate() {
        let generator = FakeGenerator::new();
        let node = node(Some(generator.clone()), 32);
        let descriptor = serde_json::from_value(serde_json::json!({
            "id": RASTER_ID,
            "type": "raster",
            "dataStore": {"store": "internal", "file": "dem.tif"},
            "use_cache_only": true
        }))
        .unwrap();
        node.state.registry.create(descriptor).await.unwrap();

        let (status, _) = get(
            &node,
            "/api/tile/6f2b56da-5f4f-4f95-9f0a-6b1e6f6ddc01/3/4/5.png",
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn compressed_vector_tiles_carry_gzip() {
        let generator = FakeGenerator::new();
        let node = node(Some(generator.clone()), 32);
        let descriptor = serde_json::from_value(serde_json::json!({
            "id": VECTOR_ID,
            "type": "vector",
            "dataStore": {"store": "internal"},
            "compress_tiles": true,
            "layers": [{
                "id": "roads",
                "type": "line",
                "storeLayer": "osm_roads",
                "geomField": "geom"
            }]
        }))
        .unwrap();
        node.state.registry.create(descriptor).await.unwrap();

        let uri = "/api/tile/0b0e2b60-9d4e-4cf6-a9cd-3e87fb3cbb02/3/4/5.pbf";
        let response = router(node.state.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/vnd.mapbox-vector-tile"
        );
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..2], &[0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn datasource_round_trip_and_validation_surface() {
        let node = node(None, 32);
        let document = serde_json::json!({
            "id": RASTER_ID,
            "type": "raster",
            "dataStore": {"store": "internal", "file": "dem.tif"},
            "name": "alps",
            "maxzoom": 12
        });

        let response = router(node.state.clone())
            .oneshot(
                Request::post("/api/datasources")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(document.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let saved: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(saved["datasource_id"], RASTER_ID);

        let (status, body) = get(&node, &format!("/api/datasources/{RASTER_ID}")).await;
        assert_eq!(status, StatusCode::OK);
        let fetched: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(fetched["name"], "alps");
        assert_eq!(fetched["maxzoom"], 12);
        assert_eq!(fetched["dataStore"]["file"], "dem.tif");

        // An invalid document answers 422 with addressable details.
        let broken = serde_json::json!({
            "type": "raster",
            "dataStore": {"store": "internal"}
        });
        let response = router(node.state.clone())
            .oneshot(
                Request::post("/api/datasources")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(broken.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let detail: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(detail["detail"].as_array().map(|d| !d.is_empty()).unwrap_or(false));
    }

    #[tokio::test]
    async fn pyramid_for_unknown_datasource_is_404() {
        let node = node(None, 32);
        let response = router(node.state.clone())
            .oneshot(
                Request::post("/api/pyramid")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({"datasource_id": "nope"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cache_only_node_answers_misses_with_204() {
        // No generator at all, as on a serve-cache node.
        let node = node(None, 32);
        add_raster(&node).await;
        let (status, _) = get(&node, HIT).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let node = node(None, 32);
        let (status, body) = get(&node, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "ok");
    }
}
