mod args;
mod cache;
mod config;
mod datasource;
mod db;
mod generate;
mod queue;
mod registry;
mod server;
mod somehow;
mod state;
mod tile;

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use crate::{
    args::{Args, Command, ServeCommand},
    cache::TileCache,
    config::Config,
    generate::TileGenerator,
    queue::JobQueue,
    registry::Registry,
    server::{singleflight::SingleFlight, workers::WorkerPool},
    state::AppState,
};

const DEFAULT_CONFIG_PATH: &str = "config_app.json";

fn init_logging(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

fn log_filter(verbose: u8, config: Option<&Config>) -> &'static str {
    match verbose {
        0 => config.map(|c| c.log_level.as_filter()).unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    }
}

fn runtime(blocking_threads: usize) -> std::io::Result<tokio::runtime::Runtime> {
    // All bookkeeping runs on a single cooperative thread; only process
    // spawns, disk walks and similar calls are shipped to blocking threads.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(blocking_threads)
        .build()
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match args.command {
        Command::Init => {
            init_logging(log_filter(args.verbose, None));
            let db_config = db::DbConfig::from_env()?;
            runtime(1)?.block_on(db::init(&db_config))
        }
        Command::Serve(serve) => {
            let config = load_config(&config_path, serve)?;
            init_logging(log_filter(args.verbose, Some(config)));
            runtime(config.blocking_threads as usize)?.block_on(serve_node(config))
        }
        Command::ServeCache => {
            let config: &'static Config = Box::leak(Box::new(Config::load(&config_path)?));
            init_logging(log_filter(args.verbose, Some(config)));
            runtime(config.blocking_threads as usize)?.block_on(serve_cache_node(config))
        }
    }
}

fn load_config(path: &std::path::Path, serve: ServeCommand) -> anyhow::Result<&'static Config> {
    let mut config = Config::load(path)?;
    if let Some(address) = serve.address {
        anyhow::ensure!(address.contains(':'), "--address expects HOST:PORT");
        config.address = Some(address);
    }
    Ok(Box::leak(Box::new(config)))
}

/// A dispatcher node: web surface, worker pool, cache, registry; masters add
/// queue execution and the reload schedule.
async fn serve_node(config: &'static Config) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let db_config = db::DbConfig::from_env()?;
    // No database, no dispatcher: fatal at startup.
    let db = db::open_pool(&db_config).await?;

    let registry = Arc::new(Registry::new(Some(db.clone()), cwd.join("datasources")));
    registry.load_from_db().await?;

    let client = reqwest::Client::new();
    let pool = WorkerPool::new(config, client.clone());
    pool.start();

    let queue = config.is_master().then(|| JobQueue::new(db.clone()));

    let state = AppState {
        config,
        db: Some(db),
        registry,
        cache: Arc::new(TileCache::new(cwd.join("tiles"))),
        flights: Arc::new(SingleFlight::new()),
        gate: Arc::new(Semaphore::new(config.max_concurrent_tile_requests)),
        generator: Some(pool.clone() as Arc<dyn TileGenerator>),
        pool: Some(pool),
        queue,
        client,
    };

    server::run(state).await.map_err(|e| e.0)
}

/// A cache-only node: answers from disk artifacts, spawns no workers and
/// needs no database.
async fn serve_cache_node(config: &'static Config) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;

    let registry = Arc::new(Registry::new(None, cwd.join("datasources")));
    registry.load_files(None).await;

    let state = AppState {
        config,
        db: None,
        registry,
        cache: Arc::new(TileCache::new(cwd.join("tiles"))),
        flights: Arc::new(SingleFlight::new()),
        gate: Arc::new(Semaphore::new(config.max_concurrent_tile_requests)),
        generator: None,
        pool: None,
        queue: None,
        client: reqwest::Client::new(),
    };

    server::run(state).await.map_err(|e| e.0)
}
