//! PostgreSQL connection handling and schema setup.

use std::env;

use anyhow::{anyhow, Context};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    ConnectOptions, Connection, PgConnection, PgPool,
};
use tracing::{debug, info};

const CREATE_TABLE_DATASOURCE: &str = "\
    CREATE TABLE IF NOT EXISTS datasource ( \
        id serial PRIMARY KEY, \
        identifier varchar NOT NULL UNIQUE, \
        data_type varchar, \
        host varchar, \
        port integer, \
        store_type varchar, \
        mbtiles boolean, \
        name varchar, \
        description varchar, \
        attribution varchar, \
        minzoom smallint, \
        maxzoom smallint, \
        bounds jsonb, \
        center jsonb, \
        data jsonb NOT NULL \
    )";

const CREATE_TABLE_QUEUE: &str = "\
    CREATE TABLE IF NOT EXISTS queue ( \
        id serial PRIMARY KEY, \
        job_id varchar NOT NULL UNIQUE, \
        created_at timestamptz NOT NULL, \
        updated_at timestamptz NOT NULL, \
        scheduled_for timestamptz NOT NULL, \
        failed_attempts integer NOT NULL, \
        status integer NOT NULL, \
        job_detail jsonb NOT NULL \
    )";

const CREATE_INDEX_QUEUE_SCHEDULED_FOR: &str =
    "CREATE INDEX IF NOT EXISTS queue_scheduled_for ON queue (scheduled_for)";

const CREATE_INDEX_QUEUE_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS queue_status ON queue (status)";

/// Attempts made for a request-path query that fails transiently.
pub const TRANSIENT_ATTEMPTS: u32 = 3;

/// Whether a query failure is worth a bounded in-request retry. Anything
/// else (constraint violations, decode errors) is surfaced immediately.
pub fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

/// Connection settings taken from the environment at startup.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub pass: String,
    pub pool_size: u32,
}

impl DbConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let var = |name: &str| {
            env::var(name).map_err(|_| anyhow!("environment variable '{name}' is undefined"))
        };
        let pool_size = match env::var("DBPOOLSIZE") {
            Ok(value) => value.parse().context("invalid DBPOOLSIZE")?,
            Err(_) => 5,
        };
        Ok(Self {
            host: var("DBHOST")?,
            port: var("DBPORT")?.parse().context("invalid DBPORT")?,
            name: var("DBNAME")?,
            user: var("DBUSER")?,
            pass: var("DBPASS")?,
            pool_size,
        })
    }

    fn options(&self, database: &str) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(database)
            .username(&self.user)
            .password(&self.pass)
            .disable_statement_logging()
    }
}

pub async fn open_pool(db_config: &DbConfig) -> anyhow::Result<PgPool> {
    info!(
        "Connecting to database '{}' at {}:{}",
        db_config.name, db_config.host, db_config.port
    );
    let pool = PgPoolOptions::new()
        .max_connections(db_config.pool_size)
        .connect_with(db_config.options(&db_config.name))
        .await
        .context("error connecting to PostgreSQL")?;
    Ok(pool)
}

/// Create the database (when missing) and the datasource and queue tables.
pub async fn init(db_config: &DbConfig) -> anyhow::Result<()> {
    // CREATE DATABASE cannot run inside the target database itself.
    let mut conn = PgConnection::connect_with(&db_config.options("postgres"))
        .await
        .context("error connecting to PostgreSQL")?;

    let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
        .bind(&db_config.name)
        .fetch_optional(&mut conn)
        .await?;
    if exists.is_none() {
        info!("Creating database '{}'", db_config.name);
        sqlx::query(&format!("CREATE DATABASE \"{}\"", db_config.name))
            .execute(&mut conn)
            .await?;
    }
    conn.close().await?;

    let mut conn = PgConnection::connect_with(&db_config.options(&db_config.name)).await?;
    for statement in [
        CREATE_TABLE_DATASOURCE,
        CREATE_TABLE_QUEUE,
        CREATE_INDEX_QUEUE_SCHEDULED_FOR,
        CREATE_INDEX_QUEUE_STATUS,
    ] {
        sqlx::query(statement).execute(&mut conn).await?;
    }
    conn.close().await?;

    debug!("Database schema is up to date");
    Ok(())
}
