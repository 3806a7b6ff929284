//! Read-only lookup of previously generated tiles.
//!
//! The disk artifact is the cache: a per-datasource tile tree is consulted
//! first, then the datasource's MBTiles archive. Writes are owned by the
//! generator and surface here on the next lookup.

use std::{collections::HashMap, io::ErrorKind, path::PathBuf};

use bytes::Bytes;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::tile::TileCoord;

/// Lookup result for one coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileArtifact {
    Present(Bytes),
    /// The coordinate is on the grid but the generator produced no content.
    Empty,
    Absent,
}

pub struct TileCache {
    tiles_dir: PathBuf,
    pools: Mutex<HashMap<String, SqlitePool>>,
}

impl TileCache {
    pub fn new(tiles_dir: PathBuf) -> Self {
        Self {
            tiles_dir,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, coord: &TileCoord) -> anyhow::Result<TileArtifact> {
        if let Some(artifact) = self.lookup_disk(coord).await? {
            return Ok(artifact);
        }
        self.lookup_mbtiles(coord).await
    }

    /// Drop the pooled archive connection of one datasource, e.g. before its
    /// archive is rebuilt by a pyramid job or the datasource is deleted.
    pub async fn evict(&self, datasource_id: &str) {
        if let Some(pool) = self.pools.lock().await.remove(datasource_id) {
            debug!("Closing tile archive for {datasource_id}");
            pool.close().await;
        }
    }

    async fn lookup_disk(&self, coord: &TileCoord) -> anyhow::Result<Option<TileArtifact>> {
        let path = self
            .tiles_dir
            .join(&coord.datasource_id)
            .join(coord.z.to_string())
            .join(coord.x.to_string())
            .join(format!("{}.{}", coord.y, coord.ext));

        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Some(TileArtifact::Empty)),
            Ok(bytes) => Ok(Some(TileArtifact::Present(Bytes::from(bytes)))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup_mbtiles(&self, coord: &TileCoord) -> anyhow::Result<TileArtifact> {
        let Some(pool) = self.archive_pool(&coord.datasource_id).await? else {
            return Ok(TileArtifact::Absent);
        };

        let row: Option<Option<Vec<u8>>> = sqlx::query_scalar(
            "SELECT tile_data FROM tiles \
             WHERE zoom_level = ? AND tile_column = ? AND tile_row = ? \
             LIMIT 1",
        )
        .bind(coord.z as i64)
        .bind(coord.x as i64)
        .bind(coord.y as i64)
        .fetch_optional(&pool)
        .await?;

        Ok(match row {
            None => TileArtifact::Absent,
            // A row with no payload marks a tile the generator visited but
            // produced nothing for.
            Some(None) => TileArtifact::Empty,
            Some(Some(bytes)) if bytes.is_empty() => TileArtifact::Empty,
            Some(Some(bytes)) => TileArtifact::Present(Bytes::from(bytes)),
        })
    }

    async fn archive_pool(&self, datasource_id: &str) -> anyhow::Result<Option<SqlitePool>> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(datasource_id) {
            return Ok(Some(pool.clone()));
        }

        let path = self
            .tiles_dir
            .join(datasource_id)
            .join(format!("{datasource_id}.mbtiles"));
        if tokio::fs::metadata(&path).await.is_err() {
            return Ok(None);
        }

        let options = SqliteConnectOptions::new()
            // https://www.sqlite.org/pragma.html#pragma_journal_mode
            .journal_mode(SqliteJournalMode::Wal)
            .read_only(true)
            .filename(&path);

        info!("Opening tile archive at {}", path.display());
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        pools.insert(datasource_id.to_string(), pool.clone());
        Ok(Some(pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileExt;

    fn coord(id: &str, z: u8, x: u32, y: u32) -> TileCoord {
        TileCoord {
            datasource_id: id.to_string(),
            z,
            x,
            y,
            ext: TileExt::Png,
        }
    }

    async fn write_archive(dir: &std::path::Path, id: &str) -> SqlitePool {
        let ds_dir = dir.join(id);
        std::fs::create_dir_all(&ds_dir).unwrap();
        let options = SqliteConnectOptions::new()
            .filename(ds_dir.join(format!("{id}.mbtiles")))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
        sqlx::query(
            "CREATE TABLE tiles ( \
                zoom_level integer NOT NULL, \
                tile_column integer NOT NULL, \
                tile_row integer NOT NULL, \
                tile_data blob, \
                PRIMARY KEY (zoom_level, tile_column, tile_row) \
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn archive_hit_empty_and_miss() {
        let dir = tempfile::tempdir().unwrap();
        let pool = write_archive(dir.path(), "d1").await;
        sqlx::query("INSERT INTO tiles VALUES (3, 4, 5, ?)")
            .bind(&b"tile-bytes"[..])
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO tiles VALUES (3, 4, 6, x'')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO tiles VALUES (3, 4, 7, NULL)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let cache = TileCache::new(dir.path().to_path_buf());
        assert_eq!(
            cache.lookup(&coord("d1", 3, 4, 5)).await.unwrap(),
            TileArtifact::Present(Bytes::from_static(b"tile-bytes"))
        );
        assert_eq!(
            cache.lookup(&coord("d1", 3, 4, 6)).await.unwrap(),
            TileArtifact::Empty
        );
        assert_eq!(
            cache.lookup(&coord("d1", 3, 4, 7)).await.unwrap(),
            TileArtifact::Empty
        );
        assert_eq!(
            cache.lookup(&coord("d1", 3, 0, 0)).await.unwrap(),
            TileArtifact::Absent
        );
    }

    #[tokio::test]
    async fn disk_tree_wins_over_archive() {
        let dir = tempfile::tempdir().unwrap();
        let pool = write_archive(dir.path(), "d1").await;
        sqlx::query("INSERT INTO tiles VALUES (3, 4, 5, ?)")
            .bind(&b"from-archive"[..])
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let tile_dir = dir.path().join("d1").join("3").join("4");
        std::fs::create_dir_all(&tile_dir).unwrap();
        std::fs::write(tile_dir.join("5.png"), b"from-disk").unwrap();

        let cache = TileCache::new(dir.path().to_path_buf());
        assert_eq!(
            cache.lookup(&coord("d1", 3, 4, 5)).await.unwrap(),
            TileArtifact::Present(Bytes::from_static(b"from-disk"))
        );
    }

    #[tokio::test]
    async fn unknown_datasource_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TileCache::new(dir.path().to_path_buf());
        assert_eq!(
            cache.lookup(&coord("nope", 0, 0, 0)).await.unwrap(),
            TileArtifact::Absent
        );
    }

    #[tokio::test]
    async fn evict_closes_the_pool_and_relookup_works() {
        let dir = tempfile::tempdir().unwrap();
        let pool = write_archive(dir.path(), "d1").await;
        sqlx::query("INSERT INTO tiles VALUES (1, 0, 0, ?)")
            .bind(&b"t"[..])
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let cache = TileCache::new(dir.path().to_path_buf());
        assert!(matches!(
            cache.lookup(&coord("d1", 1, 0, 0)).await.unwrap(),
            TileArtifact::Present(_)
        ));
        cache.evict("d1").await;
        assert!(matches!(
            cache.lookup(&coord("d1", 1, 0, 0)).await.unwrap(),
            TileArtifact::Present(_)
        ));
    }
}
