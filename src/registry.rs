//! In-memory index of validated datasource descriptors.
//!
//! The registry is the only writer of the `datasource` table; file ingest and
//! API ingest go through the same validation. Cache-only nodes run the
//! registry without a database.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use futures::TryStreamExt;
use serde::Serialize;
use sqlx::{types::Json, PgPool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::datasource::{DataStore, Descriptor, Kind, Layer, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("datasource not found")]
    NotFound,
    #[error("datasource failed validation")]
    Invalid(Vec<ValidationError>),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of a `load_files`/`reload_files` scan.
#[derive(Debug, Default, Serialize)]
pub struct LoadReport {
    pub load_vector_datasources: usize,
    pub load_raster_datasources: usize,
    pub errors: Vec<ValidationError>,
}

pub struct Registry {
    db: Option<PgPool>,
    datasources_dir: PathBuf,
    datasources: Mutex<HashMap<String, Descriptor>>,
}

impl Registry {
    pub fn new(db: Option<PgPool>, datasources_dir: PathBuf) -> Self {
        Self {
            db,
            datasources_dir,
            datasources: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Descriptor> {
        self.datasources.lock().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Descriptor> {
        let mut list: Vec<Descriptor> = self.datasources.lock().unwrap().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn contains(&self, id: &str) -> bool {
        self.datasources.lock().unwrap().contains_key(id)
    }

    /// Validate and store a new descriptor, assigning an id when absent.
    pub async fn create(&self, mut descriptor: Descriptor) -> Result<String, RegistryError> {
        self.check(&descriptor).await?;
        let id = match &descriptor.id {
            Some(id) => id.clone(),
            None => {
                let id = Uuid::new_v4().to_string();
                descriptor.id = Some(id.clone());
                id
            }
        };
        self.persist(&id, &descriptor).await?;
        self.datasources.lock().unwrap().insert(id.clone(), descriptor);
        Ok(id)
    }

    pub async fn update(&self, id: &str, mut descriptor: Descriptor) -> Result<(), RegistryError> {
        if !self.contains(id) {
            return Err(RegistryError::NotFound);
        }
        descriptor.id = Some(id.to_string());
        self.check(&descriptor).await?;
        self.persist(id, &descriptor).await?;
        self.datasources
            .lock()
            .unwrap()
            .insert(id.to_string(), descriptor);
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), RegistryError> {
        if !self.contains(id) {
            return Err(RegistryError::NotFound);
        }
        // Drop the row first: failing here must leave the in-memory entry
        // intact, or lookups answer 404 while the row still exists.
        if let Some(db) = &self.db {
            let mut delay = std::time::Duration::from_millis(100);
            for attempt in 1.. {
                let result = sqlx::query("DELETE FROM datasource WHERE identifier = $1")
                    .bind(id)
                    .execute(db)
                    .await;
                match result {
                    Ok(_) => break,
                    Err(e)
                        if crate::db::is_transient(&e)
                            && attempt < crate::db::TRANSIENT_ATTEMPTS =>
                    {
                        warn!("Transient error deleting datasource {id} (attempt {attempt}): {e}");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    Err(e) => return Err(RegistryError::Other(e.into())),
                }
            }
        }
        if self.datasources.lock().unwrap().remove(id).is_none() {
            return Err(RegistryError::NotFound);
        }
        info!("Deleted datasource {id}");
        Ok(())
    }

    /// Replace the in-memory index with the rows of the `datasource` table.
    pub async fn load_from_db(&self) -> anyhow::Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let map = sqlx::query_as::<_, (String, Json<Descriptor>)>(
            "SELECT identifier, data FROM datasource",
        )
        .fetch(db)
        .map_ok(|(identifier, Json(descriptor))| (identifier, descriptor))
        .try_collect::<HashMap<_, _>>()
        .await?;
        let count = map.len();
        *self.datasources.lock().unwrap() = map;
        info!("Loaded {count} datasources from the database");
        Ok(count)
    }

    /// Scan the vector and raster descriptor directories and upsert every
    /// document that validates. Restricting to `only` implements
    /// `reload_files`.
    pub async fn load_files(&self, only: Option<&[String]>) -> LoadReport {
        let mut report = LoadReport::default();
        for (kind, dir) in [(Kind::Vector, "vector"), (Kind::Raster, "raster")] {
            let dir = self.datasources_dir.join(dir);
            self.load_dir(kind, &dir, only, &mut report).await;
        }
        info!(
            "Loaded {} vector and {} raster datasources from files ({} errors)",
            report.load_vector_datasources,
            report.load_raster_datasources,
            report.errors.len()
        );
        report
    }

    async fn load_dir(
        &self,
        kind: Kind,
        dir: &Path,
        only: Option<&[String]>,
        report: &mut LoadReport,
    ) {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Skipping datasource directory {}: {e}", dir.display());
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            match self.load_file(kind, &path, only).await {
                Ok(true) => match kind {
                    Kind::Vector => report.load_vector_datasources += 1,
                    Kind::Raster => report.load_raster_datasources += 1,
                },
                Ok(false) => {}
                Err(RegistryError::Invalid(mut errors)) => {
                    for error in &mut errors {
                        error.location.insert(0, file.clone());
                    }
                    report.errors.append(&mut errors);
                }
                Err(e) => {
                    warn!("Error loading datasource file {}: {e}", path.display());
                    report.errors.push(ValidationError::new(
                        &[&file],
                        e.to_string(),
                        "load_error",
                    ));
                }
            }
        }
    }

    async fn load_file(
        &self,
        kind: Kind,
        path: &Path,
        only: Option<&[String]>,
    ) -> Result<bool, RegistryError> {
        let bytes = tokio::fs::read(path).await.map_err(anyhow::Error::from)?;
        let mut descriptor: Descriptor = serde_json::from_slice(&bytes)
            .map_err(|e| RegistryError::Invalid(vec![ValidationError::new(
                &[],
                e.to_string(),
                "json_error",
            )]))?;

        if descriptor.kind != kind {
            return Err(RegistryError::Invalid(vec![ValidationError::new(
                &["type"],
                "descriptor kind does not match its directory",
                "value_error",
            )]));
        }

        if descriptor.id.is_none() {
            descriptor.id = Some(Uuid::new_v4().to_string());
        }
        let id = descriptor.id.clone().unwrap_or_default();
        if let Some(only) = only {
            if !only.contains(&id) {
                return Ok(false);
            }
        }

        self.check(&descriptor).await?;
        self.persist(&id, &descriptor).await?;
        self.datasources.lock().unwrap().insert(id, descriptor);
        Ok(true)
    }

    async fn check(&self, descriptor: &Descriptor) -> Result<(), RegistryError> {
        let mut errors = descriptor.validate();
        errors.append(&mut self.validate_against_store(descriptor).await?);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Invalid(errors))
        }
    }

    /// Check layer tables and columns against the spatial database's
    /// information schema. A node without a database trusts the document.
    async fn validate_against_store(
        &self,
        descriptor: &Descriptor,
    ) -> Result<Vec<ValidationError>, RegistryError> {
        let mut errors = Vec::new();
        let Some(db) = &self.db else {
            return Ok(errors);
        };
        if descriptor.kind != Kind::Vector
            || !matches!(descriptor.data_store, DataStore::Internal { .. })
        {
            return Ok(errors);
        }
        let Some(layers) = &descriptor.layers else {
            return Ok(errors);
        };

        for layer in layers {
            // Raw-SQL layers are the operator's responsibility.
            if layer.queries.is_some() {
                continue;
            }
            self.validate_layer_against_store(db, layer, &mut errors)
                .await
                .map_err(RegistryError::Other)?;
        }
        Ok(errors)
    }

    async fn validate_layer_against_store(
        &self,
        db: &PgPool,
        layer: &Layer,
        errors: &mut Vec<ValidationError>,
    ) -> anyhow::Result<()> {
        let Some(table) = &layer.store_layer else {
            errors.push(ValidationError::new(
                &["layers", &layer.id, "storeLayer"],
                "required unless the layer carries raw SQL queries",
                "missing",
            ));
            return Ok(());
        };

        let table_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS ( \
                 SELECT FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_name = $1 \
             )",
        )
        .bind(table)
        .fetch_one(db)
        .await?;
        if !table_exists {
            errors.push(ValidationError::new(
                &["layers", &layer.id, "storeLayer"],
                format!("table '{table}' not found"),
                "missing",
            ));
            return Ok(());
        }

        let mut columns: Vec<&str> = Vec::new();
        if let Some(geom_field) = &layer.geom_field {
            columns.push(geom_field);
        }
        if let Some(fields) = &layer.fields {
            columns.extend(fields.iter().map(|f| f.column()));
        }
        for column in columns {
            let column_exists: bool = sqlx::query_scalar(
                "SELECT EXISTS ( \
                     SELECT FROM information_schema.columns \
                     WHERE table_name = $1 AND column_name = $2 \
                 )",
            )
            .bind(table)
            .bind(column)
            .fetch_one(db)
            .await?;
            if !column_exists {
                errors.push(ValidationError::new(
                    &["layers", &layer.id, "fields", column],
                    format!("column '{column}' not found in '{table}'"),
                    "missing",
                ));
            }
        }
        Ok(())
    }

    async fn persist(&self, id: &str, descriptor: &Descriptor) -> Result<(), RegistryError> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        let (minzoom, maxzoom) = descriptor.zoom_range();
        let store_type = match &descriptor.data_store {
            DataStore::Internal { .. } => "internal",
            DataStore::Tiles { .. } => "tiles",
            DataStore::Tilejson { .. } => "tilejson",
            DataStore::Mbtiles { .. } => "mbtiles",
        };
        let data_type = match descriptor.kind {
            Kind::Raster => "raster",
            Kind::Vector => "vector",
        };
        let bounds = descriptor
            .bounds
            .as_ref()
            .map(|b| serde_json::to_value(b))
            .transpose()
            .map_err(anyhow::Error::from)?;
        let center = descriptor
            .center
            .as_ref()
            .map(|c| serde_json::to_value(c))
            .transpose()
            .map_err(anyhow::Error::from)?;

        let mut delay = std::time::Duration::from_millis(100);
        for attempt in 1.. {
            let result = sqlx::query(
                "INSERT INTO datasource \
                 (identifier, data_type, host, port, store_type, mbtiles, name, description, \
                  attribution, minzoom, maxzoom, bounds, center, data) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
                 ON CONFLICT (identifier) DO UPDATE SET \
                     data_type = excluded.data_type, \
                     host = excluded.host, \
                     port = excluded.port, \
                     store_type = excluded.store_type, \
                     mbtiles = excluded.mbtiles, \
                     name = excluded.name, \
                     description = excluded.description, \
                     attribution = excluded.attribution, \
                     minzoom = excluded.minzoom, \
                     maxzoom = excluded.maxzoom, \
                     bounds = excluded.bounds, \
                     center = excluded.center, \
                     data = excluded.data",
            )
            .bind(id)
            .bind(data_type)
            .bind(&descriptor.host)
            .bind(descriptor.port.map(|p| p as i32))
            .bind(store_type)
            .bind(descriptor.mbtiles)
            .bind(&descriptor.name)
            .bind(&descriptor.description)
            .bind(&descriptor.attribution)
            .bind(minzoom as i16)
            .bind(maxzoom as i16)
            .bind(&bounds)
            .bind(&center)
            .bind(Json(descriptor))
            .execute(db)
            .await;

            match result {
                Ok(_) => break,
                Err(e) if crate::db::is_transient(&e) && attempt < crate::db::TRANSIENT_ATTEMPTS => {
                    warn!("Transient error persisting datasource {id} (attempt {attempt}): {e}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(RegistryError::Other(e.into())),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(None, PathBuf::from("/nonexistent"))
    }

    fn raster(id: Option<&str>) -> Descriptor {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "type": "raster",
            "dataStore": {"store": "internal", "file": "dem.tif"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_get_update_delete_round_trip() {
        let registry = registry();
        let id = registry
            .create(raster(Some("1b6f3c38-58b3-4f0e-9f7e-aaaaaaaaaaaa")))
            .await
            .unwrap();
        assert_eq!(id, "1b6f3c38-58b3-4f0e-9f7e-aaaaaaaaaaaa");
        assert!(registry.get(&id).is_some());
        assert_eq!(registry.list().len(), 1);

        let mut changed = raster(Some(id.as_str()));
        changed.name = Some("alps".to_string());
        registry.update(&id, changed).await.unwrap();
        assert_eq!(registry.get(&id).unwrap().name.as_deref(), Some("alps"));

        registry.delete(&id).await.unwrap();
        assert!(registry.get(&id).is_none());
        assert!(matches!(
            registry.delete(&id).await,
            Err(RegistryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn create_assigns_an_id_when_absent() {
        let registry = registry();
        let id = registry.create(raster(None)).await.unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(registry.get(&id).unwrap().id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn invalid_documents_are_rejected_with_details() {
        let registry = registry();
        let mut ds = raster(None);
        ds.minzoom = Some(20);
        ds.maxzoom = Some(10);
        match registry.create(ds).await {
            Err(RegistryError::Invalid(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_of_unknown_id_is_not_found() {
        let registry = registry();
        let result = registry.update("missing", raster(None)).await;
        assert!(matches!(result, Err(RegistryError::NotFound)));
    }

    #[tokio::test]
    async fn load_files_scans_both_directories() {
        let dir = tempfile::tempdir().unwrap();
        let vector_dir = dir.path().join("vector");
        let raster_dir = dir.path().join("raster");
        std::fs::create_dir_all(&vector_dir).unwrap();
        std::fs::create_dir_all(&raster_dir).unwrap();

        std::fs::write(
            raster_dir.join("dem.json"),
            serde_json::json!({
                "type": "raster",
                "dataStore": {"store": "internal", "file": "dem.tif"}
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            vector_dir.join("roads.json"),
            serde_json::json!({
                "type": "vector",
                "dataStore": {"store": "internal"},
                "layers": [{
                    "id": "roads",
                    "type": "line",
                    "storeLayer": "osm_roads",
                    "geomField": "geom"
                }]
            })
            .to_string(),
        )
        .unwrap();
        // A raster document in the vector directory must be reported.
        std::fs::write(
            vector_dir.join("wrong.json"),
            serde_json::json!({
                "type": "raster",
                "dataStore": {"store": "internal", "file": "x.tif"}
            })
            .to_string(),
        )
        .unwrap();

        let registry = Registry::new(None, dir.path().to_path_buf());
        let report = registry.load_files(None).await;
        assert_eq!(report.load_raster_datasources, 1);
        assert_eq!(report.load_vector_datasources, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].location[0], "wrong.json");
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn reload_files_is_restricted_to_the_given_ids() {
        let dir = tempfile::tempdir().unwrap();
        let raster_dir = dir.path().join("raster");
        std::fs::create_dir_all(&raster_dir).unwrap();
        for (file, id) in [
            ("a.json", "11111111-1111-4111-8111-111111111111"),
            ("b.json", "22222222-2222-4222-8222-222222222222"),
        ] {
            std::fs::write(
                raster_dir.join(file),
                serde_json::json!({
                    "id": id,
                    "type": "raster",
                    "dataStore": {"store": "internal", "file": "dem.tif"}
                })
                .to_string(),
            )
            .unwrap();
        }

        let registry = Registry::new(None, dir.path().to_path_buf());
        let only = vec!["22222222-2222-4222-8222-222222222222".to_string()];
        let report = registry.load_files(Some(&only)).await;
        assert_eq!(report.load_raster_datasources, 1);
        assert!(registry.contains("22222222-2222-4222-8222-222222222222"));
        assert!(!registry.contains("11111111-1111-4111-8111-111111111111"));
    }
}
