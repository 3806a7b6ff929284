//! Datasource descriptors and their validation.
//!
//! A descriptor is a JSON document describing how tiles for one dataset are
//! produced: a single raster file, a raster mosaic folder, a vector dataset
//! whose layers carry filter expressions, a vector dataset with raw SQL, or
//! an upstream set of remote tile URLs. Validation is exhaustive per variant
//! and identical for file and API ingress.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_RASTER_MAXZOOM: u8 = 13;
pub const DEFAULT_VECTOR_MAXZOOM: u8 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Raster,
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Mapbox,
    Terrarium,
    F32,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelSelection {
    FirstMethod,
    HighestMethod,
    LowestMethod,
    MeanMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    Average,
    Antialias,
    Nearest,
    Bilinear,
    Cubic,
    Cubicspline,
    Lanczos,
    Min,
    Max,
    Med,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    Point,
    Line,
    Polygon,
    Raster,
}

/// Geographic extent in degrees, west/south/east/north.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bounds {
    pub lng_w: f64,
    pub lat_s: f64,
    pub lng_e: f64,
    pub lat_n: f64,
}

/// One validation failure, addressable down to the offending field.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    pub location: Vec<String>,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ValidationError {
    pub fn new(location: &[&str], message: impl Into<String>, kind: &str) -> Self {
        Self {
            location: location.iter().map(|s| s.to_string()).collect(),
            message: message.into(),
            kind: kind.to_string(),
        }
    }
}

/// Where the tile payload bytes come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "store", rename_all = "lowercase")]
pub enum DataStore {
    Internal {
        #[serde(skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        folder: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        dataset: Option<String>,
    },
    Tiles {
        tiles: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        keys: Option<Vec<String>>,
    },
    Tilejson {
        url: String,
    },
    Mbtiles {
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_in_db: Option<String>,
    #[serde(default)]
    pub encode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Field {
    pub fn column(&self) -> &str {
        self.name_in_db.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerQuery {
    pub minzoom: u8,
    pub maxzoom: u8,
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    #[serde(rename = "type")]
    pub layer_type: LayerType,
    #[serde(rename = "storeLayer", skip_serializing_if = "Option::is_none")]
    pub store_layer: Option<String>,
    #[serde(rename = "geomField", skip_serializing_if = "Option::is_none")]
    pub geom_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minzoom: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxzoom: Option<u8>,
    #[serde(default)]
    pub simplify: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<Field>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<LayerQuery>>,
}

mod default {
    pub fn tile_size() -> u32 {
        256
    }

    pub fn tiledriver() -> String {
        "PNG".to_string()
    }

    pub fn count_processes() -> u32 {
        1
    }

    pub fn truthy() -> bool {
        true
    }
}

/// Knobs for bulk pyramid builds, handed through to the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyramidSettings {
    #[serde(default = "default::count_processes")]
    pub count_processes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resampling: Option<Resampling>,
    #[serde(default = "default::tiledriver")]
    pub tiledriver: String,
    #[serde(default = "default::tile_size")]
    pub tile_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel_selection_method: Option<PixelSelection>,
    #[serde(default)]
    pub mosaic_merge: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodata_default: Option<f64>,
    #[serde(default = "default::truthy")]
    pub merge: bool,
}

impl Default for PyramidSettings {
    fn default() -> Self {
        Self {
            count_processes: default::count_processes(),
            resampling: None,
            tiledriver: default::tiledriver(),
            tile_size: default::tile_size(),
            pixel_selection_method: None,
            mosaic_merge: false,
            nodata_default: None,
            merge: true,
        }
    }
}

/// A validated datasource document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(rename = "dataStore")]
    pub data_store: DataStore,

    /// Worker node owning the source files; absent means this node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub minzoom: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxzoom: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center: Option<Vec<f64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
    #[serde(rename = "pyramidSettings", default)]
    pub pyramid: PyramidSettings,

    #[serde(default)]
    pub mbtiles: bool,
    #[serde(default)]
    pub use_cache_only: bool,
    #[serde(default)]
    pub compress_tiles: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub layers: Option<Vec<Layer>>,
}

/// The exhaustive shape a descriptor resolves to after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    RasterSingle,
    RasterMosaic,
    VectorFilter,
    VectorSql,
    VectorRemoteTiles,
}

impl Descriptor {
    /// Effective zoom range, kind defaults applied.
    pub fn zoom_range(&self) -> (u8, u8) {
        let minzoom = self.minzoom.unwrap_or(0);
        let maxzoom = self.maxzoom.unwrap_or(match self.kind {
            Kind::Raster => DEFAULT_RASTER_MAXZOOM,
            Kind::Vector => DEFAULT_VECTOR_MAXZOOM,
        });
        (minzoom, maxzoom)
    }

    /// The remote node owning this datasource, if any.
    pub fn upstream(&self) -> Option<(&str, u16)> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some((host.as_str(), port)),
            _ => None,
        }
    }

    /// Resolve the variant. Only meaningful on a descriptor that validated.
    pub fn variant(&self) -> Option<Variant> {
        match (&self.kind, &self.data_store) {
            (Kind::Raster, DataStore::Internal { folder: Some(_), .. }) => {
                Some(Variant::RasterMosaic)
            }
            (Kind::Raster, DataStore::Internal { .. }) => Some(Variant::RasterSingle),
            (Kind::Vector, DataStore::Tiles { .. }) => Some(Variant::VectorRemoteTiles),
            (Kind::Vector, DataStore::Internal { .. }) => {
                let sql = self
                    .layers
                    .as_ref()
                    .is_some_and(|layers| layers.iter().any(|l| l.queries.is_some()));
                Some(if sql {
                    Variant::VectorSql
                } else {
                    Variant::VectorFilter
                })
            }
            _ => None,
        }
    }

    /// Total validation; an empty result means the document is well-formed.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(id) = &self.id {
            if Uuid::parse_str(id).is_err() {
                errors.push(ValidationError::new(
                    &["id"],
                    format!("'{id}' is not a UUID"),
                    "value_error",
                ));
            }
        }

        let (minzoom, maxzoom) = self.zoom_range();
        if maxzoom > crate::tile::MAX_ZOOM {
            errors.push(ValidationError::new(
                &["maxzoom"],
                format!("must be <= {}", crate::tile::MAX_ZOOM),
                "value_error",
            ));
        }
        if minzoom > maxzoom {
            errors.push(ValidationError::new(
                &["minzoom"],
                format!("minzoom {minzoom} exceeds maxzoom {maxzoom}"),
                "value_error",
            ));
        }

        if let Some(bounds) = &self.bounds {
            if !(-180.0..=180.0).contains(&bounds.lng_w)
                || !(-180.0..=180.0).contains(&bounds.lng_e)
                || !(-90.0..=90.0).contains(&bounds.lat_s)
                || !(-90.0..=90.0).contains(&bounds.lat_n)
                || bounds.lng_w >= bounds.lng_e
                || bounds.lat_s >= bounds.lat_n
            {
                errors.push(ValidationError::new(
                    &["bounds"],
                    "expected lng_w < lng_e in -180..=180 and lat_s < lat_n in -90..=90",
                    "value_error",
                ));
            }
        }

        if let Some(center) = &self.center {
            if center.len() != 2 && center.len() != 3 {
                errors.push(ValidationError::new(
                    &["center"],
                    "expected [lng, lat] or [lng, lat, zoom]",
                    "value_error",
                ));
            }
        }

        if (self.host.is_some()) != (self.port.is_some()) {
            errors.push(ValidationError::new(
                &["host"],
                "host and port must be given together",
                "missing",
            ));
        }

        match self.kind {
            Kind::Raster => self.validate_raster(&mut errors),
            Kind::Vector => self.validate_vector(&mut errors),
        }

        errors
    }

    fn validate_raster(&self, errors: &mut Vec<ValidationError>) {
        if self.layers.is_some() {
            errors.push(ValidationError::new(
                &["layers"],
                "raster datasources carry no layers",
                "value_error",
            ));
        }
        match &self.data_store {
            DataStore::Internal { file, folder, .. } => match (file, folder) {
                (Some(_), Some(_)) => errors.push(ValidationError::new(
                    &["dataStore"],
                    "'file' and 'folder' are mutually exclusive",
                    "value_error",
                )),
                (None, None) => errors.push(ValidationError::new(
                    &["dataStore"],
                    "an internal raster store needs 'file' or 'folder'",
                    "missing",
                )),
                (None, Some(_)) => {
                    // A mosaic needs a pixel selection rule to merge sources.
                    if self.pyramid.pixel_selection_method.is_none() {
                        errors.push(ValidationError::new(
                            &["pyramidSettings", "pixel_selection_method"],
                            "required for a raster mosaic",
                            "missing",
                        ));
                    }
                }
                (Some(_), None) => {}
            },
            DataStore::Tiles { tiles, .. } => {
                if tiles.is_empty() {
                    errors.push(ValidationError::new(
                        &["dataStore", "tiles"],
                        "must not be empty",
                        "value_error",
                    ));
                }
            }
            DataStore::Tilejson { .. } | DataStore::Mbtiles { .. } => {
                errors.push(ValidationError::new(
                    &["dataStore", "store"],
                    "store not supported for raster datasources",
                    "value_error",
                ));
            }
        }
    }

    fn validate_vector(&self, errors: &mut Vec<ValidationError>) {
        if self.encoding.is_some() {
            errors.push(ValidationError::new(
                &["encoding"],
                "encoding applies to raster datasources only",
                "value_error",
            ));
        }
        match &self.data_store {
            DataStore::Internal { .. } => {
                let Some(layers) = &self.layers else {
                    errors.push(ValidationError::new(
                        &["layers"],
                        "an internal vector store needs at least one layer",
                        "missing",
                    ));
                    return;
                };
                if layers.is_empty() {
                    errors.push(ValidationError::new(
                        &["layers"],
                        "an internal vector store needs at least one layer",
                        "missing",
                    ));
                }
                for layer in layers {
                    validate_layer(layer, errors);
                }
            }
            DataStore::Tiles { tiles, .. } => {
                if tiles.is_empty() {
                    errors.push(ValidationError::new(
                        &["dataStore", "tiles"],
                        "must not be empty",
                        "value_error",
                    ));
                }
                if self.layers.is_some() {
                    errors.push(ValidationError::new(
                        &["layers"],
                        "remote tile datasources carry no layers",
                        "value_error",
                    ));
                }
            }
            DataStore::Tilejson { .. } | DataStore::Mbtiles { .. } => {
                errors.push(ValidationError::new(
                    &["dataStore", "store"],
                    "store not supported for vector datasources",
                    "value_error",
                ));
            }
        }
    }
}

fn validate_layer(layer: &Layer, errors: &mut Vec<ValidationError>) {
    let loc = |tail: &[&str]| -> Vec<String> {
        ["layers", layer.id.as_str()]
            .iter()
            .map(|s| s.to_string())
            .chain(tail.iter().map(|s| s.to_string()))
            .collect()
    };

    if let Some(queries) = &layer.queries {
        if layer.filter.is_some() || layer.fields.is_some() {
            errors.push(ValidationError {
                location: loc(&["queries"]),
                message: "a layer carries either filter/fields or raw SQL queries, not both"
                    .to_string(),
                kind: "value_error".to_string(),
            });
        }
        if queries.is_empty() {
            errors.push(ValidationError {
                location: loc(&["queries"]),
                message: "must not be empty".to_string(),
                kind: "value_error".to_string(),
            });
        }
        for query in queries {
            if query.minzoom > query.maxzoom {
                errors.push(ValidationError {
                    location: loc(&["queries"]),
                    message: format!(
                        "query minzoom {} exceeds maxzoom {}",
                        query.minzoom, query.maxzoom
                    ),
                    kind: "value_error".to_string(),
                });
            }
        }
        return;
    }

    let Some(geom_field) = &layer.geom_field else {
        errors.push(ValidationError {
            location: loc(&["geomField"]),
            message: "required unless the layer carries raw SQL queries".to_string(),
            kind: "missing".to_string(),
        });
        return;
    };

    if let Some(filter) = &layer.filter {
        let Some(fields) = &layer.fields else {
            errors.push(ValidationError {
                location: loc(&["fields"]),
                message: "required when a filter is present".to_string(),
                kind: "missing".to_string(),
            });
            return;
        };
        for name in filter_field_refs(filter) {
            if name == *geom_field {
                continue;
            }
            if !fields.iter().any(|f| f.name == name) {
                errors.push(ValidationError {
                    location: loc(&["filter", &name]),
                    message: format!("filter references '{name}' which is not in 'fields'"),
                    kind: "missing".to_string(),
                });
            }
        }
    }
}

/// Field names referenced by a filter expression, i.e. its `["get", name]`
/// nodes at any depth.
pub fn filter_field_refs(filter: &Value) -> Vec<String> {
    let mut refs = Vec::new();
    collect_field_refs(filter, &mut refs);
    refs
}

fn collect_field_refs(node: &Value, refs: &mut Vec<String>) {
    if let Value::Array(items) = node {
        if let [Value::String(op), Value::String(name)] = items.as_slice() {
            if op == "get" {
                refs.push(name.clone());
                return;
            }
        }
        for item in items {
            collect_field_refs(item, refs);
        }
    }
}
