use axum_extra::routing::TypedPath;
use serde::Deserialize;

/////////////
// Tile api //
/////////////

#[derive(Deserialize, TypedPath)]
#[typed_path("/api/tile/:id/:z/:x/:y_ext")]
pub struct PathApiTile {
    pub id: String,
    pub z: u8,
    pub x: u32,
    /// Trailing segment `y.ext`, split by the handler.
    pub y_ext: String,
}

#[derive(Deserialize, TypedPath)]
#[typed_path("/api/pyramid")]
pub struct PathApiPyramid {}

/////////////////
// Datasources //
/////////////////

#[derive(Deserialize, TypedPath)]
#[typed_path("/api/datasources")]
pub struct PathApiDatasources {}

#[derive(Deserialize, TypedPath)]
#[typed_path("/api/datasources/:id")]
pub struct PathApiDatasourceById {
    pub id: String,
}

#[derive(Deserialize, TypedPath)]
#[typed_path("/api/datasources/load_files")]
pub struct PathApiDatasourcesLoadFiles {}

#[derive(Deserialize, TypedPath)]
#[typed_path("/api/datasources/reload_files")]
pub struct PathApiDatasourcesReloadFiles {}

//////////
// Jobs //
//////////

#[derive(Deserialize, TypedPath)]
#[typed_path("/api/jobs")]
pub struct PathApiJobs {}

#[derive(Deserialize, TypedPath)]
#[typed_path("/api/jobs/:job_id")]
pub struct PathApiJobById {
    pub job_id: String,
}

/////////////////
// Maintenance //
/////////////////

#[derive(Deserialize, TypedPath)]
#[typed_path("/maintenance/add_workers")]
pub struct PathMaintenanceAddWorkers {}

#[derive(Deserialize, TypedPath)]
#[typed_path("/maintenance/reload_workers")]
pub struct PathMaintenanceReloadWorkers {}

#[derive(Deserialize, TypedPath)]
#[typed_path("/maintenance/terminate_workers")]
pub struct PathMaintenanceTerminateWorkers {}

#[derive(Deserialize, TypedPath)]
#[typed_path("/maintenance/info_workers")]
pub struct PathMaintenanceInfoWorkers {}

//////////
// Misc //
//////////

#[derive(Deserialize, TypedPath)]
#[typed_path("/health")]
pub struct PathHealth {}
