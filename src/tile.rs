//! Tile coordinates, extensions and Web Mercator grid math.

use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use crate::datasource::{Bounds, Kind};

/// Hard ceiling on zoom levels served by any datasource.
pub const MAX_ZOOM: u8 = 22;

/// Web Mercator latitude clamp.
const MAX_LAT: f64 = 85.05112878;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileExt {
    Png,
    Jpg,
    Webp,
    Mvt,
    Pbf,
}

impl TileExt {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpg => "image/jpeg",
            Self::Webp => "image/webp",
            Self::Mvt => "application/vnd.mapbox-vector-tile",
            Self::Pbf => "application/x-protobuf",
        }
    }

    /// Raster datasources answer image payloads, vector ones MVT/PBF.
    pub fn matches_kind(&self, kind: Kind) -> bool {
        match self {
            Self::Png | Self::Jpg | Self::Webp => kind == Kind::Raster,
            Self::Mvt | Self::Pbf => kind == Kind::Vector,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Webp => "webp",
            Self::Mvt => "mvt",
            Self::Pbf => "pbf",
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Mvt | Self::Pbf)
    }
}

impl FromStr for TileExt {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "png" => Ok(Self::Png),
            "jpg" => Ok(Self::Jpg),
            "webp" => Ok(Self::Webp),
            "mvt" => Ok(Self::Mvt),
            "pbf" => Ok(Self::Pbf),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TileExt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressable tile of one datasource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub datasource_id: String,
    pub z: u8,
    pub x: u32,
    pub y: u32,
    pub ext: TileExt,
}

impl TileCoord {
    /// Whether `(z, x, y)` lies on the tile grid at all.
    pub fn on_grid(&self) -> bool {
        self.z <= MAX_ZOOM && (self.x as u64) < (1u64 << self.z) && (self.y as u64) < (1u64 << self.z)
    }

    /// Stable key for request coalescing.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Request path of this tile on a dispatcher node.
    pub fn uri_path(&self) -> String {
        format!(
            "/api/tile/{}/{}/{}/{}.{}",
            self.datasource_id, self.z, self.x, self.y, self.ext
        )
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}.{}",
            self.datasource_id, self.z, self.x, self.y, self.ext
        )
    }
}

fn lng_to_x(lng: f64, z: u8) -> u32 {
    let n = (1u64 << z) as f64;
    let x = (lng + 180.0) / 360.0 * n;
    (x.floor() as i64).clamp(0, (1i64 << z) - 1) as u32
}

fn lat_to_y(lat: f64, z: u8) -> u32 {
    let lat = lat.clamp(-MAX_LAT, MAX_LAT).to_radians();
    let n = (1u64 << z) as f64;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / std::f64::consts::PI) / 2.0 * n;
    (y.floor() as i64).clamp(0, (1i64 << z) - 1) as u32
}

/// Inclusive tile index ranges covering `bounds` at zoom `z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub x_min: u32,
    pub x_max: u32,
    pub y_min: u32,
    pub y_max: u32,
}

impl TileRange {
    pub fn of(bounds: &Bounds, z: u8) -> Self {
        // Tile y grows southwards, so the north edge gives y_min.
        Self {
            x_min: lng_to_x(bounds.lng_w, z),
            x_max: lng_to_x(bounds.lng_e, z),
            y_min: lat_to_y(bounds.lat_n, z),
            y_max: lat_to_y(bounds.lat_s, z),
        }
    }

    pub fn full(z: u8) -> Self {
        let max = ((1u64 << z) - 1) as u32;
        Self {
            x_min: 0,
            x_max: max,
            y_min: 0,
            y_max: max,
        }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        (self.x_min..=self.x_max).contains(&x) && (self.y_min..=self.y_max).contains(&y)
    }

    pub fn count(&self) -> u64 {
        (self.x_max - self.x_min + 1) as u64 * (self.y_max - self.y_min + 1) as u64
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let ys = self.y_min..=self.y_max;
        ys.flat_map(move |y| (self.x_min..=self.x_max).map(move |x| (x, y)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::Bounds;

    fn coord(z: u8, x: u32, y: u32) -> TileCoord {
        TileCoord {
            datasource_id: "d1".to_string(),
            z,
            x,
            y,
            ext: TileExt::Png,
        }
    }

    #[test]
    fn grid_limits() {
        assert!(coord(0, 0, 0).on_grid());
        assert!(coord(3, 7, 7).on_grid());
        assert!(!coord(3, 8, 0).on_grid());
        assert!(!coord(3, 0, 8).on_grid());
        assert!(!coord(23, 0, 0).on_grid());
        assert!(coord(22, (1 << 22) - 1, 0).on_grid());
    }

    #[test]
    fn fingerprint_is_stable_and_distinguishes() {
        assert_eq!(coord(3, 4, 5).fingerprint(), coord(3, 4, 5).fingerprint());
        assert_ne!(coord(3, 4, 5).fingerprint(), coord(3, 5, 4).fingerprint());
        let mut other = coord(3, 4, 5);
        other.ext = TileExt::Webp;
        assert_ne!(coord(3, 4, 5).fingerprint(), other.fingerprint());
    }

    #[test]
    fn ext_parse_and_content_type() {
        assert_eq!("png".parse::<TileExt>().unwrap(), TileExt::Png);
        assert_eq!("pbf".parse::<TileExt>().unwrap(), TileExt::Pbf);
        assert!("gif".parse::<TileExt>().is_err());
        assert_eq!(TileExt::Mvt.content_type(), "application/vnd.mapbox-vector-tile");
        assert!(TileExt::Png.matches_kind(Kind::Raster));
        assert!(!TileExt::Png.matches_kind(Kind::Vector));
        assert!(TileExt::Mvt.matches_kind(Kind::Vector));
    }

    #[test]
    fn world_bounds_cover_everything() {
        let world = Bounds {
            lng_w: -180.0,
            lat_s: -85.0,
            lng_e: 180.0,
            lat_n: 85.0,
        };
        assert_eq!(TileRange::of(&world, 0), TileRange::full(0));
        assert_eq!(TileRange::of(&world, 3), TileRange::full(3));
    }

    #[test]
    fn small_bounds_exclude_far_tiles() {
        // Roughly central Europe.
        let bounds = Bounds {
            lng_w: 5.0,
            lat_s: 45.0,
            lng_e: 15.0,
            lat_n: 55.0,
        };
        let range = TileRange::of(&bounds, 10);
        assert!(!range.contains(0, 0));
        // Munich at z10 is around (545, 354).
        assert!(range.contains(545, 354));
        assert!(range.count() > 0);
    }

    #[test]
    fn range_iteration_matches_count() {
        let bounds = Bounds {
            lng_w: 5.0,
            lat_s: 45.0,
            lng_e: 15.0,
            lat_n: 55.0,
        };
        let range = TileRange::of(&bounds, 6);
        let tiles: Vec<_> = range.iter().collect();
        assert_eq!(tiles.len() as u64, range.count());
        for (x, y) in tiles {
            assert!(range.contains(x, y));
        }
    }
}
