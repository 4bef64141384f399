//! NetCDF sub-raster addressing and scaled reads
//!
//! Sentinel-3 variables are stored as scaled integers and addressed through
//! the `PREFIX:"<file-path>":<subdataset-name>` syntax.

use crate::io::raster::{Raster, RasterBackend};
use crate::types::{FusionError, FusionResult};
use ndarray::Array2;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Geolocation grid a variable belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grid {
    /// Full resolution (optical bands)
    An,
    /// Half resolution (thermal bands)
    In,
    /// Half resolution, slightly offset from `In`
    Fn,
}

impl Grid {
    /// Grid from the variable name suffix, e.g. `S7_BT_in` -> `In`
    pub fn from_name(name: &str) -> Option<Grid> {
        match name.rsplit('_').next()? {
            "an" => Some(Grid::An),
            "in" => Some(Grid::In),
            "fn" => Some(Grid::Fn),
            _ => None,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Grid::An => "an",
            Grid::In => "in",
            Grid::Fn => "fn",
        }
    }
}

impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Parsed `PREFIX:"<file-path>":<subdataset-name>` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdatasetPath {
    pub prefix: String,
    pub file: PathBuf,
    pub name: String,
}

impl SubdatasetPath {
    pub fn new(prefix: &str, file: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            file: file.into(),
            name: name.to_string(),
        }
    }

    /// NetCDF variable `name` inside `file`
    pub fn netcdf(file: impl Into<PathBuf>, name: &str) -> Self {
        Self::new("NETCDF", file, name)
    }

    /// Parse an address. The quoted file path may itself contain `:`.
    pub fn parse(address: &str) -> FusionResult<Self> {
        let pattern = Regex::new(r#"^([A-Za-z0-9_]+):"([^"]+)":([^:"]+)$"#)
            .map_err(|e| FusionError::Processing(e.to_string()))?;
        let caps = pattern
            .captures(address)
            .ok_or_else(|| FusionError::MalformedSubdatasetPath(address.to_string()))?;

        Ok(Self {
            prefix: caps[1].to_string(),
            file: PathBuf::from(&caps[2]),
            name: caps[3].to_string(),
        })
    }

    /// Directory holding the file, where the geodetic grids live too
    pub fn directory(&self) -> &Path {
        self.file.parent().unwrap_or_else(|| Path::new(""))
    }

    /// Addresses of the longitude, latitude and elevation grids for `grid`
    pub fn geodetic_siblings(&self, grid: Grid) -> GeodeticPaths {
        let file = self.directory().join(format!("geodetic_{}.nc", grid));
        GeodeticPaths {
            longitude: Self::new(&self.prefix, file.clone(), &format!("longitude_{}", grid)),
            latitude: Self::new(&self.prefix, file.clone(), &format!("latitude_{}", grid)),
            elevation: Self::new(&self.prefix, file, &format!("elevation_{}", grid)),
        }
    }
}

impl fmt::Display for SubdatasetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:\"{}\":{}", self.prefix, self.file.display(), self.name)
    }
}

/// Addresses of the three geolocation grids of one grid family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeodeticPaths {
    pub longitude: SubdatasetPath,
    pub latitude: SubdatasetPath,
    pub elevation: SubdatasetPath,
}

/// Raster whose stored values become physical through `raw * scale + offset`
#[derive(Debug)]
pub struct ScaledSubRaster<R> {
    pub raster: R,
    pub path: SubdatasetPath,
    pub grid: Grid,
    pub scale: f64,
    pub offset: f64,
}

impl<R: Raster> ScaledSubRaster<R> {
    /// Wrap an opened raster, reading `<name>#scale_factor` and
    /// `<name>#add_offset` from its default metadata domain.
    /// `grid` overrides the grid derived from the variable name.
    pub fn new(raster: R, path: SubdatasetPath, grid: Option<Grid>) -> FusionResult<Self> {
        let grid = grid.or_else(|| Grid::from_name(&path.name)).ok_or_else(|| {
            FusionError::MalformedSubdatasetPath(format!(
                "{} (no geolocation grid suffix in '{}')",
                path, path.name
            ))
        })?;

        let scale = Self::numeric_item(&raster, &format!("{}#scale_factor", path.name))?.unwrap_or(1.0);
        let offset = Self::numeric_item(&raster, &format!("{}#add_offset", path.name))?.unwrap_or(0.0);
        log::debug!("{}: grid {}, scale {}, offset {}", path, grid, scale, offset);

        Ok(Self {
            raster,
            path,
            grid,
            scale,
            offset,
        })
    }

    fn numeric_item(raster: &R, key: &str) -> FusionResult<Option<f64>> {
        match raster.metadata_item(key, "") {
            Some(value) => value.trim().parse::<f64>().map(Some).map_err(|e| {
                FusionError::Processing(format!("Invalid metadata value {}='{}': {}", key, value, e))
            }),
            None => Ok(None),
        }
    }

    /// Physical values of band 1
    pub fn read_physical(&self) -> FusionResult<Array2<f64>> {
        let raw = self.raster.read_band(1)?;
        let (scale, offset) = (self.scale, self.offset);
        Ok(raw.mapv(|v| v * scale + offset))
    }

    pub fn geodetic_paths(&self) -> GeodeticPaths {
        self.path.geodetic_siblings(self.grid)
    }
}

/// Open `path` through `backend` as a scaled sub-raster
pub fn open_scaled<B: RasterBackend>(
    backend: &B,
    path: &SubdatasetPath,
    grid: Option<Grid>,
) -> FusionResult<ScaledSubRaster<B::Raster>> {
    let raster = backend.open(&path.to_string())?;
    ScaledSubRaster::new(raster, path.clone(), grid)
}
