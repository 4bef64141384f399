//! Pipeline configuration
//!
//! A single [`FusionConfig`] is built once at start-up (from YAML or from
//! `Default`) and passed by reference to every stage. It is never mutated
//! after validation.

use crate::core::tiling::EdgePolicy;
use crate::io::subdataset::Grid;
use crate::types::{FusionError, FusionResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default)]
    pub tiling: TilingConfig,
    #[serde(default)]
    pub alignment: AlignmentConfig,
    #[serde(default)]
    pub coregistration: CoregistrationConfig,
    #[serde(default)]
    pub georeferencing: GeoreferencingConfig,
}

/// Tile sizes for the two inputs and batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingConfig {
    /// Tile edge in pixels for the high resolution raster (and the output)
    #[serde(default = "default_high_tile_size")]
    pub high_tile_size: usize,
    /// Tile edge in pixels for the low resolution raster
    #[serde(default = "default_low_tile_size")]
    pub low_tile_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub edge_policy: EdgePolicy,
}

fn default_high_tile_size() -> usize {
    500
}

fn default_low_tile_size() -> usize {
    10
}

fn default_batch_size() -> usize {
    1
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            high_tile_size: default_high_tile_size(),
            low_tile_size: default_low_tile_size(),
            batch_size: default_batch_size(),
            edge_policy: EdgePolicy::default(),
        }
    }
}

/// Geometry of the crop and trim steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Pixel size (ground units) the low resolution raster is warped to
    #[serde(default = "default_target_resolution")]
    pub target_resolution: f64,
    /// Upper-left pixel offset of the trim window on the low resolution raster
    #[serde(default = "default_trim_offset")]
    pub trim_offset: (usize, usize),
    /// Trim window size in low resolution pixels
    #[serde(default = "default_trim_size")]
    pub trim_size: (usize, usize),
}

fn default_target_resolution() -> f64 {
    500.0
}

fn default_trim_offset() -> (usize, usize) {
    (10, 10)
}

fn default_trim_size() -> (usize, usize) {
    (200, 200)
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            target_resolution: default_target_resolution(),
            trim_offset: default_trim_offset(),
            trim_size: default_trim_size(),
        }
    }
}

/// Parameters handed to the co-registration collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoregistrationConfig {
    /// Matching window edge (in low resolution pixels)
    #[serde(default = "default_window_size")]
    pub window_size: (usize, usize),
    /// 1-based band of the reference (high resolution) raster used for matching
    #[serde(default = "default_reference_band")]
    pub reference_band: usize,
    /// 1-based band of the moving (low resolution) raster used for matching
    #[serde(default = "default_moving_band")]
    pub moving_band: usize,
    /// Minimum reliability (percent) for a shift vector to be kept
    #[serde(default = "default_min_reliability")]
    pub min_reliability: f64,
    /// Shifts larger than this (in moving pixels) are discarded
    #[serde(default = "default_max_shift")]
    pub max_shift: f64,
}

fn default_window_size() -> (usize, usize) {
    (64, 64)
}

fn default_reference_band() -> usize {
    9
}

fn default_moving_band() -> usize {
    3
}

fn default_min_reliability() -> f64 {
    10.0
}

fn default_max_shift() -> f64 {
    5.0
}

impl Default for CoregistrationConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            reference_band: default_reference_band(),
            moving_band: default_moving_band(),
            min_reliability: default_min_reliability(),
            max_shift: default_max_shift(),
        }
    }
}

/// Sampling stride used when turning geolocation grids into GCPs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoreferencingConfig {
    #[serde(default = "default_an_dilation")]
    pub an_dilation: usize,
    #[serde(default = "default_in_dilation")]
    pub in_dilation: usize,
    #[serde(default = "default_fn_dilation")]
    pub fn_dilation: usize,
}

fn default_an_dilation() -> usize {
    300
}

fn default_in_dilation() -> usize {
    150
}

fn default_fn_dilation() -> usize {
    150
}

impl Default for GeoreferencingConfig {
    fn default() -> Self {
        Self {
            an_dilation: default_an_dilation(),
            in_dilation: default_in_dilation(),
            fn_dilation: default_fn_dilation(),
        }
    }
}

impl GeoreferencingConfig {
    pub fn dilation(&self, grid: Grid) -> usize {
        match grid {
            Grid::An => self.an_dilation,
            Grid::In => self.in_dilation,
            Grid::Fn => self.fn_dilation,
        }
    }
}

impl FusionConfig {
    /// Load and validate a YAML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> FusionResult<Self> {
        log::info!("Loading configuration from {}", path.as_ref().display());
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML content
    pub fn from_yaml(content: &str) -> FusionResult<Self> {
        let config: FusionConfig = serde_yaml::from_str(content)
            .map_err(|e| FusionError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FusionResult<()> {
        let t = &self.tiling;
        if t.high_tile_size == 0 || t.low_tile_size == 0 {
            return Err(FusionError::Config("tile sizes must be positive".to_string()));
        }
        if t.batch_size == 0 {
            return Err(FusionError::Config("batch size must be positive".to_string()));
        }

        let a = &self.alignment;
        if !(a.target_resolution > 0.0) {
            return Err(FusionError::Config(format!(
                "target resolution must be positive, got {}",
                a.target_resolution
            )));
        }
        if a.trim_size.0 == 0 || a.trim_size.1 == 0 {
            return Err(FusionError::Config("trim size must be positive".to_string()));
        }

        let c = &self.coregistration;
        if c.window_size.0 < 8 || c.window_size.1 < 8 {
            return Err(FusionError::Config(format!(
                "co-registration window {:?} is too small",
                c.window_size
            )));
        }
        if c.reference_band == 0 || c.moving_band == 0 {
            return Err(FusionError::Config("band indices are 1-based".to_string()));
        }
        if !(0.0..=100.0).contains(&c.min_reliability) {
            return Err(FusionError::Config(format!(
                "min reliability must be a percentage, got {}",
                c.min_reliability
            )));
        }

        let g = &self.georeferencing;
        if g.an_dilation == 0 || g.in_dilation == 0 || g.fn_dilation == 0 {
            return Err(FusionError::Config("grid dilation must be positive".to_string()));
        }

        Ok(())
    }

    /// Ratio between the low and high resolution tile sizes
    pub fn tile_ratio(&self) -> usize {
        self.tiling.high_tile_size / self.tiling.low_tile_size
    }
}
