//! msifuse: Sentinel-2 MSI and Sentinel-3 SLSTR fusion pipeline
//!
//! This library aligns a Sentinel-2 L1C raster and a Sentinel-3 SLSTR
//! (RBT + LST) raster into pixel-for-pixel correspondence, then drives
//! patch-wise model inference over matched tiles and reassembles the fused
//! output as a geocoded raster.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::FusionConfig;
pub use types::{
    Bounds, FusionError, FusionResult, GeoTransform, GroundControlPoint, RasterSize,
    TileCoordinate,
};

pub use crate::core::{AlignmentPipeline, FusionRunner, MosaicBuilder, TileDispatcher};
pub use io::{Archive, MemoryBackend, ProductFamily, Raster, RasterBackend};
#[cfg(feature = "gdal")]
pub use io::GdalBackend;
