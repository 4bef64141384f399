//! Raster handle and raster-library traits
//!
//! Everything the pipeline needs from a raster library goes through
//! [`RasterBackend`]. Every operation returns a new handle; inputs are never
//! modified in place.

use crate::types::{Bounds, FusionError, FusionResult, GeoTransform, RasterSize, TileCoordinate};
use ndarray::{Array2, Array3, ArrayView3};
use std::path::PathBuf;

/// Read access to a georeferenced raster
pub trait Raster {
    /// Path or other identifier the raster was opened from
    fn description(&self) -> String;

    fn geo_transform(&self) -> FusionResult<GeoTransform>;

    /// Projection as WKT or any identifier the backend understands
    fn projection(&self) -> String;

    fn size(&self) -> RasterSize;

    fn band_count(&self) -> usize;

    /// Read all bands inside `window` as `(band, row, col)`
    fn read_window(&self, window: &TileCoordinate) -> FusionResult<Array3<f32>>;

    /// Read one full band (1-based) at double precision
    fn read_band(&self, band: usize) -> FusionResult<Array2<f64>>;

    fn metadata_item(&self, key: &str, domain: &str) -> Option<String>;

    /// Ground footprint of the raster
    fn bounds(&self) -> FusionResult<Bounds> {
        Ok(Bounds::from_geotransform(&self.geo_transform()?, self.size()))
    }
}

/// Write access, used for output rasters
pub trait WritableRaster: Raster {
    fn write_window(&mut self, window: &TileCoordinate, data: ArrayView3<f32>) -> FusionResult<()>;

    fn set_metadata_item(&mut self, key: &str, value: &str, domain: &str) -> FusionResult<()>;

    fn band_metadata_item(&self, band: usize, key: &str, domain: &str) -> Option<String>;

    fn set_band_metadata_item(
        &mut self,
        band: usize,
        key: &str,
        value: &str,
        domain: &str,
    ) -> FusionResult<()>;

    fn flush(&mut self) -> FusionResult<()> {
        Ok(())
    }
}

/// Crop window for [`RasterBackend::window_crop`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Window {
    /// Pixel offset and size
    Pixels(TileCoordinate),
    /// Ground-unit box in the raster's own CRS
    Ground(Bounds),
}

/// Target grid of a reprojection
#[derive(Debug, Clone, PartialEq)]
pub struct ReprojectRequest {
    pub bounds: Bounds,
    pub src_crs: String,
    pub dst_crs: String,
    pub resolution: f64,
}

/// Geometry of a raster to allocate
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSpec {
    /// Destination file; `None` keeps the raster in memory
    pub path: Option<PathBuf>,
    pub geo_transform: GeoTransform,
    pub projection: String,
    pub size: RasterSize,
    pub bands: usize,
}

/// Operations consumed from the raster library
pub trait RasterBackend {
    type Raster: WritableRaster;

    fn open(&self, path: &str) -> FusionResult<Self::Raster>;

    /// Warp `raster` into `request.dst_crs` on a grid aligned to `request.resolution`
    fn reproject_and_crop(
        &self,
        raster: &Self::Raster,
        request: &ReprojectRequest,
    ) -> FusionResult<Self::Raster>;

    /// Stack the inputs into one multi-band raster at the highest input resolution
    fn build_mosaic(&self, bands: &[Self::Raster]) -> FusionResult<Self::Raster>;

    fn window_crop(&self, raster: &Self::Raster, window: &Window) -> FusionResult<Self::Raster>;

    fn create(&self, spec: &RasterSpec) -> FusionResult<Self::Raster>;

    /// Wrap a `(band, row, col)` array as a georeferenced raster
    fn from_array(
        &self,
        data: Array3<f32>,
        geo_transform: GeoTransform,
        projection: &str,
    ) -> FusionResult<Self::Raster>;
}

/// Pixel window of `size` covering `bounds`, rounded to whole pixels
pub fn pixel_window_for_bounds(
    gt: &GeoTransform,
    size: RasterSize,
    bounds: &Bounds,
) -> FusionResult<TileCoordinate> {
    let inverse = gt.invert().ok_or_else(|| {
        FusionError::InvalidGeometry(format!("Geotransform {:?} is not invertible", gt))
    })?;

    let corners = [
        inverse.apply(bounds.x_min, bounds.y_min),
        inverse.apply(bounds.x_max, bounds.y_min),
        inverse.apply(bounds.x_min, bounds.y_max),
        inverse.apply(bounds.x_max, bounds.y_max),
    ];
    let p_min = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
    let p_max = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
    let l_min = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
    let l_max = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);

    let x = p_min.round();
    let y = l_min.round();
    let width = (p_max - p_min).round();
    let height = (l_max - l_min).round();

    if x < 0.0 || y < 0.0 || width < 1.0 || height < 1.0 {
        return Err(FusionError::InvalidGeometry(format!(
            "Bounds {:?} fall outside the raster (pixel window {}, {}, {}, {})",
            bounds, x, y, width, height
        )));
    }

    let window = TileCoordinate::new(x as usize, y as usize, width as usize, height as usize);
    if !window.fits_within(size) {
        return Err(FusionError::InvalidGeometry(format!(
            "Pixel window {:?} exceeds raster size {}x{}",
            window, size.width, size.height
        )));
    }
    Ok(window)
}
