//! In-memory raster backend
//!
//! Pure ndarray implementation of [`RasterBackend`]. Reprojection is limited
//! to re-gridding within one CRS; resampling is nearest neighbour.

use crate::io::raster::{
    pixel_window_for_bounds, Raster, RasterBackend, RasterSpec, ReprojectRequest, Window,
    WritableRaster,
};
use crate::types::{Bounds, FusionError, FusionResult, GeoTransform, RasterSize, TileCoordinate};
use ndarray::{s, Array2, Array3, ArrayView3, Axis};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

type MetadataDomains = BTreeMap<String, BTreeMap<String, String>>;

/// Raster held entirely in memory as `(band, row, col)` doubles
#[derive(Debug, Clone)]
pub struct MemRaster {
    description: String,
    data: Array3<f64>,
    geo_transform: GeoTransform,
    projection: String,
    metadata: MetadataDomains,
    band_metadata: Vec<MetadataDomains>,
}

impl MemRaster {
    pub fn new(
        description: impl Into<String>,
        data: Array3<f64>,
        geo_transform: GeoTransform,
        projection: impl Into<String>,
    ) -> Self {
        let bands = data.len_of(Axis(0));
        Self {
            description: description.into(),
            data,
            geo_transform,
            projection: projection.into(),
            metadata: MetadataDomains::new(),
            band_metadata: vec![MetadataDomains::new(); bands],
        }
    }

    /// Single-band raster from a 2-D array
    pub fn from_band(
        description: impl Into<String>,
        band: Array2<f64>,
        geo_transform: GeoTransform,
        projection: impl Into<String>,
    ) -> Self {
        let data = band.insert_axis(Axis(0));
        Self::new(description, data, geo_transform, projection)
    }

    /// Builder-style metadata setter
    pub fn with_metadata(mut self, key: &str, value: &str, domain: &str) -> Self {
        self.metadata
            .entry(domain.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    /// All items of one metadata domain
    pub fn metadata_domain(&self, domain: &str) -> BTreeMap<String, String> {
        self.metadata.get(domain).cloned().unwrap_or_default()
    }

    fn check_window(&self, window: &TileCoordinate) -> FusionResult<()> {
        if !window.fits_within(self.size()) {
            return Err(FusionError::InvalidGeometry(format!(
                "Window {:?} exceeds raster {} ({}x{})",
                window,
                self.description,
                self.size().width,
                self.size().height
            )));
        }
        Ok(())
    }

    fn band_index(&self, band: usize) -> FusionResult<usize> {
        if band == 0 || band > self.band_count() {
            return Err(FusionError::InvalidGeometry(format!(
                "Band {} out of range for raster {} with {} bands",
                band,
                self.description,
                self.band_count()
            )));
        }
        Ok(band - 1)
    }
}

impl Raster for MemRaster {
    fn description(&self) -> String {
        self.description.clone()
    }

    fn geo_transform(&self) -> FusionResult<GeoTransform> {
        Ok(self.geo_transform)
    }

    fn projection(&self) -> String {
        self.projection.clone()
    }

    fn size(&self) -> RasterSize {
        let (_, rows, cols) = self.data.dim();
        RasterSize::new(cols, rows)
    }

    fn band_count(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    fn read_window(&self, window: &TileCoordinate) -> FusionResult<Array3<f32>> {
        self.check_window(window)?;
        let view = self.data.slice(s![
            ..,
            window.y..window.y + window.height,
            window.x..window.x + window.width
        ]);
        Ok(view.mapv(|v| v as f32))
    }

    fn read_band(&self, band: usize) -> FusionResult<Array2<f64>> {
        let index = self.band_index(band)?;
        Ok(self.data.index_axis(Axis(0), index).to_owned())
    }

    fn metadata_item(&self, key: &str, domain: &str) -> Option<String> {
        self.metadata.get(domain).and_then(|d| d.get(key)).cloned()
    }
}

impl WritableRaster for MemRaster {
    fn write_window(&mut self, window: &TileCoordinate, data: ArrayView3<f32>) -> FusionResult<()> {
        self.check_window(window)?;
        let expected = (self.band_count(), window.height, window.width);
        if data.dim() != expected {
            return Err(FusionError::InvalidGeometry(format!(
                "Array of shape {:?} does not match window shape {:?}",
                data.dim(),
                expected
            )));
        }

        self.data
            .slice_mut(s![
                ..,
                window.y..window.y + window.height,
                window.x..window.x + window.width
            ])
            .zip_mut_with(&data, |dst, &src| *dst = src as f64);
        Ok(())
    }

    fn set_metadata_item(&mut self, key: &str, value: &str, domain: &str) -> FusionResult<()> {
        self.metadata
            .entry(domain.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn band_metadata_item(&self, band: usize, key: &str, domain: &str) -> Option<String> {
        let index = self.band_index(band).ok()?;
        self.band_metadata[index]
            .get(domain)
            .and_then(|d| d.get(key))
            .cloned()
    }

    fn set_band_metadata_item(
        &mut self,
        band: usize,
        key: &str,
        value: &str,
        domain: &str,
    ) -> FusionResult<()> {
        let index = self.band_index(band)?;
        self.band_metadata[index]
            .entry(domain.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Nearest-neighbour resampling of every band onto a target grid.
/// Target pixels whose centre falls outside the source are zero.
pub fn resample_nearest(
    source: &MemRaster,
    target_transform: &GeoTransform,
    target_size: RasterSize,
) -> FusionResult<Array3<f64>> {
    let inverse = source.geo_transform.invert().ok_or_else(|| {
        FusionError::InvalidGeometry(format!(
            "Geotransform of {} is not invertible",
            source.description
        ))
    })?;

    let src_size = source.size();
    let mut output = Array3::zeros((source.band_count(), target_size.height, target_size.width));

    for row in 0..target_size.height {
        for col in 0..target_size.width {
            // Target pixel centre to ground, then into source pixel space
            let (x, y) = target_transform.apply(col as f64 + 0.5, row as f64 + 0.5);
            let (p, l) = inverse.apply(x, y);
            if p < 0.0 || l < 0.0 {
                continue;
            }
            let (sc, sr) = (p.floor() as usize, l.floor() as usize);
            if sc >= src_size.width || sr >= src_size.height {
                continue;
            }
            for band in 0..source.band_count() {
                output[[band, row, col]] = source.data[[band, sr, sc]];
            }
        }
    }

    Ok(output)
}

/// Pure-Rust raster backend.
///
/// `open` resolves paths against rasters registered beforehand with
/// [`MemoryBackend::register`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    registry: RefCell<HashMap<String, MemRaster>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `raster` available to [`RasterBackend::open`] under `path`
    pub fn register(&self, path: impl Into<String>, raster: MemRaster) {
        self.registry.borrow_mut().insert(path.into(), raster);
    }
}

impl RasterBackend for MemoryBackend {
    type Raster = MemRaster;

    fn open(&self, path: &str) -> FusionResult<MemRaster> {
        self.registry
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| FusionError::InvalidPath(format!("No raster registered at {}", path)))
    }

    fn reproject_and_crop(
        &self,
        raster: &MemRaster,
        request: &ReprojectRequest,
    ) -> FusionResult<MemRaster> {
        if !request.src_crs.is_empty() && request.src_crs != request.dst_crs {
            return Err(FusionError::Processing(format!(
                "In-memory backend cannot reproject from '{}' to '{}'",
                request.src_crs, request.dst_crs
            )));
        }
        let res = request.resolution;
        if !(res > 0.0) {
            return Err(FusionError::InvalidGeometry(format!(
                "Target resolution must be positive, got {}",
                res
            )));
        }

        // Target-aligned pixels: snap the bounds outwards to multiples of the resolution
        let b = &request.bounds;
        let aligned = Bounds {
            x_min: (b.x_min / res).floor() * res,
            y_min: (b.y_min / res).floor() * res,
            x_max: (b.x_max / res).ceil() * res,
            y_max: (b.y_max / res).ceil() * res,
        };
        let size = RasterSize::new(
            (aligned.width() / res).round() as usize,
            (aligned.height() / res).round() as usize,
        );
        if size.width == 0 || size.height == 0 {
            return Err(FusionError::InvalidGeometry(format!(
                "Empty target grid for bounds {:?}",
                request.bounds
            )));
        }

        let gt = GeoTransform::north_up(aligned.x_min, aligned.y_max, res);
        log::debug!(
            "Warping {} onto {}x{} grid at {} units",
            raster.description,
            size.width,
            size.height,
            res
        );

        let data = resample_nearest(raster, &gt, size)?;
        Ok(MemRaster::new(
            format!("{} (warped)", raster.description),
            data,
            gt,
            request.dst_crs.clone(),
        ))
    }

    fn build_mosaic(&self, bands: &[MemRaster]) -> FusionResult<MemRaster> {
        let first = bands.first().ok_or_else(|| {
            FusionError::Processing("Cannot build a mosaic from zero rasters".to_string())
        })?;

        if let Some(other) = bands.iter().find(|b| b.projection != first.projection) {
            return Err(FusionError::Processing(format!(
                "Mosaic inputs use different projections: '{}' and '{}'",
                first.projection, other.projection
            )));
        }

        // Highest resolution wins; the extent is the union of all inputs
        let mut finest = first;
        let mut extent = first.bounds()?;
        for band in &bands[1..] {
            if band.geo_transform.resolution().0 < finest.geo_transform.resolution().0 {
                finest = band;
            }
            extent = extent.union(&band.bounds()?);
        }

        let (res_x, res_y) = finest.geo_transform.resolution();
        let gt = GeoTransform {
            top_left_x: extent.x_min,
            pixel_width: res_x,
            rotation_x: 0.0,
            top_left_y: extent.y_max,
            rotation_y: 0.0,
            pixel_height: -res_y,
        };
        let size = RasterSize::new(
            (extent.width() / res_x).round() as usize,
            (extent.height() / res_y).round() as usize,
        );

        let band_total: usize = bands.iter().map(|b| b.band_count()).sum();
        let mut data = Array3::zeros((band_total, size.height, size.width));
        let mut next = 0;
        for band in bands {
            let resampled = if band.geo_transform == gt && band.size() == size {
                band.data.clone()
            } else {
                resample_nearest(band, &gt, size)?
            };
            let count = band.band_count();
            data.slice_mut(s![next..next + count, .., ..]).assign(&resampled);
            next += count;
        }

        log::debug!(
            "Built {}-band mosaic of {}x{} pixels",
            band_total,
            size.width,
            size.height
        );
        Ok(MemRaster::new("mosaic", data, gt, first.projection.clone()))
    }

    fn window_crop(&self, raster: &MemRaster, window: &Window) -> FusionResult<MemRaster> {
        let pixels = match window {
            Window::Pixels(w) => *w,
            Window::Ground(bounds) => {
                pixel_window_for_bounds(&raster.geo_transform, raster.size(), bounds)?
            }
        };
        raster.check_window(&pixels)?;

        let data = raster
            .data
            .slice(s![
                ..,
                pixels.y..pixels.y + pixels.height,
                pixels.x..pixels.x + pixels.width
            ])
            .to_owned();
        let gt = raster.geo_transform.offset_by(pixels.x as f64, pixels.y as f64);

        let mut cropped = MemRaster::new(
            format!("{} (cropped)", raster.description),
            data,
            gt,
            raster.projection.clone(),
        );
        cropped.metadata = raster.metadata.clone();
        cropped.band_metadata = raster.band_metadata.clone();
        Ok(cropped)
    }

    fn create(&self, spec: &RasterSpec) -> FusionResult<MemRaster> {
        let description = spec
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string());
        let data = Array3::zeros((spec.bands, spec.size.height, spec.size.width));
        Ok(MemRaster::new(
            description,
            data,
            spec.geo_transform,
            spec.projection.clone(),
        ))
    }

    fn from_array(
        &self,
        data: Array3<f32>,
        geo_transform: GeoTransform,
        projection: &str,
    ) -> FusionResult<MemRaster> {
        Ok(MemRaster::new(
            "memory",
            data.mapv(|v| v as f64),
            geo_transform,
            projection,
        ))
    }
}
