//! Geometric alignment of the high and low resolution rasters
//!
//! The pipeline runs Crop, Coregister, TrimLow and TrimHigh in that order.
//! Each step produces new raster handles; a failing step aborts the run
//! with [`FusionError::AlignmentFailure`].

use crate::config::FusionConfig;
use crate::core::coregister::Coregistrar;
use crate::io::raster::{Raster, RasterBackend, ReprojectRequest, Window};
use crate::types::{FusionError, FusionResult, TileCoordinate};
use std::fmt;

/// Steps of the alignment pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentStage {
    Crop,
    Coregister,
    TrimLow,
    TrimHigh,
    Validate,
}

impl fmt::Display for AlignmentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlignmentStage::Crop => "crop",
            AlignmentStage::Coregister => "co-registration",
            AlignmentStage::TrimLow => "low resolution trim",
            AlignmentStage::TrimHigh => "high resolution trim",
            AlignmentStage::Validate => "validation",
        };
        f.write_str(name)
    }
}

/// Two rasters covering the same footprint with an integral resolution ratio
#[derive(Debug)]
pub struct AlignedPair<R> {
    pub high: R,
    pub low: R,
    /// High resolution pixels per low resolution pixel, along each axis
    pub ratio: usize,
    /// Co-registration shift applied to the low resolution raster (pixels)
    pub shift: (f64, f64),
}

pub struct AlignmentPipeline<'a, B: RasterBackend, C: Coregistrar> {
    backend: &'a B,
    coregistrar: &'a C,
    config: &'a FusionConfig,
}

fn stage_error(stage: AlignmentStage, error: FusionError) -> FusionError {
    match error {
        FusionError::AlignmentFailure(message) => {
            FusionError::AlignmentFailure(format!("{} failed: {}", stage, message))
        }
        other => FusionError::AlignmentFailure(format!("{} failed: {}", stage, other)),
    }
}

impl<'a, B: RasterBackend, C: Coregistrar> AlignmentPipeline<'a, B, C> {
    pub fn new(backend: &'a B, coregistrar: &'a C, config: &'a FusionConfig) -> Self {
        Self {
            backend,
            coregistrar,
            config,
        }
    }

    /// Run every step on `high` (reference) and `low` (moving)
    pub fn run(&self, high: B::Raster, low: B::Raster) -> FusionResult<AlignedPair<B::Raster>> {
        log::info!("Starting alignment of {} onto {}", low.description(), high.description());

        let low = self.step(AlignmentStage::Crop, || self.crop(&high, &low))?;
        let (low, shift) = self.step(AlignmentStage::Coregister, || self.coregister(&high, &low))?;
        let low = self.step(AlignmentStage::TrimLow, || self.trim_low(&low))?;
        let high = self.step(AlignmentStage::TrimHigh, || self.trim_high(&high, &low))?;
        let ratio = self.step(AlignmentStage::Validate, || self.validate(&high, &low))?;

        log::info!(
            "Alignment complete: high {}x{}, low {}x{}, ratio {}",
            high.size().width,
            high.size().height,
            low.size().width,
            low.size().height,
            ratio
        );
        Ok(AlignedPair {
            high,
            low,
            ratio,
            shift,
        })
    }

    fn step<T>(
        &self,
        stage: AlignmentStage,
        f: impl FnOnce() -> FusionResult<T>,
    ) -> FusionResult<T> {
        log::info!("Alignment stage: {}", stage);
        f().map_err(|e| {
            log::warn!("Alignment stage {} failed: {}", stage, e);
            stage_error(stage, e)
        })
    }

    /// Warp `low` onto the footprint of `high`, in the CRS of `high`, at the
    /// target resolution
    pub fn crop(&self, high: &B::Raster, low: &B::Raster) -> FusionResult<B::Raster> {
        let bounds = high.bounds()?;
        log::debug!("Crop bounds {:?}", bounds);
        let request = ReprojectRequest {
            bounds,
            src_crs: low.projection(),
            dst_crs: high.projection(),
            resolution: self.config.alignment.target_resolution,
        };
        self.backend.reproject_and_crop(low, &request)
    }

    /// Shift `low` onto `high`; the result may cover a smaller area
    pub fn coregister(
        &self,
        high: &B::Raster,
        low: &B::Raster,
    ) -> FusionResult<(B::Raster, (f64, f64))> {
        let result = self
            .coregistrar
            .coregister(high, low, &self.config.coregistration)?;
        log::debug!(
            "Co-registered raster is {:?} at {:?}",
            result.data.dim(),
            result.geo_transform.coefficients()
        );
        let raster = self
            .backend
            .from_array(result.data, result.geo_transform, &result.projection)?;
        Ok((raster, result.shift))
    }

    /// Fixed pixel window of `low`, away from co-registration edge effects
    pub fn trim_low(&self, low: &B::Raster) -> FusionResult<B::Raster> {
        let (x, y) = self.config.alignment.trim_offset;
        let (width, height) = self.config.alignment.trim_size;
        let window = TileCoordinate::new(x, y, width, height);
        if !window.fits_within(low.size()) {
            return Err(FusionError::AlignmentFailure(format!(
                "Trim window {:?} exceeds the {}x{} low resolution raster",
                window,
                low.size().width,
                low.size().height
            )));
        }
        self.backend.window_crop(low, &Window::Pixels(window))
    }

    /// Crop `high` to the ground footprint of `low`
    pub fn trim_high(&self, high: &B::Raster, low: &B::Raster) -> FusionResult<B::Raster> {
        let footprint = low.bounds()?;
        log::debug!("Trimming high resolution raster to {:?}", footprint);
        self.backend.window_crop(high, &Window::Ground(footprint))
    }

    /// Check that the pair shares its footprint and that the resolution ratio
    /// is a whole number; returns the ratio
    pub fn validate(&self, high: &B::Raster, low: &B::Raster) -> FusionResult<usize> {
        let (high_res, _) = high.geo_transform()?.resolution();
        let (low_res, _) = low.geo_transform()?.resolution();
        let ratio = low_res / high_res;
        let rounded = ratio.round();
        if rounded < 1.0 || (ratio - rounded).abs() > 1e-6 * ratio {
            return Err(FusionError::AlignmentFailure(format!(
                "Resolution ratio {} / {} = {} is not a whole number",
                low_res, high_res, ratio
            )));
        }
        let ratio = rounded as usize;

        let (hs, ls) = (high.size(), low.size());
        if hs.width != ls.width * ratio || hs.height != ls.height * ratio {
            return Err(FusionError::AlignmentFailure(format!(
                "High resolution raster {}x{} does not match {}x{} low resolution pixels at ratio {}",
                hs.width, hs.height, ls.width, ls.height, ratio
            )));
        }

        let (hb, lb) = (high.bounds()?, low.bounds()?);
        let tolerance = high_res / 2.0;
        let offsets = [
            hb.x_min - lb.x_min,
            hb.y_min - lb.y_min,
            hb.x_max - lb.x_max,
            hb.y_max - lb.y_max,
        ];
        if offsets.iter().any(|d| d.abs() > tolerance) {
            return Err(FusionError::AlignmentFailure(format!(
                "Footprints differ: {:?} vs {:?}",
                hb, lb
            )));
        }
        Ok(ratio)
    }
}
