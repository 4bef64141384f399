//! Patch-wise fusion over an aligned raster pair
//!
//! The runner pulls matched batches from the dispatcher, prepares them for
//! the model, writes the de-normalized predictions tile by tile and scores
//! them against the low resolution input.

use crate::config::FusionConfig;
use crate::core::alignment::AlignedPair;
use crate::core::dispatch::{TileDispatcher, TileStream};
use crate::core::normalize::{Preprocessor, ValidAverageDownsampling};
use crate::core::output::{BandMetadata, Metadata, MetadataDomain, ModelOutput};
use crate::core::quality::FusionQuality;
use crate::core::tiling::TileCoords;
use crate::io::raster::{Raster, RasterBackend, RasterSpec};
use crate::types::{FusionError, FusionResult, RasterSize};
use ndarray::{Array4, ArrayView3, Axis};
use std::path::PathBuf;

/// Numerical fusion model.
///
/// Takes a `(batch, band, row, col)` high resolution batch and its low
/// resolution counterpart; returns the fused batch at the high resolution
/// with one band per low resolution band.
pub trait FusionModel {
    fn infer(&self, high: &Array4<f32>, low: &Array4<f32>) -> FusionResult<Array4<f32>>;
}

/// Counts reported at the end of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub tiles: usize,
    /// Tiles scored against the low resolution input
    pub evaluated: usize,
}

pub struct FusionRunner<'a, B: RasterBackend, M: FusionModel> {
    backend: &'a B,
    model: &'a M,
    preprocessor: Preprocessor,
    config: &'a FusionConfig,
}

impl<'a, B: RasterBackend, M: FusionModel> FusionRunner<'a, B, M> {
    pub fn new(
        backend: &'a B,
        model: &'a M,
        preprocessor: Preprocessor,
        config: &'a FusionConfig,
    ) -> Self {
        Self {
            backend,
            model,
            preprocessor,
            config,
        }
    }

    /// Output geometry: the high resolution grid, cut or padded to whole tiles
    fn output_spec(&self, high: &B::Raster, bands: usize, path: Option<PathBuf>) -> FusionResult<RasterSpec> {
        let tiling = &self.config.tiling;
        let coords = TileCoords::new(tiling.high_tile_size, high.size(), tiling.edge_policy)?;
        let (xtiles, ytiles) = coords.grid();
        Ok(RasterSpec {
            path,
            geo_transform: high.geo_transform()?,
            projection: high.projection(),
            size: RasterSize::new(xtiles * tiling.high_tile_size, ytiles * tiling.high_tile_size),
            bands,
        })
    }

    /// Fuse `pair` into a new raster at `destination` (in memory when `None`)
    pub fn run(
        &self,
        pair: &AlignedPair<B::Raster>,
        destination: Option<PathBuf>,
    ) -> FusionResult<(B::Raster, RunSummary)> {
        let tiling = &self.config.tiling;
        if self.config.tile_ratio() != pair.ratio {
            log::warn!(
                "Tile sizes {}/{} do not follow the {}:1 resolution ratio; tiles will not share footprints",
                tiling.high_tile_size,
                tiling.low_tile_size,
                pair.ratio
            );
        }
        let streams = vec![
            TileStream::new(&pair.high, tiling.high_tile_size, tiling.batch_size, tiling.edge_policy)?,
            TileStream::new(&pair.low, tiling.low_tile_size, tiling.batch_size, tiling.edge_policy)?,
        ];
        let dispatcher = TileDispatcher::new(streams)?;
        let total = dispatcher.total_batches();

        let bands = pair.low.band_count();
        let spec = self.output_spec(&pair.high, bands, destination)?;
        let mut output = ModelOutput::new(self.backend, &spec, tiling.high_tile_size)?;

        let downsample = ValidAverageDownsampling::new(pair.ratio)?;
        let mut quality = FusionQuality::new();
        let mut summary = RunSummary::default();

        for batch in dispatcher {
            let batch = batch?;
            let high: Vec<ArrayView3<f32>> = batch.stream(0).iter().map(|t| t.view()).collect();
            let low: Vec<ArrayView3<f32>> = batch.stream(1).iter().map(|t| t.view()).collect();

            let (high_in, low_in) = self.preprocessor.apply(&high, &low)?;
            let prediction = self.model.infer(&high_in, &low_in)?;
            let expected = (high.len(), bands, tiling.high_tile_size, tiling.high_tile_size);
            if prediction.dim() != expected {
                return Err(FusionError::Processing(format!(
                    "Model returned a batch of shape {:?}, expected {:?}",
                    prediction.dim(),
                    expected
                )));
            }

            let fused = self.preprocessor.reset_value_range(&prediction)?;
            summary.tiles += output.write_tiles(&fused)?;
            summary.evaluated += self.evaluate(&mut quality, &downsample, &fused, &batch.stacked(1)?)?;
            summary.batches += 1;
            log::debug!("Fused batch {}/{}", batch.index + 1, total);
        }

        if quality.tiles_evaluated() > 0 {
            output.write_band_metadata(&[&quality as &dyn BandMetadata])?;
        }
        let processing = MetadataDomain::new("FUSION")
            .with("RESOLUTION_RATIO", pair.ratio)
            .with("HIGH_TILE_SIZE", tiling.high_tile_size)
            .with("LOW_TILE_SIZE", tiling.low_tile_size)
            .with("CO_REGISTRATION_SHIFT", format!("{} {}", pair.shift.0, pair.shift.1));
        output.write_metadata(&[&processing as &dyn Metadata])?;

        log::info!(
            "Fusion complete: {} batches, {} tiles written, {} tiles evaluated",
            summary.batches,
            summary.tiles,
            summary.evaluated
        );
        Ok((output.into_inner()?, summary))
    }

    /// Score `fused` downsampled to the low resolution grid; skipped when the
    /// shapes disagree
    fn evaluate(
        &self,
        quality: &mut FusionQuality,
        downsample: &ValidAverageDownsampling,
        fused: &Array4<f32>,
        reference: &Array4<f32>,
    ) -> FusionResult<usize> {
        let (_, _, h, w) = fused.dim();
        if h % downsample.scale() != 0 || w % downsample.scale() != 0 {
            return Ok(0);
        }
        let coarse = downsample.apply(fused)?;
        if coarse.dim() != reference.dim() {
            log::debug!(
                "Skipping evaluation: {:?} against {:?}",
                coarse.dim(),
                reference.dim()
            );
            return Ok(0);
        }
        quality.evaluate(&coarse, reference)?;
        Ok(coarse.len_of(Axis(0)))
    }
}
