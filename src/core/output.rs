//! Geocoded output raster with sequential tile writes

use crate::core::tiling::{EdgePolicy, TileCoords};
use crate::io::raster::{RasterBackend, RasterSpec, WritableRaster};
use crate::types::{FusionError, FusionResult, TileCoordinate};
use ndarray::{Array4, ArrayView3, Axis};
use std::collections::BTreeMap;

/// Whole-raster metadata: one domain of key/value items
pub trait Metadata {
    fn domain(&self) -> &str;
    fn content(&self) -> BTreeMap<String, String>;
}

/// Per-band metadata: one domain, one key/value map per band
pub trait BandMetadata {
    fn domain(&self) -> &str;
    fn band_values(&self) -> Vec<BTreeMap<String, String>>;
}

/// Plain metadata domain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataDomain {
    pub domain: String,
    pub items: BTreeMap<String, String>,
}

impl MetadataDomain {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            items: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.items.insert(key.to_string(), value.to_string());
        self
    }
}

impl Metadata for MetadataDomain {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn content(&self) -> BTreeMap<String, String> {
        self.items.clone()
    }
}

/// Plain per-band metadata domain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BandMetadataDomain {
    pub domain: String,
    pub bands: Vec<BTreeMap<String, String>>,
}

impl BandMetadata for BandMetadataDomain {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn band_values(&self) -> Vec<BTreeMap<String, String>> {
        self.bands.clone()
    }
}

/// Output raster that only grows through [`ModelOutput::write_next_tile`].
///
/// Tiles are placed in the row-major order of its own tile generator.
pub struct ModelOutput<R: WritableRaster> {
    raster: R,
    coords: TileCoords,
    tile_size: usize,
    bands: usize,
    written: usize,
}

impl<R: WritableRaster> ModelOutput<R> {
    /// Allocate the output raster. Width and height must be exact multiples
    /// of `tile_size`.
    pub fn new<B>(backend: &B, spec: &RasterSpec, tile_size: usize) -> FusionResult<Self>
    where
        B: RasterBackend<Raster = R>,
    {
        let size = spec.size;
        if size.width == 0 || size.height == 0 || spec.bands == 0 || tile_size == 0 {
            return Err(FusionError::InvalidGeometry(format!(
                "Output raster needs positive dimensions, bands and tile size (got {}x{}, {} bands, tile {})",
                size.width, size.height, spec.bands, tile_size
            )));
        }
        if size.width % tile_size != 0 || size.height % tile_size != 0 {
            return Err(FusionError::InvalidGeometry(format!(
                "Output raster {}x{} is not a whole number of {}-pixel tiles",
                size.width, size.height, tile_size
            )));
        }

        let raster = backend.create(spec)?;
        let coords = TileCoords::new(tile_size, size, EdgePolicy::Drop)?;
        log::info!(
            "Output raster {}x{} with {} bands, {} tiles of {} pixels",
            size.width,
            size.height,
            spec.bands,
            coords.total(),
            tile_size
        );

        Ok(Self {
            raster,
            coords,
            tile_size,
            bands: spec.bands,
            written: 0,
        })
    }

    /// Write `tile` (`(bands, tile, tile)`) at the next tile position
    pub fn write_next_tile(&mut self, tile: ArrayView3<f32>) -> FusionResult<TileCoordinate> {
        if !self.coords.has_next() {
            return Err(FusionError::OutputExhausted {
                written: self.written,
            });
        }
        let expected = (self.bands, self.tile_size, self.tile_size);
        if tile.dim() != expected {
            return Err(FusionError::InvalidGeometry(format!(
                "Tile of shape {:?} does not match output tile shape {:?}",
                tile.dim(),
                expected
            )));
        }

        let coordinate = self.coords.next().ok_or(FusionError::OutputExhausted {
            written: self.written,
        })?;
        self.raster.write_window(&coordinate, tile)?;
        self.written += 1;
        log::debug!("Wrote tile {} at ({}, {})", self.written, coordinate.x, coordinate.y);
        Ok(coordinate)
    }

    /// Write every tile of a `(batch, bands, tile, tile)` array in order
    pub fn write_tiles(&mut self, batch: &Array4<f32>) -> FusionResult<usize> {
        for tile in batch.axis_iter(Axis(0)) {
            self.write_next_tile(tile)?;
        }
        Ok(batch.len_of(Axis(0)))
    }

    /// Set every item of each domain on the raster
    pub fn write_metadata(&mut self, metadata: &[&dyn Metadata]) -> FusionResult<()> {
        for m in metadata {
            for (key, value) in m.content() {
                self.raster.set_metadata_item(&key, &value, m.domain())?;
            }
        }
        Ok(())
    }

    /// Set per-band items; other keys already in the domain are kept
    pub fn write_band_metadata(&mut self, metadata: &[&dyn BandMetadata]) -> FusionResult<()> {
        for m in metadata {
            let values = m.band_values();
            if values.len() != self.bands {
                return Err(FusionError::BandMetadataLengthMismatch {
                    expected: self.bands,
                    found: values.len(),
                });
            }
            for (index, items) in values.iter().enumerate() {
                for (key, value) in items {
                    self.raster
                        .set_band_metadata_item(index + 1, key, value, m.domain())?;
                }
            }
        }
        Ok(())
    }

    pub fn tiles_written(&self) -> usize {
        self.written
    }

    /// Total number of tiles the raster holds
    pub fn tile_budget(&self) -> usize {
        self.coords.total()
    }

    pub fn raster(&self) -> &R {
        &self.raster
    }

    /// Flush and hand back the raster
    pub fn into_inner(mut self) -> FusionResult<R> {
        self.raster.flush()?;
        Ok(self.raster)
    }
}
