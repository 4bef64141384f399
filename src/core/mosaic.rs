//! Multi-band mosaics from ordered single-band rasters

use crate::config::GeoreferencingConfig;
use crate::core::georef::GeoreferencingBuilder;
use crate::io::archive::{Archive, ProductFamily};
use crate::io::raster::{Raster, RasterBackend};
use crate::types::{FusionError, FusionResult};

pub struct MosaicBuilder<'a, B: RasterBackend> {
    backend: &'a B,
}

impl<'a, B: RasterBackend> MosaicBuilder<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Stack `bands` in order into one raster at the highest input resolution
    pub fn build(&self, bands: &[B::Raster]) -> FusionResult<B::Raster> {
        if bands.is_empty() {
            return Err(FusionError::Processing(
                "Mosaic needs at least one band".to_string(),
            ));
        }

        let expected: usize = bands.iter().map(|b| b.band_count()).sum();
        log::info!("Building mosaic from {} rasters ({} bands)", bands.len(), expected);

        let mosaic = self.backend.build_mosaic(bands)?;
        if mosaic.band_count() != expected {
            return Err(FusionError::BandCountMismatch {
                expected,
                found: mosaic.band_count(),
            });
        }

        let size = mosaic.size();
        log::debug!(
            "Mosaic is {}x{} at {:?}",
            size.width,
            size.height,
            mosaic.geo_transform()?.resolution()
        );
        Ok(mosaic)
    }

    /// The 13-band Sentinel-2 L1C raster of `archive`
    pub fn sentinel2(&self, archive: &Archive) -> FusionResult<B::Raster> {
        if archive.family() != ProductFamily::Sentinel2L1C {
            return Err(FusionError::Processing(format!(
                "Expected a Sentinel-2 L1C archive, got {:?}",
                archive.family()
            )));
        }
        self.build(&archive.open_bands(self.backend)?)
    }

    /// The 12-band Sentinel-3 SLSTR raster: RBT bands followed by LST.
    /// Every band is georeferenced from its own geolocation grid first.
    pub fn sentinel3(
        &self,
        rbt: &Archive,
        lst: &Archive,
        config: &GeoreferencingConfig,
    ) -> FusionResult<B::Raster> {
        if rbt.family() != ProductFamily::Sentinel3Rbt || lst.family() != ProductFamily::Sentinel3Lst {
            return Err(FusionError::Processing(format!(
                "Expected RBT and LST archives, got {:?} and {:?}",
                rbt.family(),
                lst.family()
            )));
        }

        let georef = GeoreferencingBuilder::new(self.backend, config);
        let rbt_bands = rbt.open_scaled_bands(self.backend)?;
        let lst_bands = lst.open_scaled_bands(self.backend)?;

        let bands = rbt_bands
            .iter()
            .chain(lst_bands.iter())
            .map(|scaled| georef.georeference(scaled))
            .collect::<FusionResult<Vec<_>>>()?;
        self.build(&bands)
    }
}
