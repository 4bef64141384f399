pub mod archive;
#[cfg(feature = "gdal")]
pub mod gdal_backend;
pub mod manifest;
pub mod memory;
pub mod naming;
pub mod raster;
pub mod subdataset;

pub use archive::{Archive, ArchiveName, BandReference, ProductFamily, ValidatedPath};
#[cfg(feature = "gdal")]
pub use gdal_backend::{GdalBackend, GdalRaster};
pub use manifest::ManifestParser;
pub use memory::{MemRaster, MemoryBackend};
pub use naming::{Sen2Name, Sen3Name};
pub use raster::{Raster, RasterBackend, RasterSpec, ReprojectRequest, Window, WritableRaster};
pub use subdataset::{Grid, ScaledSubRaster, SubdatasetPath};
