//! Core fusion pipeline modules

pub mod alignment;
pub mod coregister;
pub mod dispatch;
pub mod fusion;
pub mod georef;
pub mod mosaic;
pub mod normalize;
pub mod output;
pub mod quality;
pub mod tiling;

// Re-export main types
pub use alignment::{AlignedPair, AlignmentPipeline, AlignmentStage};
pub use coregister::{Coregistrar, CoregistrationResult, PhaseCorrelationCoregistrar};
pub use dispatch::{Batch, TileDispatcher, TileStream};
pub use fusion::{FusionModel, FusionRunner, RunSummary};
pub use georef::{fit_geotransform, geodetics_to_gcps, GeoreferencingBuilder};
pub use mosaic::MosaicBuilder;
pub use normalize::{Normalizer, Preprocessor, Standardizer, ValidAverageDownsampling};
pub use output::{BandMetadata, BandMetadataDomain, Metadata, MetadataDomain, ModelOutput};
pub use quality::FusionQuality;
pub use tiling::{tile_coords, EdgePolicy, TileCoords};
