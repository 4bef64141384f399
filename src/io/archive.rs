//! Product archive parsing
//!
//! An [`Archive`] is a validated `.SAFE` or `.SEN3` directory: its name has
//! the exact length of its family's convention, its manifest lists the data
//! objects, and exactly the family's canonical bands were found among them.

use crate::io::manifest::ManifestParser;
use crate::io::naming::{base_name, check_name_length, Sen2Name, Sen3Name, SEN2_NAME_LENGTH, SEN3_NAME_LENGTH};
use crate::io::raster::RasterBackend;
use crate::io::subdataset::{open_scaled, Grid, ScaledSubRaster, SubdatasetPath};
use crate::types::{FusionError, FusionResult};
use std::path::{Path, PathBuf};

/// Sentinel-2 L1C bands in raster channel order
pub const SEN2_L1C_BANDS: [&str; 13] = [
    "B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B10", "B11", "B12",
];

/// Sentinel-3 SLSTR RBT radiance and brightness temperature variables
pub const SEN3_RBT_BANDS: [&str; 11] = [
    "S1_radiance_an",
    "S2_radiance_an",
    "S3_radiance_an",
    "S4_radiance_an",
    "S5_radiance_an",
    "S6_radiance_an",
    "S7_BT_in",
    "S8_BT_in",
    "S9_BT_in",
    "F1_BT_fn",
    "F2_BT_in",
];

/// Sentinel-3 SLSTR LST variable file
pub const SEN3_LST_BANDS: [&str; 1] = ["LST_in"];

/// A path whose existence and kind were checked at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedPath {
    File(PathBuf),
    Directory(PathBuf),
    SubRasterPath(SubdatasetPath),
}

impl ValidatedPath {
    pub fn file<P: AsRef<Path>>(path: P) -> FusionResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(FusionError::InvalidPath(format!("{} is not a file", path.display())));
        }
        Ok(ValidatedPath::File(path.to_path_buf()))
    }

    pub fn directory<P: AsRef<Path>>(path: P) -> FusionResult<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(FusionError::InvalidPath(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        Ok(ValidatedPath::Directory(path.to_path_buf()))
    }

    /// Parse a sub-raster address and check that its file exists
    pub fn sub_raster(address: &str) -> FusionResult<Self> {
        let parsed = SubdatasetPath::parse(address)?;
        if !parsed.file.is_file() {
            return Err(FusionError::InvalidPath(format!(
                "{} refers to a missing file",
                address
            )));
        }
        Ok(ValidatedPath::SubRasterPath(parsed))
    }

    pub fn path(&self) -> &Path {
        match self {
            ValidatedPath::File(p) | ValidatedPath::Directory(p) => p,
            ValidatedPath::SubRasterPath(s) => &s.file,
        }
    }

    /// String handed to the raster backend's `open`
    pub fn address(&self) -> String {
        match self {
            ValidatedPath::File(p) | ValidatedPath::Directory(p) => p.display().to_string(),
            ValidatedPath::SubRasterPath(s) => s.to_string(),
        }
    }
}

/// Supported product families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductFamily {
    Sentinel2L1C,
    Sentinel3Rbt,
    Sentinel3Lst,
}

impl ProductFamily {
    pub fn name_length(&self) -> usize {
        match self {
            ProductFamily::Sentinel2L1C => SEN2_NAME_LENGTH,
            ProductFamily::Sentinel3Rbt | ProductFamily::Sentinel3Lst => SEN3_NAME_LENGTH,
        }
    }

    pub fn manifest_name(&self) -> &'static str {
        match self {
            ProductFamily::Sentinel2L1C => "manifest.safe",
            ProductFamily::Sentinel3Rbt | ProductFamily::Sentinel3Lst => "xfdumanifest.xml",
        }
    }

    /// Canonical band identifiers; their order is the raster channel order
    pub fn band_names(&self) -> &'static [&'static str] {
        match self {
            ProductFamily::Sentinel2L1C => &SEN2_L1C_BANDS,
            ProductFamily::Sentinel3Rbt => &SEN3_RBT_BANDS,
            ProductFamily::Sentinel3Lst => &SEN3_LST_BANDS,
        }
    }

    fn file_extension(&self) -> &'static str {
        match self {
            ProductFamily::Sentinel2L1C => "jp2",
            ProductFamily::Sentinel3Rbt | ProductFamily::Sentinel3Lst => "nc",
        }
    }

    /// Index of the canonical band that `href` holds, if any
    pub fn band_index(&self, href: &str) -> Option<usize> {
        if *self == ProductFamily::Sentinel2L1C && !href.contains("IMG_DATA") {
            return None;
        }
        let extension = self.file_extension();
        self.band_names()
            .iter()
            .position(|band| href.ends_with(&format!("{}.{}", band, extension)))
    }

    /// Variable to read from a band file; `None` means the file is the raster
    pub fn subdataset_name(&self, band: &str) -> Option<String> {
        match self {
            ProductFamily::Sentinel2L1C => None,
            ProductFamily::Sentinel3Rbt => Some(band.to_string()),
            ProductFamily::Sentinel3Lst => Some("LST".to_string()),
        }
    }

    /// Grid that cannot be derived from the variable name
    pub fn grid_override(&self) -> Option<Grid> {
        match self {
            ProductFamily::Sentinel3Lst => Some(Grid::In),
            _ => None,
        }
    }
}

/// Parsed archive name fields
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveName {
    Sen2(Sen2Name),
    Sen3(Sen3Name),
}

/// One band file in canonical order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandReference {
    pub band: String,
    pub location: ValidatedPath,
}

/// Validated product archive
#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
    family: ProductFamily,
    name: ArchiveName,
    manifest: PathBuf,
    data_objects: Vec<PathBuf>,
    metadata_file: Option<PathBuf>,
    bands: Vec<BandReference>,
}

impl Archive {
    /// Validate and parse an archive directory
    pub fn open<P: AsRef<Path>>(path: P, family: ProductFamily) -> FusionResult<Self> {
        let root = path.as_ref();
        let archive_name = base_name(root)?;

        // The name is checked before anything touches the filesystem
        check_name_length(&archive_name, family.name_length())?;
        let root = ValidatedPath::directory(root)?.path().to_path_buf();

        let name = match family {
            ProductFamily::Sentinel2L1C => ArchiveName::Sen2(Sen2Name::parse(&archive_name)?),
            _ => ArchiveName::Sen3(Sen3Name::parse(&archive_name)?),
        };

        log::info!("Reading {:?} archive {}", family, archive_name);
        let manifest = ValidatedPath::file(root.join(family.manifest_name()))?
            .path()
            .to_path_buf();
        let hrefs = ManifestParser::data_object_hrefs(&ManifestParser::read_manifest(&manifest)?);
        log::debug!("Manifest lists {} data objects", hrefs.len());

        let data_objects: Vec<PathBuf> = hrefs.iter().map(|h| root.join(h)).collect();

        // The first data object of a SAFE manifest is the MTD metadata file
        let metadata_file = match family {
            ProductFamily::Sentinel2L1C => {
                let first = data_objects.first().ok_or_else(|| {
                    FusionError::XmlParsing("Manifest lists no data objects".to_string())
                })?;
                Some(ValidatedPath::file(first)?.path().to_path_buf())
            }
            _ => None,
        };

        let mut matched: Vec<(usize, &String)> = hrefs
            .iter()
            .filter_map(|href| family.band_index(href).map(|i| (i, href)))
            .collect();
        matched.sort_by_key(|(index, _)| *index);

        let expected = family.band_names().len();
        if matched.len() != expected {
            return Err(FusionError::BandCountMismatch {
                expected,
                found: matched.len(),
            });
        }

        let bands = matched
            .into_iter()
            .map(|(index, href)| {
                let band = family.band_names()[index];
                let file = root.join(href);
                let location = match family.subdataset_name(band) {
                    Some(variable) => {
                        ValidatedPath::sub_raster(&SubdatasetPath::netcdf(file, &variable).to_string())?
                    }
                    None => ValidatedPath::file(file)?,
                };
                Ok(BandReference {
                    band: band.to_string(),
                    location,
                })
            })
            .collect::<FusionResult<Vec<_>>>()?;

        log::info!("Found {} bands in canonical order", bands.len());

        Ok(Self {
            root,
            family,
            name,
            manifest,
            data_objects,
            metadata_file,
            bands,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn family(&self) -> ProductFamily {
        self.family
    }

    pub fn name(&self) -> &ArchiveName {
        &self.name
    }

    pub fn manifest(&self) -> &Path {
        &self.manifest
    }

    /// Every data object of the manifest, in manifest order
    pub fn data_objects(&self) -> &[PathBuf] {
        &self.data_objects
    }

    /// Sentinel-2 MTD metadata file
    pub fn metadata_file(&self) -> Option<&Path> {
        self.metadata_file.as_deref()
    }

    pub fn bands(&self) -> &[BandReference] {
        &self.bands
    }

    /// Open every band through `backend`, in canonical order
    pub fn open_bands<B: RasterBackend>(&self, backend: &B) -> FusionResult<Vec<B::Raster>> {
        self.bands
            .iter()
            .map(|b| backend.open(&b.location.address()))
            .collect()
    }

    /// Open every band as a scaled sub-raster, in canonical order
    pub fn open_scaled_bands<B: RasterBackend>(
        &self,
        backend: &B,
    ) -> FusionResult<Vec<ScaledSubRaster<B::Raster>>> {
        self.bands
            .iter()
            .map(|b| match &b.location {
                ValidatedPath::SubRasterPath(path) => {
                    open_scaled(backend, path, self.family.grid_override())
                }
                other => Err(FusionError::MalformedSubdatasetPath(other.address())),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_index_matching() {
        let s2 = ProductFamily::Sentinel2L1C;
        assert_eq!(s2.band_index("GRANULE/L1C/IMG_DATA/T31TDG_20231004T103809_B8A.jp2"), Some(8));
        assert_eq!(s2.band_index("GRANULE/L1C/IMG_DATA/T31TDG_20231004T103809_B08.jp2"), Some(7));
        assert_eq!(s2.band_index("GRANULE/L1C/IMG_DATA/T31TDG_20231004T103809_TCI.jp2"), None);
        assert_eq!(s2.band_index("GRANULE/L1C/QI_DATA/MSK_B01.jp2"), None);

        let rbt = ProductFamily::Sentinel3Rbt;
        assert_eq!(rbt.band_index("F1_BT_fn.nc"), Some(9));
        assert_eq!(rbt.band_index("S1_quality_an.nc"), None);
        assert_eq!(ProductFamily::Sentinel3Lst.band_index("LST_in.nc"), Some(0));
    }

    #[test]
    fn test_name_checked_before_io() {
        let result = Archive::open("/does/not/exist/S2B_MSIL1C.SAFE", ProductFamily::Sentinel2L1C);
        assert!(matches!(result, Err(FusionError::InconsistentArchiveName { .. })));
    }

    #[test]
    fn test_validated_path_kinds() {
        let dir = std::env::temp_dir();
        assert!(ValidatedPath::directory(&dir).is_ok());
        assert!(ValidatedPath::file(&dir).is_err());
        assert!(matches!(
            ValidatedPath::sub_raster("NETCDF:no-quotes:LST"),
            Err(FusionError::MalformedSubdatasetPath(_))
        ));
    }
}
