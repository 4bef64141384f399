use crate::types::{FusionError, FusionResult};
use quick_xml::de::from_str;
use serde::Deserialize;
use std::path::Path;

/// XFDU manifest (`manifest.safe` / `xfdumanifest.xml`).
/// Only the data object section is deserialized.
#[derive(Debug, Deserialize)]
pub struct ManifestRoot {
    #[serde(rename = "dataObjectSection")]
    pub data_object_section: DataObjectSection,
}

#[derive(Debug, Deserialize)]
pub struct DataObjectSection {
    #[serde(rename = "dataObject", default)]
    pub data_objects: Vec<DataObject>,
}

#[derive(Debug, Deserialize)]
pub struct DataObject {
    #[serde(rename = "@ID", default)]
    pub id: String,
    #[serde(rename = "byteStream")]
    pub byte_stream: ByteStream,
}

#[derive(Debug, Deserialize)]
pub struct ByteStream {
    #[serde(rename = "@mimeType", default)]
    pub mime_type: String,
    #[serde(rename = "fileLocation")]
    pub file_location: FileLocation,
}

#[derive(Debug, Deserialize)]
pub struct FileLocation {
    #[serde(rename = "@href")]
    pub href: String,
}

/// Manifest parser
pub struct ManifestParser;

impl ManifestParser {
    pub fn parse_manifest(xml_content: &str) -> FusionResult<ManifestRoot> {
        from_str::<ManifestRoot>(xml_content)
            .map_err(|e| FusionError::XmlParsing(format!("Failed to parse manifest: {}", e)))
    }

    pub fn read_manifest<P: AsRef<Path>>(path: P) -> FusionResult<ManifestRoot> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(FusionError::InvalidPath(format!(
                "Manifest not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse_manifest(&content)
    }

    /// Data object references in manifest order, without the leading `./`
    pub fn data_object_hrefs(manifest: &ManifestRoot) -> Vec<String> {
        manifest
            .data_object_section
            .data_objects
            .iter()
            .map(|o| {
                let href = o.byte_stream.file_location.href.as_str();
                href.strip_prefix("./").unwrap_or(href).to_string()
            })
            .collect()
    }
}
