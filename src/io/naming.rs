//! Sentinel product naming conventions
//!
//! Names are checked for their exact length before anything else, then split
//! on `_` into their fields.

use crate::types::{FusionError, FusionResult};
use chrono::NaiveDateTime;
use regex::Regex;
use std::path::Path;

/// Length of a Sentinel-2 `.SAFE` archive name, e.g.
/// `S2B_MSIL1C_20231004T103809_N0509_R008_T31TDG_20231004T141941.SAFE`
pub const SEN2_NAME_LENGTH: usize = 65;

/// Length of a Sentinel-3 `.SEN3` archive name, e.g.
/// `S3A_SL_1_RBT____20231004T094736_20231004T095036_20231005T182022_0179_104_136_2160_PS1_O_NT_004.SEN3`
pub const SEN3_NAME_LENGTH: usize = 99;

const TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Final path component of `path` as a string
pub fn base_name(path: &Path) -> FusionResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .ok_or_else(|| FusionError::InvalidPath(format!("No file name in {}", path.display())))
}

/// Fail with `InconsistentArchiveName` unless `name` has `expected` characters
pub fn check_name_length(name: &str, expected: usize) -> FusionResult<()> {
    let found = name.chars().count();
    if found != expected {
        return Err(FusionError::InconsistentArchiveName {
            name: name.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

fn parse_time(name: &str, field: &str) -> FusionResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(field, TIME_FORMAT).map_err(|e| {
        FusionError::InconsistentArchiveName {
            name: format!("{} (bad timestamp '{}': {})", name, field, e),
            expected: name.len(),
            found: name.len(),
        }
    })
}

fn malformed(name: &str) -> FusionError {
    FusionError::InconsistentArchiveName {
        name: format!("{} (unexpected field layout)", name),
        expected: name.len(),
        found: name.len(),
    }
}

/// Fields of a Sentinel-2 archive name
#[derive(Debug, Clone, PartialEq)]
pub struct Sen2Name {
    pub platform: String,
    pub product: String,
    pub acquisition_time: NaiveDateTime,
    pub baseline: String,
    pub relative_orbit: String,
    pub tile: String,
    pub processing_time: NaiveDateTime,
}

impl Sen2Name {
    pub fn parse(name: &str) -> FusionResult<Self> {
        check_name_length(name, SEN2_NAME_LENGTH)?;

        let pattern = Regex::new(
            r"^(S2[ABCD])_(MSIL1C|MSIL2A)_(\d{8}T\d{6})_(N\d{4})_(R\d{3})_(T\w{5})_(\d{8}T\d{6})\.SAFE$",
        )
        .map_err(|e| FusionError::Processing(e.to_string()))?;
        let caps = pattern.captures(name).ok_or_else(|| malformed(name))?;

        Ok(Self {
            platform: caps[1].to_string(),
            product: caps[2].to_string(),
            acquisition_time: parse_time(name, &caps[3])?,
            baseline: caps[4].to_string(),
            relative_orbit: caps[5].to_string(),
            tile: caps[6].to_string(),
            processing_time: parse_time(name, &caps[7])?,
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> FusionResult<Self> {
        Self::parse(&base_name(path.as_ref())?)
    }
}

/// Fields of a Sentinel-3 archive name
#[derive(Debug, Clone, PartialEq)]
pub struct Sen3Name {
    pub platform: String,
    pub sensor: String,
    pub processing_level: String,
    pub product: String,
    pub acquisition_start: NaiveDateTime,
    pub acquisition_end: NaiveDateTime,
    pub processing_time: NaiveDateTime,
    pub duration: String,
    pub cycle: String,
    pub relative_orbit: String,
    pub frame: String,
    pub centre: String,
    pub platform_class: String,
    pub timeliness: String,
    pub baseline: String,
}

impl Sen3Name {
    pub fn parse(name: &str) -> FusionResult<Self> {
        check_name_length(name, SEN3_NAME_LENGTH)?;

        let stem = name.strip_suffix(".SEN3").ok_or_else(|| malformed(name))?;
        let fields: Vec<&str> = stem.split('_').collect();
        // Product type is padded with underscores, which leaves three empty fields
        if fields.len() != 18 {
            return Err(malformed(name));
        }

        Ok(Self {
            platform: fields[0].to_string(),
            sensor: fields[1].to_string(),
            processing_level: fields[2].to_string(),
            product: fields[3].to_string(),
            acquisition_start: parse_time(name, fields[7])?,
            acquisition_end: parse_time(name, fields[8])?,
            processing_time: parse_time(name, fields[9])?,
            duration: fields[10].to_string(),
            cycle: fields[11].to_string(),
            relative_orbit: fields[12].to_string(),
            frame: fields[13].to_string(),
            centre: fields[14].to_string(),
            platform_class: fields[15].to_string(),
            timeliness: fields[16].to_string(),
            baseline: fields[17].to_string(),
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> FusionResult<Self> {
        Self::parse(&base_name(path.as_ref())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const S2: &str = "S2B_MSIL1C_20231004T103809_N0509_R008_T31TDG_20231004T141941.SAFE";
    const S3: &str = "S3A_SL_1_RBT____20231004T094736_20231004T095036_20231005T182022_0179_104_136_2160_PS1_O_NT_004.SEN3";

    #[test]
    fn test_sen2_name() {
        let name = Sen2Name::parse(S2).unwrap();
        assert_eq!(name.platform, "S2B");
        assert_eq!(name.product, "MSIL1C");
        assert_eq!(name.tile, "T31TDG");
        assert_eq!(name.relative_orbit, "R008");
        assert_eq!(name.acquisition_time.hour(), 10);
        assert_eq!(name.processing_time.day(), 4);
    }

    #[test]
    fn test_sen3_name() {
        let name = Sen3Name::from_path(Path::new("/data").join(S3)).unwrap();
        assert_eq!(name.platform, "S3A");
        assert_eq!(name.sensor, "SL");
        assert_eq!(name.processing_level, "1");
        assert_eq!(name.product, "RBT");
        assert_eq!(name.acquisition_start.minute(), 47);
        assert_eq!(name.acquisition_end.minute(), 50);
        assert_eq!(name.relative_orbit, "136");
        assert_eq!(name.baseline, "004");
    }

    #[test]
    fn test_wrong_length_rejected() {
        let short = &S2[1..];
        match Sen2Name::parse(short) {
            Err(FusionError::InconsistentArchiveName { expected, found, .. }) => {
                assert_eq!(expected, 65);
                assert_eq!(found, 64);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(Sen3Name::parse(S2).is_err());
    }
}
