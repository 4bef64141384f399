use msifuse::io::archive::{ArchiveName, SEN2_L1C_BANDS, SEN3_RBT_BANDS};
use msifuse::io::{Archive, ProductFamily, ValidatedPath};
use msifuse::FusionError;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const S2_NAME: &str = "S2B_MSIL1C_20231004T103809_N0509_R008_T31TDG_20231004T141941.SAFE";
const S3_NAME: &str =
    "S3A_SL_1_RBT____20231004T094736_20231004T095036_20231005T182022_0179_104_136_2160_PS1_O_NT_004.SEN3";

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn data_object(id: &str, href: &str) -> String {
    format!(
        r#"    <dataObject ID="{id}">
      <byteStream mimeType="application/octet-stream" size="1">
        <fileLocation locatorType="URL" href="./{href}"/>
      </byteStream>
    </dataObject>
"#
    )
}

fn write_manifest(root: &Path, name: &str, hrefs: &[String]) {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<xfdu:XFDU xmlns:xfdu=\"urn:ccsds:schema:xfdu:1\">\n  <dataObjectSection>\n",
    );
    for (i, href) in hrefs.iter().enumerate() {
        xml.push_str(&data_object(&format!("object{}", i), href));
    }
    xml.push_str("  </dataObjectSection>\n</xfdu:XFDU>\n");
    fs::write(root.join(name), xml).unwrap();
}

fn touch(root: &Path, href: &str) {
    let path = root.join(href);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"").unwrap();
}

/// SAFE archive whose manifest lists the bands in reverse order
fn sentinel2_archive(dir: &TempDir, skip: Option<&str>) -> PathBuf {
    let root = dir.path().join(S2_NAME);
    fs::create_dir_all(&root).unwrap();

    let mut hrefs = vec!["GRANULE/L1C_T31TDG/MTD_TL.xml".to_string()];
    hrefs.push("GRANULE/L1C_T31TDG/IMG_DATA/T31TDG_20231004T103809_TCI.jp2".to_string());
    for band in SEN2_L1C_BANDS.iter().rev() {
        if Some(*band) == skip {
            continue;
        }
        hrefs.push(format!("GRANULE/L1C_T31TDG/IMG_DATA/T31TDG_20231004T103809_{}.jp2", band));
    }
    hrefs.push("GRANULE/L1C_T31TDG/QI_DATA/MSK_CLOUDS_B00.jp2".to_string());

    for href in &hrefs {
        touch(&root, href);
    }
    write_manifest(&root, "manifest.safe", &hrefs);
    root
}

fn sentinel3_archive(dir: &TempDir) -> PathBuf {
    let root = dir.path().join(S3_NAME);
    fs::create_dir_all(&root).unwrap();

    let mut hrefs: Vec<String> = SEN3_RBT_BANDS.iter().map(|b| format!("{}.nc", b)).collect();
    hrefs.rotate_left(4);
    hrefs.push("geodetic_an.nc".to_string());
    hrefs.push("S1_quality_an.nc".to_string());
    for href in &hrefs {
        touch(&root, href);
    }
    write_manifest(&root, "xfdumanifest.xml", &hrefs);
    root
}

#[test]
fn test_sentinel2_bands_in_canonical_order() {
    init();
    let dir = TempDir::new().unwrap();
    let root = sentinel2_archive(&dir, None);

    let archive = Archive::open(&root, ProductFamily::Sentinel2L1C).unwrap();
    let bands: Vec<&str> = archive.bands().iter().map(|b| b.band.as_str()).collect();
    assert_eq!(bands, SEN2_L1C_BANDS.to_vec());

    for reference in archive.bands() {
        let file = reference.location.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(file.ends_with(&format!("{}.jp2", reference.band)));
        assert!(matches!(reference.location, ValidatedPath::File(_)));
    }

    assert!(archive.metadata_file().unwrap().ends_with("MTD_TL.xml"));
    assert_eq!(archive.data_objects().len(), 16);
    match archive.name() {
        ArchiveName::Sen2(name) => assert_eq!(name.tile, "T31TDG"),
        other => panic!("unexpected name {:?}", other),
    }
}

#[test]
fn test_sentinel3_bands_are_subdataset_paths() {
    init();
    let dir = TempDir::new().unwrap();
    let root = sentinel3_archive(&dir);

    let archive = Archive::open(&root, ProductFamily::Sentinel3Rbt).unwrap();
    assert_eq!(archive.bands().len(), 11);
    assert_eq!(archive.bands()[0].band, "S1_radiance_an");
    assert_eq!(archive.bands()[9].band, "F1_BT_fn");
    assert!(archive.metadata_file().is_none());

    let address = archive.bands()[6].location.address();
    assert!(address.starts_with("NETCDF:\""));
    assert!(address.ends_with("S7_BT_in.nc\":S7_BT_in"));
}

#[test]
fn test_inconsistent_name_rejected() {
    init();
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("S2B_MSIL1C_20231004T103809_N0509_R008_T31TDG.SAFE");
    fs::create_dir_all(&root).unwrap();

    match Archive::open(&root, ProductFamily::Sentinel2L1C) {
        Err(FusionError::InconsistentArchiveName { expected, .. }) => assert_eq!(expected, 65),
        other => panic!("unexpected result: {:?}", other.map(|a| a.bands().len())),
    }

    // A valid Sentinel-2 name is the wrong length for Sentinel-3
    let s2 = sentinel2_archive(&dir, None);
    assert!(matches!(
        Archive::open(&s2, ProductFamily::Sentinel3Rbt),
        Err(FusionError::InconsistentArchiveName { .. })
    ));
}

#[test]
fn test_missing_band_is_a_count_mismatch() {
    init();
    let dir = TempDir::new().unwrap();
    let root = sentinel2_archive(&dir, Some("B8A"));

    match Archive::open(&root, ProductFamily::Sentinel2L1C) {
        Err(FusionError::BandCountMismatch { expected, found }) => {
            assert_eq!(expected, 13);
            assert_eq!(found, 12);
        }
        other => panic!("unexpected result: {:?}", other.map(|a| a.bands().len())),
    }
}

#[test]
fn test_missing_band_file_is_invalid_path() {
    init();
    let dir = TempDir::new().unwrap();
    let root = sentinel2_archive(&dir, None);
    fs::remove_file(root.join("GRANULE/L1C_T31TDG/IMG_DATA/T31TDG_20231004T103809_B03.jp2")).unwrap();

    assert!(matches!(
        Archive::open(&root, ProductFamily::Sentinel2L1C),
        Err(FusionError::InvalidPath(_))
    ));
}
