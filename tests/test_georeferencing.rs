use approx::assert_abs_diff_eq;
use msifuse::config::GeoreferencingConfig;
use msifuse::core::georef::{geodetics_to_gcps, GeoreferencingBuilder, WGS84_WKT};
use msifuse::core::MosaicBuilder;
use msifuse::io::archive::SEN3_RBT_BANDS;
use msifuse::io::subdataset::{open_scaled, Grid, SubdatasetPath};
use msifuse::io::{Archive, MemRaster, MemoryBackend, ProductFamily, Raster};
use msifuse::GeoTransform;
use ndarray::Array2;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const RBT_NAME: &str =
    "S3A_SL_1_RBT____20231004T094736_20231004T095036_20231005T182022_0179_104_136_2160_PS1_O_NT_004.SEN3";
const LST_NAME: &str =
    "S3A_SL_2_LST____20231004T094736_20231004T095036_20231005T182022_0179_104_136_2160_PS1_O_NT_004.SEN3";

const ROWS: usize = 6;
const COLS: usize = 5;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn unreferenced(name: &str, band: Array2<f64>) -> MemRaster {
    MemRaster::from_band(name, band, GeoTransform::north_up(0.0, 0.0, 1.0), "")
}

fn longitude() -> Array2<f64> {
    Array2::from_shape_fn((ROWS, COLS), |(_, c)| 10.0 + 0.01 * c as f64)
}

fn latitude() -> Array2<f64> {
    Array2::from_shape_fn((ROWS, COLS), |(r, _)| 45.0 - 0.01 * r as f64)
}

/// Register the three geolocation grids of `grid` next to `file`
fn register_geodetics(backend: &MemoryBackend, file: &Path, grid: Grid) {
    let band = SubdatasetPath::netcdf(file, "S1_radiance_an");
    let paths = band.geodetic_siblings(grid);
    backend.register(paths.longitude.to_string(), unreferenced("lon", longitude()));
    backend.register(paths.latitude.to_string(), unreferenced("lat", latitude()));
    backend.register(
        paths.elevation.to_string(),
        unreferenced("elev", Array2::from_elem((ROWS, COLS), 250.0)),
    );
}

fn write_archive(dir: &TempDir, name: &str, files: &[String]) -> PathBuf {
    let root = dir.path().join(name);
    fs::create_dir_all(&root).unwrap();
    let mut xml = String::from("<XFDU>\n  <dataObjectSection>\n");
    for file in files {
        fs::write(root.join(file), b"").unwrap();
        xml.push_str(&format!(
            "    <dataObject ID=\"{0}\"><byteStream mimeType=\"application/x-netcdf\"><fileLocation href=\"./{0}\"/></byteStream></dataObject>\n",
            file
        ));
    }
    xml.push_str("  </dataObjectSection>\n</XFDU>\n");
    fs::write(root.join("xfdumanifest.xml"), xml).unwrap();
    root
}

#[test]
fn test_gcps_use_physical_values_and_drop_invalid_samples() {
    init();
    let backend = MemoryBackend::new();
    let band_path = SubdatasetPath::netcdf("/data/product.SEN3/S8_BT_in.nc", "S8_BT_in");
    let geodetic = band_path.geodetic_siblings(Grid::In);

    // Longitude stored as micro-degrees
    let raw_lon = Array2::from_shape_fn((4, 4), |(_, c)| (12_000_000 + 10_000 * c) as f64);
    let mut elevation = Array2::from_elem((4, 4), 120.0);
    elevation[[1, 2]] = -5.0;
    backend.register(
        geodetic.longitude.to_string(),
        unreferenced("lon", raw_lon)
            .with_metadata("longitude_in#scale_factor", "1e-6", "")
            .with_metadata("longitude_in#add_offset", "0.5", ""),
    );
    backend.register(
        geodetic.latitude.to_string(),
        unreferenced("lat", Array2::from_shape_fn((4, 4), |(r, _)| 50.0 - 0.01 * r as f64)),
    );
    backend.register(geodetic.elevation.to_string(), unreferenced("elev", elevation));
    backend.register(
        band_path.to_string(),
        unreferenced("S8", Array2::from_elem((4, 4), 290.0)),
    );

    let config = GeoreferencingConfig {
        an_dilation: 1,
        in_dilation: 1,
        fn_dilation: 1,
    };
    let builder = GeoreferencingBuilder::new(&backend, &config);
    let band = open_scaled(&backend, &band_path, None).unwrap();
    assert_eq!(band.grid, Grid::In);

    let gcps = builder.ground_control_points(&band).unwrap();
    assert_eq!(gcps.len(), 15);
    assert_abs_diff_eq!(gcps[0].x, 12.5, epsilon = 1e-9);
    assert_eq!((gcps[0].pixel, gcps[0].line), (0.0, 0.0));
    // Sample (row 1, col 2) is gone: the sixth GCP is (row 1, col 3)
    assert_eq!((gcps[6].pixel, gcps[6].line), (3.0, 1.0));

    let gt = builder.geotransform(&band).unwrap();
    assert_abs_diff_eq!(gt.pixel_width, 0.01, epsilon = 1e-9);
    assert_abs_diff_eq!(gt.pixel_height, -0.01, epsilon = 1e-9);
    assert_abs_diff_eq!(gt.top_left_x, 12.5, epsilon = 1e-9);
    assert_abs_diff_eq!(gt.top_left_y, 50.0, epsilon = 1e-9);
}

#[test]
fn test_out_of_range_longitude_dropped() {
    init();
    let mut lon = longitude();
    lon[[0, 1]] = 200.0;
    let gcps = geodetics_to_gcps(&lon, &latitude(), &Array2::from_elem((ROWS, COLS), 10.0), 1).unwrap();
    assert_eq!(gcps.len(), ROWS * COLS - 1);
    assert!(gcps.iter().all(|g| g.x < 180.0));
}

#[test]
fn test_sentinel3_mosaic_from_archives() {
    init();
    let dir = TempDir::new().unwrap();
    let mut rbt_files: Vec<String> = SEN3_RBT_BANDS.iter().map(|b| format!("{}.nc", b)).collect();
    rbt_files.reverse();
    let rbt_root = write_archive(&dir, RBT_NAME, &rbt_files);
    let lst_root = write_archive(&dir, LST_NAME, &["LST_in.nc".to_string()]);

    let backend = MemoryBackend::new();
    for (i, band) in SEN3_RBT_BANDS.iter().enumerate() {
        let file = rbt_root.join(format!("{}.nc", band));
        let values = Array2::from_shape_fn((ROWS, COLS), |(r, c)| (i * 100 + r * COLS + c) as f64);
        backend.register(
            SubdatasetPath::netcdf(&file, band).to_string(),
            unreferenced(band, values),
        );
    }
    let lst_file = lst_root.join("LST_in.nc");
    backend.register(
        SubdatasetPath::netcdf(&lst_file, "LST").to_string(),
        unreferenced("LST", Array2::from_elem((ROWS, COLS), 1000.0))
            .with_metadata("LST#scale_factor", "0.25", "")
            .with_metadata("LST#add_offset", "40", ""),
    );
    for grid in [Grid::An, Grid::In, Grid::Fn] {
        register_geodetics(&backend, &rbt_root.join("S1_radiance_an.nc"), grid);
    }
    register_geodetics(&backend, &lst_file, Grid::In);

    let rbt = Archive::open(&rbt_root, ProductFamily::Sentinel3Rbt).unwrap();
    let lst = Archive::open(&lst_root, ProductFamily::Sentinel3Lst).unwrap();
    let config = GeoreferencingConfig {
        an_dilation: 1,
        in_dilation: 1,
        fn_dilation: 1,
    };

    let mosaic = MosaicBuilder::new(&backend).sentinel3(&rbt, &lst, &config).unwrap();
    assert_eq!(mosaic.band_count(), 12);
    assert_eq!(mosaic.size().width, COLS);
    assert_eq!(mosaic.size().height, ROWS);
    assert_eq!(mosaic.projection(), WGS84_WKT);

    let data = mosaic.data();
    assert_eq!(data[[0, 0, 0]], 0.0);
    assert_eq!(data[[9, 2, 3]], (900 + 2 * COLS + 3) as f64);
    assert_eq!(data[[11, 5, 4]], 290.0);
}
