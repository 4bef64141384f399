//! Georeferencing from geolocation grids
//!
//! Sentinel-3 variables carry no affine geotransform; every pixel is located
//! through longitude/latitude/elevation grids. This module samples those grids
//! into ground control points and fits an affine approximation to them.

use crate::config::GeoreferencingConfig;
use crate::core::output::MetadataDomain;
use crate::io::raster::{Raster, RasterBackend};
use crate::io::subdataset::{open_scaled, GeodeticPaths, ScaledSubRaster};
use crate::types::{FusionError, FusionResult, GeoTransform, GroundControlPoint};
use ndarray::Array2;

/// WGS 84 geographic coordinates, the CRS of the geolocation grids
pub const WGS84_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AXIS["Latitude",NORTH],AXIS["Longitude",EAST],AUTHORITY["EPSG","4326"]]"#;

pub const LONGITUDE_RANGE: (f64, f64) = (-180.0, 180.0);
pub const LATITUDE_RANGE: (f64, f64) = (-90.0, 90.0);
pub const ELEVATION_RANGE: (f64, f64) = (0.0, 9000.0);

fn in_range(value: f64, (min, max): (f64, f64)) -> bool {
    value >= min && value <= max
}

/// Sample co-located physical geolocation grids into GCPs.
///
/// Every `dilation`-th sample of the flattened grids is considered; samples
/// outside the valid ground ranges are dropped. Sample `i` sits at pixel
/// `i % width`, line `i / width`.
pub fn geodetics_to_gcps(
    longitude: &Array2<f64>,
    latitude: &Array2<f64>,
    elevation: &Array2<f64>,
    dilation: usize,
) -> FusionResult<Vec<GroundControlPoint>> {
    if longitude.dim() != latitude.dim() || longitude.dim() != elevation.dim() {
        return Err(FusionError::InvalidGeometry(format!(
            "Geolocation grids differ in shape: {:?}, {:?}, {:?}",
            longitude.dim(),
            latitude.dim(),
            elevation.dim()
        )));
    }
    if dilation == 0 {
        return Err(FusionError::Config("Grid dilation must be positive".to_string()));
    }

    let width = longitude.ncols();
    let samples = longitude.len();
    let (lon, lat, elev) = (longitude.iter(), latitude.iter(), elevation.iter());

    let mut gcps = Vec::with_capacity(samples / dilation + 1);
    let mut dropped = 0usize;
    for (i, ((&x, &y), &z)) in lon.zip(lat).zip(elev).enumerate().step_by(dilation) {
        if !in_range(x, LONGITUDE_RANGE) || !in_range(y, LATITUDE_RANGE) || !in_range(z, ELEVATION_RANGE) {
            dropped += 1;
            continue;
        }
        gcps.push(GroundControlPoint {
            x,
            y,
            z,
            pixel: (i % width) as f64,
            line: (i / width) as f64,
        });
    }

    if dropped > 0 {
        log::warn!("Dropped {} geolocation samples outside the valid ranges", dropped);
    }
    log::debug!("Built {} GCPs from {} samples (dilation {})", gcps.len(), samples, dilation);
    Ok(gcps)
}

/// Least-squares affine geotransform through `gcps`.
///
/// The fitted transform maps each GCP's `(pixel, line)` onto its ground
/// coordinate, as GDAL's `GCPsToGeoTransform` does.
pub fn fit_geotransform(gcps: &[GroundControlPoint]) -> FusionResult<GeoTransform> {
    if gcps.len() < 3 {
        return Err(FusionError::Georeferencing(format!(
            "At least three GCPs are required, got {}",
            gcps.len()
        )));
    }

    let n = gcps.len() as f64;
    let mean = |f: &dyn Fn(&GroundControlPoint) -> f64| gcps.iter().map(f).sum::<f64>() / n;
    let mu = mean(&|g| g.pixel);
    let mv = mean(&|g| g.line);
    let mx = mean(&|g| g.x);
    let my = mean(&|g| g.y);

    // Centred normal equations
    let (mut suu, mut svv, mut suv) = (0.0, 0.0, 0.0);
    let (mut sux, mut svx, mut suy, mut svy) = (0.0, 0.0, 0.0, 0.0);
    for g in gcps {
        let u = g.pixel - mu;
        let v = g.line - mv;
        let x = g.x - mx;
        let y = g.y - my;
        suu += u * u;
        svv += v * v;
        suv += u * v;
        sux += u * x;
        svx += v * x;
        suy += u * y;
        svy += v * y;
    }

    let det = suu * svv - suv * suv;
    if !(det > 1e-12 * suu * svv) {
        return Err(FusionError::Georeferencing(
            "GCPs are collinear in pixel/line space".to_string(),
        ));
    }

    let pixel_width = (sux * svv - svx * suv) / det;
    let rotation_x = (svx * suu - sux * suv) / det;
    let rotation_y = (suy * svv - svy * suv) / det;
    let pixel_height = (svy * suu - suy * suv) / det;

    let gt = GeoTransform {
        top_left_x: mx - pixel_width * mu - rotation_x * mv,
        pixel_width,
        rotation_x,
        top_left_y: my - rotation_y * mu - pixel_height * mv,
        rotation_y,
        pixel_height,
    };

    let rms = (gcps
        .iter()
        .map(|g| {
            let (x, y) = gt.apply(g.pixel, g.line);
            (x - g.x).powi(2) + (y - g.y).powi(2)
        })
        .sum::<f64>()
        / n)
        .sqrt();
    log::debug!("Fitted geotransform {:?} (RMS residual {:.6})", gt.coefficients(), rms);

    Ok(gt)
}

/// `GEOLOCATION` metadata domain pointing a raster at its geolocation arrays
pub fn geolocation_domain(paths: &GeodeticPaths) -> MetadataDomain {
    MetadataDomain::new("GEOLOCATION")
        .with("X_DATASET", &paths.longitude)
        .with("X_BAND", 1)
        .with("Y_DATASET", &paths.latitude)
        .with("Y_BAND", 1)
        .with("Z_DATASET", &paths.elevation)
        .with("Z_BAND", 1)
        .with("PIXEL_OFFSET", 0)
        .with("PIXEL_STEP", 1)
        .with("LINE_OFFSET", 0)
        .with("LINE_STEP", 1)
}

/// Derives GCPs or geotransforms for scaled sub-rasters from their
/// geodetic sibling files
pub struct GeoreferencingBuilder<'a, B: RasterBackend> {
    backend: &'a B,
    config: &'a GeoreferencingConfig,
}

impl<'a, B: RasterBackend> GeoreferencingBuilder<'a, B> {
    pub fn new(backend: &'a B, config: &'a GeoreferencingConfig) -> Self {
        Self { backend, config }
    }

    /// GCPs for the grid of `band`
    pub fn ground_control_points<R: Raster>(
        &self,
        band: &ScaledSubRaster<R>,
    ) -> FusionResult<Vec<GroundControlPoint>> {
        let paths = band.geodetic_paths();
        log::debug!("Reading geolocation grids {}", paths.longitude.file.display());

        let longitude = open_scaled(self.backend, &paths.longitude, Some(band.grid))?;
        let latitude = open_scaled(self.backend, &paths.latitude, Some(band.grid))?;
        let elevation = open_scaled(self.backend, &paths.elevation, Some(band.grid))?;

        geodetics_to_gcps(
            &longitude.read_physical()?,
            &latitude.read_physical()?,
            &elevation.read_physical()?,
            self.config.dilation(band.grid),
        )
    }

    /// Affine geotransform for the grid of `band`
    pub fn geotransform<R: Raster>(&self, band: &ScaledSubRaster<R>) -> FusionResult<GeoTransform> {
        fit_geotransform(&self.ground_control_points(band)?)
    }

    /// Physical values of `band` on the fitted geotransform, in WGS 84
    pub fn georeference<R: Raster>(&self, band: &ScaledSubRaster<R>) -> FusionResult<B::Raster> {
        let gt = self.geotransform(band)?;
        let values = band.read_physical()?.mapv(|v| v as f32).insert_axis(ndarray::Axis(0));
        log::info!("Georeferenced {} on the {} grid", band.path.name, band.grid);
        self.backend.from_array(values, gt, WGS84_WKT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gcp(x: f64, y: f64, pixel: f64, line: f64) -> GroundControlPoint {
        GroundControlPoint { x, y, z: 0.0, pixel, line }
    }

    #[test]
    fn test_fit_exact_affine() {
        let truth = GeoTransform::from_coefficients([10.0, 0.01, 0.002, 45.0, -0.001, -0.01]);
        let mut gcps = Vec::new();
        for line in 0..5 {
            for pixel in 0..7 {
                let (x, y) = truth.apply(pixel as f64, line as f64);
                gcps.push(gcp(x, y, pixel as f64, line as f64));
            }
        }

        let fitted = fit_geotransform(&gcps).unwrap();
        for (a, b) in fitted.coefficients().iter().zip(truth.coefficients().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_fit_puts_first_gcp_on_the_origin() {
        let mut gcps = Vec::new();
        for line in 0..3 {
            for pixel in 0..3 {
                gcps.push(gcp(10.0 + pixel as f64, 50.0 - line as f64, pixel as f64, line as f64));
            }
        }

        let fitted = fit_geotransform(&gcps).unwrap();
        let expected = [10.0, 1.0, 0.0, 50.0, 0.0, -1.0];
        for (a, b) in fitted.coefficients().iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_fit_rejects_degenerate_sets() {
        let two = vec![gcp(0.0, 0.0, 0.0, 0.0), gcp(1.0, 1.0, 1.0, 0.0)];
        assert!(matches!(fit_geotransform(&two), Err(FusionError::Georeferencing(_))));

        let collinear: Vec<_> = (0..5).map(|i| gcp(i as f64, 0.0, i as f64, 0.0)).collect();
        assert!(matches!(fit_geotransform(&collinear), Err(FusionError::Georeferencing(_))));
    }

    #[test]
    fn test_dilation_and_positions() {
        let lon = Array2::from_shape_fn((4, 5), |(r, c)| c as f64 + r as f64 * 0.1);
        let lat = Array2::from_elem((4, 5), 40.0);
        let elev = Array2::from_elem((4, 5), 100.0);

        let gcps = geodetics_to_gcps(&lon, &lat, &elev, 3).unwrap();
        // Samples 0, 3, 6, ..., 18
        assert_eq!(gcps.len(), 7);
        assert_eq!((gcps[2].pixel, gcps[2].line), (1.0, 1.0));
        assert_abs_diff_eq!(gcps[2].x, 1.1, epsilon = 1e-12);
    }

    #[test]
    fn test_shape_mismatch() {
        let a = Array2::zeros((2, 2));
        let b = Array2::zeros((2, 3));
        assert!(geodetics_to_gcps(&a, &a, &b, 1).is_err());
    }
}
