//! GDAL raster backend
//!
//! Reprojection and window crops go through the GDAL utility C API
//! (`GDALWarp`, `GDALTranslate`); mosaics through `build_vrt`. Every
//! derived raster is materialised in the `MEM` driver so it stays valid
//! once its inputs are dropped.

use crate::io::raster::{Raster, RasterBackend, RasterSpec, ReprojectRequest, Window, WritableRaster};
use crate::types::{FusionError, FusionResult, GeoTransform, RasterSize, TileCoordinate};
use gdal::cpl::CslStringList;
use gdal::programs::raster::{build_vrt, BuildVRTOptions};
use gdal::raster::Buffer;
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::{Array2, Array3, ArrayView3, Axis};
use std::ffi::{CStr, CString};
use std::path::Path;

/// Raster handle backed by a GDAL dataset
pub struct GdalRaster {
    dataset: Dataset,
    description: String,
}

impl GdalRaster {
    pub fn new(dataset: Dataset, description: impl Into<String>) -> Self {
        Self {
            dataset,
            description: description.into(),
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    fn check_band(&self, band: usize) -> FusionResult<isize> {
        if band == 0 || band > self.band_count() {
            return Err(FusionError::InvalidGeometry(format!(
                "Band {} out of range for raster {} with {} bands",
                band,
                self.description,
                self.band_count()
            )));
        }
        Ok(band as isize)
    }
}

impl std::fmt::Debug for GdalRaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GdalRaster")
            .field("description", &self.description)
            .field("size", &self.dataset.raster_size())
            .field("bands", &self.dataset.raster_count())
            .finish()
    }
}

impl Raster for GdalRaster {
    fn description(&self) -> String {
        self.description.clone()
    }

    fn geo_transform(&self) -> FusionResult<GeoTransform> {
        Ok(GeoTransform::from_coefficients(self.dataset.geo_transform()?))
    }

    fn projection(&self) -> String {
        self.dataset.projection()
    }

    fn size(&self) -> RasterSize {
        let (width, height) = self.dataset.raster_size();
        RasterSize::new(width, height)
    }

    fn band_count(&self) -> usize {
        self.dataset.raster_count().max(0) as usize
    }

    fn read_window(&self, window: &TileCoordinate) -> FusionResult<Array3<f32>> {
        if !window.fits_within(self.size()) {
            return Err(FusionError::InvalidGeometry(format!(
                "Window {:?} exceeds raster {}",
                window, self.description
            )));
        }

        let shape = (window.width, window.height);
        let mut output = Array3::zeros((self.band_count(), window.height, window.width));
        for (index, mut plane) in output.axis_iter_mut(Axis(0)).enumerate() {
            let band = self.dataset.rasterband(index as isize + 1)?;
            let buffer = band.read_as::<f32>((window.x as isize, window.y as isize), shape, shape, None)?;
            let data = Array2::from_shape_vec((window.height, window.width), buffer.data)
                .map_err(|e| FusionError::Processing(format!("Failed to reshape band data: {}", e)))?;
            plane.assign(&data);
        }
        Ok(output)
    }

    fn read_band(&self, band: usize) -> FusionResult<Array2<f64>> {
        let index = self.check_band(band)?;
        let (width, height) = self.dataset.raster_size();
        let rasterband = self.dataset.rasterband(index)?;
        let buffer = rasterband.read_as::<f64>((0, 0), (width, height), (width, height), None)?;

        Array2::from_shape_vec((height, width), buffer.data)
            .map_err(|e| FusionError::Processing(format!("Failed to reshape band data: {}", e)))
    }

    fn metadata_item(&self, key: &str, domain: &str) -> Option<String> {
        self.dataset.metadata_item(key, domain)
    }
}

impl WritableRaster for GdalRaster {
    fn write_window(&mut self, window: &TileCoordinate, data: ArrayView3<f32>) -> FusionResult<()> {
        let expected = (self.band_count(), window.height, window.width);
        if data.dim() != expected || !window.fits_within(self.size()) {
            return Err(FusionError::InvalidGeometry(format!(
                "Array of shape {:?} cannot be written at {:?} into {}",
                data.dim(),
                window,
                self.description
            )));
        }

        for (index, plane) in data.axis_iter(Axis(0)).enumerate() {
            let mut band = self.dataset.rasterband(index as isize + 1)?;
            let buffer = Buffer::new((window.width, window.height), plane.iter().copied().collect());
            band.write((window.x as isize, window.y as isize), (window.width, window.height), &buffer)?;
        }
        Ok(())
    }

    fn set_metadata_item(&mut self, key: &str, value: &str, domain: &str) -> FusionResult<()> {
        self.dataset.set_metadata_item(key, value, domain)?;
        Ok(())
    }

    fn band_metadata_item(&self, band: usize, key: &str, domain: &str) -> Option<String> {
        let index = self.check_band(band).ok()?;
        self.dataset.rasterband(index).ok()?.metadata_item(key, domain)
    }

    fn set_band_metadata_item(
        &mut self,
        band: usize,
        key: &str,
        value: &str,
        domain: &str,
    ) -> FusionResult<()> {
        let index = self.check_band(band)?;
        let mut rasterband = self.dataset.rasterband(index)?;
        rasterband.set_metadata_item(key, value, domain)?;
        Ok(())
    }
}

/// Backend delegating to the GDAL library
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalBackend;

impl GdalBackend {
    pub fn new() -> Self {
        Self
    }

    fn last_error(operation: &str) -> FusionError {
        let message = unsafe {
            let ptr = gdal_sys::CPLGetLastErrorMsg();
            if ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        };
        FusionError::Processing(format!("{} failed: {}", operation, message))
    }

    fn options(args: &[String]) -> FusionResult<CslStringList> {
        let mut list = CslStringList::new();
        for arg in args {
            list.add_string(arg)?;
        }
        Ok(list)
    }

    /// `gdalwarp` into an anonymous MEM dataset
    fn warp(source: &Dataset, args: &[String]) -> FusionResult<Dataset> {
        let options = Self::options(args)?;
        let dest = CString::new("").map_err(|e| FusionError::Processing(e.to_string()))?;

        unsafe {
            let warp_options = gdal_sys::GDALWarpAppOptionsNew(options.as_ptr(), std::ptr::null_mut());
            if warp_options.is_null() {
                return Err(Self::last_error("GDALWarpAppOptionsNew"));
            }

            let mut sources = [source.c_dataset()];
            let mut usage_error: std::os::raw::c_int = 0;
            let handle = gdal_sys::GDALWarp(
                dest.as_ptr(),
                std::ptr::null_mut(),
                1,
                sources.as_mut_ptr(),
                warp_options,
                &mut usage_error,
            );
            gdal_sys::GDALWarpAppOptionsFree(warp_options);

            if handle.is_null() || usage_error != 0 {
                return Err(Self::last_error("GDALWarp"));
            }
            Ok(Dataset::from_c_dataset(handle))
        }
    }

    /// `gdal_translate` into an anonymous MEM dataset
    fn translate(source: &Dataset, args: &[String]) -> FusionResult<Dataset> {
        let options = Self::options(args)?;
        let dest = CString::new("").map_err(|e| FusionError::Processing(e.to_string()))?;

        unsafe {
            let translate_options =
                gdal_sys::GDALTranslateOptionsNew(options.as_ptr(), std::ptr::null_mut());
            if translate_options.is_null() {
                return Err(Self::last_error("GDALTranslateOptionsNew"));
            }

            let mut usage_error: std::os::raw::c_int = 0;
            let handle = gdal_sys::GDALTranslate(
                dest.as_ptr(),
                source.c_dataset(),
                translate_options,
                &mut usage_error,
            );
            gdal_sys::GDALTranslateOptionsFree(translate_options);

            if handle.is_null() || usage_error != 0 {
                return Err(Self::last_error("GDALTranslate"));
            }
            Ok(Dataset::from_c_dataset(handle))
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

impl RasterBackend for GdalBackend {
    type Raster = GdalRaster;

    fn open(&self, path: &str) -> FusionResult<GdalRaster> {
        log::debug!("Opening raster {}", path);
        let dataset = Dataset::open(Path::new(path))?;
        Ok(GdalRaster::new(dataset, path))
    }

    fn reproject_and_crop(
        &self,
        raster: &GdalRaster,
        request: &ReprojectRequest,
    ) -> FusionResult<GdalRaster> {
        let b = &request.bounds;
        let res = request.resolution.to_string();
        let mut args = strings(&["-of", "MEM", "-r", "near", "-tap"]);
        if !request.src_crs.is_empty() {
            args.extend(strings(&["-s_srs", &request.src_crs]));
        }
        args.extend(strings(&["-t_srs", &request.dst_crs, "-tr", &res, &res]));
        args.extend(strings(&[
            "-te",
            &b.x_min.to_string(),
            &b.y_min.to_string(),
            &b.x_max.to_string(),
            &b.y_max.to_string(),
        ]));

        log::debug!("gdalwarp {} {}", raster.description, args.join(" "));
        let dataset = Self::warp(&raster.dataset, &args)?;
        Ok(GdalRaster::new(dataset, format!("{} (warped)", raster.description)))
    }

    fn build_mosaic(&self, bands: &[GdalRaster]) -> FusionResult<GdalRaster> {
        if bands.is_empty() {
            return Err(FusionError::Processing(
                "Cannot build a mosaic from zero rasters".to_string(),
            ));
        }

        let datasets: Vec<&Dataset> = bands.iter().map(|b| &b.dataset).collect();
        let options = BuildVRTOptions::new(vec!["-resolution", "highest", "-separate"])?;
        let vrt = build_vrt(None, &datasets, Some(options))?;

        // The VRT refers to its sources; copy it out while they are still open
        let dataset = Self::translate(&vrt, &strings(&["-of", "MEM"]))?;
        Ok(GdalRaster::new(dataset, "mosaic"))
    }

    fn window_crop(&self, raster: &GdalRaster, window: &Window) -> FusionResult<GdalRaster> {
        let mut args = strings(&["-of", "MEM"]);
        match window {
            Window::Pixels(w) => args.extend(strings(&[
                "-srcwin",
                &w.x.to_string(),
                &w.y.to_string(),
                &w.width.to_string(),
                &w.height.to_string(),
            ])),
            Window::Ground(b) => args.extend(strings(&[
                "-projwin",
                &b.x_min.to_string(),
                &b.y_max.to_string(),
                &b.x_max.to_string(),
                &b.y_min.to_string(),
            ])),
        }

        log::debug!("gdal_translate {} {}", raster.description, args.join(" "));
        let dataset = Self::translate(&raster.dataset, &args)?;
        Ok(GdalRaster::new(dataset, format!("{} (cropped)", raster.description)))
    }

    fn create(&self, spec: &RasterSpec) -> FusionResult<GdalRaster> {
        let (driver_name, path) = match &spec.path {
            Some(path) => ("GTiff", path.clone()),
            None => ("MEM", Path::new("").to_path_buf()),
        };
        log::info!(
            "Creating {} raster {} ({}x{}, {} bands)",
            driver_name,
            path.display(),
            spec.size.width,
            spec.size.height,
            spec.bands
        );

        let driver = DriverManager::get_driver_by_name(driver_name)?;
        let mut dataset = driver.create_with_band_type::<f32, _>(
            &path,
            spec.size.width as isize,
            spec.size.height as isize,
            spec.bands as isize,
        )?;
        dataset.set_geo_transform(&spec.geo_transform.coefficients())?;
        if !spec.projection.is_empty() {
            dataset.set_projection(&spec.projection)?;
        }

        Ok(GdalRaster::new(dataset, path.display().to_string()))
    }

    fn from_array(
        &self,
        data: Array3<f32>,
        geo_transform: GeoTransform,
        projection: &str,
    ) -> FusionResult<GdalRaster> {
        let (bands, height, width) = data.dim();
        let spec = RasterSpec {
            path: None,
            geo_transform,
            projection: projection.to_string(),
            size: RasterSize::new(width, height),
            bands,
        };
        let mut raster = self.create(&spec)?;
        raster.write_window(&TileCoordinate::full(spec.size), data.view())?;
        Ok(raster)
    }
}

#[cfg(all(test, feature = "gdal"))]
mod tests {
    use super::*;
    use crate::io::memory::MemoryBackend;
    use crate::types::Bounds;
    use gdal::spatial_ref::SpatialRef;

    fn utm31() -> String {
        SpatialRef::from_epsg(32631).unwrap().to_wkt().unwrap()
    }

    fn ramp(bands: usize, rows: usize, cols: usize) -> Array3<f32> {
        Array3::from_shape_fn((bands, rows, cols), |(b, r, c)| (b * 10000 + r * 100 + c) as f32)
    }

    /// The same array on both backends
    fn pair(data: Array3<f32>, gt: GeoTransform) -> (GdalRaster, crate::io::MemRaster) {
        let wkt = utm31();
        let on_gdal = GdalBackend::new().from_array(data.clone(), gt, &wkt).unwrap();
        let in_memory = MemoryBackend::new().from_array(data, gt, &wkt).unwrap();
        (on_gdal, in_memory)
    }

    fn full<R: Raster>(raster: &R) -> Array3<f32> {
        raster.read_window(&TileCoordinate::full(raster.size())).unwrap()
    }

    #[test]
    fn test_from_array_round_trip() {
        let gt = GeoTransform::north_up(500_000.0, 4_000_000.0, 10.0);
        let raster = GdalBackend::new().from_array(ramp(3, 8, 12), gt, &utm31()).unwrap();
        assert_eq!(raster.band_count(), 3);
        assert_eq!(raster.size(), RasterSize::new(12, 8));
        assert_eq!(raster.geo_transform().unwrap(), gt);
        assert_eq!(full(&raster), ramp(3, 8, 12));
        assert_eq!(raster.read_band(2).unwrap()[[7, 11]], 10711.0);
        assert!(raster.read_band(4).is_err());
    }

    #[test]
    fn test_pixel_crop_matches_memory_backend() {
        let (on_gdal, in_memory) = pair(ramp(2, 20, 30), GeoTransform::north_up(0.0, 100.0, 2.0));
        let window = Window::Pixels(TileCoordinate::new(5, 3, 10, 4));

        let a = GdalBackend::new().window_crop(&on_gdal, &window).unwrap();
        let b = MemoryBackend::new().window_crop(&in_memory, &window).unwrap();
        assert_eq!(a.size(), RasterSize::new(10, 4));
        assert_eq!(a.geo_transform().unwrap(), b.geo_transform().unwrap());
        assert_eq!(full(&a), full(&b));
    }

    #[test]
    fn test_ground_crop_matches_memory_backend() {
        let (on_gdal, in_memory) = pair(ramp(2, 20, 30), GeoTransform::north_up(0.0, 100.0, 2.0));
        // Pixels x 5..15, y 10..20
        let window = Window::Ground(Bounds {
            x_min: 10.0,
            y_min: 60.0,
            x_max: 30.0,
            y_max: 80.0,
        });

        let a = GdalBackend::new().window_crop(&on_gdal, &window).unwrap();
        let b = MemoryBackend::new().window_crop(&in_memory, &window).unwrap();
        assert_eq!(a.size(), RasterSize::new(10, 10));
        assert_eq!(a.geo_transform().unwrap(), b.geo_transform().unwrap());
        assert_eq!(full(&a)[[0, 0, 0]], 1005.0);
        assert_eq!(full(&a), full(&b));
    }

    #[test]
    fn test_reproject_within_crs_matches_memory_backend() {
        let (on_gdal, in_memory) = pair(ramp(1, 10, 10), GeoTransform::north_up(0.0, 100.0, 10.0));
        for resolution in [10.0, 50.0] {
            let request = ReprojectRequest {
                bounds: on_gdal.bounds().unwrap(),
                src_crs: String::new(),
                dst_crs: "EPSG:32631".to_string(),
                resolution,
            };
            let a = GdalBackend::new().reproject_and_crop(&on_gdal, &request).unwrap();
            let b = MemoryBackend::new().reproject_and_crop(&in_memory, &request).unwrap();
            assert_eq!(a.size(), b.size());
            assert_eq!(a.geo_transform().unwrap(), b.geo_transform().unwrap());
            assert_eq!(full(&a), full(&b));
        }
    }

    #[test]
    fn test_mosaic_keeps_band_order() {
        let backend = GdalBackend::new();
        let gt = GeoTransform::north_up(0.0, 40.0, 10.0);
        let bands: Vec<GdalRaster> = [3.0f32, 1.0, 2.0]
            .iter()
            .map(|&v| backend.from_array(Array3::from_elem((1, 4, 4), v), gt, &utm31()).unwrap())
            .collect();

        let mosaic = backend.build_mosaic(&bands).unwrap();
        drop(bands);
        assert_eq!(mosaic.band_count(), 3);
        assert_eq!(mosaic.size(), RasterSize::new(4, 4));
        for (band, expected) in [(1, 3.0), (2, 1.0), (3, 2.0)] {
            assert!(mosaic.read_band(band).unwrap().iter().all(|&v| v == expected));
        }
        assert!(backend.build_mosaic(&[]).is_err());
    }

    #[test]
    fn test_window_writes_and_metadata_round_trip() {
        let backend = GdalBackend::new();
        let spec = RasterSpec {
            path: None,
            geo_transform: GeoTransform::north_up(0.0, 20.0, 1.0),
            projection: utm31(),
            size: RasterSize::new(20, 20),
            bands: 2,
        };
        let mut raster = backend.create(&spec).unwrap();

        let tile = Array3::from_elem((2, 10, 10), 4.5f32);
        raster.write_window(&TileCoordinate::new(10, 10, 10, 10), tile.view()).unwrap();
        let data = full(&raster);
        assert_eq!(data[[1, 19, 19]], 4.5);
        assert_eq!(data[[1, 9, 9]], 0.0);
        let wrong = Array3::<f32>::zeros((1, 10, 10));
        assert!(raster.write_window(&TileCoordinate::new(0, 0, 10, 10), wrong.view()).is_err());

        raster.set_metadata_item("RESOLUTION_RATIO", "5", "FUSION").unwrap();
        raster.set_band_metadata_item(2, "r", "0.93", "Fusion Quality").unwrap();
        assert_eq!(raster.metadata_item("RESOLUTION_RATIO", "FUSION").as_deref(), Some("5"));
        assert_eq!(raster.band_metadata_item(2, "r", "Fusion Quality").as_deref(), Some("0.93"));
        assert!(raster.band_metadata_item(1, "r", "Fusion Quality").is_none());
        assert!(raster.band_metadata_item(3, "r", "Fusion Quality").is_none());
        assert!(raster.set_band_metadata_item(0, "r", "1", "Fusion Quality").is_err());
    }
}
