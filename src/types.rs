use serde::{Deserialize, Serialize};

/// Affine geotransform mapping pixel/line to ground coordinates
///
/// `x = top_left_x + pixel * pixel_width + line * rotation_x`
/// `y = top_left_y + pixel * rotation_y + line * pixel_height`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Build from the usual six-coefficient GDAL ordering
    pub fn from_coefficients(c: [f64; 6]) -> Self {
        Self {
            top_left_x: c[0],
            pixel_width: c[1],
            rotation_x: c[2],
            top_left_y: c[3],
            rotation_y: c[4],
            pixel_height: c[5],
        }
    }

    /// Six coefficients in GDAL ordering
    pub fn coefficients(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// North-up transform without rotation terms
    pub fn north_up(top_left_x: f64, top_left_y: f64, resolution: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: resolution,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -resolution,
        }
    }

    /// Ground coordinates of a (fractional) pixel/line position
    pub fn apply(&self, pixel: f64, line: f64) -> (f64, f64) {
        (
            self.top_left_x + pixel * self.pixel_width + line * self.rotation_x,
            self.top_left_y + pixel * self.rotation_y + line * self.pixel_height,
        )
    }

    /// Inverse mapping, `None` for a degenerate transform
    pub fn invert(&self) -> Option<GeoTransform> {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        if det.abs() < f64::EPSILON * 1e-3 || !det.is_finite() {
            return None;
        }

        let inv_det = 1.0 / det;
        let a = self.pixel_height * inv_det;
        let b = -self.rotation_x * inv_det;
        let d = -self.rotation_y * inv_det;
        let e = self.pixel_width * inv_det;

        Some(GeoTransform {
            top_left_x: -(a * self.top_left_x + b * self.top_left_y),
            pixel_width: a,
            rotation_x: b,
            top_left_y: -(d * self.top_left_x + e * self.top_left_y),
            rotation_y: d,
            pixel_height: e,
        })
    }

    /// Ground size of one pixel along x and y (absolute values)
    pub fn resolution(&self) -> (f64, f64) {
        (
            self.pixel_width.hypot(self.rotation_y),
            self.rotation_x.hypot(self.pixel_height),
        )
    }

    /// Shift the transform origin by a number of pixels/lines
    pub fn offset_by(&self, pixels: f64, lines: f64) -> GeoTransform {
        let (x, y) = self.apply(pixels, lines);
        GeoTransform {
            top_left_x: x,
            top_left_y: y,
            ..*self
        }
    }
}

/// Raster dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RasterSize {
    pub width: usize,
    pub height: usize,
}

impl RasterSize {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// Ground bounding box `(x_min, y_min, x_max, y_max)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl Bounds {
    /// Footprint of a raster; the sign of the row pitch decides which edge is `y_min`
    pub fn from_geotransform(gt: &GeoTransform, size: RasterSize) -> Self {
        let (w, h) = (size.width as f64, size.height as f64);
        let corners = [
            gt.apply(0.0, 0.0),
            gt.apply(w, 0.0),
            gt.apply(0.0, h),
            gt.apply(w, h),
        ];

        let mut bounds = Bounds {
            x_min: f64::INFINITY,
            y_min: f64::INFINITY,
            x_max: f64::NEG_INFINITY,
            y_max: f64::NEG_INFINITY,
        };
        for (x, y) in corners {
            bounds.x_min = bounds.x_min.min(x);
            bounds.x_max = bounds.x_max.max(x);
            bounds.y_min = bounds.y_min.min(y);
            bounds.y_max = bounds.y_max.max(y);
        }
        bounds
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    /// Overlap of two boxes, `None` when they do not intersect
    pub fn intersection(&self, other: &Bounds) -> Option<Bounds> {
        let b = Bounds {
            x_min: self.x_min.max(other.x_min),
            y_min: self.y_min.max(other.y_min),
            x_max: self.x_max.min(other.x_max),
            y_max: self.y_max.min(other.y_max),
        };
        if b.x_min < b.x_max && b.y_min < b.y_max {
            Some(b)
        } else {
            None
        }
    }

    /// Smallest box containing both
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            x_min: self.x_min.min(other.x_min),
            y_min: self.y_min.min(other.y_min),
            x_max: self.x_max.max(other.x_max),
            y_max: self.y_max.max(other.y_max),
        }
    }
}

/// Pixel window `(x, y, width, height)` of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoordinate {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl TileCoordinate {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self { x, y, width, height }
    }

    /// Whole-raster window
    pub fn full(size: RasterSize) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// True when the window lies completely inside a raster of `size`
    pub fn fits_within(&self, size: RasterSize) -> bool {
        self.x + self.width <= size.width && self.y + self.height <= size.height
    }
}

/// Correspondence between a pixel/line position and a ground coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundControlPoint {
    /// Longitude (or projected x)
    pub x: f64,
    /// Latitude (or projected y)
    pub y: f64,
    /// Elevation in metres
    pub z: f64,
    pub pixel: f64,
    pub line: f64,
}

/// Error types for the fusion pipeline
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("{name} does not follow the naming convention (expected {expected} characters, found {found})")]
    InconsistentArchiveName {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Unexpected number of bands: expected {expected}, found {found}")]
    BandCountMismatch { expected: usize, found: usize },

    #[error("Malformed subdataset path '{0}': PREFIX:\"<path-to-file>\":<subdataset-name> format expected")]
    MalformedSubdatasetPath(String),

    #[error("Alignment failure: {0}")]
    AlignmentFailure(String),

    #[error("Tile streams are not synchronized: batch counts {batches:?}")]
    UnsynchronizedStreams { batches: Vec<usize> },

    #[error("Output raster exhausted after {written} tiles")]
    OutputExhausted { written: usize },

    #[error("Band metadata length mismatch: raster has {expected} bands, got {found} values")]
    BandMetadataLengthMismatch { expected: usize, found: usize },

    #[error("Georeferencing error: {0}")]
    Georeferencing(String),

    #[error("Invalid raster geometry: {0}")]
    InvalidGeometry(String),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for fusion operations
pub type FusionResult<T> = Result<T, FusionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_north_up() {
        let gt = GeoTransform::north_up(300000.0, 5000000.0, 10.0);
        let bounds = Bounds::from_geotransform(&gt, RasterSize::new(100, 50));

        assert_eq!(bounds.x_min, 300000.0);
        assert_eq!(bounds.x_max, 301000.0);
        // y_min comes from the negative row pitch, not the origin
        assert_eq!(bounds.y_min, 4999500.0);
        assert_eq!(bounds.y_max, 5000000.0);
    }

    #[test]
    fn test_bounds_south_up() {
        let gt = GeoTransform::from_coefficients([0.0, 1.0, 0.0, 10.0, 0.0, 2.0]);
        let bounds = Bounds::from_geotransform(&gt, RasterSize::new(4, 5));
        assert_eq!(bounds.y_min, 10.0);
        assert_eq!(bounds.y_max, 20.0);
    }

    #[test]
    fn test_geotransform_inverse() {
        let gt = GeoTransform::from_coefficients([100.0, 2.0, 0.5, 200.0, 0.25, -3.0]);
        let inv = gt.invert().unwrap();
        let (x, y) = gt.apply(7.0, 11.0);
        let (p, l) = inv.apply(x, y);
        assert!((p - 7.0).abs() < 1e-9);
        assert!((l - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_intersection() {
        let a = Bounds { x_min: 0.0, y_min: 0.0, x_max: 10.0, y_max: 10.0 };
        let b = Bounds { x_min: 5.0, y_min: -5.0, x_max: 15.0, y_max: 5.0 };
        let i = a.intersection(&b).unwrap();
        assert_eq!(i, Bounds { x_min: 5.0, y_min: 0.0, x_max: 10.0, y_max: 5.0 });

        let c = Bounds { x_min: 20.0, y_min: 20.0, x_max: 30.0, y_max: 30.0 };
        assert!(a.intersection(&c).is_none());
    }
}
