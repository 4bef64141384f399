//! Fusion quality metrics
//!
//! Every metric compares two `(batch, band, row, col)` arrays tile by tile
//! and band by band, returning a `(batch, band)` array.

use crate::core::output::BandMetadata;
use crate::types::{FusionError, FusionResult};
use ndarray::{Array2, Array4, ArrayView2, Axis};
use std::collections::BTreeMap;

/// Metadata domain the per-band scores are written to
pub const FUSION_QUALITY_DOMAIN: &str = "Fusion Quality";

const SSIM_C: f64 = 1e-10;

/// Spatial moments of one band pair
struct Moments {
    mean_x: f64,
    mean_y: f64,
    sxx: f64,
    syy: f64,
    sxy: f64,
    n: f64,
}

impl Moments {
    fn of(x: ArrayView2<f32>, y: ArrayView2<f32>) -> Self {
        let n = x.len() as f64;
        let mean_x = x.iter().map(|&v| v as f64).sum::<f64>() / n;
        let mean_y = y.iter().map(|&v| v as f64).sum::<f64>() / n;

        let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
        for (&a, &b) in x.iter().zip(y.iter()) {
            let dx = a as f64 - mean_x;
            let dy = b as f64 - mean_y;
            sxx += dx * dx;
            syy += dy * dy;
            sxy += dx * dy;
        }
        Self {
            mean_x,
            mean_y,
            sxx,
            syy,
            sxy,
            n,
        }
    }
}

fn per_band<F>(x: &Array4<f32>, y: &Array4<f32>, metric: F) -> FusionResult<Array2<f64>>
where
    F: Fn(ArrayView2<f32>, ArrayView2<f32>) -> f64,
{
    if x.dim() != y.dim() {
        return Err(FusionError::InvalidGeometry(format!(
            "Cannot compare arrays of shape {:?} and {:?}",
            x.dim(),
            y.dim()
        )));
    }
    let (batch, bands, _, _) = x.dim();
    Ok(Array2::from_shape_fn((batch, bands), |(t, b)| {
        let xv = x.index_axis(Axis(0), t);
        let yv = y.index_axis(Axis(0), t);
        metric(xv.index_axis(Axis(0), b), yv.index_axis(Axis(0), b))
    }))
}

/// Pearson correlation coefficient; NaN when either band is constant
pub fn pearson(x: &Array4<f32>, y: &Array4<f32>) -> FusionResult<Array2<f64>> {
    per_band(x, y, |a, b| {
        let m = Moments::of(a, b);
        m.sxy / (m.sxx * m.syy).sqrt()
    })
}

/// Mean absolute difference, the root of each squared residual averaged over space
pub fn srmse(x: &Array4<f32>, y: &Array4<f32>) -> FusionResult<Array2<f64>> {
    per_band(x, y, |a, b| {
        let n = a.len() as f64;
        a.iter()
            .zip(b.iter())
            .map(|(&p, &q)| (p as f64 - q as f64).abs())
            .sum::<f64>()
            / n
    })
}

/// Global SSIM: the product of luminance, contrast and structure terms,
/// each clipped at zero
pub fn ssim(x: &Array4<f32>, y: &Array4<f32>) -> FusionResult<Array2<f64>> {
    per_band(x, y, |a, b| {
        let m = Moments::of(a, b);
        let (sx, sy) = ((m.sxx / m.n).sqrt(), (m.syy / m.n).sqrt());

        let l = (2.0 * m.mean_x * m.mean_y + SSIM_C)
            / (m.mean_x.powi(2) + m.mean_y.powi(2) + SSIM_C);
        let c = (2.0 * sx * sy + SSIM_C) / (sx.powi(2) + sy.powi(2) + SSIM_C);
        let s = (m.sxy + SSIM_C) / (m.sxx * m.syy + SSIM_C).sqrt();
        l.max(0.0) * c.max(0.0) * s.max(0.0)
    })
}

/// Running per-band average of one metric
#[derive(Debug, Clone, Default)]
struct Accumulator {
    sums: Vec<f64>,
    counts: Vec<usize>,
}

impl Accumulator {
    fn add(&mut self, values: &Array2<f64>) {
        let bands = values.ncols();
        if self.sums.len() < bands {
            self.sums.resize(bands, 0.0);
            self.counts.resize(bands, 0);
        }
        for row in values.rows() {
            for (band, &v) in row.iter().enumerate() {
                // Constant tiles give an undefined correlation
                if v.is_finite() {
                    self.sums[band] += v;
                    self.counts[band] += 1;
                }
            }
        }
    }

    fn means(&self) -> Vec<f64> {
        self.sums
            .iter()
            .zip(&self.counts)
            .map(|(s, &n)| if n > 0 { s / n as f64 } else { f64::NAN })
            .collect()
    }
}

/// Scene-wide fusion quality, accumulated batch by batch
#[derive(Debug, Clone, Default)]
pub struct FusionQuality {
    r: Accumulator,
    srmse: Accumulator,
    ssim: Accumulator,
    tiles: usize,
}

impl FusionQuality {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score the fused batch `x` against the reference batch `y`
    pub fn evaluate(&mut self, x: &Array4<f32>, y: &Array4<f32>) -> FusionResult<()> {
        self.r.add(&pearson(x, y)?);
        self.srmse.add(&srmse(x, y)?);
        self.ssim.add(&ssim(x, y)?);
        self.tiles += x.len_of(Axis(0));
        log::debug!("Evaluated {} tiles so far", self.tiles);
        Ok(())
    }

    pub fn tiles_evaluated(&self) -> usize {
        self.tiles
    }

    pub fn mean_r(&self) -> Vec<f64> {
        self.r.means()
    }

    pub fn mean_srmse(&self) -> Vec<f64> {
        self.srmse.means()
    }

    pub fn mean_ssim(&self) -> Vec<f64> {
        self.ssim.means()
    }
}

impl BandMetadata for FusionQuality {
    fn domain(&self) -> &str {
        FUSION_QUALITY_DOMAIN
    }

    fn band_values(&self) -> Vec<BTreeMap<String, String>> {
        let (r, e, s) = (self.mean_r(), self.mean_srmse(), self.mean_ssim());
        (0..r.len())
            .map(|band| {
                BTreeMap::from([
                    ("r".to_string(), r[band].to_string()),
                    ("srmse".to_string(), e[band].to_string()),
                    ("ssim".to_string(), s[band].to_string()),
                ])
            })
            .collect()
    }
}
