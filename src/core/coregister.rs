//! Sub-pixel co-registration
//!
//! [`Coregistrar`] is the seam to the co-registration algorithm. The
//! bundled [`PhaseCorrelationCoregistrar`] estimates one shift per matching
//! window by FFT phase correlation, keeps the reliable ones, and applies
//! their median to the moving raster.

use crate::config::CoregistrationConfig;
use crate::io::raster::Raster;
use crate::types::{FusionError, FusionResult, GeoTransform, TileCoordinate};
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use num_complex::Complex64;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// Shifted moving raster, clipped to the overlap with the reference
#[derive(Debug, Clone)]
pub struct CoregistrationResult {
    /// `(band, row, col)` pixel values
    pub data: Array3<f32>,
    pub geo_transform: GeoTransform,
    pub projection: String,
    /// Applied shift in moving-raster pixels
    pub shift: (f64, f64),
    /// Number of windows that produced a reliable shift
    pub tie_points: usize,
}

pub trait Coregistrar {
    /// Align `moving` onto `reference`
    fn coregister(
        &self,
        reference: &dyn Raster,
        moving: &dyn Raster,
        params: &CoregistrationConfig,
    ) -> FusionResult<CoregistrationResult>;
}

/// Shift of one matching window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShiftEstimate {
    /// Displacement of the moving content along x, in pixels
    pub dx: f64,
    /// Displacement of the moving content along y, in pixels
    pub dy: f64,
    /// Percentage; 100 means no competing correlation peak
    pub reliability: f64,
    pub window: TileCoordinate,
}

/// FFT phase-correlation co-registration
#[derive(Debug, Default, Clone, Copy)]
pub struct PhaseCorrelationCoregistrar;

impl PhaseCorrelationCoregistrar {
    pub fn new() -> Self {
        Self
    }

    /// Shifts of every usable window, reliable or not
    pub fn estimate_shifts(
        &self,
        reference: &dyn Raster,
        moving: &dyn Raster,
        params: &CoregistrationConfig,
    ) -> FusionResult<Vec<ShiftEstimate>> {
        let (wx, wy) = params.window_size;
        if wx < 2 || wy < 2 {
            return Err(FusionError::Config(format!(
                "Matching window {:?} is too small",
                params.window_size
            )));
        }

        let ref_band = reference.read_band(params.reference_band)?;
        let mov_band = moving.read_band(params.moving_band)?;
        let ref_on_moving = average_onto_grid(
            &ref_band,
            &reference.geo_transform()?,
            &moving.geo_transform()?,
            mov_band.dim(),
        )?;

        let (rows, cols) = mov_band.dim();
        let mut planner = FftPlanner::new();
        let mut estimates = Vec::new();

        for y in (0..rows.saturating_sub(wy - 1)).step_by(wy) {
            for x in (0..cols.saturating_sub(wx - 1)).step_by(wx) {
                let window = TileCoordinate::new(x, y, wx, wy);
                let ref_patch = ref_on_moving.slice(s![y..y + wy, x..x + wx]);
                let mov_patch = mov_band.slice(s![y..y + wy, x..x + wx]);
                if let Some(estimate) = phase_correlate(ref_patch, mov_patch, window, &mut planner) {
                    estimates.push(estimate);
                }
            }
        }

        log::debug!("Estimated {} window shifts", estimates.len());
        Ok(estimates)
    }
}

impl Coregistrar for PhaseCorrelationCoregistrar {
    fn coregister(
        &self,
        reference: &dyn Raster,
        moving: &dyn Raster,
        params: &CoregistrationConfig,
    ) -> FusionResult<CoregistrationResult> {
        let estimates = self.estimate_shifts(reference, moving, params)?;
        let total = estimates.len();

        let reliable: Vec<&ShiftEstimate> = estimates
            .iter()
            .filter(|e| e.reliability >= params.min_reliability)
            .filter(|e| e.dx.abs() <= params.max_shift && e.dy.abs() <= params.max_shift)
            .collect();

        if reliable.is_empty() {
            return Err(FusionError::AlignmentFailure(format!(
                "No reliable shift vectors ({} windows evaluated, minimum reliability {}%)",
                total, params.min_reliability
            )));
        }
        if reliable.len() < total {
            log::warn!("Discarded {} of {} shift vectors", total - reliable.len(), total);
        }

        let dx = median(reliable.iter().map(|e| e.dx).collect());
        let dy = median(reliable.iter().map(|e| e.dy).collect());
        log::info!(
            "Co-registration shift ({:.3}, {:.3}) px from {} tie points",
            dx,
            dy,
            reliable.len()
        );

        let gt = moving.geo_transform()?;
        let size = moving.size();
        let window = overlap_window(
            &gt,
            (size.width, size.height),
            (dx, dy),
            &reference.bounds()?,
        )?;

        let full = moving.read_window(&TileCoordinate::full(size))?;
        let mut data = Array3::zeros((full.len_of(Axis(0)), window.height, window.width));
        for (src, mut dst) in full.axis_iter(Axis(0)).zip(data.axis_iter_mut(Axis(0))) {
            for row in 0..window.height {
                for col in 0..window.width {
                    let sy = (window.y + row) as f64 + dy;
                    let sx = (window.x + col) as f64 + dx;
                    dst[[row, col]] = bilinear_sample(&src, sy, sx);
                }
            }
        }

        Ok(CoregistrationResult {
            data,
            geo_transform: gt.offset_by(window.x as f64, window.y as f64),
            projection: moving.projection(),
            shift: (dx, dy),
            tie_points: reliable.len(),
        })
    }
}

/// Mean of the finite `source` pixels whose centres fall in each target
/// pixel; NaN where none do
pub fn average_onto_grid(
    source: &Array2<f64>,
    source_gt: &GeoTransform,
    target_gt: &GeoTransform,
    target_dim: (usize, usize),
) -> FusionResult<Array2<f64>> {
    let inverse = target_gt.invert().ok_or_else(|| {
        FusionError::AlignmentFailure("Moving raster geotransform is not invertible".to_string())
    })?;

    let (rows, cols) = target_dim;
    let mut sum = Array2::<f64>::zeros(target_dim);
    let mut count = Array2::<u32>::zeros(target_dim);

    for ((r, c), &value) in source.indexed_iter() {
        if !value.is_finite() {
            continue;
        }
        let (x, y) = source_gt.apply(c as f64 + 0.5, r as f64 + 0.5);
        let (p, l) = inverse.apply(x, y);
        if p < 0.0 || l < 0.0 {
            continue;
        }
        let (tc, tr) = (p as usize, l as usize);
        if tc < cols && tr < rows {
            sum[[tr, tc]] += value;
            count[[tr, tc]] += 1;
        }
    }

    Ok(ndarray::Zip::from(&sum)
        .and(&count)
        .map_collect(|&s, &n| if n > 0 { s / n as f64 } else { f64::NAN }))
}

fn hann(i: usize, n: usize) -> f64 {
    if n < 2 {
        return 1.0;
    }
    0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos()
}

/// Windowed, mean-free complex copy of a patch; `None` for flat or invalid patches
fn prepare(patch: ArrayView2<f64>) -> Option<Array2<Complex64>> {
    if patch.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mean = patch.mean()?;
    let variance = patch.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / patch.len() as f64;
    if variance <= f64::EPSILON {
        return None;
    }

    let (rows, cols) = patch.dim();
    Some(Array2::from_shape_fn((rows, cols), |(r, c)| {
        Complex64::new((patch[[r, c]] - mean) * hann(r, rows) * hann(c, cols), 0.0)
    }))
}

fn fft2(data: &mut Array2<Complex64>, planner: &mut FftPlanner<f64>, inverse: bool) {
    let (rows, cols) = data.dim();
    let (row_fft, col_fft) = if inverse {
        (planner.plan_fft_inverse(cols), planner.plan_fft_inverse(rows))
    } else {
        (planner.plan_fft_forward(cols), planner.plan_fft_forward(rows))
    };

    let mut buffer = vec![Complex64::new(0.0, 0.0); rows.max(cols)];
    for mut row in data.rows_mut() {
        for (b, v) in buffer.iter_mut().zip(row.iter()) {
            *b = *v;
        }
        row_fft.process(&mut buffer[..cols]);
        for (v, b) in row.iter_mut().zip(buffer.iter()) {
            *v = *b;
        }
    }
    for mut col in data.columns_mut() {
        for (b, v) in buffer.iter_mut().zip(col.iter()) {
            *b = *v;
        }
        col_fft.process(&mut buffer[..rows]);
        for (v, b) in col.iter_mut().zip(buffer.iter()) {
            *v = *b;
        }
    }
}

fn wrap(index: isize, n: usize) -> usize {
    index.rem_euclid(n as isize) as usize
}

/// Offset of the parabola vertex through three samples
fn parabolic_offset(left: f64, centre: f64, right: f64) -> f64 {
    let denominator = left - 2.0 * centre + right;
    if denominator.abs() < f64::EPSILON {
        return 0.0;
    }
    (0.5 * (left - right) / denominator).clamp(-0.5, 0.5)
}

/// Displacement of `moving` relative to `reference` by phase correlation.
///
/// When `moving(p) = reference(p - d)` the correlation surface peaks at `d`.
pub fn phase_correlate(
    reference: ArrayView2<f64>,
    moving: ArrayView2<f64>,
    window: TileCoordinate,
    planner: &mut FftPlanner<f64>,
) -> Option<ShiftEstimate> {
    let mut f = prepare(reference)?;
    let mut g = prepare(moving)?;
    let (rows, cols) = f.dim();

    fft2(&mut f, planner, false);
    fft2(&mut g, planner, false);

    let mut cross = ndarray::Zip::from(&g).and(&f).map_collect(|g, f| {
        let product = g * f.conj();
        let magnitude = product.norm();
        if magnitude > 1e-12 {
            product / magnitude
        } else {
            Complex64::new(0.0, 0.0)
        }
    });
    fft2(&mut cross, planner, true);
    let surface = cross.mapv(|v| v.re);

    let ((pr, pc), peak) = surface
        .indexed_iter()
        .fold(((0, 0), f64::NEG_INFINITY), |best, (idx, &v)| {
            if v > best.1 {
                (idx, v)
            } else {
                best
            }
        });
    if !(peak > 0.0) {
        return None;
    }

    // Highest value outside the 3x3 neighbourhood of the peak
    let second = surface
        .indexed_iter()
        .filter(|((r, c), _)| {
            let dr = (*r as isize - pr as isize).rem_euclid(rows as isize);
            let dc = (*c as isize - pc as isize).rem_euclid(cols as isize);
            let near_r = dr <= 1 || dr >= rows as isize - 1;
            let near_c = dc <= 1 || dc >= cols as isize - 1;
            !(near_r && near_c)
        })
        .map(|(_, &v)| v)
        .fold(0.0f64, f64::max);
    let reliability = (100.0 * (1.0 - second / peak)).clamp(0.0, 100.0);

    let at = |r: isize, c: isize| surface[[wrap(r, rows), wrap(c, cols)]];
    let (pr_i, pc_i) = (pr as isize, pc as isize);
    let sub_r = parabolic_offset(at(pr_i - 1, pc_i), peak, at(pr_i + 1, pc_i));
    let sub_c = parabolic_offset(at(pr_i, pc_i - 1), peak, at(pr_i, pc_i + 1));

    let signed = |p: usize, n: usize| if p > n / 2 { p as f64 - n as f64 } else { p as f64 };
    Some(ShiftEstimate {
        dx: signed(pc, cols) + sub_c,
        dy: signed(pr, rows) + sub_r,
        reliability,
        window,
    })
}

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Bilinear sample with edge clamping
fn bilinear_sample(data: &ArrayView2<f32>, y: f64, x: f64) -> f32 {
    let (rows, cols) = data.dim();
    let y = y.clamp(0.0, (rows - 1) as f64);
    let x = x.clamp(0.0, (cols - 1) as f64);
    let (y0, x0) = (y.floor() as usize, x.floor() as usize);
    let (y1, x1) = ((y0 + 1).min(rows - 1), (x0 + 1).min(cols - 1));
    let (fy, fx) = ((y - y0 as f64) as f32, (x - x0 as f64) as f32);

    let top = data[[y0, x0]] * (1.0 - fx) + data[[y0, x1]] * fx;
    let bottom = data[[y1, x0]] * (1.0 - fx) + data[[y1, x1]] * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Pixel window of the moving grid that stays supported after shifting by
/// `shift` and lies inside `reference_bounds`
fn overlap_window(
    gt: &GeoTransform,
    (width, height): (usize, usize),
    (dx, dy): (f64, f64),
    reference_bounds: &crate::types::Bounds,
) -> FusionResult<TileCoordinate> {
    let lost = |d: f64| d.abs().ceil() as usize;
    let mut c0 = if dx < 0.0 { lost(dx) } else { 0 };
    let mut c1 = width.saturating_sub(if dx > 0.0 { lost(dx) } else { 0 });
    let mut r0 = if dy < 0.0 { lost(dy) } else { 0 };
    let mut r1 = height.saturating_sub(if dy > 0.0 { lost(dy) } else { 0 });

    let inverse = gt.invert().ok_or_else(|| {
        FusionError::AlignmentFailure("Moving raster geotransform is not invertible".to_string())
    })?;
    let b = reference_bounds;
    let corners = [
        inverse.apply(b.x_min, b.y_min),
        inverse.apply(b.x_max, b.y_min),
        inverse.apply(b.x_min, b.y_max),
        inverse.apply(b.x_max, b.y_max),
    ];
    let p_min = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min);
    let p_max = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max);
    let l_min = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min);
    let l_max = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max);

    let snap_in = |v: f64| (v - 1e-6).ceil().max(0.0) as usize;
    let snap_out = |v: f64| (v + 1e-6).floor().max(0.0) as usize;
    c0 = c0.max(snap_in(p_min));
    c1 = c1.min(snap_out(p_max));
    r0 = r0.max(snap_in(l_min));
    r1 = r1.min(snap_out(l_max));

    if c0 >= c1 || r0 >= r1 {
        return Err(FusionError::AlignmentFailure(
            "Empty overlap between reference and shifted moving raster".to_string(),
        ));
    }
    Ok(TileCoordinate::new(c0, r0, c1 - c0, r1 - r0))
}
