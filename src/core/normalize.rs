//! Value range transforms applied to tile batches around model inference
//!
//! Batches are `(batch, channel, row, col)` arrays; channel-wise constants
//! broadcast along axis 1.

use crate::types::{FusionError, FusionResult};
use ndarray::{s, Array4, ArrayView3, Axis, Zip};

/// Guards divisions by a zero scale
pub const NORMALIZER_EPSILON: f32 = 1e-15;

fn channel_array(values: &[f32]) -> Array4<f32> {
    Array4::from_shape_fn((1, values.len(), 1, 1), |(_, c, _, _)| values[c])
}

/// Channel-wise affine normalization `(a - offset) / (scale + e)`
#[derive(Debug, Clone, PartialEq)]
pub struct Normalizer {
    offset: Vec<f32>,
    scale: Vec<f32>,
    epsilon: f32,
}

impl Normalizer {
    pub fn new(offset: Vec<f32>, scale: Vec<f32>) -> FusionResult<Self> {
        if offset.len() != scale.len() || offset.is_empty() {
            return Err(FusionError::Config(format!(
                "Normalizer needs one offset and one scale per channel (got {} and {})",
                offset.len(),
                scale.len()
            )));
        }
        Ok(Self {
            offset,
            scale,
            epsilon: NORMALIZER_EPSILON,
        })
    }

    /// Min/max normalizer onto `[0, 1]`
    pub fn min_max(min: &[f32], max: &[f32]) -> FusionResult<Self> {
        let scale = min.iter().zip(max).map(|(lo, hi)| hi - lo).collect();
        Self::new(min.to_vec(), scale)
    }

    pub fn channels(&self) -> usize {
        self.offset.len()
    }

    fn check(&self, batch: &Array4<f32>) -> FusionResult<()> {
        let channels = batch.len_of(Axis(1));
        if channels != self.channels() {
            return Err(FusionError::Processing(format!(
                "Normalizer holds {} channels, batch has {}",
                self.channels(),
                channels
            )));
        }
        Ok(())
    }

    fn divisor(&self) -> Array4<f32> {
        channel_array(&self.scale).mapv(|s| s + self.epsilon)
    }

    pub fn apply(&self, batch: &Array4<f32>) -> FusionResult<Array4<f32>> {
        self.check(batch)?;
        Ok((batch - &channel_array(&self.offset)) / &self.divisor())
    }

    /// Inverse of [`Normalizer::apply`]
    pub fn reverse(&self, batch: &Array4<f32>) -> FusionResult<Array4<f32>> {
        self.check(batch)?;
        Ok(batch * &self.divisor() + &channel_array(&self.offset))
    }
}

/// Zero mean, unit deviation per tile and channel over the spatial axes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Standardizer {
    epsilon: f32,
}

impl Default for Standardizer {
    fn default() -> Self {
        Self {
            epsilon: NORMALIZER_EPSILON,
        }
    }
}

impl Standardizer {
    pub fn apply(&self, batch: &Array4<f32>) -> Array4<f32> {
        let mut out = batch.clone();
        for mut tile in out.axis_iter_mut(Axis(0)) {
            for mut channel in tile.axis_iter_mut(Axis(0)) {
                let n = channel.len() as f32;
                if n == 0.0 {
                    continue;
                }
                let mean = channel.sum() / n;
                let variance = channel.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
                let std = variance.sqrt() + self.epsilon;
                channel.mapv_inplace(|v| (v - mean) / std);
            }
        }
        out
    }
}

/// Block average that ignores non-positive samples.
///
/// Every `scale`×`scale` block becomes `sum / (count(v > 0) + 1e-10)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidAverageDownsampling {
    scale: usize,
}

impl ValidAverageDownsampling {
    pub fn new(scale: usize) -> FusionResult<Self> {
        if scale == 0 {
            return Err(FusionError::Config(
                "Downsampling scale must be positive".to_string(),
            ));
        }
        Ok(Self { scale })
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    pub fn apply(&self, batch: &Array4<f32>) -> FusionResult<Array4<f32>> {
        let (b, c, h, w) = batch.dim();
        let k = self.scale;
        if h % k != 0 || w % k != 0 {
            return Err(FusionError::InvalidGeometry(format!(
                "{}x{} tiles do not split into {}-pixel blocks",
                w, h, k
            )));
        }

        let mut out = Array4::zeros((b, c, h / k, w / k));
        Zip::indexed(&mut out).for_each(|(bi, ci, row, col), value| {
            let block = batch.slice(s![bi, ci, row * k..(row + 1) * k, col * k..(col + 1) * k]);
            let valid = block.iter().filter(|v| **v > 0.0).count() as f32;
            *value = block.sum() / (valid + 1e-10);
        });
        Ok(out)
    }
}

/// Batch preparation before inference
///
/// Tiles are stacked, negatives clipped to zero and each input normalized with
/// its own constants when given.
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    high: Option<Normalizer>,
    low: Option<Normalizer>,
}

impl Preprocessor {
    pub fn new(high: Option<Normalizer>, low: Option<Normalizer>) -> Self {
        Self { high, low }
    }

    fn prepare(tiles: &[ArrayView3<f32>], normalizer: Option<&Normalizer>) -> FusionResult<Array4<f32>> {
        let mut batch = ndarray::stack(Axis(0), tiles)
            .map_err(|e| FusionError::Processing(format!("Failed to stack tiles: {}", e)))?;
        batch.mapv_inplace(|v| if v.is_nan() || v < 0.0 { 0.0 } else { v });
        match normalizer {
            Some(n) => n.apply(&batch),
            None => Ok(batch),
        }
    }

    /// Model inputs from the high and low resolution tiles of one batch
    pub fn apply(
        &self,
        high: &[ArrayView3<f32>],
        low: &[ArrayView3<f32>],
    ) -> FusionResult<(Array4<f32>, Array4<f32>)> {
        Ok((
            Self::prepare(high, self.high.as_ref())?,
            Self::prepare(low, self.low.as_ref())?,
        ))
    }

    /// Model output back in the physical range of the low resolution input
    pub fn reset_value_range(&self, output: &Array4<f32>) -> FusionResult<Array4<f32>> {
        match &self.low {
            Some(n) => n.reverse(output),
            None => Ok(output.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    #[test]
    fn test_normalizer_reverse_restores_values() {
        let normalizer = Normalizer::new(vec![10.0, -1.0], vec![2.0, 4.0]).unwrap();
        let batch = Array4::from_shape_fn((2, 2, 3, 3), |(b, c, r, col)| {
            (b * 10 + c * 5 + r * 3 + col) as f32
        });
        let normalized = normalizer.apply(&batch).unwrap();
        assert_abs_diff_eq!(normalized[[0, 0, 0, 0]], -5.0, epsilon = 1e-5);
        assert_abs_diff_eq!(normalized[[0, 1, 0, 0]], 1.5, epsilon = 1e-5);

        let restored = normalizer.reverse(&normalized).unwrap();
        for (a, b) in restored.iter().zip(batch.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_normalizer_channel_mismatch() {
        let normalizer = Normalizer::new(vec![0.0], vec![1.0]).unwrap();
        assert!(normalizer.apply(&Array4::zeros((1, 2, 2, 2))).is_err());
        assert!(Normalizer::new(vec![0.0, 1.0], vec![1.0]).is_err());
    }

    #[test]
    fn test_standardizer() {
        let batch = Array4::from_shape_fn((1, 1, 2, 2), |(_, _, r, c)| (r * 2 + c) as f32);
        let out = Standardizer::default().apply(&batch);
        assert_abs_diff_eq!(out.sum(), 0.0, epsilon = 1e-5);
        let variance = out.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert_abs_diff_eq!(variance, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_valid_average_ignores_empty_samples() {
        let mut batch = Array4::from_elem((1, 1, 4, 4), 2.0f32);
        batch[[0, 0, 0, 0]] = 0.0;
        batch.slice_mut(s![0, 0, 2.., 2..]).fill(0.0);

        let out = ValidAverageDownsampling::new(2).unwrap().apply(&batch).unwrap();
        assert_eq!(out.dim(), (1, 1, 2, 2));
        assert_abs_diff_eq!(out[[0, 0, 0, 0]], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(out[[0, 0, 0, 1]], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(out[[0, 0, 1, 1]], 0.0, epsilon = 1e-5);

        assert!(ValidAverageDownsampling::new(3).unwrap().apply(&batch).is_err());
    }

    #[test]
    fn test_preprocessor_clips_and_resets() {
        let low = Normalizer::new(vec![100.0], vec![50.0]).unwrap();
        let preprocess = Preprocessor::new(None, Some(low));

        let high = Array3::from_elem((2, 4, 4), -3.0f32);
        let coarse = Array3::from_elem((1, 2, 2), 150.0f32);
        let (h, l) = preprocess.apply(&[high.view()], &[coarse.view()]).unwrap();
        assert_eq!(h.dim(), (1, 2, 4, 4));
        assert!(h.iter().all(|v| *v == 0.0));
        assert_abs_diff_eq!(l[[0, 0, 1, 1]], 1.0, epsilon = 1e-5);

        let reset = preprocess.reset_value_range(&l).unwrap();
        assert_abs_diff_eq!(reset[[0, 0, 0, 0]], 150.0, epsilon = 1e-3);
    }
}
