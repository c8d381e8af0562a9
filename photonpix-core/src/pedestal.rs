//! Online per-pixel pedestal (dark level) estimation.
//!
//! Each pixel keeps a running sum and sum of squares. The first `n_samples`
//! values are averaged plainly; after that the sums decay like a leaky
//! integrator so the estimate follows slow drifts of the baseline.

use crate::error::{Error, Result};
use crate::pixel::{Accumulator, Pixel};
use ndarray::{Array2, ArrayView2, Zip};

/// Running mean/variance estimator for every pixel of a frame.
///
/// The mean is cached per pixel because the cluster finder reads it for
/// every neighbour of every pixel, far more often than it is updated.
#[derive(Debug, Clone)]
pub struct PedestalTracker<F = f64> {
    n_samples: u32,
    samples: Array2<u32>,
    sum: Array2<F>,
    sum_sq: Array2<F>,
    mean: Array2<F>,
}

impl<F: Accumulator> PedestalTracker<F> {
    /// Creates a tracker for a `rows x cols` detector with warm-up length
    /// `n_samples`.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` if any dimension or `n_samples` is zero.
    pub fn new(rows: usize, cols: usize, n_samples: u32) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(Error::InvalidConfig(format!(
                "pedestal shape must be non-empty, got ({rows}, {cols})"
            )));
        }
        if n_samples == 0 {
            return Err(Error::InvalidConfig(
                "pedestal warm-up length must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            n_samples,
            samples: Array2::zeros((rows, cols)),
            sum: Array2::from_elem((rows, cols), F::zero()),
            sum_sq: Array2::from_elem((rows, cols), F::zero()),
            mean: Array2::from_elem((rows, cols), F::zero()),
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.samples.nrows()
    }

    /// Number of columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.samples.ncols()
    }

    /// Shape as `(rows, cols)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.samples.dim()
    }

    /// Warm-up length.
    #[must_use]
    pub fn n_samples(&self) -> u32 {
        self.n_samples
    }

    /// Adds one sample to a pixel.
    ///
    /// # Panics
    /// Panics if `(row, col)` is outside the tracker.
    #[inline]
    pub fn push<T: Pixel>(&mut self, row: usize, col: usize, value: T) {
        let idx = [row, col];
        accumulate(
            &mut self.samples[idx],
            &mut self.sum[idx],
            &mut self.sum_sq[idx],
            &mut self.mean[idx],
            self.n_samples,
            F::from_pixel(value),
        );
    }

    /// Adds one sample assuming the pixel has finished its warm-up.
    ///
    /// Skips the warm-up branch. Used before warm-up it leaves the sample
    /// count untouched and the estimate under-counted until the decaying sums
    /// catch up.
    ///
    /// # Panics
    /// Panics if `(row, col)` is outside the tracker.
    #[inline]
    pub fn push_fast<T: Pixel>(&mut self, row: usize, col: usize, value: T) {
        let idx = [row, col];
        let value = F::from_pixel(value);
        let count = F::from_count(self.n_samples);

        let sum = self.sum[idx];
        let sum = sum + value - sum / count;
        let sum_sq = self.sum_sq[idx];
        let sum_sq = sum_sq + value * value - sum_sq / count;

        self.sum[idx] = sum;
        self.sum_sq[idx] = sum_sq;
        self.mean[idx] = sum / count;
    }

    /// Pushes every pixel of a frame.
    ///
    /// # Errors
    /// Returns `Error::ShapeMismatch` if the frame shape differs from the
    /// tracker shape.
    pub fn push_frame<T: Pixel>(&mut self, frame: ArrayView2<'_, T>) -> Result<()> {
        self.check_shape(frame.dim())?;
        let n_samples = self.n_samples;
        Zip::from(&mut self.samples)
            .and(&mut self.sum)
            .and(&mut self.sum_sq)
            .and(&mut self.mean)
            .and(&frame)
            .par_for_each(|samples, sum, sum_sq, mean, &value| {
                accumulate(samples, sum, sum_sq, mean, n_samples, F::from_pixel(value));
            });
        Ok(())
    }

    /// Cached mean of a pixel.
    #[inline]
    #[must_use]
    pub fn mean(&self, row: usize, col: usize) -> F {
        self.mean[[row, col]]
    }

    /// Variance of a pixel, zero while no samples were seen.
    ///
    /// Can come out slightly negative through rounding in the decaying sums.
    #[inline]
    #[must_use]
    pub fn variance(&self, row: usize, col: usize) -> F {
        let idx = [row, col];
        variance_of(self.samples[idx], self.sum_sq[idx], self.mean[idx])
    }

    /// Standard deviation of a pixel. Negative variances clamp to zero.
    #[inline]
    #[must_use]
    pub fn std(&self, row: usize, col: usize) -> F {
        self.variance(row, col).max(F::zero()).sqrt()
    }

    /// Number of samples accumulated for a pixel (at most `n_samples`).
    #[must_use]
    pub fn samples_seen(&self, row: usize, col: usize) -> u32 {
        self.samples[[row, col]]
    }

    /// Returns true once every pixel has completed its warm-up.
    #[must_use]
    pub fn is_warmed_up(&self) -> bool {
        self.samples.iter().all(|&n| n == self.n_samples)
    }

    /// Snapshot of the mean of every pixel.
    #[must_use]
    pub fn mean_map(&self) -> Array2<F> {
        self.mean.clone()
    }

    /// Snapshot of the variance of every pixel.
    #[must_use]
    pub fn variance_map(&self) -> Array2<F> {
        Zip::from(&self.samples)
            .and(&self.sum_sq)
            .and(&self.mean)
            .map_collect(|&n, &sum_sq, &mean| variance_of(n, sum_sq, mean))
    }

    /// Snapshot of the standard deviation of every pixel.
    #[must_use]
    pub fn std_map(&self) -> Array2<F> {
        self.variance_map()
            .mapv_into(|variance| variance.max(F::zero()).sqrt())
    }

    /// Per pixel sample counts.
    #[must_use]
    pub fn samples_map(&self) -> ArrayView2<'_, u32> {
        self.samples.view()
    }

    /// Running sums.
    #[must_use]
    pub fn sum(&self) -> ArrayView2<'_, F> {
        self.sum.view()
    }

    /// Running sums of squares.
    #[must_use]
    pub fn sum_sq(&self) -> ArrayView2<'_, F> {
        self.sum_sq.view()
    }

    /// Resets every pixel.
    pub fn clear(&mut self) {
        self.samples.fill(0);
        self.sum.fill(F::zero());
        self.sum_sq.fill(F::zero());
        self.mean.fill(F::zero());
    }

    /// Resets a single pixel.
    ///
    /// # Panics
    /// Panics if `(row, col)` is outside the tracker.
    pub fn clear_pixel(&mut self, row: usize, col: usize) {
        let idx = [row, col];
        self.samples[idx] = 0;
        self.sum[idx] = F::zero();
        self.sum_sq[idx] = F::zero();
        self.mean[idx] = F::zero();
    }

    /// Checks that a frame of shape `dim` can be used with this tracker.
    ///
    /// # Errors
    /// Returns `Error::ShapeMismatch` if the shapes differ.
    pub fn check_shape(&self, dim: (usize, usize)) -> Result<()> {
        if dim == self.shape() {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                expected: self.shape(),
                actual: dim,
            })
        }
    }
}

#[inline]
fn accumulate<F: Accumulator>(
    samples: &mut u32,
    sum: &mut F,
    sum_sq: &mut F,
    mean: &mut F,
    n_samples: u32,
    value: F,
) {
    let (s, s2) = (*sum, *sum_sq);
    if *samples < n_samples {
        *sum = s + value;
        *sum_sq = s2 + value * value;
        *samples += 1;
    } else {
        let count = F::from_count(*samples);
        *sum = s + value - s / count;
        *sum_sq = s2 + value * value - s2 / count;
    }
    // at least one sample was pushed so the division is well defined
    *mean = *sum / F::from_count(*samples);
}

#[inline]
fn variance_of<F: Accumulator>(samples: u32, sum_sq: F, mean: F) -> F {
    if samples == 0 {
        return F::zero();
    }
    sum_sq / F::from_count(samples) - mean * mean
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn test_new_rejects_empty_shape() {
        assert!(PedestalTracker::<f64>::new(0, 10, 100).is_err());
        assert!(PedestalTracker::<f64>::new(10, 0, 100).is_err());
        assert!(PedestalTracker::<f64>::new(10, 10, 0).is_err());
    }

    #[test]
    fn test_warm_up_counts() {
        let mut tracker = PedestalTracker::<f64>::new(2, 2, 5).unwrap();
        for k in 1..=4u32 {
            tracker.push(0, 1, 10u16);
            assert_eq!(tracker.samples_seen(0, 1), k);
        }
        for _ in 0..20 {
            tracker.push(0, 1, 10u16);
            assert_eq!(tracker.samples_seen(0, 1), 5);
        }
        assert_eq!(tracker.samples_seen(0, 0), 0);
        assert!(!tracker.is_warmed_up());
    }

    #[test]
    fn test_constant_value_converges() {
        let mut tracker = PedestalTracker::<f64>::new(1, 1, 10).unwrap();
        for _ in 0..10 {
            tracker.push(0, 0, 1000u16);
        }
        assert_eq!(tracker.mean(0, 0), 1000.0);
        assert_eq!(tracker.variance(0, 0), 0.0);
        assert_eq!(tracker.std(0, 0), 0.0);
        assert!(tracker.is_warmed_up());
    }

    #[test]
    fn test_leaky_update_after_warm_up() {
        let mut tracker = PedestalTracker::<f64>::new(1, 1, 4).unwrap();
        for _ in 0..4 {
            tracker.push(0, 0, 10u16);
        }
        assert_eq!(tracker.sum()[[0, 0]], 40.0);

        tracker.push(0, 0, 30u16);
        // 40 + 30 - 40/4
        assert_eq!(tracker.sum()[[0, 0]], 60.0);
        assert_eq!(tracker.mean(0, 0), 15.0);
        // 400 + 900 - 400/4
        assert_eq!(tracker.sum_sq()[[0, 0]], 1200.0);
        assert_relative_eq!(tracker.variance(0, 0), 75.0);
    }

    #[test]
    fn test_push_fast_matches_push_when_warm() {
        let mut a = PedestalTracker::<f64>::new(1, 1, 8).unwrap();
        let mut b = PedestalTracker::<f64>::new(1, 1, 8).unwrap();
        for v in [3u16, 5, 7, 9, 3, 5, 7, 9] {
            a.push(0, 0, v);
            b.push(0, 0, v);
        }
        for v in [100u16, 4, 17, 6] {
            a.push(0, 0, v);
            b.push_fast(0, 0, v);
        }
        assert_relative_eq!(a.mean(0, 0), b.mean(0, 0));
        assert_relative_eq!(a.variance(0, 0), b.variance(0, 0));
        assert_eq!(b.samples_seen(0, 0), 8);
    }

    #[test]
    fn test_push_fast_before_warm_up_undercounts() {
        let mut tracker = PedestalTracker::<f64>::new(1, 1, 100).unwrap();
        tracker.push_fast(0, 0, 50u16);
        assert_eq!(tracker.samples_seen(0, 0), 0);
        assert_relative_eq!(tracker.mean(0, 0), 0.5);
        assert_eq!(tracker.variance(0, 0), 0.0);
    }

    #[test]
    fn test_std_never_nan() {
        let mut tracker = PedestalTracker::<f32>::new(1, 1, 3).unwrap();
        for v in [0.1f32, 0.1, 0.1, 0.1, 0.1, 0.1, 0.1] {
            tracker.push(0, 0, v);
            let std = tracker.std(0, 0);
            assert!(!std.is_nan());
            assert!(std >= 0.0);
        }
    }

    #[test]
    fn test_push_frame_matches_pixel_push() {
        let frame = Array2::from_shape_fn((3, 4), |(r, c)| (r * 4 + c) as u16);
        let mut by_frame = PedestalTracker::<f64>::new(3, 4, 2).unwrap();
        let mut by_pixel = PedestalTracker::<f64>::new(3, 4, 2).unwrap();
        for _ in 0..3 {
            by_frame.push_frame(frame.view()).unwrap();
            for ((r, c), &v) in frame.indexed_iter() {
                by_pixel.push(r, c, v);
            }
        }
        assert_eq!(by_frame.mean_map(), by_pixel.mean_map());
        assert_eq!(by_frame.variance_map(), by_pixel.variance_map());
        assert_eq!(by_frame.samples_map(), by_pixel.samples_map());
    }

    #[test]
    fn test_push_frame_shape_mismatch() {
        let mut tracker = PedestalTracker::<f64>::new(3, 4, 2).unwrap();
        let frame = Array2::<u16>::zeros((4, 3));
        let err = tracker.push_frame(frame.view()).unwrap_err();
        assert_eq!(
            err,
            Error::ShapeMismatch {
                expected: (3, 4),
                actual: (4, 3)
            }
        );
    }

    #[test]
    fn test_clear() {
        let mut tracker = PedestalTracker::<f64>::new(2, 2, 2).unwrap();
        let frame = Array2::from_elem((2, 2), 7u16);
        tracker.push_frame(frame.view()).unwrap();
        tracker.clear_pixel(1, 1);
        assert_eq!(tracker.samples_seen(1, 1), 0);
        assert_eq!(tracker.mean(1, 1), 0.0);
        assert_eq!(tracker.mean(0, 0), 7.0);

        tracker.clear();
        assert!(tracker.samples_map().iter().all(|&n| n == 0));
        assert!(tracker.mean_map().iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_std_map() {
        let mut tracker = PedestalTracker::<f64>::new(1, 2, 4).unwrap();
        for v in [8u16, 12, 8, 12] {
            tracker.push(0, 0, v);
            tracker.push(0, 1, 10u16);
        }
        let std = tracker.std_map();
        assert_relative_eq!(std[[0, 0]], 2.0);
        assert_eq!(std[[0, 1]], 0.0);
    }
}
