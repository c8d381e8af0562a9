//! Threshold photon cluster finder.
//!
//! Key characteristics:
//! - Single pass over the frame, row-major
//! - Pedestal subtracted values, threshold in units of the pixel noise
//! - Only the local maximum of a neighbourhood emits a cluster
//! - Pixels without signal nearby feed the pedestal tracker
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::config::DetectorConfig;
use ndarray::ArrayView2;
use photonpix_core::{
    Accumulator, ClusterBuffer, ClusterValue, Coord, Error, PedestalTracker, Pixel, Result,
};
use std::ops::RangeInclusive;

/// Counters of one [`ClusterFinder::find_clusters`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameSummary {
    /// Clusters appended to the output buffer.
    pub clusters: usize,
    /// Pixels fed back into the pedestal tracker.
    pub pedestal_updates: usize,
    /// Pixels skipped for being far below the pedestal.
    pub negative_excursions: usize,
}

/// Cluster finding algorithm.
///
/// Holds only the thresholds and window geometry; the pedestal state lives in
/// a [`PedestalTracker`] passed to every call.
#[derive(Debug, Clone)]
pub struct ClusterFinder<F = f64> {
    n_sigma: F,
    scan_window: (usize, usize),
    store_window: (usize, usize),
    c2: F,
    c3: F,
}

impl<F: Accumulator> ClusterFinder<F> {
    /// Creates a finder from a validated configuration.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` if the configuration is invalid.
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        config.validate()?;
        let (scan_x, scan_y) = config.scan_window;
        let (store_x, store_y) = config.store_window;
        let c2 = F::from_f64((((scan_y + 1) / 2) * ((scan_x + 1) / 2)) as f64).sqrt();
        let c3 = F::from_f64((store_x * store_y) as f64).sqrt();
        Ok(Self {
            n_sigma: F::from_f64(config.n_sigma),
            scan_window: config.scan_window,
            store_window: config.store_window,
            c2,
            c3,
        })
    }

    /// Detection threshold in units of the pixel noise.
    #[must_use]
    pub fn n_sigma(&self) -> F {
        self.n_sigma
    }

    /// Scan window `(x, y)`.
    #[must_use]
    pub fn scan_window(&self) -> (usize, usize) {
        self.scan_window
    }

    /// Storage window `(x, y)`.
    #[must_use]
    pub fn store_window(&self) -> (usize, usize) {
        self.store_window
    }

    /// Noise scale of a quarter window. Not used by the decision rule.
    #[must_use]
    pub fn c2(&self) -> F {
        self.c2
    }

    /// Noise scale of the whole storage window, applied to the
    /// neighbourhood total.
    #[must_use]
    pub fn c3(&self) -> F {
        self.c3
    }

    /// Scans `frame` for photons, appending one record per photon to `out`.
    ///
    /// Pixels with no signal in their scan window are pushed into `tracker`.
    ///
    /// # Errors
    /// Returns `Error::ShapeMismatch` if `frame` and `tracker` disagree,
    /// `Error::GeometryMismatch` if `out` does not use the storage window and
    /// `Error::InvalidConfig` if the frame is too large for `i16` coordinates.
    pub fn find_clusters<T: Pixel, C: ClusterValue>(
        &self,
        frame: ArrayView2<'_, T>,
        tracker: &mut PedestalTracker<F>,
        out: &mut ClusterBuffer<C>,
    ) -> Result<FrameSummary> {
        tracker.check_shape(frame.dim())?;
        let geometry = (out.cluster_size_x(), out.cluster_size_y());
        if geometry != self.store_window {
            return Err(Error::GeometryMismatch {
                left: self.store_window,
                right: geometry,
            });
        }
        let (rows, cols) = frame.dim();
        let max_extent = Coord::MAX as usize + 1;
        if rows > max_extent || cols > max_extent {
            return Err(Error::InvalidConfig(format!(
                "frame of {rows}x{cols} pixels exceeds the cluster coordinate range"
            )));
        }

        let scan_rows = window_offsets(self.scan_window.1);
        let scan_cols = window_offsets(self.scan_window.0);
        let store_rows = window_offsets(self.store_window.1);
        let store_cols = window_offsets(self.store_window.0);
        let mut values = vec![C::default(); self.store_window.0 * self.store_window.1];
        let mut summary = FrameSummary::default();

        for iy in 0..rows {
            for ix in 0..cols {
                let raw = frame[[iy, ix]];
                let threshold = self.n_sigma * tracker.std(iy, ix);
                let value = F::from_pixel(raw) - tracker.mean(iy, ix);

                if value < -threshold {
                    summary.negative_excursions += 1;
                    continue;
                }

                let mut max = F::zero();
                let mut total = F::zero();
                for dy in scan_rows.clone() {
                    let Some(y) = shifted(iy, dy, rows) else {
                        continue;
                    };
                    for dx in scan_cols.clone() {
                        let Some(x) = shifted(ix, dx, cols) else {
                            continue;
                        };
                        let v = F::from_pixel(frame[[y, x]]) - tracker.mean(y, x);
                        total = total + v;
                        if v > max {
                            max = v;
                        }
                    }
                }

                if max <= threshold && total <= self.c3 * threshold {
                    tracker.push_fast(iy, ix, raw);
                    summary.pedestal_updates += 1;
                    continue;
                }
                if value < max {
                    continue;
                }

                values.fill(C::default());
                for (slot_row, dy) in store_rows.clone().enumerate() {
                    let Some(y) = shifted(iy, dy, rows) else {
                        continue;
                    };
                    for (slot_col, dx) in store_cols.clone().enumerate() {
                        let Some(x) = shifted(ix, dx, cols) else {
                            continue;
                        };
                        let v = F::from_pixel(frame[[y, x]]) - tracker.mean(y, x);
                        values[slot_row * self.store_window.0 + slot_col] =
                            C::from_accumulated(v.as_f64());
                    }
                }
                out.push_back(ix as Coord, iy as Coord, &values)?;
                summary.clusters += 1;
            }
        }
        Ok(summary)
    }
}

/// Offsets covered by a window of `size` pixels around its center.
///
/// Odd sizes are symmetric, even sizes reach one pixel further to the
/// negative side: 3 gives `-1..=1`, 4 gives `-2..=1`.
#[must_use]
pub fn window_offsets(size: usize) -> RangeInclusive<isize> {
    let size = size as isize;
    -(size / 2)..=size - 1 - size / 2
}

#[inline]
fn shifted(index: usize, delta: isize, len: usize) -> Option<usize> {
    index.checked_add_signed(delta).filter(|&i| i < len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    /// Tracker with mean 100 and noise 2 everywhere.
    fn flat_tracker(rows: usize, cols: usize) -> PedestalTracker<f64> {
        let mut tracker = PedestalTracker::new(rows, cols, 10).unwrap();
        for i in 0..10 {
            let level: u16 = if i % 2 == 0 { 98 } else { 102 };
            tracker
                .push_frame(Array2::from_elem((rows, cols), level).view())
                .unwrap();
        }
        tracker
    }

    fn finder(config: &DetectorConfig) -> ClusterFinder<f64> {
        ClusterFinder::new(config).unwrap()
    }

    #[test]
    fn test_window_offsets() {
        assert_eq!(window_offsets(1), 0..=0);
        assert_eq!(window_offsets(3), -1..=1);
        assert_eq!(window_offsets(4), -2..=1);
        assert_eq!(window_offsets(5), -2..=2);
    }

    #[test]
    fn test_constants() {
        let f = finder(&DetectorConfig::default());
        assert_relative_eq!(f.c3(), 3.0);
        assert_relative_eq!(f.c2(), 2.0);

        let f = finder(&DetectorConfig::new().with_cluster_size(2, 2));
        assert_relative_eq!(f.c3(), 2.0);
        assert_relative_eq!(f.c2(), 1.0);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = DetectorConfig::new().with_scan_window(0, 1);
        assert!(ClusterFinder::<f64>::new(&config).is_err());
    }

    #[test]
    fn test_flat_frame_updates_pedestal() {
        let f = finder(&DetectorConfig::default());
        let mut tracker = flat_tracker(4, 5);
        let mut out = ClusterBuffer::<i32>::new(3, 3);
        let frame = Array2::from_elem((4, 5), 100u16);

        let summary = f.find_clusters(frame.view(), &mut tracker, &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(summary.pedestal_updates, 20);
        assert_eq!(summary.clusters, 0);
        assert_relative_eq!(tracker.mean(2, 2), 100.0);
    }

    #[test]
    fn test_single_photon() {
        let f = finder(&DetectorConfig::default());
        let mut tracker = flat_tracker(8, 10);
        let mut out = ClusterBuffer::<i32>::new(3, 3);
        let mut frame = Array2::from_elem((8, 10), 100u16);
        frame[[4, 6]] = 300;
        frame[[4, 7]] = 130;

        let summary = f.find_clusters(frame.view(), &mut tracker, &mut out).unwrap();
        assert_eq!(summary.clusters, 1);
        // the 3x3 neighbourhood (plus one column reached by the 130) is not updated
        assert_eq!(summary.pedestal_updates, 80 - 12);

        let record = out.get(0).unwrap();
        assert_eq!((record.x(), record.y()), (6, 4));
        assert_eq!(
            record.values().collect::<Vec<_>>(),
            vec![0, 0, 0, 0, 200, 30, 0, 0, 0]
        );
    }

    #[test]
    fn test_border_photon_is_zero_padded() {
        let f = finder(&DetectorConfig::default());
        let mut tracker = flat_tracker(5, 5);
        let mut out = ClusterBuffer::<i32>::new(3, 3);
        let mut frame = Array2::from_elem((5, 5), 100u16);
        frame[[0, 0]] = 300;
        frame[[0, 1]] = 150;
        frame[[1, 0]] = 120;

        f.find_clusters(frame.view(), &mut tracker, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        let record = out.get(0).unwrap();
        assert_eq!((record.x(), record.y()), (0, 0));
        assert_eq!(
            record.values().collect::<Vec<_>>(),
            vec![0, 0, 0, 0, 200, 50, 0, 20, 0]
        );
    }

    #[test]
    fn test_negative_excursion_is_ignored() {
        let f = finder(&DetectorConfig::default());
        let mut tracker = flat_tracker(3, 3);
        let mut out = ClusterBuffer::<i32>::new(3, 3);
        let mut frame = Array2::from_elem((3, 3), 100u16);
        frame[[1, 1]] = 50;

        let before = tracker.sum()[[1, 1]];
        let summary = f.find_clusters(frame.view(), &mut tracker, &mut out).unwrap();
        assert_eq!(summary.negative_excursions, 1);
        assert_eq!(summary.pedestal_updates, 8);
        assert_relative_eq!(tracker.sum()[[1, 1]], before);
        assert!(out.is_empty());
    }

    #[test]
    fn test_large_total_without_peak() {
        // Nine pixels at 4 sigma: no single pixel passes, the sum does.
        let f = finder(&DetectorConfig::default());
        let mut tracker = flat_tracker(3, 3);
        let mut out = ClusterBuffer::<i32>::new(3, 3);
        let mut frame = Array2::from_elem((3, 3), 108u16);
        frame[[1, 1]] = 109;

        let summary = f.find_clusters(frame.view(), &mut tracker, &mut out).unwrap();
        assert_eq!(summary.clusters, 1);
        let record = out.get(0).unwrap();
        assert_eq!((record.x(), record.y()), (1, 1));
        assert_eq!(summary.pedestal_updates, 0);
        assert_eq!(record.sum(), 8 * 8 + 9);
    }

    #[test]
    fn test_separate_store_window() {
        let config = DetectorConfig::new()
            .with_scan_window(3, 3)
            .with_store_window(5, 1);
        let f = finder(&config);
        let mut tracker = flat_tracker(5, 7);
        let mut out = ClusterBuffer::<f32>::new(5, 1);
        let mut frame = Array2::from_elem((5, 7), 100u16);
        frame[[2, 3]] = 200;
        frame[[2, 5]] = 110;

        f.find_clusters(frame.view(), &mut tracker, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        let values: Vec<f32> = out.get(0).unwrap().values().collect();
        assert_eq!(values, vec![0.0, 0.0, 100.0, 0.0, 10.0]);
    }

    #[test]
    fn test_shape_and_geometry_errors() {
        let f = finder(&DetectorConfig::default());
        let mut tracker = flat_tracker(3, 3);
        let frame = Array2::from_elem((3, 4), 100u16);
        let mut out = ClusterBuffer::<i32>::new(3, 3);
        assert!(matches!(
            f.find_clusters(frame.view(), &mut tracker, &mut out),
            Err(Error::ShapeMismatch { .. })
        ));

        let frame = Array2::from_elem((3, 3), 100u16);
        let mut wrong = ClusterBuffer::<i32>::new(2, 2);
        assert!(matches!(
            f.find_clusters(frame.view(), &mut tracker, &mut wrong),
            Err(Error::GeometryMismatch { .. })
        ));
    }
}
