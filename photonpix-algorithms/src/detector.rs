//! Stateful per-detector processing: pedestal tracker, finder and output.

use crate::config::DetectorConfig;
use crate::finder::{ClusterFinder, FrameSummary};
use ndarray::{Array2, ArrayView2};
use photonpix_core::{Accumulator, ClusterBuffer, ClusterValue, PedestalTracker, Pixel, Result};
use std::marker::PhantomData;
use tracing::trace;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Running counters of a [`Detector`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DetectorStatistics {
    /// Data frames scanned for clusters.
    pub frames_processed: u64,
    /// Frames pushed into the pedestal as a whole.
    pub pedestal_frames: u64,
    /// Clusters emitted.
    pub clusters_found: u64,
    /// Single pixel pedestal updates made while scanning data frames.
    pub pedestal_updates: u64,
    /// Pixels skipped for being far below the pedestal.
    pub negative_excursions: u64,
}

impl DetectorStatistics {
    /// Adds the counters of `other`.
    pub fn merge(&mut self, other: &Self) {
        self.frames_processed += other.frames_processed;
        self.pedestal_frames += other.pedestal_frames;
        self.clusters_found += other.clusters_found;
        self.pedestal_updates += other.pedestal_updates;
        self.negative_excursions += other.negative_excursions;
    }

    fn record(&mut self, summary: &FrameSummary) {
        self.frames_processed += 1;
        self.clusters_found += summary.clusters as u64;
        self.pedestal_updates += summary.pedestal_updates as u64;
        self.negative_excursions += summary.negative_excursions as u64;
    }
}

/// A cluster finder together with the pedestal it maintains and the
/// clusters it has found since the last [`steal_clusters`](Self::steal_clusters).
///
/// `T` is the raw pixel type, `F` the pedestal accumulator and `C` the
/// stored cluster value.
#[derive(Debug)]
pub struct Detector<T = u16, F = f64, C = i32> {
    config: DetectorConfig,
    finder: ClusterFinder<F>,
    tracker: PedestalTracker<F>,
    clusters: ClusterBuffer<C>,
    statistics: DetectorStatistics,
    _pixel: PhantomData<fn(T)>,
}

impl<T: Pixel, F: Accumulator, C: ClusterValue> Detector<T, F, C> {
    /// Creates a detector for frames of `shape = (rows, cols)`.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` for an invalid configuration or an
    /// empty shape.
    pub fn new(shape: (usize, usize), config: &DetectorConfig) -> Result<Self> {
        let finder = ClusterFinder::new(config)?;
        let tracker = PedestalTracker::new(shape.0, shape.1, config.n_samples)?;
        let (store_x, store_y) = config.store_window;
        Ok(Self {
            config: config.clone(),
            finder,
            tracker,
            clusters: ClusterBuffer::with_capacity(store_x, store_y, config.capacity),
            statistics: DetectorStatistics::default(),
            _pixel: PhantomData,
        })
    }

    /// Frame shape `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        self.tracker.shape()
    }

    /// Configuration the detector was built with.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// The cluster finding algorithm.
    pub fn finder(&self) -> &ClusterFinder<F> {
        &self.finder
    }

    /// Pushes a dark frame into the pedestal.
    ///
    /// # Errors
    /// Returns `Error::ShapeMismatch` if the frame has the wrong shape.
    pub fn push_pedestal_frame(&mut self, frame: ArrayView2<'_, T>) -> Result<()> {
        self.tracker.push_frame(frame)?;
        self.statistics.pedestal_frames += 1;
        Ok(())
    }

    /// Scans a data frame, appending clusters to the internal buffer, which
    /// is tagged with `frame_number`. Returns the number of new clusters.
    ///
    /// # Errors
    /// Returns `Error::ShapeMismatch` if the frame has the wrong shape.
    pub fn find_clusters(&mut self, frame: ArrayView2<'_, T>, frame_number: u64) -> Result<usize> {
        self.clusters.set_frame_number(frame_number);
        let summary = self
            .finder
            .find_clusters(frame, &mut self.tracker, &mut self.clusters)?;
        self.statistics.record(&summary);
        trace!(
            frame_number,
            clusters = summary.clusters,
            pedestal_updates = summary.pedestal_updates,
            "frame processed"
        );
        Ok(summary.clusters)
    }

    /// Clusters found since the last steal.
    pub fn clusters(&self) -> &ClusterBuffer<C> {
        &self.clusters
    }

    /// Moves the found clusters out. See [`ClusterBuffer::steal`].
    pub fn steal_clusters(&mut self, realloc_same_capacity: bool) -> ClusterBuffer<C> {
        self.clusters.steal(realloc_same_capacity)
    }

    /// Snapshot of the pedestal mean.
    pub fn pedestal(&self) -> Array2<F> {
        self.tracker.mean_map()
    }

    /// Snapshot of the pedestal noise (standard deviation).
    pub fn noise(&self) -> Array2<F> {
        self.tracker.std_map()
    }

    /// Forgets all pedestal samples.
    pub fn clear_pedestal(&mut self) {
        self.tracker.clear();
    }

    /// The pedestal tracker.
    pub fn tracker(&self) -> &PedestalTracker<F> {
        &self.tracker
    }

    /// Mutable access to the pedestal tracker.
    pub fn tracker_mut(&mut self) -> &mut PedestalTracker<F> {
        &mut self.tracker
    }

    /// Counters since creation or the last reset.
    pub fn statistics(&self) -> DetectorStatistics {
        self.statistics
    }

    /// Zeroes the counters.
    pub fn reset_statistics(&mut self) {
        self.statistics = DetectorStatistics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn detector() -> Detector {
        Detector::new((6, 6), &DetectorConfig::new().with_n_samples(4)).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_input() {
        assert!(Detector::<u16>::new((0, 4), &DetectorConfig::default()).is_err());
        let config = DetectorConfig::new().with_n_sigma(-2.0);
        assert!(Detector::<u16>::new((4, 4), &config).is_err());
    }

    #[test]
    fn test_pedestal_frames() {
        let mut det = detector();
        for level in [10u16, 12, 10, 12] {
            det.push_pedestal_frame(Array2::from_elem((6, 6), level).view())
                .unwrap();
        }
        assert!(det.tracker().is_warmed_up());
        assert_relative_eq!(det.pedestal()[[3, 3]], 11.0);
        assert_relative_eq!(det.noise()[[0, 5]], 1.0);
        assert_eq!(det.statistics().pedestal_frames, 4);

        det.clear_pedestal();
        assert_relative_eq!(det.pedestal()[[3, 3]], 0.0);
        assert_eq!(det.tracker().samples_seen(3, 3), 0);
    }

    #[test]
    fn test_find_and_steal() {
        let mut det = detector();
        for level in [10u16, 12, 10, 12] {
            det.push_pedestal_frame(Array2::from_elem((6, 6), level).view())
                .unwrap();
        }
        let mut frame = Array2::from_elem((6, 6), 11u16);
        frame[[2, 3]] = 60;

        assert_eq!(det.find_clusters(frame.view(), 17).unwrap(), 1);
        assert_eq!(det.clusters().frame_number(), 17);

        let clusters = det.steal_clusters(true);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters.frame_number(), 17);
        assert_eq!(clusters.get(0).unwrap().value(4), 49);
        assert!(det.clusters().is_empty());
        assert_eq!(det.clusters().capacity(), clusters.capacity());

        let stats = det.statistics();
        assert_eq!(stats.frames_processed, 1);
        assert_eq!(stats.clusters_found, 1);
        assert_eq!(stats.pedestal_updates, 36 - 9);

        det.reset_statistics();
        assert_eq!(det.statistics(), DetectorStatistics::default());
    }

    #[test]
    fn test_wrong_shape_keeps_state() {
        let mut det = detector();
        let frame = Array2::from_elem((5, 6), 11u16);
        assert!(det.push_pedestal_frame(frame.view()).is_err());
        assert!(det.find_clusters(frame.view(), 0).is_err());
        assert_eq!(det.statistics(), DetectorStatistics::default());
    }

    #[test]
    fn test_merge_statistics() {
        let mut a = DetectorStatistics {
            frames_processed: 2,
            clusters_found: 5,
            ..Default::default()
        };
        let b = DetectorStatistics {
            frames_processed: 3,
            pedestal_frames: 1,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.frames_processed, 5);
        assert_eq!(a.pedestal_frames, 1);
        assert_eq!(a.clusters_found, 5);
    }
}
