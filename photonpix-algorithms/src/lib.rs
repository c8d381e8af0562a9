//! photonpix-algorithms: Photon cluster finding for pixel detector frames.
//!
//! The [`ClusterFinder`] holds the thresholds and window geometry and runs
//! over a frame with an external [`PedestalTracker`](photonpix_core::PedestalTracker).
//! A [`Detector`] owns one of each plus the output buffer and is the unit a
//! processing worker works with.
//!
#![warn(missing_docs)]

pub mod config;
pub mod detector;
pub mod finder;

pub use config::{DetectorConfig, MAX_WINDOW};
pub use detector::{Detector, DetectorStatistics};
pub use finder::{window_offsets, ClusterFinder, FrameSummary};
