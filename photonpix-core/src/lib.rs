//! photonpix-core: Core types for photon-counting pixel detector processing.
//!
//! This crate provides the per-pixel pedestal tracker, the numeric traits
//! shared by the processing stages, and the packed cluster container that
//! flows between them.
//!

pub mod cluster;
pub mod error;
pub mod pedestal;
pub mod pixel;

pub use cluster::{ClusterBuffer, ClusterRecord, ClusterValue, Coord, DEFAULT_CAPACITY};
pub use error::{Error, Result};
pub use pedestal::PedestalTracker;
pub use pixel::{Accumulator, Pixel};
