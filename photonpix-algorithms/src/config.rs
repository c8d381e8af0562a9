//! Detector configuration.

use photonpix_core::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Largest supported window edge, in pixels.
pub const MAX_WINDOW: usize = 255;

/// Largest allocation a `Vec` can hold.
const MAX_BUFFER_BYTES: usize = usize::MAX >> 1;

/// Bytes of a record holding the widest cluster value.
fn widest_record_bytes((x, y): (usize, usize)) -> usize {
    2 * std::mem::size_of::<i16>() + x * y * std::mem::size_of::<f64>()
}

/// Configuration of a [`Detector`](crate::Detector).
///
/// Windows are given as `(x, y)`, i.e. `(columns, rows)`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct DetectorConfig {
    /// Detection threshold in units of the pixel noise.
    pub n_sigma: f64,
    /// Neighbourhood inspected around each pixel.
    pub scan_window: (usize, usize),
    /// Window stored for each emitted cluster.
    pub store_window: (usize, usize),
    /// Warm-up length of the pedestal tracker.
    pub n_samples: u32,
    /// Initial capacity of the output cluster buffer.
    pub capacity: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            n_sigma: 5.0,
            scan_window: (3, 3),
            store_window: (3, 3),
            n_samples: 1000,
            capacity: 2000,
        }
    }
}

impl DetectorConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the detection threshold.
    #[must_use]
    pub fn with_n_sigma(mut self, n_sigma: f64) -> Self {
        self.n_sigma = n_sigma;
        self
    }

    /// Sets the scan window.
    #[must_use]
    pub fn with_scan_window(mut self, x: usize, y: usize) -> Self {
        self.scan_window = (x, y);
        self
    }

    /// Sets the storage window.
    #[must_use]
    pub fn with_store_window(mut self, x: usize, y: usize) -> Self {
        self.store_window = (x, y);
        self
    }

    /// Sets scan and storage window to the same size.
    #[must_use]
    pub fn with_cluster_size(self, x: usize, y: usize) -> Self {
        self.with_scan_window(x, y).with_store_window(x, y)
    }

    /// Sets the pedestal warm-up length.
    #[must_use]
    pub fn with_n_samples(mut self, n_samples: u32) -> Self {
        self.n_samples = n_samples;
        self
    }

    /// Sets the initial cluster buffer capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !self.n_sigma.is_finite() || self.n_sigma < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "n_sigma must be finite and non-negative, got {}",
                self.n_sigma
            )));
        }
        check_window("scan_window", self.scan_window)?;
        check_window("store_window", self.store_window)?;
        if self.n_samples == 0 {
            return Err(Error::InvalidConfig(
                "n_samples must be at least 1".to_string(),
            ));
        }
        let buffer_bytes = self
            .capacity
            .checked_mul(widest_record_bytes(self.store_window));
        if !buffer_bytes.is_some_and(|bytes| bytes <= MAX_BUFFER_BYTES) {
            return Err(Error::InvalidConfig(format!(
                "capacity of {} clusters does not fit in memory",
                self.capacity
            )));
        }
        Ok(())
    }
}

fn check_window(name: &str, (x, y): (usize, usize)) -> Result<()> {
    if x == 0 || y == 0 {
        return Err(Error::InvalidConfig(format!(
            "{name} must be non-empty, got {x}x{y}"
        )));
    }
    if x > MAX_WINDOW || y > MAX_WINDOW {
        return Err(Error::InvalidConfig(format!(
            "{name} {x}x{y} exceeds {MAX_WINDOW}x{MAX_WINDOW}"
        )));
    }
    Ok(())
}
