//! Pipeline configuration.

use crate::error::Result;
use photonpix_core::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Thread and queue layout of a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PipelineConfig {
    /// Number of worker threads, each with its own detector.
    pub n_workers: usize,
    /// Capacity of each worker's input queue.
    pub input_capacity: usize,
    /// Capacity of each worker's output queue.
    pub output_capacity: usize,
    /// Capacity of the shared sink queue.
    pub sink_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            n_workers: 3,
            input_capacity: 200,
            output_capacity: 200,
            sink_capacity: 1000,
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of workers.
    #[must_use]
    pub fn with_n_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers;
        self
    }

    /// Sets the input queue capacity.
    #[must_use]
    pub fn with_input_capacity(mut self, capacity: usize) -> Self {
        self.input_capacity = capacity;
        self
    }

    /// Sets the output queue capacity.
    #[must_use]
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity;
        self
    }

    /// Sets the sink queue capacity.
    #[must_use]
    pub fn with_sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = capacity;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    /// Returns an invalid configuration error for zero workers or a zero
    /// capacity.
    pub fn validate(&self) -> Result<()> {
        if self.n_workers == 0 {
            return Err(Error::InvalidConfig("n_workers must be at least 1".to_string()).into());
        }
        let capacities = [
            ("input_capacity", self.input_capacity),
            ("output_capacity", self.output_capacity),
            ("sink_capacity", self.sink_capacity),
        ];
        for (name, capacity) in capacities {
            if capacity == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be at least 1")).into());
            }
        }
        Ok(())
    }
}
