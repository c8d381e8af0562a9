//! Messages passed between the pipeline stages.

use ndarray::Array2;
use photonpix_core::ClusterBuffer;
use std::sync::Arc;

/// Frame number that may not be submitted; kept free for end markers in
/// downstream formats.
pub const POISON_FRAME_NUMBER: u64 = u64::MAX;

/// Work item for a worker thread.
#[derive(Debug)]
pub enum FrameTask<T> {
    /// Search a frame for clusters.
    Data {
        /// Number the resulting cluster buffer is tagged with.
        frame_number: u64,
        /// Owned copy of the frame.
        frame: Array2<T>,
    },
    /// Push a dark frame into the pedestal. One copy is shared by all
    /// workers.
    Pedestal {
        /// Shared copy of the frame.
        frame: Arc<Array2<T>>,
    },
    /// Finish the queued work and exit.
    Poison,
}

/// Message flowing from the workers to the sink.
#[derive(Debug)]
pub enum SinkMessage<C> {
    /// Clusters of one data frame.
    Clusters(ClusterBuffer<C>),
    /// No more clusters will follow until the pipeline is restarted.
    Finished,
}

impl<C> SinkMessage<C> {
    /// Returns true for [`SinkMessage::Finished`].
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}
