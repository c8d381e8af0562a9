//! photonpix-io: frame and cluster file I/O for photonpix.
//!
//! Raw frame files are read through memory maps via memmap2. Cluster files
//! are a sequence of frames, each a frame number, a cluster count and the
//! packed records of a [`ClusterBuffer`](photonpix_core::ClusterBuffer).
//! The sink consumers drain a running pipeline into a file or into memory.

mod error;
mod reader;
mod sink;
mod writer;

pub use error::{Error, Result};
pub use reader::{ClusterFileReader, MappedFileReader, RawFrameReader, CLUSTER_FRAME_HEADER};
pub use sink::{ClusterCollector, ClusterFileSink, SinkSummary};
pub use writer::{ClusterFileWriter, RawFrameWriter};
