//! photonpix-pipeline: Multi-threaded frame processing.
//!
//! This crate provides the bounded [`WorkQueue`] connecting the stages and the
//! [`Pipeline`] that spreads frames over a pool of cluster finding workers
//! and merges their output into a single sink queue.
//!
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod task;
mod worker;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::Pipeline;
pub use queue::{PopError, PushError, QueueClosed, WorkQueue};
pub use task::{FrameTask, SinkMessage, POISON_FRAME_NUMBER};
