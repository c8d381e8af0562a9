//! Consumers for the pipeline sink queue.
//!
//! Both consumers run on their own thread, log through an injected
//! [`Dispatch`] and stop at [`SinkMessage::Finished`].

use crate::writer::ClusterFileWriter;
use crate::{Error, Result};
use photonpix_core::{ClusterBuffer, ClusterValue};
use photonpix_pipeline::{SinkMessage, WorkQueue};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, Dispatch};

/// Totals reported by a [`ClusterFileSink`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkSummary {
    /// Frames written.
    pub frames: u64,
    /// Clusters written.
    pub clusters: u64,
}

/// Writes every buffer arriving on a sink queue to a cluster file.
///
/// On a write error the source queue is closed, so that upstream pushes fail
/// instead of blocking, and the error is returned from [`join`](Self::join).
pub struct ClusterFileSink {
    path: PathBuf,
    handle: JoinHandle<Result<SinkSummary>>,
}

impl ClusterFileSink {
    /// Creates the output file and starts the writer thread.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or the thread cannot be
    /// spawned.
    pub fn spawn<C, P>(
        source: Arc<WorkQueue<SinkMessage<C>>>,
        path: P,
        dispatch: Dispatch,
    ) -> Result<Self>
    where
        C: ClusterValue,
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let writer = ClusterFileWriter::create(&path)?;
        let thread_path = path.clone();
        let handle = thread::Builder::new()
            .name("photonpix-file-sink".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let result = write_all(writer, &source);
                    match &result {
                        Ok(summary) => info!(
                            path = %thread_path.display(),
                            frames = summary.frames,
                            clusters = summary.clusters,
                            "cluster file written"
                        ),
                        Err(err) => {
                            error!(
                                path = %thread_path.display(),
                                error = %err,
                                "cluster file sink failed"
                            );
                            source.close();
                        }
                    }
                    result
                })
            })?;
        Ok(Self { path, handle })
    }

    /// Output file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true once the writer thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the end marker and returns what was written.
    ///
    /// # Errors
    /// Returns the write error that stopped the thread, or
    /// `Error::SinkPanicked`.
    pub fn join(self) -> Result<SinkSummary> {
        self.handle.join().map_err(|_| Error::SinkPanicked)?
    }
}

fn write_all<C: ClusterValue>(
    mut writer: ClusterFileWriter,
    source: &WorkQueue<SinkMessage<C>>,
) -> Result<SinkSummary> {
    debug!("file sink started");
    while let Some(SinkMessage::Clusters(clusters)) = source.pop() {
        writer.write_frame(&clusters)?;
    }
    writer.flush()?;
    Ok(SinkSummary {
        frames: writer.frames_written(),
        clusters: writer.clusters_written(),
    })
}

/// Collects every buffer arriving on a sink queue in memory.
pub struct ClusterCollector<C = i32> {
    handle: JoinHandle<Vec<ClusterBuffer<C>>>,
}

impl<C: ClusterValue> ClusterCollector<C> {
    /// Starts the collecting thread.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(source: Arc<WorkQueue<SinkMessage<C>>>, dispatch: Dispatch) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("photonpix-memory-sink".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let mut buffers = Vec::new();
                    while let Some(SinkMessage::Clusters(clusters)) = source.pop() {
                        buffers.push(clusters);
                    }
                    debug!(frames = buffers.len(), "memory sink finished");
                    buffers
                })
            })?;
        Ok(Self { handle })
    }

    /// Waits for the end marker and returns the buffers in arrival order.
    ///
    /// # Errors
    /// Returns `Error::SinkPanicked` if the thread panicked.
    pub fn join(self) -> Result<Vec<ClusterBuffer<C>>> {
        self.handle.join().map_err(|_| Error::SinkPanicked)
    }
}
