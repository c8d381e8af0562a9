//! Multi-threaded cluster finding pipeline.
//!
//! ```text
//! submit_data ──round robin──▶ input[i] ──▶ worker[i] ──▶ output[i] ──┐
//! submit_pedestal ──broadcast──▶ all inputs                           ├─▶ collector ──▶ sink
//!                                                                     ┘
//! ```
//!
//! Every worker owns a [`Detector`]; pedestal and noise maps can be read back
//! once the pipeline is stopped. Buffers from different workers are merged in
//! no particular global order, consumers sort by frame number if they need to.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::queue::WorkQueue;
use crate::task::{FrameTask, SinkMessage, POISON_FRAME_NUMBER};
use crate::worker::{run_collector, run_worker, InFlight};
use ndarray::{Array2, ArrayView2};
use parking_lot::Mutex;
use photonpix_algorithms::{Detector, DetectorConfig, DetectorStatistics};
use photonpix_core::{Accumulator, ClusterValue, Pixel};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, Dispatch};

/// How often [`Pipeline::sync`] checks for dead workers while waiting.
const SYNC_POLL: Duration = Duration::from_millis(50);

type InputQueue<T> = Arc<WorkQueue<FrameTask<T>>>;
type OutputQueue<C> = Arc<WorkQueue<SinkMessage<C>>>;

enum State<T, F, C> {
    Running {
        workers: Vec<JoinHandle<Detector<T, F, C>>>,
        collector: JoinHandle<()>,
    },
    Stopped {
        detectors: Vec<Detector<T, F, C>>,
    },
}

/// Parallel cluster finder fed frame by frame.
///
/// `T` is the raw pixel type, `F` the pedestal accumulator and `C` the
/// cluster value type. The pipeline starts running on construction.
pub struct Pipeline<T = u16, F = f64, C = i32> {
    shape: (usize, usize),
    detector_config: DetectorConfig,
    config: PipelineConfig,
    inputs: Vec<InputQueue<T>>,
    outputs: Vec<OutputQueue<C>>,
    sink: OutputQueue<C>,
    counter: AtomicUsize,
    in_flight: Arc<InFlight>,
    broadcast: Mutex<()>,
    dispatch: Dispatch,
    state: State<T, F, C>,
}

impl<T, F, C> Pipeline<T, F, C>
where
    T: Pixel,
    F: Accumulator,
    C: ClusterValue,
{
    /// Creates the detectors and starts the worker and collector threads.
    ///
    /// Every thread logs through `dispatch`.
    ///
    /// # Errors
    /// Returns an invalid configuration error or `PipelineError::Spawn`.
    pub fn new(
        shape: (usize, usize),
        detector_config: &DetectorConfig,
        config: PipelineConfig,
        dispatch: Dispatch,
    ) -> Result<Self> {
        config.validate()?;
        let detectors = (0..config.n_workers)
            .map(|_| Detector::new(shape, detector_config))
            .collect::<photonpix_core::Result<Vec<_>>>()?;

        let mut pipeline = Self {
            shape,
            detector_config: detector_config.clone(),
            sink: Arc::new(WorkQueue::new(config.sink_capacity)),
            config,
            inputs: Vec::new(),
            outputs: Vec::new(),
            counter: AtomicUsize::new(0),
            in_flight: Arc::new(InFlight::default()),
            broadcast: Mutex::new(()),
            dispatch,
            state: State::Stopped { detectors },
        };
        pipeline.start()?;
        Ok(pipeline)
    }

    /// Starts a stopped pipeline again, keeping the detectors (and their
    /// pedestals).
    ///
    /// # Errors
    /// Returns `PipelineError::Running` if already running.
    pub fn start(&mut self) -> Result<()> {
        let detectors = match &mut self.state {
            State::Running { .. } => return Err(PipelineError::Running),
            State::Stopped { detectors } => std::mem::take(detectors),
        };

        self.inputs = (0..detectors.len())
            .map(|_| Arc::new(WorkQueue::new(self.config.input_capacity)))
            .collect();
        self.outputs = (0..detectors.len())
            .map(|_| Arc::new(WorkQueue::new(self.config.output_capacity)))
            .collect();
        self.counter.store(0, Ordering::Relaxed);
        self.in_flight.reset();

        let mut workers = Vec::with_capacity(detectors.len());
        for (index, detector) in detectors.into_iter().enumerate() {
            let input = Arc::clone(&self.inputs[index]);
            let output = Arc::clone(&self.outputs[index]);
            let in_flight = Arc::clone(&self.in_flight);
            let dispatch = self.dispatch.clone();
            let handle = thread::Builder::new()
                .name(format!("photonpix-worker-{index}"))
                .spawn(move || {
                    tracing::dispatcher::with_default(&dispatch, || {
                        run_worker(index, detector, &input, &output, &in_flight)
                    })
                })?;
            workers.push(handle);
        }

        let outputs = self.outputs.clone();
        let sink = Arc::clone(&self.sink);
        let in_flight = Arc::clone(&self.in_flight);
        let dispatch = self.dispatch.clone();
        let collector = thread::Builder::new()
            .name("photonpix-collector".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    run_collector(&outputs, &sink, &in_flight);
                });
            })?;

        tracing::dispatcher::with_default(&self.dispatch, || {
            debug!(workers = workers.len(), "pipeline started");
        });
        self.state = State::Running { workers, collector };
        Ok(())
    }

    /// Drains all queued work and stops the threads.
    ///
    /// The sink receives [`SinkMessage::Finished`] after the last buffer.
    ///
    /// # Errors
    /// Returns `PipelineError::NotRunning` if already stopped and
    /// `PipelineError::WorkerPanicked` if a worker died; that worker's slot
    /// starts over with a fresh detector. Shutdown completes in either case.
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }
        let State::Running { workers, collector } = std::mem::replace(
            &mut self.state,
            State::Stopped {
                detectors: Vec::new(),
            },
        ) else {
            return Err(PipelineError::NotRunning);
        };
        let dispatch = self.dispatch.clone();
        tracing::dispatcher::with_default(&dispatch, || self.shutdown(workers, collector))
    }

    /// Waits until every submitted frame has been handled and the sink is
    /// empty, leaving the threads running.
    ///
    /// Someone must be draining the sink, otherwise this blocks. A closed
    /// sink ends the wait early.
    ///
    /// # Errors
    /// Returns `PipelineError::NotRunning` if stopped and `WorkerPanicked` if
    /// a worker died with work still queued.
    pub fn sync(&self) -> Result<()> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }
        while !self.in_flight.wait_idle(SYNC_POLL) {
            if let Some(index) = self.inputs.iter().position(|input| input.is_closed()) {
                return Err(PipelineError::WorkerPanicked { index });
            }
        }
        while !self.sink.wait_empty_timeout(SYNC_POLL) {
            if self.sink.is_closed() {
                break;
            }
        }
        Ok(())
    }

    fn shutdown(
        &mut self,
        workers: Vec<JoinHandle<Detector<T, F, C>>>,
        collector: JoinHandle<()>,
    ) -> Result<()> {
        for input in &self.inputs {
            // Fails only for the closed queue of a dead worker.
            let _ = input.push(FrameTask::Poison);
        }

        let mut detectors = Vec::with_capacity(workers.len());
        let mut failure = None;
        for (index, handle) in workers.into_iter().enumerate() {
            match handle.join() {
                Ok(detector) => detectors.push(detector),
                Err(_) => {
                    error!(worker = index, "worker panicked, replacing its detector");
                    failure.get_or_insert(PipelineError::WorkerPanicked { index });
                    detectors.push(Detector::new(self.shape, &self.detector_config)?);
                }
            }
        }

        for output in &self.outputs {
            let _ = output.push(SinkMessage::Finished);
        }
        if collector.join().is_err() {
            error!("collector panicked");
            failure.get_or_insert(PipelineError::CollectorPanicked);
        }

        let mut total = DetectorStatistics::default();
        for detector in &detectors {
            total.merge(&detector.statistics());
        }
        info!(
            frames = total.frames_processed,
            pedestal_frames = total.pedestal_frames,
            clusters = total.clusters_found,
            "pipeline stopped"
        );

        self.state = State::Stopped { detectors };
        failure.map_or(Ok(()), Err)
    }

    /// Queues a data frame for the next worker in turn, blocking while that
    /// worker's input queue is full. The frame is copied.
    ///
    /// # Errors
    /// Returns `PipelineError::NotRunning`, `InvalidFrameNumber` for the
    /// reserved frame number, a shape mismatch, or `WorkerPanicked` if the
    /// chosen worker is dead.
    pub fn submit_data(&self, frame: ArrayView2<'_, T>, frame_number: u64) -> Result<()> {
        if frame_number == POISON_FRAME_NUMBER {
            return Err(PipelineError::InvalidFrameNumber(frame_number));
        }
        self.check_submit(frame.dim())?;
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.inputs.len();
        self.in_flight.add(1);
        self.inputs[index]
            .push(FrameTask::Data {
                frame_number,
                frame: frame.to_owned(),
            })
            .map_err(|_| {
                self.in_flight.done();
                PipelineError::WorkerPanicked { index }
            })
    }

    /// Queues a dark frame for every worker. One copy is shared.
    ///
    /// Concurrent callers are serialized, so every worker sees the pedestal
    /// frames in the same order.
    ///
    /// # Errors
    /// Returns `PipelineError::NotRunning`, a shape mismatch, or
    /// `WorkerPanicked` if a worker is dead.
    pub fn submit_pedestal(&self, frame: ArrayView2<'_, T>) -> Result<()> {
        self.check_submit(frame.dim())?;
        let frame = Arc::new(frame.to_owned());
        let _broadcast = self.broadcast.lock();
        for (index, input) in self.inputs.iter().enumerate() {
            self.in_flight.add(1);
            input
                .push(FrameTask::Pedestal {
                    frame: Arc::clone(&frame),
                })
                .map_err(|_| {
                    self.in_flight.done();
                    PipelineError::WorkerPanicked { index }
                })?;
        }
        Ok(())
    }

    fn check_submit(&self, dim: (usize, usize)) -> Result<()> {
        if !self.is_running() {
            return Err(PipelineError::NotRunning);
        }
        if dim != self.shape {
            return Err(photonpix_core::Error::ShapeMismatch {
                expected: self.shape,
                actual: dim,
            }
            .into());
        }
        Ok(())
    }

    /// The queue all cluster buffers end up in.
    pub fn sink(&self) -> Arc<WorkQueue<SinkMessage<C>>> {
        Arc::clone(&self.sink)
    }

    /// Returns true while the threads are running.
    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Submitted tasks not yet handed to the sink (data) or folded into a
    /// pedestal.
    pub fn pending_tasks(&self) -> usize {
        self.in_flight.get()
    }

    /// Tasks and buffers currently held in the worker input and output
    /// queues. The sink is not included.
    pub fn queued_tasks(&self) -> usize {
        let inputs: usize = self.inputs.iter().map(|queue| queue.len()).sum();
        let outputs: usize = self.outputs.iter().map(|queue| queue.len()).sum();
        inputs + outputs
    }

    /// Number of workers.
    pub fn n_workers(&self) -> usize {
        self.config.n_workers
    }

    /// Frame shape `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Queue configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Detector of worker `index`.
    ///
    /// # Errors
    /// Returns `PipelineError::Running` while running and
    /// `PipelineError::WorkerIndex` for a bad index.
    pub fn detector(&self, index: usize) -> Result<&Detector<T, F, C>> {
        let detectors = self.detectors()?;
        detectors.get(index).ok_or(PipelineError::WorkerIndex {
            index,
            n_workers: detectors.len(),
        })
    }

    /// Pedestal mean of worker `index`.
    ///
    /// # Errors
    /// See [`detector`](Self::detector).
    pub fn pedestal(&self, index: usize) -> Result<Array2<F>> {
        Ok(self.detector(index)?.pedestal())
    }

    /// Pedestal noise of worker `index`.
    ///
    /// # Errors
    /// See [`detector`](Self::detector).
    pub fn noise(&self, index: usize) -> Result<Array2<F>> {
        Ok(self.detector(index)?.noise())
    }

    /// Counters of worker `index`.
    ///
    /// # Errors
    /// See [`detector`](Self::detector).
    pub fn statistics(&self, index: usize) -> Result<DetectorStatistics> {
        Ok(self.detector(index)?.statistics())
    }

    /// Counters summed over all workers.
    ///
    /// # Errors
    /// Returns `PipelineError::Running` while running.
    pub fn total_statistics(&self) -> Result<DetectorStatistics> {
        let mut total = DetectorStatistics::default();
        for detector in self.detectors()? {
            total.merge(&detector.statistics());
        }
        Ok(total)
    }

    /// Clears the pedestal of every worker.
    ///
    /// # Errors
    /// Returns `PipelineError::Running` while running.
    pub fn clear_pedestal(&mut self) -> Result<()> {
        match &mut self.state {
            State::Running { .. } => Err(PipelineError::Running),
            State::Stopped { detectors } => {
                detectors.iter_mut().for_each(Detector::clear_pedestal);
                Ok(())
            }
        }
    }

    fn detectors(&self) -> Result<&[Detector<T, F, C>]> {
        match &self.state {
            State::Running { .. } => Err(PipelineError::Running),
            State::Stopped { detectors } => Ok(detectors),
        }
    }
}

impl<T, F, C> Drop for Pipeline<T, F, C> {
    fn drop(&mut self) {
        let State::Running { workers, collector } = std::mem::replace(
            &mut self.state,
            State::Stopped {
                detectors: Vec::new(),
            },
        ) else {
            return;
        };
        for input in &self.inputs {
            let _ = input.push(FrameTask::Poison);
        }
        for handle in workers {
            let _ = handle.join();
        }
        for output in &self.outputs {
            let _ = output.push(SinkMessage::Finished);
        }
        let _ = collector.join();
    }
}

impl<T, F, C> std::fmt::Debug for Pipeline<T, F, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("shape", &self.shape)
            .field("config", &self.config)
            .field("running", &matches!(self.state, State::Running { .. }))
            .finish_non_exhaustive()
    }
}
