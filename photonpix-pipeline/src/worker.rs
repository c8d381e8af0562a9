//! Worker and collector thread bodies.

use crate::queue::{PopError, WorkQueue};
use crate::task::{FrameTask, SinkMessage};
use parking_lot::{Condvar, Mutex};
use photonpix_algorithms::Detector;
use photonpix_core::{Accumulator, ClusterValue, Pixel};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Count of submitted tasks whose effect has not reached the sink yet.
///
/// A data task is done once the collector has handed its buffer to the sink,
/// a pedestal task once the worker has folded it in.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    pub(crate) fn add(&self, n: usize) {
        *self.count.lock() += n;
    }

    pub(crate) fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn get(&self) -> usize {
        *self.count.lock()
    }

    pub(crate) fn reset(&self) {
        *self.count.lock() = 0;
        self.idle.notify_all();
    }

    /// Waits at most `timeout` for the count to reach zero.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        *count == 0
    }
}

/// Closes a worker's queues if the worker unwinds, so that neither the
/// submitter nor the collector wait on it forever.
struct CloseOnPanic<'a, T, C> {
    index: usize,
    input: &'a WorkQueue<FrameTask<T>>,
    output: &'a WorkQueue<SinkMessage<C>>,
}

impl<T, C> Drop for CloseOnPanic<'_, T, C> {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(worker = self.index, "worker panicked, closing its queues");
            self.input.close();
            self.output.close();
        }
    }
}

/// Processes tasks until a `Poison` task (or a closed input queue) and
/// returns the detector.
pub(crate) fn run_worker<T, F, C>(
    index: usize,
    mut detector: Detector<T, F, C>,
    input: &WorkQueue<FrameTask<T>>,
    output: &WorkQueue<SinkMessage<C>>,
    in_flight: &InFlight,
) -> Detector<T, F, C>
where
    T: Pixel,
    F: Accumulator,
    C: ClusterValue,
{
    let _guard = CloseOnPanic {
        index,
        input,
        output,
    };
    debug!(worker = index, "worker started");

    while let Some(task) = input.pop() {
        match task {
            FrameTask::Data {
                frame_number,
                frame,
            } => {
                if let Err(err) = detector.find_clusters(frame.view(), frame_number) {
                    warn!(worker = index, frame_number, error = %err, "skipping frame");
                }
                // One buffer per data frame, possibly empty, so the sink
                // sees every submitted frame once.
                let clusters = detector.steal_clusters(true);
                if output.push(SinkMessage::Clusters(clusters)).is_err() {
                    warn!(worker = index, frame_number, "output queue closed, dropping clusters");
                    in_flight.done();
                }
            }
            FrameTask::Pedestal { frame } => {
                if let Err(err) = detector.push_pedestal_frame(frame.view()) {
                    warn!(worker = index, error = %err, "skipping pedestal frame");
                }
                in_flight.done();
            }
            FrameTask::Poison => break,
        }
    }

    let stats = detector.statistics();
    debug!(
        worker = index,
        frames = stats.frames_processed,
        clusters = stats.clusters_found,
        "worker stopped"
    );
    detector
}

/// Longest wait on a single output while none has anything ready.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Forwards cluster buffers from the worker outputs to the sink, taking
/// whatever is ready, until every output has delivered `Finished`.
pub(crate) fn run_collector<C: ClusterValue>(
    outputs: &[Arc<WorkQueue<SinkMessage<C>>>],
    sink: &WorkQueue<SinkMessage<C>>,
    in_flight: &InFlight,
) {
    let mut collector = Collector {
        sink,
        in_flight,
        finished: vec![false; outputs.len()],
        n_finished: 0,
        forwarded: 0,
    };
    let mut turn = 0;
    debug!(outputs = outputs.len(), "collector started");

    while collector.n_finished < outputs.len() {
        let mut moved = false;
        for (index, output) in outputs.iter().enumerate() {
            if !collector.finished[index] {
                moved |= collector.take(index, output.try_pop());
            }
        }
        if moved {
            continue;
        }
        let next = (1..=outputs.len())
            .map(|step| (turn + step) % outputs.len())
            .find(|&index| !collector.finished[index]);
        if let Some(index) = next {
            turn = index;
            collector.take(index, outputs[index].pop_timeout(IDLE_WAIT));
        }
    }

    if sink.push(SinkMessage::Finished).is_err() {
        warn!("sink closed before the end marker");
    }
    debug!(forwarded = collector.forwarded, "collector stopped");
}

struct Collector<'a, C> {
    sink: &'a WorkQueue<SinkMessage<C>>,
    in_flight: &'a InFlight,
    finished: Vec<bool>,
    n_finished: usize,
    forwarded: u64,
}

impl<C: ClusterValue> Collector<'_, C> {
    /// Handles one pop result from output `index`; true if a buffer moved.
    fn take(&mut self, index: usize, popped: Result<SinkMessage<C>, PopError>) -> bool {
        match popped {
            Ok(SinkMessage::Clusters(clusters)) => {
                if self.sink.push(SinkMessage::Clusters(clusters)).is_err() {
                    warn!(worker = index, "sink closed, dropping clusters");
                } else {
                    self.forwarded += 1;
                }
                self.in_flight.done();
                true
            }
            // A closed and drained output belongs to a dead worker.
            Ok(SinkMessage::Finished) | Err(PopError::Closed) => {
                self.finished[index] = true;
                self.n_finished += 1;
                false
            }
            Err(PopError::Empty) => false,
        }
    }
}
