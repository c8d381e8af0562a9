//! Bounded blocking FIFO shared between pipeline stages.
//!
//! Producers block while the queue is full, consumers while it is empty.
//! [`WorkQueue::close`] wakes everybody: pushes fail from then on and hand the
//! item back, pops keep draining what is left and then return `None`.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Returned by [`WorkQueue::push`] on a closed queue, carrying the item.
#[derive(Error)]
#[error("queue is closed")]
pub struct QueueClosed<T>(pub T);

impl<T> QueueClosed<T> {
    /// Takes the rejected item back.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed(..)")
    }
}

/// Failure of a non-blocking or timed push; the item is handed back.
#[derive(Error)]
pub enum PushError<T> {
    /// The queue stayed full.
    #[error("queue is full")]
    Full(T),
    /// The queue is closed.
    #[error("queue is closed")]
    Closed(T),
}

impl<T> PushError<T> {
    /// Takes the rejected item back.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// Failure of a non-blocking or timed pop.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// The queue stayed empty.
    #[error("queue is empty")]
    Empty,
    /// The queue is closed and drained.
    #[error("queue is closed")]
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed capacity multi-producer multi-consumer queue.
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    drained: Condvar,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    /// Creates a queue holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            drained: Condvar::new(),
            capacity,
        }
    }

    /// Appends an item, blocking while the queue is full.
    ///
    /// # Errors
    /// Returns the item in `QueueClosed` if the queue is or gets closed.
    pub fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(QueueClosed(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Appends an item if there is room.
    ///
    /// # Errors
    /// Returns `PushError::Full` or `PushError::Closed` with the item.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        self.push_timeout(item, Duration::ZERO)
    }

    /// Appends an item, waiting at most `timeout` for room.
    ///
    /// # Errors
    /// Returns `PushError::Full` or `PushError::Closed` with the item.
    pub fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            if self.not_full.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Removes the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                let now_empty = state.items.is_empty();
                drop(state);
                self.not_full.notify_one();
                if now_empty {
                    self.drained.notify_all();
                }
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Removes the oldest item if there is one.
    ///
    /// # Errors
    /// Returns `PopError::Empty`, or `PopError::Closed` once closed and drained.
    pub fn try_pop(&self) -> Result<T, PopError> {
        self.pop_timeout(Duration::ZERO)
    }

    /// Removes the oldest item, waiting at most `timeout` for one.
    ///
    /// # Errors
    /// Returns `PopError::Empty`, or `PopError::Closed` once closed and drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, PopError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                let now_empty = state.items.is_empty();
                drop(state);
                self.not_full.notify_one();
                if now_empty {
                    self.drained.notify_all();
                }
                return Ok(item);
            }
            if state.closed {
                return Err(PopError::Closed);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() && state.items.is_empty()
            {
                return Err(if state.closed {
                    PopError::Closed
                } else {
                    PopError::Empty
                });
            }
        }
    }

    /// Closes the queue and wakes all waiting threads.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.drained.notify_all();
    }

    /// Waits at most `timeout` for consumers to empty the queue.
    ///
    /// Returns true if the queue is empty. A closed queue stops the wait
    /// early.
    pub fn wait_empty_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.items.is_empty() && !state.closed {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.items.is_empty()
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Snapshot of the emptiness; may be stale by the time it is read.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Snapshot of the number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}
