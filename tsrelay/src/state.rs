use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::{datapoint::DataPoint, telemetry::Counters};

/// Outcome of offering a point to the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// The point was appended to the back of the queue.
    Queued,

    /// The admission check rejected the point.
    Suppressed,

    /// The queue was at capacity and the point was shed.
    Full,
}

/// Bounded FIFO of points waiting to be sent.
///
/// The length of the queue never exceeds the configured maximum: the capacity check and the append
/// happen under the same lock hold, one point at a time.
pub(crate) struct BoundedQueue {
    points: Mutex<VecDeque<DataPoint>>,
    max_len: usize,
}

impl BoundedQueue {
    /// Creates a new `BoundedQueue` holding at most `max_len` points.
    pub fn new(max_len: usize) -> Self {
        BoundedQueue { points: Mutex::new(VecDeque::new()), max_len }
    }

    /// Offers a point to the queue.
    ///
    /// If the queue has room, `admit` is called with the point while the lock is held, and the
    /// point is appended only if it returns `true`. `admit` is not called at all when the queue is
    /// full, so any bookkeeping it does only happens for points that are actually queued.
    pub fn push<F>(&self, point: DataPoint, admit: F) -> Admission
    where
        F: FnOnce(&DataPoint) -> bool,
    {
        let mut points = self.points.lock();
        if points.len() >= self.max_len {
            return Admission::Full;
        }
        if !admit(&point) {
            return Admission::Suppressed;
        }
        points.push_back(point);
        Admission::Queued
    }

    /// Removes and returns up to `n` points from the front of the queue.
    pub fn take_up_to(&self, n: usize) -> Vec<DataPoint> {
        let mut points = self.points.lock();
        let n = n.min(points.len());
        points.drain(..n).collect()
    }

    /// Number of queued points.
    pub fn len(&self) -> usize {
        self.points.lock().len()
    }
}

/// State shared between the ingestor, the sender and every `Pipeline` handle.
pub(crate) struct State {
    queue: BoundedQueue,
    counters: Counters,
}

impl State {
    /// Creates a new `State` with an empty queue holding at most `max_queue_len` points.
    pub fn new(max_queue_len: usize) -> Self {
        State { queue: BoundedQueue::new(max_queue_len), counters: Counters::default() }
    }

    pub fn queue(&self) -> &BoundedQueue {
        &self.queue
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }
}
