use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Pipeline telemetry.
///
/// `Counters` tracks what happened to every point that entered the pipeline. Each counter is
/// independent and only ever increases; there is no reset for the life of the pipeline.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    dropped: AtomicU64,
    duplicate: AtomicU64,
    sent: AtomicU64,
    restored: AtomicU64,
    expired: AtomicU64,
}

impl Counters {
    /// Tracks a point shed because the queue was full, or lost during the final flush.
    pub fn track_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::AcqRel);
    }

    /// Tracks a point suppressed as an unchanged repeat.
    pub fn track_duplicate(&self) {
        self.duplicate.fetch_add(1, Ordering::AcqRel);
    }

    /// Tracks points accepted by the remote endpoint.
    pub fn track_sent(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::AcqRel);
    }

    /// Tracks points from a failed batch that were re-injected for another attempt.
    pub fn track_restored(&self, count: u64) {
        self.restored.fetch_add(count, Ordering::AcqRel);
    }

    /// Tracks points from a failed batch that were too old to retry.
    pub fn track_expired(&self, count: u64) {
        self.expired.fetch_add(count, Ordering::AcqRel);
    }

    /// Takes a point-in-time snapshot of the counters, with the given queue length.
    pub fn snapshot(&self, queued: usize) -> PipelineStats {
        PipelineStats {
            dropped: self.dropped.load(Ordering::Acquire),
            duplicate: self.duplicate.load(Ordering::Acquire),
            sent: self.sent.load(Ordering::Acquire),
            restored: self.restored.load(Ordering::Acquire),
            expired: self.expired.load(Ordering::Acquire),
            queued: queued as u64,
        }
    }
}

/// A point-in-time view of the pipeline's own statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Points shed because the queue was at capacity.
    pub dropped: u64,

    /// Points suppressed because they repeated the last admitted value within the dedup window.
    pub duplicate: u64,

    /// Points accepted by the remote endpoint.
    pub sent: u64,

    /// Points re-injected into the ingestion channel after a failed delivery.
    pub restored: u64,

    /// Points discarded after a failed delivery because they were too old to retry.
    pub expired: u64,

    /// Points currently waiting in the queue.
    pub queued: u64,
}

#[cfg(test)]
mod tests {
    use super::{Counters, PipelineStats};

    #[test]
    fn snapshot_reflects_updates() {
        let counters = Counters::default();
        counters.track_dropped(2);
        counters.track_duplicate();
        counters.track_duplicate();
        counters.track_sent(50);
        counters.track_restored(3);
        counters.track_expired(1);

        let expected =
            PipelineStats { dropped: 2, duplicate: 2, sent: 50, restored: 3, expired: 1, queued: 7 };
        assert_eq!(counters.snapshot(7), expected);
    }
}
