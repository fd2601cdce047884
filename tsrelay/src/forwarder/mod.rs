use std::time::Duration;

use crate::datapoint::DataPoint;

pub mod sender;

/// Forwarder configuration.
#[derive(Clone, Debug)]
pub struct ForwarderConfiguration {
    /// Maximum number of points per delivery attempt.
    pub batch_size: usize,

    /// Points from a failed batch older than this are discarded instead of retried.
    pub retry_cutoff: Duration,

    /// Pause after a failed delivery.
    pub failure_backoff: Duration,

    /// Pause before re-checking an empty queue.
    pub idle_interval: Duration,

    /// Whether to log every batch at info level.
    pub verbose: bool,
}

impl ForwarderConfiguration {
    /// Returns the oldest timestamp, in seconds since the Unix epoch, still worth retrying at `now`.
    pub fn retry_cutoff_at(&self, now: i64) -> i64 {
        let cutoff = i64::try_from(self.retry_cutoff.as_secs()).unwrap_or(i64::MAX);
        now.saturating_sub(cutoff)
    }
}

/// Splits a failed batch into points worth retrying and points too old to matter.
///
/// A point is expired when its timestamp is strictly before `cutoff`. Both halves keep the order
/// of the original batch.
pub(crate) fn split_by_age(batch: Vec<DataPoint>, cutoff: i64) -> (Vec<DataPoint>, Vec<DataPoint>) {
    batch.into_iter().partition(|point| point.timestamp() >= cutoff)
}
