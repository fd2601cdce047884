use std::sync::Arc;

use quanta::Clock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::{
    datapoint::DataPoint,
    dedup::SentCache,
    state::{Admission, State},
};

/// An entry on the ingestion channel.
#[derive(Debug)]
pub(crate) enum Submission {
    /// A point produced by a collector or a `Submitter`.
    Fresh(DataPoint),

    /// A point written back by the sender after a failed delivery.
    Restored(DataPoint),
}

/// Moves points from the ingestion channel into the queue, shedding and deduplicating on the way.
pub(crate) struct Ingestor {
    receiver: mpsc::UnboundedReceiver<Submission>,
    state: Arc<State>,
    cache: SentCache,
    clock: Clock,
}

impl Ingestor {
    /// Creates a new `Ingestor`.
    pub fn new(
        receiver: mpsc::UnboundedReceiver<Submission>,
        state: Arc<State>,
        cache: SentCache,
        clock: Clock,
    ) -> Self {
        Ingestor { receiver, state, cache, clock }
    }

    /// Runs the ingestor until `stop` is signalled, then drains whatever is left on the channel.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;

                _ = stop.changed() => break,
                maybe_submission = self.receiver.recv() => match maybe_submission {
                    Some(submission) => self.ingest_burst(submission),
                    None => {
                        debug!("Ingestion channel closed.");
                        return;
                    }
                },
            }
        }

        let mut drained = 0usize;
        while let Ok(submission) = self.receiver.try_recv() {
            self.ingest(submission);
            drained += 1;
        }
        debug!(drained, queued = self.state.queue().len(), "Ingestor stopped.");
    }

    /// Ingests `first` and everything else already waiting on the channel.
    ///
    /// The burst ends early as soon as a point is shed for lack of capacity. Whatever is still on
    /// the channel at that point is picked up on the next wake-up.
    pub fn ingest_burst(&mut self, first: Submission) {
        if self.ingest(first) == Admission::Full {
            return;
        }

        while let Ok(submission) = self.receiver.try_recv() {
            if self.ingest(submission) == Admission::Full {
                break;
            }
        }
    }

    fn ingest(&mut self, submission: Submission) -> Admission {
        let now = self.clock.now();
        let cache = &mut self.cache;

        let outcome = match submission {
            Submission::Fresh(point) => {
                self.state.queue().push(point, |point| cache.admit_fresh(point, now))
            }
            Submission::Restored(point) => {
                self.state.queue().push(point, |point| cache.admit_restored(point, now))
            }
        };

        match outcome {
            Admission::Queued => {}
            Admission::Suppressed => self.state.counters().track_duplicate(),
            Admission::Full => {
                trace!("Queue at capacity, dropping point.");
                self.state.counters().track_dropped(1);
            }
        }

        let evicted = self.cache.sweep(now);
        if evicted > 0 {
            trace!(evicted, remaining = self.cache.len(), "Swept dedup cache.");
        }

        outcome
    }
}
