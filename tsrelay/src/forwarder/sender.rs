use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    datapoint::{unix_now, DataPoint},
    ingest::Submission,
    state::State,
    transport::Transport,
    writer::PayloadWriter,
};

use super::{split_by_age, ForwarderConfiguration};

/// Result of a single send cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Cycle {
    /// The queue was empty.
    Idle,

    /// A batch was accepted by the endpoint.
    Sent,

    /// A batch could not be delivered and was handed to the retry path.
    Failed,

    /// A batch could not be encoded and was discarded.
    Abandoned,
}

enum Delivery {
    Sent,
    Failed(Vec<DataPoint>),
    Abandoned,
}

/// Drains the queue in batches and delivers them through a [`Transport`].
pub(crate) struct Forwarder {
    config: ForwarderConfiguration,
    state: Arc<State>,
    transport: Arc<dyn Transport>,
    retry: mpsc::UnboundedSender<Submission>,
    writer: PayloadWriter,
}

impl Forwarder {
    /// Creates a new `Forwarder`.
    ///
    /// Points from failed batches are written back to `retry`, which must feed the same ingestor
    /// that fills `state`'s queue.
    pub fn new(
        config: ForwarderConfiguration,
        state: Arc<State>,
        transport: Arc<dyn Transport>,
        retry: mpsc::UnboundedSender<Submission>,
    ) -> Self {
        Forwarder { config, state, transport, retry, writer: PayloadWriter::new() }
    }

    /// Runs the forwarder until `shutdown` is signalled.
    ///
    /// At most one batch is in flight at a time. A shutdown signal does not interrupt a delivery
    /// already in progress, only the pauses between them.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let pause = match self.send_cycle().await {
                Cycle::Idle => self.config.idle_interval,
                Cycle::Failed => self.config.failure_backoff,
                Cycle::Sent | Cycle::Abandoned => continue,
            };

            if pause_or_shutdown(&mut shutdown, pause).await {
                break;
            }
        }

        debug!(queued = self.state.queue().len(), "Forwarder stopped.");
    }

    /// Takes one batch off the queue and tries to deliver it.
    pub async fn send_cycle(&mut self) -> Cycle {
        let batch = self.state.queue().take_up_to(self.config.batch_size);
        if batch.is_empty() {
            return Cycle::Idle;
        }

        if self.config.verbose {
            info!(
                sending = batch.len(),
                remaining = self.state.queue().len(),
                "Sending batch."
            );
        }

        match self.deliver(batch).await {
            Delivery::Sent => Cycle::Sent,
            Delivery::Abandoned => Cycle::Abandoned,
            Delivery::Failed(batch) => {
                self.retry_or_expire(batch);
                Cycle::Failed
            }
        }
    }

    /// Sends whatever is left in the queue, one attempt per batch.
    ///
    /// Points from batches that fail are counted as dropped rather than retried.
    pub async fn flush(&mut self) {
        let mut batches = 0usize;
        let mut lost = 0usize;

        loop {
            let batch = self.state.queue().take_up_to(self.config.batch_size);
            if batch.is_empty() {
                break;
            }

            batches += 1;
            if let Delivery::Failed(batch) = self.deliver(batch).await {
                lost += batch.len();
                self.state.counters().track_dropped(batch.len() as u64);
            }
        }

        if lost > 0 {
            warn!(batches, lost, "Final flush could not deliver every point.");
        } else {
            debug!(batches, "Final flush complete.");
        }
    }

    async fn deliver(&mut self, batch: Vec<DataPoint>) -> Delivery {
        let payload = match self.writer.write_batch(&batch) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, points = batch.len(), "Failed to encode batch. Discarding it.");
                self.state.counters().track_dropped(batch.len() as u64);
                return Delivery::Abandoned;
            }
        };

        let payload_len = payload.len();
        match self.transport.send(payload).await {
            Ok(response) if response.is_success() => {
                self.state.counters().track_sent(batch.len() as u64);
                debug!(points = batch.len(), payload_len, "Batch delivered.");
                Delivery::Sent
            }
            Ok(response) => {
                let status = response.status;
                let status = status.canonical_reason().unwrap_or_else(|| status.as_str());
                error!(
                    message = "unexpected status after sending batch",
                    status,
                    body = %response.body,
                    points = batch.len(),
                );
                Delivery::Failed(batch)
            }
            Err(e) => {
                error!(error = %e, points = batch.len(), "Failed to send batch.");
                Delivery::Failed(batch)
            }
        }
    }

    fn retry_or_expire(&self, batch: Vec<DataPoint>) {
        let cutoff = self.config.retry_cutoff_at(unix_now());
        let (retry, expired) = split_by_age(batch, cutoff);

        if !expired.is_empty() {
            warn!(expired = expired.len(), cutoff, "Discarding points too old to retry.");
            self.state.counters().track_expired(expired.len() as u64);
        }

        let pending = retry.len();
        let mut restored = 0usize;
        for point in retry {
            if self.retry.send(Submission::Restored(point)).is_err() {
                break;
            }
            restored += 1;
        }

        self.state.counters().track_restored(restored as u64);
        if restored < pending {
            let lost = pending - restored;
            warn!(lost, "Ingestion channel closed. Points from the failed batch were lost.");
            self.state.counters().track_dropped(lost as u64);
        } else if restored > 0 {
            debug!(restored, "Restored points from the failed batch for another attempt.");
        }
    }
}

/// Sleeps for `duration`, returning `true` early if shutdown is signalled in the meantime.
///
/// A closed shutdown channel counts as a shutdown signal.
async fn pause_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use hyper::StatusCode;
    use tokio::sync::{mpsc, watch};

    use super::{Cycle, Forwarder};
    use crate::{
        datapoint::{unix_now, DataPoint, TagSet, Value},
        forwarder::ForwarderConfiguration,
        ingest::Submission,
        state::{Admission, State},
        transport::mock::MockTransport,
    };

    struct Harness {
        forwarder: Forwarder,
        state: Arc<State>,
        transport: MockTransport,
        retried: mpsc::UnboundedReceiver<Submission>,
    }

    fn harness(batch_size: usize) -> Harness {
        let config = ForwarderConfiguration {
            batch_size,
            retry_cutoff: Duration::from_secs(30 * 60),
            failure_backoff: Duration::from_secs(5),
            idle_interval: Duration::from_secs(1),
            verbose: true,
        };
        let state = Arc::new(State::new(1_000));
        let transport = MockTransport::default();
        let (tx, retried) = mpsc::unbounded_channel();
        let forwarder =
            Forwarder::new(config, Arc::clone(&state), Arc::new(transport.clone()), tx);
        Harness { forwarder, state, transport, retried }
    }

    fn enqueue(state: &State, count: usize, timestamp: i64) {
        for i in 0..count {
            let point = DataPoint::new(format!("m{i}"), timestamp, 1, TagSet::new()).unwrap();
            assert_eq!(state.queue().push(point, |_| true), Admission::Queued);
        }
    }

    #[tokio::test]
    async fn one_cycle_sends_exactly_one_batch() {
        let mut h = harness(50);
        enqueue(&h.state, 120, unix_now());

        assert_eq!(h.forwarder.send_cycle().await, Cycle::Sent);
        assert_eq!(h.state.queue().len(), 70);
        assert_eq!(h.transport.batches()[0].len(), 50);
        assert_eq!(h.state.counters().snapshot(0).sent, 50);
        assert!(h.retried.try_recv().is_err());
    }

    #[tokio::test]
    async fn batches_drain_in_queue_order() {
        let mut h = harness(2);
        enqueue(&h.state, 3, unix_now());

        assert_eq!(h.forwarder.send_cycle().await, Cycle::Sent);
        assert_eq!(h.forwarder.send_cycle().await, Cycle::Sent);
        assert_eq!(h.forwarder.send_cycle().await, Cycle::Idle);

        let metrics = h
            .transport
            .batches()
            .iter()
            .flatten()
            .map(|p| p.metric().to_string())
            .collect::<Vec<_>>();
        assert_eq!(metrics, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn failed_batch_retries_recent_points_only() {
        let mut h = harness(50);
        let now = unix_now();
        let old = DataPoint::new("old", now - 40 * 60, 1, TagSet::new()).unwrap();
        let recent = DataPoint::new("recent", now - 60, 1, TagSet::new()).unwrap();
        h.state.queue().push(old, |_| true);
        h.state.queue().push(recent.clone(), |_| true);

        h.transport.respond(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.forwarder.send_cycle().await, Cycle::Failed);

        match h.retried.try_recv() {
            Ok(Submission::Restored(point)) => assert_eq!(point, recent),
            other => panic!("expected a restored point, got {other:?}"),
        }
        assert!(h.retried.try_recv().is_err());

        let stats = h.state.counters().snapshot(0);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.restored, 1);
        assert_eq!(stats.sent, 0);
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let mut h = harness(50);
        enqueue(&h.state, 3, unix_now());

        h.transport.fail();
        assert_eq!(h.forwarder.send_cycle().await, Cycle::Failed);

        let mut restored = 0;
        while let Ok(Submission::Restored(_)) = h.retried.try_recv() {
            restored += 1;
        }
        assert_eq!(restored, 3);
    }

    #[tokio::test]
    async fn non_204_success_codes_are_failures() {
        let mut h = harness(50);
        enqueue(&h.state, 1, unix_now());

        h.transport.respond(StatusCode::OK);
        assert_eq!(h.forwarder.send_cycle().await, Cycle::Failed);
        assert_eq!(h.state.counters().snapshot(0).sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_forwarder_never_calls_transport() {
        let Harness { mut forwarder, transport, .. } = harness(50);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            forwarder.run(shutdown_rx).await;
            forwarder
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.calls(), 0);

        shutdown_tx.send_replace(true);
        task.await.unwrap();
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_backoff_delays_next_attempt() {
        let Harness { mut forwarder, state, transport, retried: _retried } = harness(1);
        enqueue(&state, 2, unix_now());
        transport.respond(StatusCode::SERVICE_UNAVAILABLE);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { forwarder.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(transport.calls(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.calls(), 2);

        shutdown_tx.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn flush_sends_every_batch_once() {
        let mut h = harness(2);
        enqueue(&h.state, 5, unix_now());
        h.transport.respond(StatusCode::NO_CONTENT).respond(StatusCode::BAD_GATEWAY);

        h.forwarder.flush().await;

        assert_eq!(h.transport.calls(), 3);
        assert_eq!(h.state.queue().len(), 0);
        let stats = h.state.counters().snapshot(0);
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.restored, 0);
        assert!(h.retried.try_recv().is_err());
    }

    #[tokio::test]
    async fn unencodable_batch_is_abandoned() {
        let mut h = harness(50);
        enqueue(&h.state, 2, unix_now());
        h.state.queue().push(DataPoint::unchecked("bad", unix_now(), Value::Float(f64::NAN)), |_| true);

        assert_eq!(h.forwarder.send_cycle().await, Cycle::Abandoned);
        assert_eq!(h.transport.calls(), 0);
        assert_eq!(h.state.queue().len(), 0);
        assert!(h.retried.try_recv().is_err());

        let stats = h.state.counters().snapshot(0);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.restored, 0);
    }
}
