use std::{future::Future, pin::Pin, sync::Arc};

use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::{
    datapoint::DataPoint, forwarder::sender::Forwarder, ingest::Ingestor, ingest::Submission,
    state::State, telemetry::PipelineStats,
};

/// Convenience type for the future driving a pipeline.
///
/// The future completes once the pipeline has been shut down and the final flush has finished.
pub type PipelineFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle to a running pipeline.
///
/// Handles are cheap to clone. Dropping the last handle has the same effect as calling
/// [`Pipeline::shutdown`].
#[derive(Clone)]
pub struct Pipeline {
    state: Arc<State>,
    sender: mpsc::UnboundedSender<Submission>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Pipeline {
    /// Returns a [`Submitter`] that feeds points into this pipeline.
    pub fn submitter(&self) -> Submitter {
        Submitter { sender: self.sender.clone() }
    }

    /// Takes a snapshot of the pipeline's own statistics.
    pub fn stats(&self) -> PipelineStats {
        self.state.counters().snapshot(self.state.queue().len())
    }

    /// Signals the pipeline to shut down.
    ///
    /// The sender stops taking new batches, everything already submitted is moved into the queue,
    /// and the queue is flushed with a single delivery attempt per batch. Points submitted after
    /// this call may be lost.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Feeds points into a pipeline.
///
/// Submitting never blocks and never fails: points that cannot be accepted are accounted for in
/// the pipeline's statistics instead.
#[derive(Clone)]
pub struct Submitter {
    sender: mpsc::UnboundedSender<Submission>,
}

impl Submitter {
    /// Submits a single point.
    pub fn submit(&self, point: DataPoint) {
        if self.sender.send(Submission::Fresh(point)).is_err() {
            trace!("Pipeline stopped. Discarding submitted point.");
        }
    }

    /// Submits every point yielded by `points`, in order.
    pub fn submit_all<I>(&self, points: I)
    where
        I: IntoIterator<Item = DataPoint>,
    {
        for point in points {
            self.submit(point);
        }
    }
}

/// Wires the ingestor and forwarder together, returning the handle and the future driving both.
pub(crate) fn assemble(
    state: Arc<State>,
    sender: mpsc::UnboundedSender<Submission>,
    ingestor: Ingestor,
    mut forwarder: Forwarder,
) -> (Pipeline, PipelineFuture) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline = Pipeline { state, sender, shutdown: Arc::new(shutdown_tx) };

    let future = Box::pin(async move {
        // The ingestor keeps running until the forwarder has stopped, so points restored by a
        // delivery that was in flight at shutdown still make it into the final flush.
        let (stop_ingest_tx, stop_ingest_rx) = watch::channel(false);
        let forward = async {
            forwarder.run(shutdown_rx).await;
            stop_ingest_tx.send_replace(true);
        };
        tokio::join!(ingestor.run(stop_ingest_rx), forward);

        forwarder.flush().await;
    });

    (pipeline, future)
}
