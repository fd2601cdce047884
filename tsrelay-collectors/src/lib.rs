//! Measurement producers for a [`tsrelay`] pipeline.
//!
//! Each [`Collector`] gathers one category of measurements and returns them as [`DataPoint`]s.
//! A [`CollectorSet`] runs every registered collector on a fixed interval, stamps default tags
//! onto the points, and hands them to a [`Sink`], normally a pipeline's [`Submitter`].
//!
//! The following collectors are provided:
//!
//! - [`http_check::HttpCheck`]: availability, response time and content of an HTTP endpoint, checked
//!   against every address its host resolves to
//! - [`processes::LinuxProcesses`]: CPU, memory and I/O accounting of selected processes
//! - [`self_stats::SelfStats`]: the pipeline's own statistics

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]

use std::{future::Future, pin::Pin, time::Duration};

use thiserror::Error;
use tokio::{
    sync::watch,
    task::JoinSet,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, trace, warn};
use tsrelay::{DataPoint, DataPointError, Submitter, TagSet, Value};

pub mod http_check;
pub mod processes;
pub mod self_stats;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

/// Errors that could occur while configuring or running a collector.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The collector configuration string could not be parsed.
    #[error("invalid collector configuration '{config}': {reason}")]
    InvalidConfig {
        /// The configuration as given.
        config: String,
        /// Details about the parsing failure.
        reason: String,
    },

    /// A host name could not be resolved.
    #[error("failed to resolve '{host}': {source}")]
    Resolve {
        /// The host that was being resolved.
        host: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Reading from the system failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A system file did not have the expected format.
    #[error("failed to parse {what}: {reason}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Details about the parsing failure.
        reason: String,
    },

    /// The HTTP client could not be created.
    #[error("failed to create HTTP client: {0}")]
    Client(String),

    /// A collected measurement could not be turned into a data point.
    #[error(transparent)]
    DataPoint(#[from] DataPointError),
}

/// Convenience type for the future returned by [`Collector::collect`].
pub type CollectorFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<DataPoint>, CollectorError>> + Send + 'a>>;

/// A source of measurements, polled periodically by a [`CollectorSet`].
pub trait Collector: Send {
    /// Returns the collector name, used for logging.
    fn name(&self) -> &str;

    /// Gathers the current measurements.
    fn collect(&mut self) -> CollectorFuture<'_>;
}

/// Destination for collected points.
pub trait Sink: Clone + Send + Sync + 'static {
    /// Accepts a round of points from a single collector.
    fn accept(&self, points: Vec<DataPoint>);
}

impl Sink for Submitter {
    fn accept(&self, points: Vec<DataPoint>) {
        self.submit_all(points);
    }
}

/// Appends a data point observed now to `points`.
///
/// Measurements that cannot form a valid data point, such as a metric name with invalid
/// characters, are logged and skipped, so a single bad measurement does not cost a collector its
/// whole round.
pub fn add<V>(points: &mut Vec<DataPoint>, metric: &str, value: V, tags: &TagSet)
where
    V: Into<Value>,
{
    match DataPoint::now(metric, value, tags.clone()) {
        Ok(point) => points.push(point),
        Err(e) => warn!(error = %e, metric, "Skipping invalid data point."),
    }
}

/// A set of collectors run on a shared interval.
pub struct CollectorSet {
    collectors: Vec<Box<dyn Collector>>,
    default_tags: TagSet,
    interval: Duration,
}

impl CollectorSet {
    /// Creates an empty `CollectorSet`.
    ///
    /// Collectors run every 15 seconds by default.
    pub fn new() -> Self {
        CollectorSet { collectors: Vec::new(), default_tags: TagSet::new(), interval: DEFAULT_INTERVAL }
    }

    /// Sets the interval between two rounds of the same collector.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets tags added to every collected point that does not already carry them.
    #[must_use]
    pub fn with_default_tags(mut self, tags: TagSet) -> Self {
        self.default_tags = tags;
        self
    }

    /// Registers a collector.
    pub fn register<C>(&mut self, collector: C)
    where
        C: Collector + 'static,
    {
        self.collectors.push(Box::new(collector));
    }

    /// Number of registered collectors.
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    /// Returns `true` if no collector is registered.
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Runs every collector on its own task until `shutdown` is signalled.
    ///
    /// The first round of every collector starts immediately. A collector that fails is logged and
    /// polled again on its next tick.
    pub async fn run<S>(self, sink: S, shutdown: watch::Receiver<bool>)
    where
        S: Sink,
    {
        let mut tasks = JoinSet::new();
        for collector in self.collectors {
            tasks.spawn(run_collector(
                collector,
                self.interval,
                self.default_tags.clone(),
                sink.clone(),
                shutdown.clone(),
            ));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Collector task panicked.");
            }
        }
    }
}

impl Default for CollectorSet {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_collector<S>(
    mut collector: Box<dyn Collector>,
    interval: Duration,
    default_tags: TagSet,
    sink: S,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Sink,
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = collector.collect() => result,
        };

        match result {
            Ok(mut points) => {
                for point in &mut points {
                    point.add_missing_tags(&default_tags);
                }
                trace!(collector = collector.name(), points = points.len(), "Collected points.");
                sink.accept(points);
            }
            Err(e) => warn!(collector = collector.name(), error = %e, "Collection failed."),
        }
    }

    debug!(collector = collector.name(), "Collector stopped.");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use tokio::sync::watch;
    use tsrelay::{DataPoint, TagSet};

    use super::{add, Collector, CollectorError, CollectorFuture, CollectorSet, Sink};

    #[derive(Clone, Default)]
    struct VecSink(Arc<Mutex<Vec<DataPoint>>>);

    impl Sink for VecSink {
        fn accept(&self, points: Vec<DataPoint>) {
            self.0.lock().unwrap().extend(points);
        }
    }

    struct Counting {
        rounds: Arc<AtomicUsize>,
        fail_every_other: bool,
    }

    impl Collector for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn collect(&mut self) -> CollectorFuture<'_> {
            let round = self.rounds.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail_every_other && round % 2 == 1;
            Box::pin(async move {
                if fail {
                    return Err(CollectorError::Parse { what: "round", reason: "odd".into() });
                }
                let mut points = Vec::new();
                add(&mut points, "test.round", round as u64, &TagSet::new().with("host", "own"));
                Ok(points)
            })
        }
    }

    #[test]
    fn add_skips_invalid_points() {
        let mut points = Vec::new();
        add(&mut points, "valid.metric", 1, &TagSet::new());
        add(&mut points, "invalid metric", 1, &TagSet::new());
        add(&mut points, "valid.metric", 1, &TagSet::new().with("bad key", "v"));
        assert_eq!(points.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn collectors_run_on_interval_with_default_tags() {
        let rounds = Arc::new(AtomicUsize::new(0));
        let mut set = CollectorSet::new()
            .with_interval(Duration::from_secs(10))
            .with_default_tags(TagSet::new().with("host", "default").with("dc", "ny"));
        set.register(Counting { rounds: Arc::clone(&rounds), fail_every_other: true });
        assert_eq!(set.len(), 1);

        let sink = VecSink::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(set.run(sink.clone(), shutdown_rx));

        // Rounds at 0s, 10s, 20s, 30s; the odd ones fail.
        tokio::time::sleep(Duration::from_secs(35)).await;
        shutdown_tx.send_replace(true);
        task.await.unwrap();

        assert_eq!(rounds.load(Ordering::SeqCst), 4);
        let points = sink.0.lock().unwrap();
        assert_eq!(points.len(), 2);
        for point in points.iter() {
            assert_eq!(point.tags().get("host"), Some("own"));
            assert_eq!(point.tags().get("dc"), Some("ny"));
        }
    }
}
