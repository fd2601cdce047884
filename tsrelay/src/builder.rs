use std::{sync::Arc, thread, time::Duration};

use hyper::Uri;
use quanta::Clock;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    dedup::{DedupWindow, SentCache},
    forwarder::{sender::Forwarder, ForwarderConfiguration},
    ingest::Ingestor,
    pipeline::{self, Pipeline, PipelineFuture},
    state::State,
    transport::{HttpTransport, Transport},
};

const DEFAULT_MAX_QUEUE_LEN: usize = 200_000;
const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RETRY_CUTOFF: Duration = Duration::from_secs(30 * 60);
const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Errors that could occur while building or spawning a pipeline.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The endpoint could not be parsed, or does not use a supported scheme.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint {
        /// The endpoint as given.
        endpoint: String,
        /// Details about the parsing failure.
        reason: String,
    },

    /// No endpoint was configured.
    #[error("no endpoint configured")]
    MissingEndpoint,

    /// The batch size was zero.
    #[error("batch size must be greater than zero")]
    ZeroBatchSize,

    /// The native root certificates could not be loaded.
    #[error("failed to load native root certificates: {0}")]
    TlsRoots(String),

    /// There was an issue when creating the necessary Tokio runtime to run the pipeline.
    #[error("failed to create Tokio runtime: {0}")]
    FailedToCreateRuntime(String),
}

/// Builder for a pipeline.
#[derive(Clone, Debug)]
pub struct PipelineBuilder {
    endpoint: Option<Uri>,
    max_queue_len: usize,
    batch_size: usize,
    ignore_duplicate: Duration,
    dedup_window: DedupWindow,
    request_timeout: Duration,
    retry_cutoff: Duration,
    failure_backoff: Duration,
    idle_interval: Duration,
    cache_sweep: bool,
    verbose: bool,
}

impl PipelineBuilder {
    /// Creates a new [`PipelineBuilder`] with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the endpoint that batches are POSTed to.
    ///
    /// Both `http` and `https` endpoints are supported. For OpenTSDB, this is the `/api/put`
    /// endpoint, such as `http://tsdb.example.com:4242/api/put`.
    ///
    /// There is no default endpoint. It must be set before calling [`build`][Self::build] or
    /// [`spawn`][Self::spawn].
    ///
    /// # Errors
    ///
    /// If the given endpoint cannot be parsed as an absolute `http` or `https` URL, an error will be
    /// returned indicating the reason.
    pub fn with_endpoint<E>(mut self, endpoint: E) -> Result<Self, BuildError>
    where
        E: AsRef<str>,
    {
        self.endpoint = Some(parse_endpoint(endpoint.as_ref())?);
        Ok(self)
    }

    /// Sets the maximum number of points waiting to be sent.
    ///
    /// Once the queue is full, newly submitted points are dropped until the sender catches up.
    ///
    /// Defaults to 200,000.
    #[must_use]
    pub fn with_max_queue_len(mut self, max_queue_len: usize) -> Self {
        self.max_queue_len = max_queue_len;
        self
    }

    /// Sets the maximum number of points sent in a single request.
    ///
    /// Defaults to 50.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the window within which unchanged repeats of a series are suppressed.
    ///
    /// A point is a repeat when its metric, tags and value all match the last admitted point of
    /// the same series. A zero window disables duplicate suppression.
    ///
    /// Defaults to zero (disabled).
    #[must_use]
    pub fn with_ignore_duplicate(mut self, window: Duration) -> Self {
        self.ignore_duplicate = window;
        self
    }

    /// Sets how the duplicate suppression window is anchored.
    ///
    /// See [`DedupWindow`] for more details.
    ///
    /// Defaults to [`DedupWindow::Fixed`].
    #[must_use]
    pub fn with_dedup_window(mut self, mode: DedupWindow) -> Self {
        self.dedup_window = mode;
        self
    }

    /// Sets whether remembered series are periodically evicted once they fall out of the window.
    ///
    /// Eviction never changes which points are suppressed. Disabling it only makes sense when the
    /// set of series is small and fixed.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_cache_sweep(mut self, cache_sweep: bool) -> Self {
        self.cache_sweep = cache_sweep;
        self
    }

    /// Sets the timeout for a single request, including reading the response body.
    ///
    /// Defaults to 60 seconds.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum age of a point that is retried after a failed delivery.
    ///
    /// Points whose timestamp is older than this when their batch fails are discarded.
    ///
    /// Defaults to 30 minutes.
    #[must_use]
    pub fn with_retry_cutoff(mut self, cutoff: Duration) -> Self {
        self.retry_cutoff = cutoff;
        self
    }

    /// Sets the pause after a failed delivery.
    ///
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    /// Sets the pause before re-checking an empty queue.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Sets whether every batch is logged at info level.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Builds the pipeline, returning a handle to it and the future that drives it.
    ///
    /// Nothing happens until the future is polled. Most callers want [`spawn`][Self::spawn]
    /// instead.
    ///
    /// # Errors
    ///
    /// If no endpoint is configured, the batch size is zero, or the TLS roots cannot be loaded, an
    /// error will be returned.
    pub fn build(self) -> Result<(Pipeline, PipelineFuture), BuildError> {
        let endpoint = self.endpoint.clone().ok_or(BuildError::MissingEndpoint)?;
        let transport = HttpTransport::new(endpoint, self.request_timeout)?;
        self.build_with_transport(Arc::new(transport))
    }

    /// Builds the pipeline on top of a custom [`Transport`].
    ///
    /// The configured endpoint and request timeout are ignored.
    ///
    /// # Errors
    ///
    /// If the batch size is zero, an error will be returned.
    pub fn build_with_transport(
        self,
        transport: Arc<dyn Transport>,
    ) -> Result<(Pipeline, PipelineFuture), BuildError> {
        self.build_with(transport, Clock::new())
    }

    pub(crate) fn build_with(
        self,
        transport: Arc<dyn Transport>,
        clock: Clock,
    ) -> Result<(Pipeline, PipelineFuture), BuildError> {
        if self.batch_size == 0 {
            return Err(BuildError::ZeroBatchSize);
        }

        let state = Arc::new(State::new(self.max_queue_len));
        let (sender, receiver) = mpsc::unbounded_channel();

        let cache = SentCache::new(self.ignore_duplicate, self.dedup_window, self.cache_sweep);
        let ingestor = Ingestor::new(receiver, Arc::clone(&state), cache, clock);

        let forwarder_config = ForwarderConfiguration {
            batch_size: self.batch_size,
            retry_cutoff: self.retry_cutoff,
            failure_backoff: self.failure_backoff,
            idle_interval: self.idle_interval,
            verbose: self.verbose,
        };
        let forwarder =
            Forwarder::new(forwarder_config, Arc::clone(&state), transport, sender.clone());

        Ok(pipeline::assemble(state, sender, ingestor, forwarder))
    }

    /// Builds the pipeline and starts running it in the background.
    ///
    /// When called from within a Tokio runtime, the pipeline future is spawned directly into the
    /// runtime. Otherwise, a new single-threaded Tokio runtime is created on a background thread,
    /// and the pipeline runs there.
    ///
    /// # Errors
    ///
    /// If there is an error while building the pipeline, or creating the runtime it runs on, an
    /// error will be returned.
    pub fn spawn(self) -> Result<Pipeline, BuildError> {
        use tokio::runtime;

        if let Ok(handle) = runtime::Handle::try_current() {
            let (pipeline, future) = {
                let _g = handle.enter();
                self.build()?
            };

            handle.spawn(future);

            Ok(pipeline)
        } else {
            let runtime = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            let (pipeline, future) = {
                let _g = runtime.enter();
                self.build()?
            };

            thread::Builder::new()
                .name("tsrelay-pipeline".to_string())
                .spawn(move || runtime.block_on(future))
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            Ok(pipeline)
        }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        PipelineBuilder {
            endpoint: None,
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
            batch_size: DEFAULT_BATCH_SIZE,
            ignore_duplicate: Duration::ZERO,
            dedup_window: DedupWindow::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry_cutoff: DEFAULT_RETRY_CUTOFF,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            cache_sweep: true,
            verbose: false,
        }
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Uri, BuildError> {
    let invalid =
        |reason: String| BuildError::InvalidEndpoint { endpoint: endpoint.to_string(), reason };

    let uri = endpoint.parse::<Uri>().map_err(|e| invalid(e.to_string()))?;
    match uri.scheme_str() {
        Some("http" | "https") => {}
        Some(scheme) => return Err(invalid(format!("unsupported scheme '{scheme}'"))),
        None => return Err(invalid("missing scheme".to_string())),
    }
    if uri.host().is_none() {
        return Err(invalid("missing host".to_string()));
    }

    Ok(uri)
}
