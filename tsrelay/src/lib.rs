//! A deduplicating, batching relay of data points to an [OpenTSDB][tsdb]-compatible HTTP endpoint.
//!
//! [tsdb]: http://opentsdb.net/docs/build/html/api_http/put.html
//!
//! # Usage
//!
//! ```no_run
//! # use tsrelay::{DataPoint, PipelineBuilder, TagSet};
//! # #[tokio::main]
//! # async fn main() {
//! // First, create a builder and point it at the ingestion endpoint.
//! //
//! // The builder can configure many aspects of the pipeline, such as how many points may wait in
//! // memory, how many points are sent per request, and whether unchanged repeats are suppressed.
//! let pipeline = PipelineBuilder::default()
//!     .with_endpoint("http://localhost:4242/api/put")
//!     .expect("failed to parse endpoint")
//!     .spawn()
//!     .expect("failed to spawn pipeline");
//!
//! // Producers submit points through a `Submitter`, which never blocks.
//! let submitter = pipeline.submitter();
//! let point = DataPoint::now("sys.load", 0.42, TagSet::new().with("host", "web01"))
//!     .expect("invalid data point");
//! submitter.submit(point);
//!
//! // When shutting down, everything already submitted is flushed with one final attempt.
//! pipeline.shutdown();
//! # }
//! ```
//!
//! # Features
//!
//! ## Bounded memory
//!
//! Submitted points wait in a queue of configurable length. When the endpoint cannot keep up, new
//! points are dropped rather than buffered without limit, and producers are never blocked.
//!
//! ## Duplicate suppression
//!
//! Many sources report values that rarely change. When a duplicate window is configured, a point
//! that repeats the last admitted value of its series (same metric, tags and value) within the
//! window is not sent again.
//!
//! ## Retries with an age cutoff
//!
//! A batch that the endpoint does not acknowledge with `204 No Content` is retried: its points are
//! fed back into the pipeline, except for those older than the retry cutoff, which would no longer
//! be useful to anyone. Consecutive failures are spaced out by a fixed backoff.
//!
//! ## Statistics
//!
//! The pipeline keeps its own counters of dropped, duplicate, sent, restored and expired points,
//! available at any time through [`Pipeline::stats`].
//!
//! # Missing
//!
//! ## Persistence
//!
//! The queue only lives in memory. Points that have not been delivered when the process exits are
//! lost.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod builder;
pub use self::builder::{BuildError, PipelineBuilder};

mod datapoint;
pub use self::datapoint::{unix_now, DataPoint, DataPointError, TagSet, Value};

mod dedup;
pub use self::dedup::DedupWindow;

mod forwarder;
mod ingest;

mod pipeline;
pub use self::pipeline::{Pipeline, PipelineFuture, Submitter};

mod state;

mod telemetry;
pub use self::telemetry::PipelineStats;

mod transport;
pub use self::transport::{
    HttpTransport, Transport, TransportError, TransportFuture, TransportResponse,
};

mod writer;
pub use self::writer::EncodeError;
