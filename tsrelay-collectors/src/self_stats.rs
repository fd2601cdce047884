//! Reporting of the pipeline's own statistics.
use tsrelay::{DataPoint, Pipeline, PipelineStats, TagSet};

use crate::{add, Collector, CollectorFuture};

/// Reports the statistics of a [`Pipeline`] as data points.
///
/// Every round emits `tsrelay.collect.dropped`, `.duplicate`, `.sent`, `.restored`, `.expired`
/// and `.queued`. All but the last are totals since the pipeline started.
pub struct SelfStats {
    pipeline: Pipeline,
}

impl SelfStats {
    /// Creates a new `SelfStats` collector for the given pipeline.
    pub fn new(pipeline: Pipeline) -> Self {
        SelfStats { pipeline }
    }
}

impl Collector for SelfStats {
    fn name(&self) -> &str {
        "self_stats"
    }

    fn collect(&mut self) -> CollectorFuture<'_> {
        let points = stats_points(&self.pipeline.stats());
        Box::pin(async move { Ok(points) })
    }
}

fn stats_points(stats: &PipelineStats) -> Vec<DataPoint> {
    let tags = TagSet::new();
    let mut points = Vec::with_capacity(6);
    add(&mut points, "tsrelay.collect.dropped", stats.dropped, &tags);
    add(&mut points, "tsrelay.collect.duplicate", stats.duplicate, &tags);
    add(&mut points, "tsrelay.collect.sent", stats.sent, &tags);
    add(&mut points, "tsrelay.collect.restored", stats.restored, &tags);
    add(&mut points, "tsrelay.collect.expired", stats.expired, &tags);
    add(&mut points, "tsrelay.collect.queued", stats.queued, &tags);
    points
}
