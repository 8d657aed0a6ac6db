use std::sync::Arc;
use std::time::Instant;

use log::debug;

use common::common::collector::Collector;
use common::error::Result;
use common::pprof::convert::{convert, ConvertInput, PullResult};

use crate::metrics::Metrics;
use crate::scrape::scrape::JobConfig;
use crate::scrape::target::Target;

/// One successful pull, with the previous successful pull of the same target.
pub struct IngestInput<'a> {
    pub target: &'a Target,
    pub config: &'a JobConfig,
    pub current: &'a PullResult,
    pub previous: Option<&'a PullResult>,
}

pub trait Appender: Send + Sync {
    /// Returns the number of samples handed on.
    fn append(&self, input: &IngestInput<'_>) -> Result<usize>;
}

/// Converts pulled profiles and forwards the samples to a collector.
pub struct Ingester {
    collector: Arc<dyn Collector>,
    metrics: Arc<Metrics>,
}

impl Ingester {
    pub fn new(collector: Arc<dyn Collector>, metrics: Arc<Metrics>) -> Self {
        Ingester { collector, metrics }
    }
}

impl Appender for Ingester {
    fn append(&self, input: &IngestInput<'_>) -> Result<usize> {
        let start_time = Instant::now();
        let kind = input.target.profile_kind();
        let Some(profiling_target) = input.config.profiling_config.get(kind) else {
            return Ok(0);
        };

        let samples = convert(&ConvertInput {
            current: input.current,
            previous: input.previous,
            profile_kind: kind,
            sample_types: &profiling_target.sample_types,
            labels: input.target.labels(),
        })?;

        let n = samples.len();
        for sample in samples {
            self.collector.collect(sample);
        }
        debug!(
            "ingested {} profile of {}: {} bytes, {} samples",
            kind,
            input.target.instance(),
            input.current.profile.len(),
            n
        );

        self.metrics
            .samples
            .with_label_values(&[&input.config.job_name])
            .inc_by(n as u64);
        self.metrics.ingest_latency.observe(start_time.elapsed().as_secs_f64());
        Ok(n)
    }
}
