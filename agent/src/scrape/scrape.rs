use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use common::common::collector::{AggregationKind, Units};
use common::error::{Error, Result};
use common::pprof::convert::SampleTypeConfig;

use crate::discover::LabelSet;

pub const DEFAULT_ENABLED_PROFILES: [&str; 2] = ["cpu", "mem"];

/// One pprof endpoint of a target.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfilingTarget {
    pub path: String,
    pub params: Vec<(String, String)>,
    /// The endpoint measures over a window; the request carries
    /// `seconds=<interval - 1>`.
    pub delta: bool,
    pub sample_types: HashMap<String, SampleTypeConfig>,
}

impl ProfilingTarget {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            params: Vec::new(),
            delta: false,
            sample_types: HashMap::new(),
        }
    }

    pub fn delta(mut self) -> Self {
        self.delta = true;
        self
    }

    pub fn sample_type(mut self, name: &str, cfg: SampleTypeConfig) -> Self {
        self.sample_types.insert(name.to_string(), cfg);
        self
    }

    /// Sets the aggregation of every sample type of this kind.
    pub fn aggregation(mut self, aggregation: AggregationKind) -> Self {
        for cfg in self.sample_types.values_mut() {
            cfg.aggregation = aggregation;
        }
        self
    }

    /// Query parameters for a job scraped every `interval`.
    pub fn query(&self, interval: Duration) -> Vec<(String, String)> {
        let mut params = self.params.clone();
        if self.delta {
            let seconds = interval.as_secs().saturating_sub(1).max(1);
            params.retain(|(k, _)| k != "seconds");
            params.push(("seconds".to_string(), seconds.to_string()));
        }
        params
    }
}

/// Profile kinds a job may enable, by name.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfilingConfig {
    targets: BTreeMap<String, ProfilingTarget>,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        let mut targets = BTreeMap::new();
        targets.insert(
            "cpu".to_string(),
            ProfilingTarget::new("/debug/pprof/profile")
                .delta()
                .sample_type("samples", SampleTypeConfig::new(Units::Samples).display_name("cpu"))
                .sample_type("cpu", SampleTypeConfig::new(Units::Nanoseconds).display_name("cpu_time")),
        );
        targets.insert(
            "mem".to_string(),
            ProfilingTarget::new("/debug/pprof/heap")
                .sample_type(
                    "inuse_objects",
                    SampleTypeConfig::new(Units::Objects).aggregation(AggregationKind::Average),
                )
                .sample_type(
                    "inuse_space",
                    SampleTypeConfig::new(Units::Bytes).aggregation(AggregationKind::Average),
                )
                .sample_type("alloc_objects", SampleTypeConfig::new(Units::Objects).cumulative())
                .sample_type("alloc_space", SampleTypeConfig::new(Units::Bytes).cumulative()),
        );
        targets.insert(
            "goroutines".to_string(),
            ProfilingTarget::new("/debug/pprof/goroutine").sample_type(
                "goroutine",
                SampleTypeConfig::new(Units::Goroutines)
                    .display_name("goroutines")
                    .aggregation(AggregationKind::Average),
            ),
        );
        targets.insert("mutex".to_string(), contention_target("/debug/pprof/mutex", "mutex"));
        targets.insert("block".to_string(), contention_target("/debug/pprof/block", "block"));
        Self { targets }
    }
}

fn contention_target(path: &str, prefix: &str) -> ProfilingTarget {
    ProfilingTarget::new(path)
        .sample_type(
            "contentions",
            SampleTypeConfig::new(Units::LockSamples)
                .display_name(&format!("{}_count", prefix))
                .cumulative(),
        )
        .sample_type(
            "delay",
            SampleTypeConfig::new(Units::LockNanoseconds)
                .display_name(&format!("{}_duration", prefix))
                .cumulative(),
        )
}

impl ProfilingConfig {
    pub fn get(&self, kind: &str) -> Option<&ProfilingTarget> {
        self.targets.get(kind)
    }

    /// Adds or replaces a profile kind.
    pub fn insert(&mut self, kind: &str, target: ProfilingTarget) {
        self.targets.insert(kind.to_string(), target);
    }

    pub fn all_targets(&self) -> &BTreeMap<String, ProfilingTarget> {
        &self.targets
    }
}

/// Scrape settings of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    pub job_name: String,
    pub scrape_interval: Duration,
    pub scrape_timeout: Duration,
    /// Largest accepted response body in bytes, 0 for no limit.
    pub body_size_limit: u64,
    pub scheme: String,
    pub enabled_profiles: Vec<String>,
    pub profiling_config: ProfilingConfig,
    pub labels: LabelSet,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: String::new(),
            scrape_interval: Duration::from_secs(10),
            scrape_timeout: Duration::from_secs(15),
            body_size_limit: 10240 * 1024,
            scheme: "http".to_string(),
            enabled_profiles: DEFAULT_ENABLED_PROFILES.iter().map(|s| s.to_string()).collect(),
            profiling_config: ProfilingConfig::default(),
            labels: LabelSet::new(),
        }
    }
}

impl JobConfig {
    pub fn new(job_name: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            return Err(Error::Config("job name is empty".to_string()));
        }
        if self.scrape_interval.is_zero() {
            return Err(Error::Config(format!("job {}: scrape interval must be positive", self.job_name)));
        }
        if self.scrape_timeout.is_zero() {
            return Err(Error::Config(format!("job {}: scrape timeout must be positive", self.job_name)));
        }
        if !matches!(self.scheme.as_str(), "http" | "https") {
            return Err(Error::Config(format!("job {}: unsupported scheme {:?}", self.job_name, self.scheme)));
        }
        for kind in &self.enabled_profiles {
            if self.profiling_config.get(kind).is_none() {
                return Err(Error::Config(format!("job {}: unknown profile kind {:?}", self.job_name, kind)));
            }
        }
        Ok(())
    }

    /// Enabled profile kinds in configuration order, duplicates skipped.
    pub fn enabled_targets(&self) -> Vec<(&str, &ProfilingTarget)> {
        let mut res: Vec<(&str, &ProfilingTarget)> = Vec::with_capacity(self.enabled_profiles.len());
        for kind in &self.enabled_profiles {
            if res.iter().any(|(k, _)| *k == kind.as_str()) {
                continue;
            }
            if let Some(t) = self.profiling_config.get(kind) {
                res.push((kind.as_str(), t));
            }
        }
        res
    }
}
