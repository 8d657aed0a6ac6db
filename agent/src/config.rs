use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use common::common::collector::AggregationKind;
use common::error::{Error, Result};

use crate::discover::kubernetes_discovery::KubernetesConfig;
use crate::discover::static_discovery::StaticConfig;
use crate::discover::DiscoveryConfig;
use crate::scrape::scrape::{JobConfig, ProfilingConfig, DEFAULT_ENABLED_PROFILES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Host,
    Kubernetes,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(Mode::Host),
            "kubernetes" => Ok(Mode::Kubernetes),
            other => Err(Error::Config(format!("unsupported mode {:?}", other))),
        }
    }
}

/// One job as it appears in the agent config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GoProfileConfig {
    pub job_name: String,
    pub mode: String,
    /// Seconds.
    pub interval: u64,
    /// Seconds.
    pub timeout: u64,
    /// Kilobytes.
    pub body_limit_size: u64,
    pub enabled_profiles: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Aggregation by profile kind, `sum` or `average`. Other values mean `sum`.
    pub aggregation: HashMap<String, String>,
    /// Settings of the discovery mode.
    pub config: Value,
}

impl Default for GoProfileConfig {
    fn default() -> Self {
        Self {
            job_name: String::new(),
            mode: "host".to_string(),
            interval: 10,
            timeout: 15,
            body_limit_size: 10240,
            enabled_profiles: DEFAULT_ENABLED_PROFILES.iter().map(|s| s.to_string()).collect(),
            labels: HashMap::new(),
            aggregation: HashMap::new(),
            config: Value::Null,
        }
    }
}

impl GoProfileConfig {
    pub fn into_job(self) -> Result<(JobConfig, Vec<DiscoveryConfig>)> {
        let mode: Mode = self.mode.parse()?;
        let discovery = match mode {
            Mode::Host => DiscoveryConfig::Static(mode_config::<StaticConfig>(self.config)?),
            Mode::Kubernetes => DiscoveryConfig::Kubernetes(mode_config::<KubernetesConfig>(self.config)?),
        };

        let mut profiling_config = ProfilingConfig::default();
        for (kind, aggregation) in &self.aggregation {
            let Some(target) = profiling_config.get(kind) else {
                return Err(Error::Config(format!(
                    "job {}: aggregation for unknown profile kind {:?}",
                    self.job_name, kind
                )));
            };
            let target = target.clone().aggregation(AggregationKind::parse(aggregation));
            profiling_config.insert(kind, target);
        }

        let job = JobConfig {
            job_name: self.job_name,
            scrape_interval: Duration::from_secs(self.interval),
            scrape_timeout: Duration::from_secs(self.timeout),
            body_size_limit: self.body_limit_size.saturating_mul(1024),
            enabled_profiles: self.enabled_profiles,
            labels: self.labels,
            profiling_config,
            ..Default::default()
        };
        job.validate()?;
        discovery.new_discoverer()?;
        Ok((job, vec![discovery]))
    }
}

fn mode_config<T: DeserializeOwned>(value: Value) -> Result<T> {
    let value = match value {
        Value::Null => Value::Object(Default::default()),
        v => v,
    };
    serde_json::from_value(value).map_err(|e| Error::Config(format!("mode config: {}", e)))
}

/// Parses the job list of a config file.
pub fn parse_configs(raw: &str) -> Result<Vec<GoProfileConfig>> {
    serde_json::from_str(raw).map_err(|e| Error::Config(format!("config file: {}", e)))
}
