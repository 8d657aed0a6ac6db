use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use common::error::{Error, Result};

use crate::discover::discover::{Discoverer, Group, LabelSet, ADDRESS_LABEL};

/// Fixed list of `host:port` addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StaticConfig {
    pub targets: Vec<String>,
    pub labels: LabelSet,
}

pub struct StaticDiscoverer {
    group: Group,
}

impl StaticDiscoverer {
    pub fn new(cfg: StaticConfig) -> Result<Self> {
        if cfg.targets.is_empty() {
            return Err(Error::Config("static discovery without targets".to_string()));
        }
        let mut targets = Vec::with_capacity(cfg.targets.len());
        for addr in &cfg.targets {
            let addr = addr.trim();
            validate_address(addr)?;
            let mut lset = LabelSet::new();
            lset.insert(ADDRESS_LABEL.to_string(), addr.to_string());
            targets.push(lset);
        }
        Ok(StaticDiscoverer {
            group: Group {
                targets,
                labels: cfg.labels,
                source: "static/0".to_string(),
            },
        })
    }
}

#[async_trait]
impl Discoverer for StaticDiscoverer {
    fn name(&self) -> &str {
        "static"
    }

    async fn refresh(&self) -> Result<Vec<Group>> {
        Ok(vec![self.group.clone()])
    }

    fn refresh_interval(&self) -> Option<Duration> {
        None
    }
}

fn validate_address(addr: &str) -> Result<()> {
    let invalid = |reason: &str| Error::Config(format!("invalid address {:?}: {}", addr, reason));

    let port = match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.ends_with(':') => port,
        Some((host, _)) if host.is_empty() => return Err(invalid("empty host")),
        _ => return Err(invalid("missing port")),
    };
    match port.parse::<u16>() {
        Ok(0) | Err(_) => return Err(invalid("bad port")),
        Ok(_) => {}
    }

    let url = Url::parse(&format!("http://{}", addr)).map_err(|e| invalid(&e.to_string()))?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("empty host"));
    }
    if url.path() != "/" || url.query().is_some() || !url.username().is_empty() {
        return Err(invalid("unexpected path, query or credentials"));
    }
    Ok(())
}
