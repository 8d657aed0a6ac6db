use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use common::error::Result;

use crate::discover::kubernetes_discovery::{KubernetesConfig, KubernetesDiscoverer};
use crate::discover::static_discovery::{StaticConfig, StaticDiscoverer};

pub const ADDRESS_LABEL: &str = "__address__";

pub type LabelSet = HashMap<String, String>;

/// Targets found by one discovery source. Every target label set carries
/// `__address__`; group labels apply to all of them unless a target
/// overrides them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    pub targets: Vec<LabelSet>,
    pub labels: LabelSet,
    pub source: String,
}

#[async_trait]
pub trait Discoverer: Send + Sync {
    fn name(&self) -> &str;

    /// Current target groups of the source.
    async fn refresh(&self) -> Result<Vec<Group>>;

    /// Poll period. `None` for sources whose result never changes.
    fn refresh_interval(&self) -> Option<Duration>;
}

#[derive(Clone)]
pub enum DiscoveryConfig {
    Static(StaticConfig),
    Kubernetes(KubernetesConfig),
    Custom(Arc<dyn Discoverer>),
}

impl DiscoveryConfig {
    pub fn name(&self) -> &str {
        match self {
            DiscoveryConfig::Static(_) => "static",
            DiscoveryConfig::Kubernetes(_) => "kubernetes",
            DiscoveryConfig::Custom(d) => d.name(),
        }
    }

    pub fn new_discoverer(&self) -> Result<Arc<dyn Discoverer>> {
        match self {
            DiscoveryConfig::Static(cfg) => Ok(Arc::new(StaticDiscoverer::new(cfg.clone())?)),
            DiscoveryConfig::Kubernetes(cfg) => Ok(Arc::new(KubernetesDiscoverer::new(cfg.clone())?)),
            DiscoveryConfig::Custom(d) => Ok(d.clone()),
        }
    }
}

/// Custom sources are equal only when they are the same instance.
impl PartialEq for DiscoveryConfig {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DiscoveryConfig::Static(a), DiscoveryConfig::Static(b)) => a == b,
            (DiscoveryConfig::Kubernetes(a), DiscoveryConfig::Kubernetes(b)) => a == b,
            (DiscoveryConfig::Custom(a), DiscoveryConfig::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for DiscoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryConfig::Static(cfg) => f.debug_tuple("Static").field(cfg).finish(),
            DiscoveryConfig::Kubernetes(cfg) => f.debug_tuple("Kubernetes").field(cfg).finish(),
            DiscoveryConfig::Custom(d) => f.debug_tuple("Custom").field(&d.name()).finish(),
        }
    }
}
