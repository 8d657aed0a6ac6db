use std::fmt;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use url::Url;

use common::common::labels::Labels;
use common::error::{Error, Result};

use crate::discover::{Group, ADDRESS_LABEL};
use crate::scrape::scrape::JobConfig;

pub const SCHEME_LABEL: &str = "__scheme__";
pub const META_LABEL_PREFIX: &str = "__meta_";
pub const PARAM_LABEL_PREFIX: &str = "__param_";
pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";
pub const PROFILE_PATH: &str = "__profile_path__";
pub const PROFILE_NAME: &str = "__name__";
pub const SERVICE_NAME_LABEL: &str = "service_name";
pub const SERVICE_NAME_K8S_LABEL: &str = "__meta_kubernetes_pod_annotation_pyroscope_io_service_name";

// TargetHealth describes the health state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetHealth {
    Unknown,
    Good,
    Bad,
}

// Target refers to one profile endpoint of a discovered process.
#[derive(Debug, Clone)]
pub struct Target {
    all_labels: Labels,
    public_labels: Labels,
    discovered_labels: Labels,
    url: String,
    hash: u64,
}

impl Target {
    pub(crate) fn new(lbls: Labels, discovered_labels: Labels, params: &[(String, String)]) -> Result<Self> {
        let public_labels = lbls.public();
        let url = url_from_target(&lbls, params)?;
        let hash = calculate_hash(&public_labels, &url);

        Ok(Target {
            all_labels: lbls,
            public_labels,
            discovered_labels,
            url,
            hash,
        })
    }

    /// Labels attached to every sample of this target.
    pub fn labels(&self) -> &Labels {
        &self.public_labels
    }

    pub fn all_labels(&self) -> &Labels {
        &self.all_labels
    }

    pub fn discovered_labels(&self) -> &Labels {
        &self.discovered_labels
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn profile_kind(&self) -> &str {
        self.all_labels.get(PROFILE_NAME).unwrap_or_default()
    }

    pub fn instance(&self) -> &str {
        self.all_labels.get(INSTANCE_LABEL).unwrap_or_default()
    }

    /// Delay before the first scrape, spreading targets over the interval.
    pub fn offset(&self, interval: Duration) -> Duration {
        let interval = interval.as_nanos();
        if interval == 0 {
            return Duration::ZERO;
        }
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let base = interval - now % interval;
        let offset = self.hash as u128 % interval;
        let next = (base + offset) % interval;
        Duration::from_nanos(next as u64)
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}
impl Eq for Target {}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

fn url_from_target(lbls: &Labels, params: &[(String, String)]) -> Result<String> {
    let mut new_params: Vec<(String, String)> = params.to_vec();

    for l in lbls.iter() {
        let Some(ks) = l.name.strip_prefix(PARAM_LABEL_PREFIX) else {
            continue;
        };
        match new_params.iter_mut().find(|(k, _)| k == ks) {
            Some(param) => param.1 = l.value.clone(),
            None => new_params.push((ks.to_string(), l.value.clone())),
        }
    }

    let scheme = lbls.get(SCHEME_LABEL).unwrap_or("http");
    let host = lbls.get(ADDRESS_LABEL).unwrap_or_default();
    let path = lbls.get(PROFILE_PATH).unwrap_or_default();

    let mut url = Url::parse(&format!("{}://{}{}", scheme, host, path))
        .map_err(|e| Error::Config(format!("invalid target url for {}: {}", host, e)))?;
    if !new_params.is_empty() {
        url.query_pairs_mut().extend_pairs(new_params.iter());
    }
    Ok(url.into())
}

fn calculate_hash(public_labels: &Labels, url: &str) -> u64 {
    let mut hasher = Sha256::new();

    for l in public_labels {
        hasher.update(&l.name);
        hasher.update([0xff]);
        hasher.update(&l.value);
        hasher.update([0xff]);
    }
    hasher.update(url);

    let result = hasher.finalize();
    let mut hash = 0u64;
    for &b in &result[..8] {
        hash = hash << 8 | b as u64;
    }
    hash
}

/// Fills in job-level labels and checks that the target can be scraped.
pub fn populate_labels(mut lset: Labels, cfg: &JobConfig) -> Result<Labels> {
    // Copy labels into the labelset for the target if they are not set already.
    let scrape_labels = [(JOB_LABEL, cfg.job_name.as_str()), (SCHEME_LABEL, cfg.scheme.as_str())];
    for (name, value) in scrape_labels {
        if !lset.contains(name) {
            lset.set(name, value.trim());
        }
    }

    let addr = match lset.get(ADDRESS_LABEL) {
        Some(addr) if !addr.trim().is_empty() => addr.trim().to_string(),
        _ => return Err(Error::Config("no address".to_string())),
    };

    if !has_port(&addr) {
        let port = match lset.get(SCHEME_LABEL).unwrap_or("http") {
            "http" => "80",
            "https" => "443",
            scheme => return Err(Error::Config(format!("invalid scheme: {}", scheme))),
        };
        lset.set(ADDRESS_LABEL, format!("{}:{}", addr, port));
    }

    if !lset.contains(SERVICE_NAME_LABEL) {
        let inferred_service_name = infer_service_name(&lset);
        lset.set(SERVICE_NAME_LABEL, inferred_service_name);
    }

    lset.retain(|l| !l.name.starts_with(META_LABEL_PREFIX));

    if !lset.contains(INSTANCE_LABEL) {
        let addr = lset.get(ADDRESS_LABEL).unwrap_or_default().to_string();
        lset.set(INSTANCE_LABEL, addr);
    }

    Ok(lset)
}

fn has_port(addr: &str) -> bool {
    let port = if let Some(rest) = addr.strip_prefix('[') {
        rest.split_once("]:").map(|(_, port)| port)
    } else {
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => Some(port),
            _ => None,
        }
    };
    port.map_or(false, |p| p.parse::<u16>().is_ok())
}

fn infer_service_name(lset: &Labels) -> String {
    if let Some(k8s_service_name) = lset.get(SERVICE_NAME_K8S_LABEL) {
        return k8s_service_name.to_string();
    }
    if let (Some(k8s_namespace), Some(k8s_container)) = (
        lset.get("__meta_kubernetes_namespace"),
        lset.get("__meta_kubernetes_pod_container_name"),
    ) {
        return format!("{}/{}", k8s_namespace, k8s_container);
    }
    "unspecified".to_string()
}

/// One label set per enabled profile kind.
pub fn labels_by_profiles(lset: &Labels, cfg: &JobConfig) -> Vec<Labels> {
    let mut res = Vec::new();
    for (profile_type, profiling_target) in cfg.enabled_targets() {
        let mut l = lset.clone();
        l.set(PROFILE_PATH, profiling_target.path.as_str());
        l.set(PROFILE_NAME, profile_type);
        res.push(l);
    }
    res
}

/// Builds the targets of a group. Label sets that cannot be scraped are
/// returned as dropped.
pub fn targets_from_group(group: &Group, cfg: &JobConfig) -> (Vec<Target>, Vec<Labels>) {
    let mut targets = Vec::new();
    let mut dropped_targets = Vec::new();

    let job_labels = Labels::from_map(&cfg.labels);
    let group_labels = Labels::from_map(&group.labels);

    for tlset in &group.targets {
        let discovered = Labels::from_map(tlset);
        // Discovered labels win over group labels, which win over job labels.
        let lset = job_labels.merge(&group_labels).merge(&discovered);

        for lset in labels_by_profiles(&lset, cfg) {
            let kind = lset.get(PROFILE_NAME).unwrap_or_default().to_string();
            let params = cfg
                .profiling_config
                .get(&kind)
                .map(|t| t.query(cfg.scrape_interval))
                .unwrap_or_default();

            match populate_labels(lset.clone(), cfg).and_then(|lbls| Target::new(lbls, discovered.clone(), &params)) {
                Ok(target) => targets.push(target),
                Err(_) => dropped_targets.push(lset),
            }
        }
    }

    (targets, dropped_targets)
}
