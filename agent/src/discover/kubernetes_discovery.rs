use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Certificate, Client};
use serde::Deserialize;
use url::Url;

use common::common::labels::sanitize_label_name;
use common::error::{Error, Result};

use crate::discover::discover::{Discoverer, Group, LabelSet, ADDRESS_LABEL};

const K8S_LABEL_NAMESPACE: &str = "__meta_kubernetes_namespace";
const K8S_LABEL_POD_NAME: &str = "__meta_kubernetes_pod_name";
const K8S_LABEL_POD_IP: &str = "__meta_kubernetes_pod_ip";
const K8S_LABEL_POD_NODE_NAME: &str = "__meta_kubernetes_pod_node_name";
const K8S_LABEL_POD_LABEL_PREFIX: &str = "__meta_kubernetes_pod_label_";
const K8S_LABEL_POD_ANNOTATION_PREFIX: &str = "__meta_kubernetes_pod_annotation_";
const K8S_LABEL_CONTAINER_NAME: &str = "__meta_kubernetes_pod_container_name";
const K8S_LABEL_CONTAINER_PORT_NAME: &str = "__meta_kubernetes_pod_container_port_name";
const K8S_LABEL_CONTAINER_PORT_NUMBER: &str = "__meta_kubernetes_pod_container_port_number";

const DEFAULT_API_SERVER: &str = "https://kubernetes.default.svc";
const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const DEFAULT_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub api_server: String,
    /// Empty means all namespaces.
    pub namespaces: Vec<String>,
    pub label_selector: Option<String>,
    /// When set, every pod yields a single `pod_ip:port` target instead of
    /// one target per declared container port.
    pub port: Option<u16>,
    pub bearer_token_file: Option<String>,
    pub ca_file: Option<String>,
    /// Seconds between two pod listings.
    pub refresh_interval: u64,
    pub labels: LabelSet,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: DEFAULT_API_SERVER.to_string(),
            namespaces: Vec::new(),
            label_selector: None,
            port: None,
            bearer_token_file: Some(DEFAULT_TOKEN_FILE.to_string()),
            ca_file: Some(DEFAULT_CA_FILE.to_string()),
            refresh_interval: 30,
            labels: LabelSet::new(),
        }
    }
}

pub struct KubernetesDiscoverer {
    cfg: KubernetesConfig,
    api_server: Url,
    client: Client,
}

impl KubernetesDiscoverer {
    pub fn new(cfg: KubernetesConfig) -> Result<Self> {
        let api_server = Url::parse(&cfg.api_server)
            .map_err(|e| Error::Config(format!("invalid api server {:?}: {}", cfg.api_server, e)))?;
        if !matches!(api_server.scheme(), "http" | "https") || api_server.host_str().is_none() {
            return Err(Error::Config(format!("invalid api server {:?}", cfg.api_server)));
        }
        if cfg.namespaces.iter().any(|ns| ns.trim().is_empty()) {
            return Err(Error::Config("empty kubernetes namespace".to_string()));
        }
        if cfg.refresh_interval == 0 {
            return Err(Error::Config("kubernetes refresh interval must be positive".to_string()));
        }

        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        // The in-cluster CA is absent when running outside a pod.
        if let Some(ca) = cfg.ca_file.as_deref().and_then(|p| std::fs::read(p).ok()) {
            let cert = Certificate::from_pem(&ca)
                .map_err(|e| Error::Config(format!("invalid kubernetes ca file: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("kubernetes client: {}", e)))?;

        Ok(KubernetesDiscoverer { cfg, api_server, client })
    }

    fn pods_url(&self, namespace: Option<&str>) -> Result<Url> {
        let path = match namespace {
            Some(ns) => format!("api/v1/namespaces/{}/pods", ns),
            None => "api/v1/pods".to_string(),
        };
        let mut url = self.api_server.join(&path).map_err(|e| self.source_error(e))?;
        if let Some(selector) = &self.cfg.label_selector {
            url.query_pairs_mut().append_pair("labelSelector", selector);
        }
        Ok(url)
    }

    fn source_error(&self, err: impl ToString) -> Error {
        Error::DiscoverySource {
            name: "kubernetes".to_string(),
            reason: err.to_string(),
        }
    }

    async fn token(&self) -> Option<String> {
        let path = self.cfg.bearer_token_file.as_deref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(token) => Some(token.trim().to_string()),
            Err(err) => {
                debug!("no kubernetes token at {}: {}", path, err);
                None
            }
        }
    }

    async fn list_pods(&self, url: Url, token: Option<&str>) -> Result<PodList> {
        let mut req = self.client.get(url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| self.source_error(e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(self.source_error(format!("listing pods: http status {}", status.as_u16())));
        }
        let body = resp.bytes().await.map_err(|e| self.source_error(e))?;
        serde_json::from_slice(&body).map_err(|e| self.source_error(format!("decoding pod list: {}", e)))
    }
}

#[async_trait]
impl Discoverer for KubernetesDiscoverer {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn refresh(&self) -> Result<Vec<Group>> {
        let token = self.token().await;
        let namespaces: Vec<Option<&str>> = if self.cfg.namespaces.is_empty() {
            vec![None]
        } else {
            self.cfg.namespaces.iter().map(|ns| Some(ns.as_str())).collect()
        };

        let mut groups = Vec::with_capacity(namespaces.len());
        for ns in namespaces {
            let pods = self.list_pods(self.pods_url(ns)?, token.as_deref()).await?;
            groups.push(Group {
                targets: targets_from_pods(&pods, self.cfg.port),
                labels: self.cfg.labels.clone(),
                source: format!("kubernetes/{}", ns.unwrap_or("all")),
            });
        }
        Ok(groups)
    }

    fn refresh_interval(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.cfg.refresh_interval))
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
    #[serde(default)]
    node_name: String,
}

#[derive(Debug, Deserialize)]
struct Container {
    name: String,
    #[serde(default)]
    ports: Vec<ContainerPort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPort {
    container_port: u16,
    #[serde(default)]
    name: String,
    #[serde(default)]
    protocol: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: String,
    #[serde(rename = "podIP", default)]
    pod_ip: String,
}

pub(crate) fn targets_from_pods(pods: &PodList, port: Option<u16>) -> Vec<LabelSet> {
    let mut tg = Vec::new();

    for pod in &pods.items {
        if pod.status.phase != "Running" || pod.status.pod_ip.is_empty() {
            continue;
        }
        let ip = &pod.status.pod_ip;

        let mut common_labels = LabelSet::new();
        common_labels.insert(K8S_LABEL_NAMESPACE.to_string(), pod.metadata.namespace.clone());
        common_labels.insert(K8S_LABEL_POD_NAME.to_string(), pod.metadata.name.clone());
        common_labels.insert(K8S_LABEL_POD_IP.to_string(), ip.clone());
        common_labels.insert(K8S_LABEL_POD_NODE_NAME.to_string(), pod.spec.node_name.clone());
        for (k, v) in &pod.metadata.labels {
            common_labels.insert(format!("{}{}", K8S_LABEL_POD_LABEL_PREFIX, sanitize_label_name(k)), v.clone());
        }
        for (k, v) in &pod.metadata.annotations {
            common_labels.insert(
                format!("{}{}", K8S_LABEL_POD_ANNOTATION_PREFIX, sanitize_label_name(k)),
                v.clone(),
            );
        }

        if let Some(port) = port {
            let mut labels = common_labels.clone();
            if let Some(c) = pod.spec.containers.first() {
                labels.insert(K8S_LABEL_CONTAINER_NAME.to_string(), c.name.clone());
            }
            labels.insert(ADDRESS_LABEL.to_string(), join_host_port(ip, port));
            tg.push(labels);
            continue;
        }

        for c in &pod.spec.containers {
            for p in &c.ports {
                if !p.protocol.is_empty() && p.protocol != "TCP" {
                    continue;
                }
                let mut labels = common_labels.clone();
                labels.insert(K8S_LABEL_CONTAINER_NAME.to_string(), c.name.clone());
                labels.insert(K8S_LABEL_CONTAINER_PORT_NAME.to_string(), p.name.clone());
                labels.insert(K8S_LABEL_CONTAINER_PORT_NUMBER.to_string(), p.container_port.to_string());
                labels.insert(ADDRESS_LABEL.to_string(), join_host_port(ip, p.container_port));
                tg.push(labels);
            }
        }
    }
    tg
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
