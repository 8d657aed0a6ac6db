use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info};
use prometheus::Registry;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use common::common::collector::Collector;
use common::error::{Error, Result};

use crate::appender::Ingester;
use crate::config::GoProfileConfig;
use crate::discover::{DiscoveryManager, DiscoveryOptions};
use crate::metrics::Metrics;
use crate::scrape::{HttpPuller, ScrapeManager};

/// Discovery and scraping wired together for a set of jobs.
pub struct GoProfile {
    discovery: Arc<DiscoveryManager>,
    scrape: Arc<ScrapeManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GoProfile {
    pub fn new(collector: Arc<dyn Collector>, registry: &Registry) -> Result<Self> {
        let metrics = Arc::new(
            Metrics::new(registry).map_err(|e| Error::Config(format!("registering metrics: {}", e)))?,
        );
        let ingester = Arc::new(Ingester::new(collector, metrics.clone()));
        let puller = Arc::new(HttpPuller::new()?);
        Ok(Self::with_parts(
            DiscoveryManager::new(DiscoveryOptions::default(), metrics.clone()),
            ScrapeManager::new(ingester, puller, metrics),
        ))
    }

    pub fn with_parts(discovery: DiscoveryManager, scrape: ScrapeManager) -> Self {
        GoProfile {
            discovery: Arc::new(discovery),
            scrape: Arc::new(scrape),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn discovery(&self) -> &DiscoveryManager {
        &self.discovery
    }

    pub fn scrape(&self) -> &ScrapeManager {
        &self.scrape
    }

    /// Applies the job list. The first call also starts the run loops;
    /// later calls replace the running configuration.
    pub async fn start(&self, configs: Vec<GoProfileConfig>) -> Result<()> {
        let mut jobs = Vec::with_capacity(configs.len());
        let mut discovery = HashMap::new();
        for c in configs {
            let (job, sources) = c.into_job()?;
            discovery.insert(job.job_name.clone(), sources);
            jobs.push(job);
        }

        self.scrape.apply_config(jobs).await?;
        self.discovery.apply_config(discovery).await?;

        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            if let Some(sync_rx) = self.discovery.sync_ch() {
                let scrape = self.scrape.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(err) = scrape.run(sync_rx).await {
                        error!("scrape manager exited: {}", err);
                    }
                }));
            }
            let discovery = self.discovery.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = discovery.run().await {
                    error!("discovery manager exited: {}", err);
                }
            }));
            info!("goprofile started");
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.discovery.stop().await;
        self.scrape.stop().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        futures::future::join_all(tasks).await;
        info!("goprofile stopped");
    }
}
