use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use common::common::labels::Labels;
use common::error::{Error, Result};

use crate::appender::Appender;
use crate::discover::SyncEvent;
use crate::metrics::Metrics;
use crate::scrape::fetch::Puller;
use crate::scrape::scrape::JobConfig;
use crate::scrape::scrape_loop::{LoopStatus, ScrapeDeps, ScrapePool};
use crate::scrape::target::Target;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Runs one scrape pool per job and keeps it in line with the target sets
/// published by discovery.
pub struct ScrapeManager {
    deps: ScrapeDeps,
    pools: Mutex<HashMap<String, ScrapePool>>,
    token: CancellationToken,
    stopped: AtomicBool,
}

impl ScrapeManager {
    pub fn new(appender: Arc<dyn Appender>, puller: Arc<dyn Puller>, metrics: Arc<Metrics>) -> Self {
        ScrapeManager {
            deps: ScrapeDeps {
                puller,
                appender,
                metrics,
                grace_period: DEFAULT_GRACE_PERIOD,
            },
            pools: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.deps.grace_period = grace_period;
        self
    }

    pub async fn apply_config(&self, jobs: Vec<JobConfig>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut names = HashSet::new();
        for job in &jobs {
            job.validate()?;
            if !names.insert(job.job_name.as_str()) {
                return Err(Error::Config(format!("duplicate job {}", job.job_name)));
            }
        }

        let mut pools = self.pools.lock().await;

        let removed: Vec<String> = pools.keys().filter(|j| !names.contains(j.as_str())).cloned().collect();
        for job in removed {
            if let Some(mut sp) = pools.remove(&job) {
                sp.stop().await;
                info!("scrape job {} stopped", job);
            }
        }

        for cfg in jobs {
            match pools.get_mut(&cfg.job_name) {
                Some(sp) => {
                    if *sp.config() != cfg {
                        sp.reload(cfg).await;
                    }
                }
                None => {
                    info!("scrape job {} started", cfg.job_name);
                    let name = cfg.job_name.clone();
                    pools.insert(name, ScrapePool::new(cfg, self.deps.clone(), self.token.child_token()));
                }
            }
        }
        Ok(())
    }

    /// Consumes target sets until the channel closes or `stop` is called.
    pub async fn run(&self, mut tsets: mpsc::Receiver<SyncEvent>) -> Result<()> {
        loop {
            let first = tokio::select! {
                _ = self.token.cancelled() => break,
                event = tsets.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            // Whatever is already queued is folded in; the latest set per job wins.
            let mut order = vec![first.job_name.clone()];
            let mut latest = HashMap::from([(first.job_name.clone(), first)]);
            while let Ok(event) = tsets.try_recv() {
                if !latest.contains_key(&event.job_name) {
                    order.push(event.job_name.clone());
                }
                latest.insert(event.job_name.clone(), event);
            }

            let mut pools = self.pools.lock().await;
            if self.token.is_cancelled() {
                break;
            }
            for job in order {
                let Some(event) = latest.remove(&job) else {
                    continue;
                };
                match pools.get_mut(&job) {
                    Some(sp) => sp.sync(event.groups).await,
                    None => warn!("received targets for unknown job {}", job),
                }
            }
        }
        debug!("scrape manager stopped");
        Ok(())
    }

    /// Stops every loop. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        let mut pools = self.pools.lock().await;
        join_all(pools.values_mut().map(|sp| sp.stop())).await;
        pools.clear();
        info!("scrape manager stopped all jobs");
    }

    pub async fn active_targets(&self) -> HashMap<String, Vec<Target>> {
        let pools = self.pools.lock().await;
        pools.iter().map(|(job, sp)| (job.clone(), sp.active_targets())).collect()
    }

    pub async fn dropped_targets(&self) -> HashMap<String, Vec<Labels>> {
        let pools = self.pools.lock().await;
        pools
            .iter()
            .map(|(job, sp)| (job.clone(), sp.dropped_targets().to_vec()))
            .collect()
    }

    pub async fn loop_states(&self, job: &str) -> Vec<(Target, LoopStatus)> {
        let pools = self.pools.lock().await;
        pools.get(job).map(ScrapePool::loop_states).unwrap_or_default()
    }
}
