use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use common::common::labels::Labels;
use common::error::Error;
use common::pprof::convert::PullResult;

use crate::appender::{Appender, IngestInput};
use crate::discover::Group;
use crate::metrics::Metrics;
use crate::scrape::fetch::Puller;
use crate::scrape::scrape::JobConfig;
use crate::scrape::target::{targets_from_group, Target, TargetHealth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// What a scrape loop last observed about its target.
#[derive(Debug, Clone)]
pub struct LoopStatus {
    pub state: LoopState,
    pub health: TargetHealth,
    pub last_error: Option<String>,
    pub last_scrape: Option<SystemTime>,
    pub last_scrape_duration: Duration,
    pub pulls: u64,
    pub errors: u64,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state: LoopState::Starting,
            health: TargetHealth::Unknown,
            last_error: None,
            last_scrape: None,
            last_scrape_duration: Duration::ZERO,
            pulls: 0,
            errors: 0,
        }
    }
}

/// Dependencies shared by every loop of a job.
#[derive(Clone)]
pub(crate) struct ScrapeDeps {
    pub(crate) puller: Arc<dyn Puller>,
    pub(crate) appender: Arc<dyn Appender>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) grace_period: Duration,
}

pub(crate) struct ScrapePool {
    job_name: String,
    config: Arc<ArcSwap<JobConfig>>,
    deps: ScrapeDeps,
    token: CancellationToken,
    active_targets: HashMap<u64, ScrapeLoop>,
    dropped_targets: Vec<Labels>,
    last_groups: Vec<Group>,
}

impl ScrapePool {
    pub(crate) fn new(cfg: JobConfig, deps: ScrapeDeps, token: CancellationToken) -> Self {
        ScrapePool {
            job_name: cfg.job_name.clone(),
            config: Arc::new(ArcSwap::from_pointee(cfg)),
            deps,
            token,
            active_targets: HashMap::new(),
            dropped_targets: Vec::new(),
            last_groups: Vec::new(),
        }
    }

    pub(crate) fn config(&self) -> Arc<JobConfig> {
        self.config.load_full()
    }

    pub(crate) async fn sync(&mut self, groups: Vec<Group>) {
        info!("syncing target groups for job {}", self.job_name);
        let cfg = self.config.load_full();

        let mut actives: HashMap<u64, Target> = HashMap::new();
        let mut dropped = Vec::new();
        for group in &groups {
            let (targets, d) = targets_from_group(group, &cfg);
            for t in targets {
                actives.entry(t.hash()).or_insert(t);
            }
            dropped.extend(d);
        }
        if !dropped.is_empty() {
            debug!("job {}: dropped {} target label sets", self.job_name, dropped.len());
        }
        self.dropped_targets = dropped;

        let removed: Vec<u64> = self
            .active_targets
            .keys()
            .filter(|h| !actives.contains_key(h))
            .copied()
            .collect();
        let removed: Vec<ScrapeLoop> = removed
            .iter()
            .filter_map(|h| self.active_targets.remove(h))
            .collect();
        let grace = self.deps.grace_period;
        join_all(removed.into_iter().map(|mut l| async move {
            debug!("stopping scrape of {}", l.target);
            l.stop(grace).await;
        }))
        .await;

        for (hash, t) in actives {
            if self.active_targets.contains_key(&hash) {
                continue;
            }
            debug!("starting scrape of {}", t);
            let l = ScrapeLoop::start(
                Arc::new(t),
                self.job_name.clone(),
                self.config.clone(),
                self.deps.clone(),
                self.token.child_token(),
            );
            self.active_targets.insert(hash, l);
        }

        self.last_groups = groups;
        self.deps
            .metrics
            .active_targets
            .with_label_values(&[&self.job_name])
            .set(self.active_targets.len() as i64);
    }

    /// Swaps in a new config. Running loops read it on their next tick;
    /// targets are re-derived so enabled kinds and labels apply at once.
    pub(crate) async fn reload(&mut self, cfg: JobConfig) {
        info!("reloading scrape config for job {}", self.job_name);
        self.config.store(Arc::new(cfg));
        let groups = std::mem::take(&mut self.last_groups);
        self.sync(groups).await;
    }

    pub(crate) async fn stop(&mut self) {
        let grace = self.deps.grace_period;
        let loops: Vec<ScrapeLoop> = self.active_targets.drain().map(|(_, l)| l).collect();
        join_all(loops.into_iter().map(|mut l| async move { l.stop(grace).await })).await;
        self.deps
            .metrics
            .active_targets
            .with_label_values(&[&self.job_name])
            .set(0);
    }

    pub(crate) fn active_targets(&self) -> Vec<Target> {
        self.active_targets.values().map(|l| l.target.as_ref().clone()).collect()
    }

    pub(crate) fn dropped_targets(&self) -> &[Labels] {
        &self.dropped_targets
    }

    pub(crate) fn loop_states(&self) -> Vec<(Target, LoopStatus)> {
        self.active_targets
            .values()
            .map(|l| (l.target.as_ref().clone(), l.status()))
            .collect()
    }
}

pub(crate) struct ScrapeLoop {
    target: Arc<Target>,
    status: Arc<Mutex<LoopStatus>>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScrapeLoop {
    fn start(
        target: Arc<Target>,
        job_name: String,
        config: Arc<ArcSwap<JobConfig>>,
        deps: ScrapeDeps,
        token: CancellationToken,
    ) -> Self {
        let status = Arc::new(Mutex::new(LoopStatus::default()));
        let ctx = LoopContext {
            target: target.clone(),
            job_name,
            config,
            deps,
            status: status.clone(),
            token: token.clone(),
        };
        ScrapeLoop {
            target,
            status,
            token,
            handle: Some(tokio::spawn(ctx.run())),
        }
    }

    fn status(&self) -> LoopStatus {
        lock(&self.status).clone()
    }

    /// Cancels the loop and waits for it. The task is aborted if it does
    /// not finish within `grace`.
    async fn stop(&mut self, grace: Duration) {
        {
            let mut status = lock(&self.status);
            if status.state != LoopState::Stopped {
                status.state = LoopState::Draining;
            }
        }
        self.token.cancel();

        if let Some(handle) = self.handle.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("scrape of {} did not stop within {:?}, aborting", self.target, grace);
                abort.abort();
            }
        }
        lock(&self.status).state = LoopState::Stopped;
    }
}

struct LoopContext {
    target: Arc<Target>,
    job_name: String,
    config: Arc<ArcSwap<JobConfig>>,
    deps: ScrapeDeps,
    status: Arc<Mutex<LoopStatus>>,
    token: CancellationToken,
}

impl LoopContext {
    async fn run(self) {
        {
            let mut status = lock(&self.status);
            if status.state == LoopState::Starting {
                status.state = LoopState::Running;
            }
        }

        let offset = self.target.offset(self.config.load().scrape_interval);
        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = sleep(offset) => {}
        }

        let mut previous: Option<PullResult> = None;
        loop {
            let cfg = self.config.load_full();
            let start = Instant::now();

            let pulled = tokio::select! {
                _ = self.token.cancelled() => break,
                res = self.scrape(&cfg, previous.as_ref()) => res,
            };
            if let Some(current) = pulled {
                previous = Some(current);
            }

            let interval = self.config.load().scrape_interval;
            let elapsed = start.elapsed();
            if elapsed < interval {
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = sleep(interval - elapsed) => {}
                }
            }
        }
    }

    /// One tick. Returns the pull to keep as the next baseline.
    async fn scrape(&self, cfg: &JobConfig, previous: Option<&PullResult>) -> Option<PullResult> {
        let start = Instant::now();
        let start_time = SystemTime::now();
        self.deps.metrics.scrapes.with_label_values(&[&self.job_name]).inc();

        let profile = match self
            .deps
            .puller
            .pull(&self.target, cfg.scrape_timeout, cfg.body_size_limit)
            .await
        {
            Ok(profile) => profile,
            Err(err) => {
                error!("scrape of {} for job {} failed: {}", self.target, self.job_name, err);
                self.deps
                    .metrics
                    .scrape_errors
                    .with_label_values(&[self.job_name.as_str(), self.target.instance()])
                    .inc();
                self.update_target_status(start, start_time, Some(&err));
                return None;
            }
        };
        self.update_target_status(start, start_time, None);

        let current = PullResult {
            profile,
            start_time,
            end_time: SystemTime::now(),
        };
        let input = IngestInput {
            target: &self.target,
            config: cfg,
            current: &current,
            previous,
        };
        match self.deps.appender.append(&input) {
            Ok(_) => Some(current),
            Err(err) if err.is_conversion() => {
                warn!("failed to decode {} profile of {}: {}", self.target.profile_kind(), self.target, err);
                self.deps
                    .metrics
                    .convert_errors
                    .with_label_values(&[&self.job_name])
                    .inc();
                None
            }
            Err(err) => {
                error!("failed to ingest profile of {}: {}", self.target, err);
                Some(current)
            }
        }
    }

    fn update_target_status(&self, start: Instant, start_time: SystemTime, err: Option<&Error>) {
        let mut status = lock(&self.status);
        status.pulls += 1;
        match err {
            Some(err) => {
                status.health = TargetHealth::Bad;
                status.last_error = Some(err.to_string());
                status.errors += 1;
            }
            None => {
                status.health = TargetHealth::Good;
                status.last_error = None;
            }
        }
        status.last_scrape = Some(start_time);
        status.last_scrape_duration = start.elapsed();
    }
}

impl Drop for LoopContext {
    fn drop(&mut self) {
        lock(&self.status).state = LoopState::Stopped;
    }
}

fn lock(status: &Mutex<LoopStatus>) -> MutexGuard<'_, LoopStatus> {
    status.lock().unwrap_or_else(|e| e.into_inner())
}
