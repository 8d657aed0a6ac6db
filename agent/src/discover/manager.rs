use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use common::error::{Error, Result};

use crate::discover::backoff::Backoff;
use crate::discover::discover::{DiscoveryConfig, Discoverer, Group};
use crate::metrics::Metrics;

/// Full current target set of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    pub job_name: String,
    pub groups: Vec<Group>,
}

pub type DiscoverySet = HashMap<String, Vec<Group>>;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub update_interval: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub grace_period: Duration,
    pub channel_capacity: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(5),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            channel_capacity: 16,
        }
    }
}

enum ProviderUpdate {
    Targets {
        job: String,
        index: usize,
        generation: u64,
        groups: Vec<Group>,
    },
    Failed {
        job: String,
        index: usize,
        generation: u64,
        source: String,
        error: Error,
    },
}

struct Provider {
    job: String,
    index: usize,
    discoverer: Arc<dyn Discoverer>,
}

struct ProviderState {
    config: DiscoveryConfig,
    groups: Vec<Group>,
    failing: bool,
}

impl ProviderState {
    fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            groups: Vec::new(),
            failing: false,
        }
    }
}

#[derive(Default)]
struct JobState {
    providers: Vec<ProviderState>,
    degraded: bool,
}

impl JobState {
    fn groups(&self) -> Vec<Group> {
        self.providers.iter().flat_map(|p| p.groups.iter().cloned()).collect()
    }
}

struct State {
    generation: u64,
    jobs: HashMap<String, JobState>,
    dirty: HashSet<String>,
    providers_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct DiscoveryManager {
    options: DiscoveryOptions,
    metrics: Arc<Metrics>,
    state: Mutex<State>,
    updates_tx: mpsc::UnboundedSender<ProviderUpdate>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<ProviderUpdate>>>,
    sync_tx: mpsc::Sender<SyncEvent>,
    sync_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
    token: CancellationToken,
}

impl DiscoveryManager {
    pub fn new(options: DiscoveryOptions, metrics: Arc<Metrics>) -> Self {
        let token = CancellationToken::new();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (sync_tx, sync_rx) = mpsc::channel(options.channel_capacity.max(1));
        DiscoveryManager {
            options,
            metrics,
            state: Mutex::new(State {
                generation: 0,
                jobs: HashMap::new(),
                dirty: HashSet::new(),
                providers_token: token.child_token(),
                tasks: Vec::new(),
            }),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
            sync_tx,
            sync_rx: Mutex::new(Some(sync_rx)),
            token,
        }
    }

    /// Receiving end of the SyncEvent channel. Handed out once.
    pub fn sync_ch(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.lock_sync_rx().take()
    }

    pub async fn apply_config(&self, cfg: HashMap<String, Vec<DiscoveryConfig>>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Closed);
        }

        let mut providers = Vec::new();
        for (job, configs) in &cfg {
            for (index, c) in configs.iter().enumerate() {
                let discoverer = c.new_discoverer().map_err(|e| {
                    error!("invalid {} discovery config for job {}: {}", c.name(), job, e);
                    e
                })?;
                providers.push(Provider {
                    job: job.clone(),
                    index,
                    discoverer,
                });
            }
        }

        let old_tasks = {
            let mut state = self.lock_state();
            let state = &mut *state;

            state.providers_token.cancel();
            state.providers_token = self.token.child_token();
            state.generation += 1;

            let removed: Vec<String> = state.jobs.keys().filter(|j| !cfg.contains_key(*j)).cloned().collect();
            for job in removed {
                info!("discovery for job {} removed", job);
                state.jobs.remove(&job);
                state.dirty.insert(job);
            }
            for (job, configs) in &cfg {
                let js = state.jobs.entry(job.clone()).or_default();
                if js.providers.len() > configs.len() {
                    js.providers.truncate(configs.len());
                    state.dirty.insert(job.clone());
                }
                for (index, c) in configs.iter().enumerate() {
                    match js.providers.get_mut(index) {
                        // Known groups only carry over to an unchanged source.
                        Some(p) if p.config == *c => p.failing = false,
                        Some(p) => {
                            *p = ProviderState::new(c.clone());
                            state.dirty.insert(job.clone());
                        }
                        None => js.providers.push(ProviderState::new(c.clone())),
                    }
                }
                js.degraded = false;
            }

            let old_tasks = mem::take(&mut state.tasks);
            for provider in providers {
                let task = tokio::spawn(run_provider(
                    provider,
                    state.generation,
                    self.updates_tx.clone(),
                    state.providers_token.clone(),
                    Backoff::new(self.options.min_backoff, self.options.max_backoff),
                ));
                state.tasks.push(task);
            }
            old_tasks
        };

        self.wait_tasks(old_tasks).await;
        info!("discovery config applied for {} jobs", cfg.len());
        Ok(())
    }

    /// Forwards source updates as SyncEvents until `stop` is called.
    pub async fn run(&self) -> Result<()> {
        let mut updates = self.lock_updates_rx().take().ok_or(Error::Closed)?;

        let mut ticker = tokio::time::interval(self.options.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => self.handle_update(update),
                    None => break,
                },
                _ = ticker.tick() => self.flush(),
            }
        }
        debug!("discovery manager stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        self.token.cancel();
        let tasks = mem::take(&mut self.lock_state().tasks);
        self.wait_tasks(tasks).await;
    }

    pub fn discovered(&self) -> DiscoverySet {
        let state = self.lock_state();
        state.jobs.iter().map(|(job, js)| (job.clone(), js.groups())).collect()
    }

    fn handle_update(&self, update: ProviderUpdate) {
        let mut state = self.lock_state();
        let state = &mut *state;

        match update {
            ProviderUpdate::Targets {
                job,
                index,
                generation,
                groups,
            } => {
                if generation != state.generation {
                    return;
                }
                let Some(js) = state.jobs.get_mut(&job) else {
                    return;
                };
                if let Some(p) = js.providers.get_mut(index) {
                    p.groups = groups;
                    p.failing = false;
                }
                if js.degraded {
                    js.degraded = false;
                    info!("discovery for job {} recovered", job);
                }
                state.dirty.insert(job);
            }
            ProviderUpdate::Failed {
                job,
                index,
                generation,
                source,
                error,
            } => {
                if generation != state.generation {
                    return;
                }
                let Some(js) = state.jobs.get_mut(&job) else {
                    return;
                };
                self.metrics.discovery_errors.with_label_values(&[&job, &source]).inc();
                let Some(p) = js.providers.get_mut(index) else {
                    return;
                };
                p.failing = true;
                error!(
                    "discovery source {} of job {} failed, keeping {} known groups: {}",
                    source,
                    job,
                    p.groups.len(),
                    error
                );
                if !js.degraded && js.providers.iter().all(|p| p.failing) {
                    js.degraded = true;
                    warn!("every discovery source of job {} is failing, serving stale targets", job);
                }
            }
        }
    }

    fn flush(&self) {
        let mut state = self.lock_state();
        let state = &mut *state;

        let dirty: Vec<String> = state.dirty.iter().cloned().collect();
        for job in dirty {
            let groups = state.jobs.get(&job).map(JobState::groups).unwrap_or_default();
            let event = SyncEvent {
                job_name: job.clone(),
                groups,
            };
            match self.sync_tx.try_send(event) {
                Ok(()) => {
                    debug!("published target set for job {}", job);
                    self.metrics.sync_events.with_label_values(&[&job]).inc();
                    state.dirty.remove(&job);
                }
                Err(TrySendError::Full(_)) => {
                    debug!("sync channel full, job {} stays pending", job);
                }
                Err(TrySendError::Closed(_)) => {
                    state.dirty.remove(&job);
                }
            }
        }
    }

    async fn wait_tasks(&self, tasks: Vec<JoinHandle<()>>) {
        if tasks.is_empty() {
            return;
        }
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if timeout(self.options.grace_period, join_all(tasks)).await.is_err() {
            warn!("discovery sources did not stop within {:?}", self.options.grace_period);
            for a in aborts {
                a.abort();
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_updates_rx(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedReceiver<ProviderUpdate>>> {
        self.updates_rx.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_sync_rx(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Receiver<SyncEvent>>> {
        self.sync_rx.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn run_provider(
    provider: Provider,
    generation: u64,
    updates: mpsc::UnboundedSender<ProviderUpdate>,
    token: CancellationToken,
    mut backoff: Backoff,
) {
    let name = format!("{}/{}", provider.discoverer.name(), provider.index);
    let mut last: Option<Vec<Group>> = None;
    let mut failed = false;

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => return,
            r = provider.discoverer.refresh() => r,
        };

        let wait = match result {
            Ok(groups) => {
                backoff.mark_success();
                if failed || last.as_ref() != Some(&groups) {
                    failed = false;
                    last = Some(groups.clone());
                    let update = ProviderUpdate::Targets {
                        job: provider.job.clone(),
                        index: provider.index,
                        generation,
                        groups,
                    };
                    if updates.send(update).is_err() {
                        return;
                    }
                }
                match provider.discoverer.refresh_interval() {
                    Some(interval) => interval,
                    None => return,
                }
            }
            Err(error) => {
                failed = true;
                let update = ProviderUpdate::Failed {
                    job: provider.job.clone(),
                    index: provider.index,
                    generation,
                    source: name.clone(),
                    error,
                };
                if updates.send(update).is_err() {
                    return;
                }
                backoff.mark_failure()
            }
        };

        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(wait) => {}
        }
    }
}
