mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tokio::sync::mpsc;

use agent::appender::Ingester;
use agent::discover::SyncEvent;
use agent::metrics::Metrics;
use agent::scrape::{JobConfig, LoopState, ScrapeManager, TargetHealth};
use common::error::Error;

use support::{eventually, goroutine_profile, group, CapturingCollector, FakePuller};

const WAIT: Duration = Duration::from_secs(5);

fn job(name: &str) -> JobConfig {
    JobConfig {
        scrape_interval: Duration::from_millis(100),
        scrape_timeout: Duration::from_millis(100),
        enabled_profiles: vec!["goroutines".to_string()],
        ..JobConfig::new(name)
    }
}

struct Harness {
    manager: Arc<ScrapeManager>,
    puller: Arc<FakePuller>,
    collector: Arc<CapturingCollector>,
    metrics: Arc<Metrics>,
    events: mpsc::Sender<SyncEvent>,
}

async fn harness(puller: Arc<FakePuller>, jobs: Vec<JobConfig>) -> Harness {
    let metrics = Arc::new(Metrics::new(&Registry::new()).unwrap());
    let collector = Arc::new(CapturingCollector::default());
    let ingester = Arc::new(Ingester::new(collector.clone(), metrics.clone()));
    let manager = Arc::new(
        ScrapeManager::new(ingester, puller.clone(), metrics.clone()).with_grace_period(Duration::from_secs(1)),
    );
    manager.apply_config(jobs).await.unwrap();

    let (events, rx) = mpsc::channel(16);
    let runner = manager.clone();
    tokio::spawn(async move { runner.run(rx).await });

    Harness {
        manager,
        puller,
        collector,
        metrics,
        events,
    }
}

impl Harness {
    async fn send(&self, job: &str, addrs: &[&str]) {
        self.events
            .send(SyncEvent {
                job_name: job.to_string(),
                groups: vec![group(addrs)],
            })
            .await
            .unwrap();
    }

    async fn instances(&self, job: &str) -> HashSet<String> {
        self.manager
            .active_targets()
            .await
            .get(job)
            .map(|ts| ts.iter().map(|t| t.instance().to_string()).collect())
            .unwrap_or_default()
    }
}

fn set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_replaces_the_target_set() {
    let h = &harness(FakePuller::ok(goroutine_profile(3)), vec![job("app")]).await;

    h.send("app", &["t1:6060", "t2:6060"]).await;
    assert!(eventually(WAIT, || async move { h.instances("app").await == set(&["t1:6060", "t2:6060"]) }).await);
    assert!(eventually(WAIT, || async move { h.puller.pulls("t1:6060") > 0 }).await);

    h.send("app", &["t2:6060", "t3:6060"]).await;
    assert!(eventually(WAIT, || async move { h.instances("app").await == set(&["t2:6060", "t3:6060"]) }).await);
    assert!(eventually(WAIT, || async move { h.puller.pulls("t3:6060") > 0 }).await);

    // t1 is fully stopped once it left the active set.
    let t1_pulls = h.puller.pulls("t1:6060");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.puller.pulls("t1:6060"), t1_pulls);

    let states = h.manager.loop_states("app").await;
    assert_eq!(states.len(), 2);
    assert!(states.iter().all(|(_, s)| s.state == LoopState::Running));

    // Instantaneous goroutine samples reach the collector on every pull.
    assert!(eventually(WAIT, || async move { !h.collector.samples().is_empty() }).await);
    let sample = &h.collector.samples()[0];
    assert_eq!(sample.name, "goroutines");
    assert_eq!(sample.value_of(&["runtime.main", "main.worker"]), Some(3.0));
    assert_eq!(sample.labels.get("job"), Some("app"));

    h.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_target_set_keeps_running_loops() {
    let h = &harness(FakePuller::ok(goroutine_profile(1)), vec![job("app")]).await;

    h.send("app", &["t1:6060"]).await;
    assert!(eventually(WAIT, || async move {
        h.manager.loop_states("app").await.iter().any(|(_, s)| s.pulls >= 2)
    })
    .await);
    let (target, before) = h.manager.loop_states("app").await.remove(0);

    h.send("app", &["t1:6060"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let states = h.manager.loop_states("app").await;
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].0.hash(), target.hash());
    // The loop was not restarted: its status kept counting.
    assert!(states[0].1.pulls > before.pulls);

    h.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_pulls_mark_the_target_bad_and_keep_looping() {
    let h = &harness(FakePuller::failing(500), vec![job("app")]).await;

    h.send("app", &["t1:6060"]).await;
    assert!(eventually(WAIT, || async move {
        h.manager.loop_states("app").await.iter().any(|(_, s)| s.errors >= 3)
    })
    .await);

    let (_, status) = h.manager.loop_states("app").await.remove(0);
    assert_eq!(status.health, TargetHealth::Bad);
    assert_eq!(status.state, LoopState::Running);
    assert!(status.last_error.unwrap().contains("500"));
    assert!(h.metrics.scrape_errors.with_label_values(&["app", "t1:6060"]).get() >= 3);
    assert!(h.collector.samples().is_empty());

    h.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversize_payloads_are_scrape_errors_and_never_converted() {
    let body = goroutine_profile(3);
    let mut cfg = job("app");
    cfg.body_size_limit = body.len() as u64 - 1;
    let h = &harness(FakePuller::ok(body), vec![cfg]).await;

    h.send("app", &["t1:6060"]).await;
    assert!(eventually(WAIT, || async move {
        h.manager.loop_states("app").await.iter().any(|(_, s)| s.errors >= 3)
    })
    .await);

    let (_, status) = h.manager.loop_states("app").await.remove(0);
    assert_eq!(status.state, LoopState::Running);
    assert_eq!(status.health, TargetHealth::Bad);
    assert!(status.last_error.unwrap().contains("size limit"));
    assert!(h.metrics.scrape_errors.with_label_values(&["app", "t1:6060"]).get() >= 3);
    assert_eq!(h.metrics.convert_errors.with_label_values(&["app"]).get(), 0);
    assert_eq!(h.metrics.samples.with_label_values(&["app"]).get(), 0);
    assert!(h.collector.samples().is_empty());

    // The loop keeps pulling after every refusal.
    let pulls = h.puller.pulls("t1:6060");
    assert!(eventually(WAIT, || async move { h.puller.pulls("t1:6060") > pulls }).await);

    h.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_payloads_count_as_convert_errors() {
    let h = &harness(FakePuller::ok(b"not a profile".to_vec()), vec![job("app")]).await;

    h.send("app", &["t1:6060"]).await;
    assert!(eventually(WAIT, || async move { h.metrics.convert_errors.with_label_values(&["app"]).get() >= 2 }).await);

    let (_, status) = h.manager.loop_states("app").await.remove(0);
    assert_eq!(status.health, TargetHealth::Good);
    h.manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn config_changes_apply_to_running_jobs() {
    let h = &harness(FakePuller::ok(goroutine_profile(1)), vec![job("app"), job("other")]).await;

    h.send("app", &["t1:6060"]).await;
    h.send("other", &["o1:6060"]).await;
    assert!(eventually(WAIT, || async move { h.instances("other").await.len() == 1 }).await);

    // Enabling a second kind re-derives targets from the last groups.
    let mut app = job("app");
    app.enabled_profiles.push("mutex".to_string());
    h.manager.apply_config(vec![app]).await.unwrap();

    let active = h.manager.active_targets().await;
    assert!(!active.contains_key("other"));
    let kinds: HashSet<String> = active["app"].iter().map(|t| t.profile_kind().to_string()).collect();
    assert_eq!(kinds, set(&["goroutines", "mutex"]));

    // Events for unknown jobs are ignored.
    h.send("other", &["o1:6060"]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!h.manager.active_targets().await.contains_key("other"));

    h.manager.stop().await;
}

#[tokio::test]
async fn invalid_config_is_rejected_as_a_whole() {
    let h = &harness(FakePuller::ok(goroutine_profile(1)), vec![job("app")]).await;

    let mut bad = job("bad");
    bad.scrape_interval = Duration::ZERO;
    let err = h.manager.apply_config(vec![job("app"), job("new"), bad]).await;
    assert!(matches!(err, Err(Error::Config(_))));
    assert!(!h.manager.active_targets().await.contains_key("new"));

    let err = h.manager.apply_config(vec![job("app"), job("app")]).await;
    assert!(matches!(err, Err(Error::Config(_))));

    h.manager.stop().await;
    h.manager.stop().await;
    assert!(matches!(h.manager.apply_config(vec![job("app")]).await, Err(Error::Closed)));
}
