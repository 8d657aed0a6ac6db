mod support;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use serde_json::json;

use agent::appender::Ingester;
use agent::config::GoProfileConfig;
use agent::discover::static_discovery::StaticConfig;
use agent::discover::{DiscoveryConfig, DiscoveryManager, DiscoveryOptions};
use agent::goprofile::GoProfile;
use agent::metrics::Metrics;
use agent::scrape::{HttpPuller, JobConfig, ProfilingTarget, ScrapeManager};
use common::common::collector::{AggregationKind, ProfileSample, Units};
use common::pprof::convert::SampleTypeConfig;

use support::{alloc_profile, eventually, serve, CapturingCollector};

const WAIT: Duration = Duration::from_secs(10);

fn wire(collector: Arc<CapturingCollector>) -> GoProfile {
    let metrics = Arc::new(Metrics::new(&Registry::new()).unwrap());
    let discovery = DiscoveryManager::new(
        DiscoveryOptions {
            update_interval: Duration::from_millis(50),
            ..Default::default()
        },
        metrics.clone(),
    );
    let scrape = ScrapeManager::new(
        Arc::new(Ingester::new(collector, metrics.clone())),
        Arc::new(HttpPuller::new().unwrap()),
        metrics,
    )
    .with_grace_period(Duration::from_secs(1));
    GoProfile::with_parts(discovery, scrape)
}

fn alloc_space(samples: &[ProfileSample]) -> Vec<ProfileSample> {
    samples.iter().filter(|s| s.name == "alloc_space").cloned().collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cumulative_heap_counters_become_interval_deltas() {
    let (addr, hits) = serve(vec![(200, alloc_profile(40)), (200, alloc_profile(100))]).await;
    let collector = Arc::new(CapturingCollector::default());
    let goprofile = wire(collector.clone());

    let cfg = GoProfileConfig {
        job_name: "app".to_string(),
        interval: 1,
        timeout: 1,
        enabled_profiles: vec!["mem".to_string()],
        labels: HashMap::from([("env".to_string(), "test".to_string())]),
        config: json!({ "targets": [addr.to_string()] }),
        ..Default::default()
    };
    goprofile.start(vec![cfg]).await.unwrap();

    let (c, h) = (&collector, &hits);
    assert!(eventually(WAIT, || async move { !alloc_space(&c.samples()).is_empty() }).await);
    // The first pull is only a baseline.
    assert!(hits.load(Ordering::SeqCst) >= 2);

    let sample = alloc_space(&collector.samples()).remove(0);
    assert_eq!(sample.profile_kind, "mem");
    assert_eq!(sample.units, Units::Bytes);
    assert_eq!(sample.aggregation, AggregationKind::Sum);
    assert_eq!(sample.value_of(&["main", "foo"]), Some(60.0));
    assert_eq!(sample.labels.get("env"), Some("test"));
    assert_eq!(sample.labels.get("job"), Some("app"));
    assert_eq!(sample.labels.get("instance"), Some(addr.to_string().as_str()));
    assert!(sample.start_time < sample.end_time);

    // Later pulls return the same payload: a zero delta emits nothing.
    assert!(eventually(WAIT, || async move { h.load(Ordering::SeqCst) >= 4 }).await);
    assert_eq!(alloc_space(&collector.samples()).len(), 1);

    goprofile.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn averaged_deltas_are_divided_by_elapsed_time() {
    let (addr, _) = serve(vec![(200, alloc_profile(40)), (200, alloc_profile(100))]).await;
    let collector = Arc::new(CapturingCollector::default());
    let metrics = Arc::new(Metrics::new(&Registry::new()).unwrap());

    let discovery = DiscoveryManager::new(
        DiscoveryOptions {
            update_interval: Duration::from_millis(50),
            ..Default::default()
        },
        metrics.clone(),
    );
    let scrape = ScrapeManager::new(
        Arc::new(Ingester::new(collector.clone(), metrics.clone())),
        Arc::new(HttpPuller::new().unwrap()),
        metrics,
    );

    let mut job = JobConfig {
        scrape_interval: Duration::from_secs(1),
        scrape_timeout: Duration::from_secs(1),
        enabled_profiles: vec!["allocs".to_string()],
        ..JobConfig::new("avg")
    };
    job.profiling_config.insert(
        "allocs",
        ProfilingTarget::new("/debug/pprof/allocs").sample_type(
            "alloc_space",
            SampleTypeConfig::new(Units::Bytes)
                .aggregation(AggregationKind::Average)
                .cumulative(),
        ),
    );
    scrape.apply_config(vec![job]).await.unwrap();
    discovery
        .apply_config(HashMap::from([(
            "avg".to_string(),
            vec![DiscoveryConfig::Static(StaticConfig {
                targets: vec![addr.to_string()],
                ..Default::default()
            })],
        )]))
        .await
        .unwrap();

    let sync_rx = discovery.sync_ch().unwrap();
    let check = async {
        let collector = &collector;
        assert!(eventually(WAIT, || async move { !alloc_space(&collector.samples()).is_empty() }).await);
        discovery.stop().await;
        scrape.stop().await;
    };
    let (d, s, _) = tokio::join!(discovery.run(), scrape.run(sync_rx), check);
    d.unwrap();
    s.unwrap();

    let sample = alloc_space(&collector.samples()).remove(0);
    let elapsed = sample.end_time.duration_since(sample.start_time).unwrap().as_secs_f64();
    assert!(elapsed > 0.5, "elapsed {}", elapsed);
    let value = sample.value_of(&["main", "foo"]).unwrap();
    assert!((value - 60.0 / elapsed).abs() < 1e-6, "value {} elapsed {}", value, elapsed);
}
