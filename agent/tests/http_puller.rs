mod support;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use agent::scrape::target::targets_from_group;
use agent::scrape::{HttpPuller, JobConfig, Puller, Target};
use common::error::Error;

use support::{goroutine_profile, group, serve, serve_stalled};

const TIMEOUT: Duration = Duration::from_secs(2);

fn target(addr: SocketAddr) -> Target {
    let cfg = JobConfig {
        enabled_profiles: vec!["goroutines".to_string()],
        ..JobConfig::new("app")
    };
    let addr = addr.to_string();
    let (mut targets, _) = targets_from_group(&group(&[addr.as_str()]), &cfg);
    targets.remove(0)
}

#[tokio::test]
async fn pulls_the_profile_body() {
    let body = goroutine_profile(5);
    let (addr, hits) = serve(vec![(200, body.clone())]).await;

    let puller = HttpPuller::new().unwrap();
    let got = puller.pull(&target(addr), TIMEOUT, 0).await.unwrap();
    assert_eq!(got.as_ref(), body.as_slice());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_2xx_is_an_http_status_error() {
    let (addr, _) = serve(vec![(404, b"404 page not found".to_vec())]).await;

    let err = HttpPuller::new().unwrap().pull(&target(addr), TIMEOUT, 0).await.unwrap_err();
    assert!(matches!(err, Error::HttpStatus(404)));
    assert!(err.is_scrape());
}

#[tokio::test]
async fn oversize_bodies_are_rejected() {
    let (addr, _) = serve(vec![(200, vec![7u8; 4096])]).await;
    let puller = HttpPuller::new().unwrap();

    let err = puller.pull(&target(addr), TIMEOUT, 1024).await.unwrap_err();
    assert!(matches!(err, Error::BodyTooLarge { limit: 1024, .. }));

    // At the limit is fine.
    let got = puller.pull(&target(addr), TIMEOUT, 4096).await.unwrap();
    assert_eq!(got.len(), 4096);
}

#[tokio::test]
async fn slow_targets_time_out() {
    let addr = serve_stalled().await;

    let err = HttpPuller::new()
        .unwrap()
        .pull(&target(addr), Duration::from_millis(200), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ScrapeTimeout(_)));
}

#[tokio::test]
async fn connection_refused_is_a_request_error() {
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let err = HttpPuller::new().unwrap().pull(&target(addr), TIMEOUT, 0).await.unwrap_err();
    assert!(matches!(err, Error::Request(_)));
}
