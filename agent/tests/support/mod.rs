#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use agent::discover::{Group, ADDRESS_LABEL};
use agent::scrape::{Puller, Target};
use common::common::collector::{Collector, ProfileSample};
use common::error::{Error, Result};
use common::pprof::ProfileBuilder;

/// Serves `responses` in order, repeating the last one. Returns the address
/// and the number of requests seen.
pub async fn serve(responses: Vec<(u16, Vec<u8>)>) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let responses = Arc::new(responses);

    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let (status, body) = responses[n.min(responses.len() - 1)].clone();
            tokio::spawn(async move {
                read_request(&mut socket).await;
                let reason = if status < 300 { "OK" } else { "Error" };
                let head = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    reason,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (addr, hits)
}

/// Accepts connections and never answers.
pub async fn serve_stalled() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

async fn read_request(socket: &mut tokio::net::TcpStream) {
    let mut buf = [0u8; 4096];
    let mut read = Vec::new();
    loop {
        let n = socket.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        read.extend_from_slice(&buf[..n]);
        if read.windows(4).any(|w| w == b"\r\n\r\n") {
            return;
        }
    }
}

pub fn group(addrs: &[&str]) -> Group {
    Group {
        targets: addrs
            .iter()
            .map(|a| HashMap::from([(ADDRESS_LABEL.to_string(), a.to_string())]))
            .collect(),
        labels: HashMap::new(),
        source: "test".to_string(),
    }
}

pub fn goroutine_profile(count: i64) -> Vec<u8> {
    let mut b = ProfileBuilder::new(&[("goroutine", "count")]);
    b.add_sample(&["runtime.main", "main.worker"], &[count]);
    b.encode()
}

pub fn alloc_profile(foo: i64) -> Vec<u8> {
    let mut b = ProfileBuilder::new(&[("alloc_objects", "count"), ("alloc_space", "bytes")]);
    b.add_sample(&["main", "foo"], &[1, foo]);
    b.gzip().unwrap()
}

/// Answers every pull with a fixed result and counts pulls per URL. Bodies
/// over the requested size limit are refused like `HttpPuller` does.
pub struct FakePuller {
    response: Mutex<Result<Bytes, u16>>,
    pulls: Mutex<HashMap<String, usize>>,
}

impl FakePuller {
    pub fn ok(body: Vec<u8>) -> Arc<Self> {
        Arc::new(FakePuller {
            response: Mutex::new(Ok(Bytes::from(body))),
            pulls: Mutex::new(HashMap::new()),
        })
    }

    pub fn failing(status: u16) -> Arc<Self> {
        Arc::new(FakePuller {
            response: Mutex::new(Err(status)),
            pulls: Mutex::new(HashMap::new()),
        })
    }

    /// Pulls of every target whose URL contains `needle`.
    pub fn pulls(&self, needle: &str) -> usize {
        self.pulls
            .lock()
            .unwrap()
            .iter()
            .filter(|(url, _)| url.contains(needle))
            .map(|(_, n)| n)
            .sum()
    }
}

#[async_trait]
impl Puller for FakePuller {
    async fn pull(&self, target: &Target, _timeout: Duration, body_size_limit: u64) -> Result<Bytes> {
        *self.pulls.lock().unwrap().entry(target.url().to_string()).or_default() += 1;
        match &*self.response.lock().unwrap() {
            Ok(body) if body_size_limit > 0 && body.len() as u64 > body_size_limit => Err(Error::BodyTooLarge {
                size: body.len() as u64,
                limit: body_size_limit,
            }),
            Ok(body) => Ok(body.clone()),
            Err(status) => Err(Error::HttpStatus(*status)),
        }
    }
}

#[derive(Default)]
pub struct CapturingCollector {
    samples: Mutex<Vec<ProfileSample>>,
}

impl CapturingCollector {
    pub fn samples(&self) -> Vec<ProfileSample> {
        self.samples.lock().unwrap().clone()
    }
}

impl Collector for CapturingCollector {
    fn collect(&self, sample: ProfileSample) {
        self.samples.lock().unwrap().push(sample);
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
