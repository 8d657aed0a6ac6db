use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::debug;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::Client;

use common::error::{Error, Result};

use crate::scrape::target::Target;

const USER_AGENT_VALUE: &str = concat!("goprofile-agent/", env!("CARGO_PKG_VERSION"));

/// Fetches the raw profile of a target.
#[async_trait]
pub trait Puller: Send + Sync {
    /// `body_size_limit` of 0 disables the size check.
    async fn pull(&self, target: &Target, timeout: Duration, body_size_limit: u64) -> Result<Bytes>;
}

pub struct HttpPuller {
    client: Client,
}

impl HttpPuller {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;
        Ok(HttpPuller { client })
    }

    async fn fetch_profile(&self, target: &Target, body_size_limit: u64) -> Result<Bytes> {
        let mut resp = self
            .client
            .get(target.url())
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header(ACCEPT, "application/octet-stream")
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::HttpStatus(status.as_u16()));
        }

        if body_size_limit > 0 {
            if let Some(len) = resp.content_length() {
                if len > body_size_limit {
                    return Err(Error::BodyTooLarge {
                        size: len,
                        limit: body_size_limit,
                    });
                }
            }
        }

        let mut body = BytesMut::with_capacity(resp.content_length().unwrap_or(0).min(1 << 20) as usize);
        while let Some(chunk) = resp.chunk().await.map_err(|e| Error::Request(e.to_string()))? {
            let size = (body.len() + chunk.len()) as u64;
            if body_size_limit > 0 && size > body_size_limit {
                return Err(Error::BodyTooLarge {
                    size,
                    limit: body_size_limit,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

#[async_trait]
impl Puller for HttpPuller {
    async fn pull(&self, target: &Target, timeout: Duration, body_size_limit: u64) -> Result<Bytes> {
        debug!("scraping {} profile: url: {}", target.profile_kind(), target.url());
        match tokio::time::timeout(timeout, self.fetch_profile(target, body_size_limit)).await {
            Ok(res) => res,
            Err(_) => Err(Error::ScrapeTimeout(timeout)),
        }
    }
}
