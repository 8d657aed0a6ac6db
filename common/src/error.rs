use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("discovery source {name} failed: {reason}")]
    DiscoverySource { name: String, reason: String },
    #[error("server returned HTTP status {0}")]
    HttpStatus(u16),
    #[error("body exceeds size limit: read {size} bytes, limit is {limit} bytes")]
    BodyTooLarge { size: u64, limit: u64 },
    #[error("scrape timed out after {0:?}")]
    ScrapeTimeout(Duration),
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid profile: {0}")]
    Decode(String),
    #[error("profile schema: {0}")]
    Schema(String),
    #[error("closed")]
    Closed,
}

impl Error {
    /// Failures of a single pull. They never stop a scrape loop.
    pub fn is_scrape(&self) -> bool {
        matches!(
            self,
            Error::HttpStatus(_)
                | Error::BodyTooLarge { .. }
                | Error::ScrapeTimeout(_)
                | Error::Request(_)
        )
    }

    /// Failures of a single conversion. Only that pull's output is dropped.
    pub fn is_conversion(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::Schema(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
