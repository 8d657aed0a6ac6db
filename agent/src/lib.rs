pub mod appender;
pub mod config;
pub mod discover;
pub mod goprofile;
pub mod metrics;
pub mod scrape;
