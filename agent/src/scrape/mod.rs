pub mod fetch;
pub mod manager;
pub mod scrape;
pub mod scrape_loop;
pub mod target;

pub use fetch::{HttpPuller, Puller};
pub use manager::ScrapeManager;
pub use scrape::{JobConfig, ProfilingConfig, ProfilingTarget};
pub use scrape_loop::{LoopState, LoopStatus};
pub use target::{Target, TargetHealth};
