pub mod backoff;
pub mod discover;
pub mod kubernetes_discovery;
pub mod manager;
pub mod static_discovery;

pub use discover::{DiscoveryConfig, Discoverer, Group, LabelSet, ADDRESS_LABEL};
pub use manager::{DiscoveryManager, DiscoveryOptions, DiscoverySet, SyncEvent};
