//! Monitoring
//!
//! Prometheus exposition of [`MultiTierStats`](crate::cache::MultiTierStats)
//! snapshots.

mod exporter;

pub use exporter::{CacheMetricsExporter, METRICS_NAMESPACE};
