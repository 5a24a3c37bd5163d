//! Prometheus exporter
//!
//! Statistics are snapshots, so everything is exported as a gauge and
//! overwritten on each [`CacheMetricsExporter::update`].

use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::MultiTierStats;
use crate::error::{Error, Result};

pub const METRICS_NAMESPACE: &str = "tiercache";

/// Owns a private registry with one gauge family per statistic
pub struct CacheMetricsExporter {
    registry: Registry,
    requests: IntGauge,
    errors: IntGauge,
    hits: IntGaugeVec,
    hit_rate: GaugeVec,
    entries: IntGaugeVec,
    avg_response_seconds: GaugeVec,
    memory_bytes: IntGauge,
    evictions: IntGauge,
    expired: IntGauge,
    durable_failure_rate: Gauge,
    durable_healthy: IntGauge,
}

impl CacheMetricsExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntGauge::with_opts(opts("requests", "Requests served by the cache"))?;
        let errors = IntGauge::with_opts(opts("errors", "Requests that ended in an error"))?;
        let hits = IntGaugeVec::new(opts("hits", "Cache hits by tier"), &["tier"])?;
        let hit_rate = GaugeVec::new(opts("hit_rate", "Hit rate by tier"), &["tier"])?;
        let entries = IntGaugeVec::new(opts("entries", "Stored entries by tier"), &["tier"])?;
        let avg_response_seconds = GaugeVec::new(
            opts("avg_response_seconds", "Average response time by tier"),
            &["tier"],
        )?;
        let memory_bytes = IntGauge::with_opts(opts(
            "memory_bytes",
            "Estimated size of the memory tier",
        ))?;
        let evictions = IntGauge::with_opts(opts("evictions", "LRU evictions"))?;
        let expired = IntGauge::with_opts(opts("expired", "Entries removed on expiry"))?;
        let durable_failure_rate = Gauge::with_opts(opts(
            "durable_failure_rate",
            "Failed share of durable operations",
        ))?;
        let durable_healthy = IntGauge::with_opts(opts(
            "durable_healthy",
            "1 while the durable tier is below its alert threshold",
        ))?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(hit_rate.clone()))?;
        registry.register(Box::new(entries.clone()))?;
        registry.register(Box::new(avg_response_seconds.clone()))?;
        registry.register(Box::new(memory_bytes.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(expired.clone()))?;
        registry.register(Box::new(durable_failure_rate.clone()))?;
        registry.register(Box::new(durable_healthy.clone()))?;

        Ok(Self {
            registry,
            requests,
            errors,
            hits,
            hit_rate,
            entries,
            avg_response_seconds,
            memory_bytes,
            evictions,
            expired,
            durable_failure_rate,
            durable_healthy,
        })
    }

    /// Overwrite every gauge from `stats`
    pub fn update(&self, stats: &MultiTierStats) {
        let overall = &stats.overall;
        self.requests.set(overall.total_requests as i64);
        self.errors.set(overall.errors as i64);
        self.hits
            .with_label_values(&["overall"])
            .set(overall.cache_hits as i64);
        self.hit_rate
            .with_label_values(&["overall"])
            .set(overall.hit_rate);
        self.avg_response_seconds
            .with_label_values(&["overall"])
            .set(overall.avg_response_time.as_secs_f64());

        let memory = &stats.memory;
        self.hits
            .with_label_values(&["memory"])
            .set(memory.hits as i64);
        self.hit_rate
            .with_label_values(&["memory"])
            .set(memory.hit_rate);
        self.entries
            .with_label_values(&["memory"])
            .set(memory.total_entries as i64);
        self.avg_response_seconds
            .with_label_values(&["memory"])
            .set(memory.avg_response_time.as_secs_f64());
        self.memory_bytes.set(memory.memory_usage as i64);
        self.evictions.set(memory.eviction_count as i64);
        self.expired.set(memory.expired_count as i64);

        let durable = &stats.durable;
        self.avg_response_seconds
            .with_label_values(&["durable"])
            .set(durable.avg_response_time.as_secs_f64());
        self.durable_failure_rate.set(durable.failure_rate);
        self.durable_healthy.set(i64::from(durable.is_healthy));

        let query = &stats.query;
        self.hits
            .with_label_values(&["query"])
            .set(query.total_hits as i64);
        self.hit_rate
            .with_label_values(&["query"])
            .set(query.hit_rate);
        self.entries
            .with_label_values(&["query"])
            .set(query.size as i64);
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(METRICS_NAMESPACE)
}
