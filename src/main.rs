//! tiercache demo driver
//!
//! Wires a [`MultiTierCache`] over the in-process store and executor, runs a
//! synthetic read workload and prints the resulting statistics.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{fetcher, GetOptions, MultiTierCache, MultiTierCacheConfig};
use tiercache::monitoring::CacheMetricsExporter;
use tiercache::query::{CommunityParams, InMemoryExecutor, InsightPagination, PropertyFilters};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - drive a multi-tier cache with a synthetic workload
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Total reads to issue
    #[arg(long, env = "TIERCACHE_REQUESTS", default_value = "1000")]
    requests: usize,

    /// Distinct keys the reads are spread over
    #[arg(long, env = "TIERCACHE_KEYS", default_value = "100")]
    keys: usize,

    /// Reads in flight at once
    #[arg(long, env = "TIERCACHE_CONCURRENCY", default_value = "16")]
    concurrency: usize,

    /// Simulated fetcher latency in milliseconds
    #[arg(long, env = "TIERCACHE_FETCH_LATENCY_MS", default_value = "5")]
    fetch_latency_ms: u64,

    /// Print Prometheus text instead of JSON
    #[arg(long, env = "TIERCACHE_PROMETHEUS")]
    prometheus: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => MultiTierCacheConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MultiTierCacheConfig::default(),
    };
    config.validate().context("invalid configuration")?;

    info!("Starting tiercache demo");
    info!("  Requests: {} over {} keys", args.requests, args.keys);
    info!("  Memory capacity: {}", config.memory.max_size);
    info!("  Fallback enabled: {}", config.enable_fallback);

    let executor = Arc::new(demo_executor());
    let cache = MultiTierCache::in_memory(config, executor.clone());
    cache.setup_health_monitoring();

    let fetches = Arc::new(AtomicU64::new(0));
    run_workload(&cache, &args, fetches.clone()).await;
    run_domain_reads(&cache).await?;

    info!(
        fetcher_calls = fetches.load(Ordering::Relaxed),
        executor_calls = executor.calls(),
        "Workload finished"
    );

    let stats = cache.stats();
    if args.prometheus {
        let exporter = CacheMetricsExporter::new()?;
        exporter.update(&stats);
        print!("{}", exporter.render()?);
    } else {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    cache.destroy();
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so stdout stays parseable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Workload
// =============================================================================

async fn run_workload(cache: &MultiTierCache, args: &Args, fetches: Arc<AtomicU64>) {
    let keys = args.keys.max(1);
    let latency = Duration::from_millis(args.fetch_latency_ms);
    let request_ids: Vec<usize> = (0..args.requests).collect();

    for chunk in request_ids.chunks(args.concurrency.max(1)) {
        let reads = chunk.iter().map(|i| {
            let id = i % keys;
            let fetches = fetches.clone();
            let source = fetcher(move || {
                let fetches = fetches.clone();
                async move {
                    fetches.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(latency).await;
                    Ok(json!({ "id": id.to_string(), "score": id * 7 }))
                }
            });
            let tag = if id % 2 == 0 { "even" } else { "odd" };
            async move {
                let key = format!("item:{}", id);
                let result = cache
                    .get(&key, source, GetOptions::tagged([tag]))
                    .await;
                if let Err(e) = result {
                    warn!(key = %key, error = %e, "Read failed");
                }
            }
        });
        join_all(reads).await;
    }

    let invalidated = cache.invalidate_by_tags(&["odd".to_string()]).await;
    info!(
        memory_entries = invalidated.memory_entries,
        "Invalidated odd keys"
    );
}

async fn run_domain_reads(cache: &MultiTierCache) -> tiercache::Result<()> {
    let luxury = PropertyFilters {
        luxury: Some(true),
        limit: Some(10),
        ..Default::default()
    };
    for _ in 0..3 {
        let rows = cache.get_properties(&luxury).await?;
        info!(rows = rows.len(), "Listings read");
    }

    let communities = cache.get_communities(&CommunityParams::default()).await?;
    info!(rows = communities.len(), "Communities read");

    let page = cache.get_insights(&InsightPagination::default()).await?;
    info!(rows = page.data.len(), total = page.total, "Insights read");
    Ok(())
}

fn demo_executor() -> InMemoryExecutor {
    let properties: Vec<Value> = (1..=25)
        .map(|i| {
            json!({
                "id": i,
                "title": format!("Residence {}", i),
                "price": 850_000 + i * 25_000,
            })
        })
        .collect();
    let communities: Vec<Value> = ["marina", "downtown", "hills"]
        .iter()
        .map(|slug| json!({ "slug": slug }))
        .collect();
    let insights: Vec<Value> = (1..=12)
        .map(|i| json!({ "id": i, "title": format!("Quarterly report {}", i) }))
        .collect();

    InMemoryExecutor::new()
        .with_table("properties", properties)
        .with_table("communities", communities)
        .with_table("market_insights", insights)
}
