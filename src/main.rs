use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::catalog::Catalog;
use tollgate::config::{LogFormat, StoreBackend, TollgateConfig};
use tollgate::grpc::GrpcServer;
use tollgate::ratelimit::{
    AlgorithmSelector, BucketEngine, MemoryConfigRepository, RateLimitGate, RateLimitOrchestrator, TierEvaluator,
};
use tollgate::store::{AtomicCounterStore, MemoryCounterStore, RedisCounterStore};
use tollgate::usage::UsageTracker;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Multi-tier distributed rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<String>,

    /// Override the gRPC listen address
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Override the log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TollgateConfig::from_file(path)?,
        None => TollgateConfig::from_env()?,
    };
    if let Some(addr) = args.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config);

    info!("Starting Tollgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        instance_id = %config.server.instance_id,
        grpc_addr = %config.server.grpc_addr,
        store = ?config.store.backend,
        fail_policy = ?config.rate_limiting.fail_policy,
        "Configuration loaded"
    );

    let store: Arc<dyn AtomicCounterStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-process counter store; limits are not shared between instances");
            let memory = Arc::new(MemoryCounterStore::with_keep_after_refill(
                config.store.keep_after_refill(),
            ));
            spawn_purge_task(memory.clone());
            memory
        }
        StoreBackend::Redis => Arc::new(
            RedisCounterStore::connect(
                &config.store.redis_url,
                &config.store.key_prefix,
                config.store.keep_after_refill(),
            )
            .await?,
        ),
    };

    let catalog = Arc::new(match &config.catalog_path {
        Some(path) => Catalog::from_file(path)?,
        None => {
            warn!("No catalog_path configured; every API key will be rejected");
            Catalog::new()
        }
    });

    let engine = Arc::new(BucketEngine::new(store, config.rate_limiting.store_timeout()));
    let selector = Arc::new(AlgorithmSelector::new(
        Arc::new(MemoryConfigRepository::new()),
        config.rate_limiting.default_algorithm,
    ));

    let system = config.rate_limiting.system.enabled.then(|| {
        TierEvaluator::system(
            engine.clone(),
            selector.clone(),
            config.rate_limiting.system.requests_per_second,
        )
    });
    let orchestrator = RateLimitOrchestrator::new(
        system,
        TierEvaluator::window(engine.clone(), selector.clone()),
        TierEvaluator::monthly(engine, selector.clone()),
        catalog.clone(),
        selector,
    )
    .with_fail_policy(config.rate_limiting.fail_policy)
    .with_default_soft_delay(Duration::from_millis(config.rate_limiting.soft_delay_ms));

    let gate = Arc::new(RateLimitGate::new(
        catalog.clone(),
        catalog,
        Arc::new(orchestrator),
        Arc::new(UsageTracker::with_retention(config.usage.retention_months)),
        config.server.request_timeout(),
    ));
    info!("Rate limiter initialized");

    let grpc_server = GrpcServer::new(config.server.grpc_addr, gate);
    info!(addr = %grpc_server.addr(), "gRPC server configured");

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate Rate Limiting Service stopped");
    Ok(())
}

/// Periodically drop expired buckets from the in-process store.
fn spawn_purge_task(store: Arc<MemoryCounterStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let removed = store.purge_expired();
            if removed > 0 {
                debug!(removed, remaining = store.bucket_count(), "Purged expired buckets");
            }
        }
    });
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(config: &TollgateConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
