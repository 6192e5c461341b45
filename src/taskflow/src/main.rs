//! Taskflow: multi-tenant AI chat backend with metered plans.
//!
//! Main entry point that wires the store, cache and model, then serves HTTP.

use std::sync::Arc;

use clap::Parser;
use taskflow_api::{AppState, ApiServer, ChatModel, OpenAiChatModel, UnconfiguredModel};
use taskflow_cache::{CacheBackend, LocalCache, RedisCache};
use taskflow_core::config::{AppConfig, CacheBackendKind};
use taskflow_core::{Clock, SystemClock};
use taskflow_store::Database;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "taskflow")]
#[command(about = "Multi-tenant AI chat backend with usage-metered plans")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "TASKFLOW__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "TASKFLOW__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Prometheus exporter port (overrides config)
    #[arg(long, env = "TASKFLOW__API__METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Keep rate-limit counters in process instead of Redis
    #[arg(long, default_value_t = false)]
    memory_cache: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskflow=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Taskflow starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(port) = cli.metrics_port {
        config.api.metrics_port = port;
    }
    if cli.memory_cache {
        config.cache.backend = CacheBackendKind::Memory;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        metrics_port = config.api.metrics_port,
        cache = ?config.cache.backend,
        payments = config.payments.is_configured(),
        email = config.email.api_key.is_some(),
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db = Arc::new(Database::new());

    let cache: Arc<dyn CacheBackend> = match config.cache.backend {
        CacheBackendKind::Redis => match RedisCache::new(&config.cache).await {
            Ok(redis) => Arc::new(redis),
            Err(e) => {
                error!(error = %e, "Failed to connect to Redis, falling back to in-process cache");
                local_cache(clock.clone())
            }
        },
        CacheBackendKind::Memory => local_cache(clock.clone()),
    };

    let model: Arc<dyn ChatModel> = match OpenAiChatModel::from_config(&config.llm) {
        Some(model) => {
            info!(model = model.model_name(), "Chat model configured");
            Arc::new(model)
        }
        None => {
            warn!("llm.api_key not set; chat requests will fail");
            Arc::new(UnconfiguredModel)
        }
    };

    let state = AppState::new(config, db, cache, clock, model)?;
    info!(algorithm = ?state.rate_limiter.algorithm(), "Rate limiter ready");
    let api_server = ApiServer::new(state);

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Taskflow is ready to serve traffic");

    api_server.start_http().await?;

    Ok(())
}

/// In-process cache plus a task that sweeps expired keys every minute.
fn local_cache(clock: Arc<dyn Clock>) -> Arc<dyn CacheBackend> {
    let cache = Arc::new(LocalCache::new(clock));
    let sweeper = cache.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let evicted = sweeper.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, "Expired cache keys swept");
            }
        }
    });
    cache
}
