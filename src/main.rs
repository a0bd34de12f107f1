use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llamactl::api::ApiServer;
use llamactl::config::EngineConfig;
use llamactl::manager::Manager;
use llamactl::pool::{ConnectionPool, PoolConfig};
use llamactl::proxy::ProxyServer;
use llamactl::reaper;

/// Reads an env var with a default, falling back to `EngineConfig`'s own
/// defaults when no config knob was set. Loading settings from a config
/// file/CLI is explicitly out of scope (§1); this is the minimal amount of
/// wiring needed to run.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn load_config() -> EngineConfig {
    let data_dir: PathBuf = env_or("LLAMACTL_DATA_DIR", PathBuf::from("./data"));
    let db_path = data_dir.join("llamactl.db");
    EngineConfig {
        port_range_low: env_or("LLAMACTL_PORT_RANGE_LOW", 8100),
        port_range_high: env_or("LLAMACTL_PORT_RANGE_HIGH", 8199),
        max_instances: env_or("LLAMACTL_MAX_INSTANCES", 64),
        max_running_instances: env_or("LLAMACTL_MAX_RUNNING_INSTANCES", 4),
        enable_lru_eviction: env_or("LLAMACTL_ENABLE_LRU_EVICTION", true),
        on_demand_start_timeout_secs: env_or("LLAMACTL_ON_DEMAND_START_TIMEOUT_SECS", 120),
        timeout_check_interval_minutes: env_or("LLAMACTL_TIMEOUT_CHECK_INTERVAL_MINUTES", 1),
        graceful_stop_secs: env_or("LLAMACTL_GRACEFUL_STOP_SECS", 30),
        data_dir,
        db_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config();
    std::fs::create_dir_all(&config.data_dir)?;
    let interval_minutes = config.timeout_check_interval_minutes;
    let proxy_bind: SocketAddr = env_or("LLAMACTL_PROXY_BIND", "0.0.0.0:8080".parse().unwrap());
    let api_bind: SocketAddr = env_or("LLAMACTL_API_BIND", "127.0.0.1:8081".parse().unwrap());

    let manager = Manager::new(config)?;
    info!("running startup recovery");
    manager.recover().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let proxy = ProxyServer::new(proxy_bind, Arc::clone(&manager), pool, shutdown_rx.clone());
    let api = ApiServer::new(api_bind, Arc::clone(&manager), shutdown_rx.clone());

    let proxy_task = tokio::spawn(proxy.run());
    let api_task = tokio::spawn(api.run());
    let reaper_task = tokio::spawn(reaper::run(
        Arc::clone(&manager),
        interval_minutes,
        shutdown_rx.clone(),
    ));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    manager.shutdown_all().await;

    let shutdown_budget = std::time::Duration::from_secs(5);
    let _ = tokio::time::timeout(
        shutdown_budget,
        async { tokio::join!(proxy_task, api_task, reaper_task) },
    )
    .await;

    Ok(())
}
