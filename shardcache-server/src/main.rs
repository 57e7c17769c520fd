use anyhow::{Context, Result};
use clap::Parser;
use shardcache_server::config::{ConfigWatcher, LoggingConfig, ServerConfig, spawn_file_watch};
use shardcache_server::core::maintenance::spawn_maintenance;
use shardcache_server::core::CacheRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "shardcache")]
#[command(about = "Sharded in-memory cache with pluggable value types", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between checks of the configuration file for changes
    #[arg(long, default_value_t = 5)]
    reload_interval: u64,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    init_tracing(&config.logging);

    info!("Starting Shardcache v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(
        CacheRegistry::from_config(&config).context("building caches from configuration")?,
    );
    info!("Serving {} caches: {:?}", registry.cache_names().len(), registry.cache_names());

    let mut tasks = Vec::new();
    if config.maintenance.enabled {
        tasks.push(spawn_maintenance(
            registry.clone(),
            config.maintenance.schedule(),
        ));
    }

    let watcher = Arc::new(ConfigWatcher::new(config.clone()));
    if let Some(path) = cli.config.clone() {
        tasks.push(spawn_file_watch(
            watcher.clone(),
            path,
            Duration::from_secs(cli.reload_interval.max(1)),
        ));

        let mut revisions = watcher.subscribe();
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            while revisions.changed().await.is_ok() {
                let next = revisions.borrow_and_update().clone();
                match registry.apply_config(&next) {
                    Ok(changes) => info!("Applied configuration: {:?}", changes),
                    Err(e) => error!("Failed to apply configuration: {}", e),
                }
            }
        }));
    }

    if config.logging.info_interval_secs > 0 {
        let registry = registry.clone();
        let period = Duration::from_secs(config.logging.info_interval_secs);
        let json_logs = config.logging.format == "json";
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let info = registry.info();
                if json_logs {
                    info!(summary = %info.to_json(), "Cache summary");
                } else {
                    info!(
                        total_items = info.total_items,
                        retained = %info.retained_human,
                        "Cache summary\n{}",
                        info.to_text()
                    );
                }
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received Ctrl+C, shutting down...");

    for task in &tasks {
        task.abort();
    }

    registry.close();
    info!("Shutdown complete");
    Ok(())
}
