use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::core::engine::{MAX_BIN_CAPACITY, MAX_BINS_PER_BUCKET, MAX_FINGERPRINT_POOL};
use crate::core::maintenance::{MaintenanceSchedule, MemoryPressure};
use crate::core::{EngineConfig, ValueConfig};

/// Main server configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub logging: LoggingConfig,
    pub maintenance: MaintenanceConfig,
    pub pool: PoolConfig,
    pub caches: Vec<CacheConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
    /// Seconds between INFO summaries in the log; 0 disables them
    pub info_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Fixed level for every sweep; unset derives it from memory use
    pub memory_level_percent: Option<u32>,
    /// Budget for retained value bytes; 0 means unbounded
    pub max_memory_mb: usize,
    /// Lowest level memory pressure may push sweeps to
    pub min_level_percent: u32,
    pub min_sweep_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Request fingerprints kept for reuse per cache
    pub fingerprint_capacity: usize,
}

/// One named cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub name: String,
    /// Registered value type; `null` creates the cache without a factory
    #[serde(default = "default_value_type")]
    pub value_type: Option<String>,
    #[serde(default = "default_buckets")]
    pub buckets: usize,
    #[serde(default = "default_bins_per_bucket")]
    pub bins_per_bucket: usize,
    #[serde(default = "default_bin_capacity")]
    pub bin_capacity: usize,
    #[serde(default)]
    pub value: ValueConfig,
}

fn default_value_type() -> Option<String> {
    Some("bytes".to_string())
}

fn default_buckets() -> usize {
    EngineConfig::default().buckets
}

fn default_bins_per_bucket() -> usize {
    EngineConfig::default().bins_per_bucket
}

fn default_bin_capacity() -> usize {
    EngineConfig::default().bin_capacity
}

impl CacheConfig {
    /// Cache of the default value type and shape
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: default_value_type(),
            buckets: default_buckets(),
            bins_per_bucket: default_bins_per_bucket(),
            bin_capacity: default_bin_capacity(),
            value: ValueConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            info_interval_secs: 60,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            memory_level_percent: None,
            max_memory_mb: 1024,
            min_level_percent: 10,
            min_sweep_interval_ms: 0,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            fingerprint_capacity: EngineConfig::default().fingerprint_pool,
        }
    }
}

impl MaintenanceConfig {
    pub fn schedule(&self) -> MaintenanceSchedule {
        MaintenanceSchedule {
            interval: Duration::from_millis(self.interval_ms.max(1)),
            memory_level_percent: self.memory_level_percent,
            pressure: MemoryPressure::new(
                self.max_memory_mb.saturating_mul(1024 * 1024),
                self.min_level_percent,
            ),
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no engine could be built from
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = HashSet::new();
        for cache in &self.caches {
            if cache.name.is_empty() {
                anyhow::bail!("cache name must not be empty");
            }
            if !names.insert(cache.name.as_str()) {
                anyhow::bail!("cache {} is defined twice", cache.name);
            }
            if cache.buckets == 0 || cache.bins_per_bucket == 0 {
                anyhow::bail!(
                    "cache {} needs at least one bucket and one bin per bucket",
                    cache.name
                );
            }
            if cache.bins_per_bucket > MAX_BINS_PER_BUCKET {
                anyhow::bail!(
                    "cache {} bins_per_bucket must be at most {}",
                    cache.name,
                    MAX_BINS_PER_BUCKET
                );
            }
            if cache.bin_capacity > MAX_BIN_CAPACITY {
                anyhow::bail!(
                    "cache {} bin_capacity must be at most {}",
                    cache.name,
                    MAX_BIN_CAPACITY
                );
            }
        }
        if self.pool.fingerprint_capacity > MAX_FINGERPRINT_POOL {
            anyhow::bail!(
                "pool.fingerprint_capacity must be at most {}",
                MAX_FINGERPRINT_POOL
            );
        }
        if self.maintenance.min_level_percent > 100 {
            anyhow::bail!("maintenance.min_level_percent must be at most 100");
        }
        Ok(())
    }

    /// Engine shape and tuning for one of this config's caches
    pub fn engine_config(&self, cache: &CacheConfig) -> EngineConfig {
        EngineConfig {
            buckets: cache.buckets,
            bins_per_bucket: cache.bins_per_bucket,
            bin_capacity: cache.bin_capacity,
            fingerprint_pool: self.pool.fingerprint_capacity,
            min_sweep_interval_ms: self.maintenance.min_sweep_interval_ms,
        }
    }
}

/// Publishes configuration revisions to subscribers
pub struct ConfigWatcher {
    sender: watch::Sender<Arc<ServerConfig>>,
}

impl ConfigWatcher {
    pub fn new(initial: ServerConfig) -> Self {
        let (sender, _) = watch::channel(Arc::new(initial));
        Self { sender }
    }

    pub fn current(&self) -> Arc<ServerConfig> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ServerConfig>> {
        self.sender.subscribe()
    }

    /// Publish `config` unless it equals the current revision
    pub fn publish(&self, config: ServerConfig) -> bool {
        let next = Arc::new(config);
        self.sender.send_if_modified(|current| {
            if **current == *next {
                false
            } else {
                *current = next.clone();
                true
            }
        })
    }

    /// Re-read `path` and publish it when it changed
    pub fn reload_from(&self, path: &Path) -> anyhow::Result<bool> {
        let config = ServerConfig::from_file(path)?;
        Ok(self.publish(config))
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Poll `path` every `poll` and publish each valid new revision.
///
/// Invalid files are logged and skipped; the last good revision stays current.
pub fn spawn_file_watch(
    watcher: Arc<ConfigWatcher>,
    path: PathBuf,
    poll: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seen = modified_at(&path);
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let modified = modified_at(&path);
            if modified == last_seen {
                continue;
            }
            last_seen = modified;

            match watcher.reload_from(&path) {
                Ok(true) => info!("Configuration reloaded from {}", path.display()),
                Ok(false) => {}
                Err(e) => warn!("Ignoring invalid configuration {}: {}", path.display(), e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = ServerConfig::from_yaml("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert!(config.caches.is_empty());
    }

    #[test]
    fn test_cache_defaults() {
        let config = ServerConfig::from_yaml(
            r#"
caches:
  - name: sessions
  - name: bare
    value_type: null
    buckets: 8
"#,
        )
        .unwrap();

        assert_eq!(config.caches[0], CacheConfig::named("sessions"));
        assert_eq!(config.caches[1].value_type, None);
        assert_eq!(config.caches[1].buckets, 8);
        assert_eq!(config.caches[1].bins_per_bucket, 16);
    }

    #[test]
    fn test_duplicate_cache_rejected() {
        let err = ServerConfig::from_yaml(
            r#"
caches:
  - name: a
  - name: a
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_oversized_capacities_rejected() {
        let err = ServerConfig::from_yaml(
            r#"
caches:
  - name: huge
    bin_capacity: 18446744073709551615
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("bin_capacity"));

        let err = ServerConfig::from_yaml("pool:\n  fingerprint_capacity: 100000000\n").unwrap_err();
        assert!(err.to_string().contains("fingerprint_capacity"));
    }

    #[test]
    fn test_engine_config_merges_sections() {
        let mut config = ServerConfig::default();
        config.pool.fingerprint_capacity = 32;
        config.maintenance.min_sweep_interval_ms = 500;
        let cache = CacheConfig::named("c");

        let engine = config.engine_config(&cache);
        assert_eq!(engine.fingerprint_pool, 32);
        assert_eq!(engine.min_sweep_interval_ms, 500);
        assert_eq!(engine.buckets, cache.buckets);
    }

    #[test]
    fn test_watcher_skips_identical_revision() {
        let watcher = ConfigWatcher::new(ServerConfig::default());
        let mut receiver = watcher.subscribe();

        assert!(!watcher.publish(ServerConfig::default()));
        assert!(!receiver.has_changed().unwrap());

        let mut next = ServerConfig::default();
        next.caches.push(CacheConfig::named("new"));
        assert!(watcher.publish(next));
        assert!(receiver.has_changed().unwrap());
        assert_eq!(receiver.borrow_and_update().caches.len(), 1);
        assert_eq!(watcher.current().caches[0].name, "new");
    }

    #[tokio::test]
    async fn test_subscriber_wakes_on_publish() {
        let watcher = Arc::new(ConfigWatcher::new(ServerConfig::default()));
        let mut receiver = watcher.subscribe();

        let publisher = watcher.clone();
        tokio::spawn(async move {
            let mut next = ServerConfig::default();
            next.maintenance.interval_ms = 250;
            publisher.publish(next);
        });

        tokio::time::timeout(Duration::from_secs(5), receiver.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(receiver.borrow().maintenance.interval_ms, 250);
    }
}
