// Configuration Tests
// Loading ServerConfig from YAML files, defaults, validation, and applying
// revisions to a live registry

use std::fs;
use shardcache_server::core::CacheRegistry;
use shardcache_server::{ConfigWatcher, ServerConfig};
use tempfile::TempDir;

const SAMPLE: &str = r#"
logging:
  level: debug
  format: pretty
maintenance:
  interval_ms: 250
  max_memory_mb: 64
  min_level_percent: 20
caches:
  - name: sessions
    buckets: 32
    bins_per_bucket: 8
    value:
      max_age_ms: 900000
  - name: slow
    value_type: latency
    value:
      latency_ms: 2
      settings:
        read_latency_ms: "1"
"#;

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("shardcache.yml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_config_default_values() {
    let config = ServerConfig::default();

    assert_eq!(config.logging.level, "info");
    assert_eq!(config.logging.format, "json");
    assert!(config.maintenance.enabled);
    assert_eq!(config.maintenance.interval_ms, 1000);
    assert_eq!(config.maintenance.memory_level_percent, None);
    assert_eq!(config.pool.fingerprint_capacity, 256);
    assert!(config.caches.is_empty());
}

#[test]
fn test_config_from_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, SAMPLE);

    let config = ServerConfig::from_file(&path).unwrap();
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.maintenance.interval_ms, 250);
    assert_eq!(config.caches.len(), 2);

    let sessions = &config.caches[0];
    assert_eq!(sessions.value_type.as_deref(), Some("bytes"));
    assert_eq!(sessions.buckets, 32);
    assert_eq!(sessions.value.max_age_ms, 900_000);

    let slow = &config.caches[1];
    assert_eq!(slow.value.latency_ms, 2);
    assert_eq!(slow.value.setting("read_latency_ms"), Some("1"));

    let schedule = config.maintenance.schedule();
    assert_eq!(schedule.interval.as_millis(), 250);
    // twice the 64MB budget halves the level
    assert_eq!(schedule.pressure.level_percent(128 * 1024 * 1024), 50);
}

#[test]
fn test_missing_and_invalid_files() {
    let dir = TempDir::new().unwrap();
    assert!(ServerConfig::from_file(dir.path().join("absent.yml")).is_err());

    let path = write_config(&dir, "caches: [ { name: x, buckets: 0 } ]");
    let err = ServerConfig::from_file(&path).unwrap_err();
    assert!(err.to_string().contains("at least one bucket"));

    let path = write_config(&dir, "caches: 12");
    assert!(ServerConfig::from_file(&path).is_err());
}

#[test]
fn test_registry_from_config() {
    let config = ServerConfig::from_yaml(SAMPLE).unwrap();
    let registry = CacheRegistry::from_config(&config).unwrap();

    assert_eq!(registry.cache_names(), vec!["sessions", "slow"]);
    let stats = registry.cache("sessions").unwrap().stats();
    assert_eq!(stats.bucket_count, 32);
    assert_eq!(stats.bins_per_bucket, 8);
}

#[test]
fn test_unknown_value_type_in_config() {
    let config = ServerConfig::from_yaml("caches: [ { name: x, value_type: tiles } ]").unwrap();
    assert!(CacheRegistry::from_config(&config).is_err());
}

#[test]
fn test_reload_applies_new_revision() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, SAMPLE);
    let config = ServerConfig::from_file(&path).unwrap();
    let registry = CacheRegistry::from_config(&config).unwrap();
    let watcher = ConfigWatcher::new(config);
    let mut revisions = watcher.subscribe();

    registry
        .write_only("sessions", b"user:7", Some(b"token"))
        .unwrap();

    // unchanged file publishes nothing
    assert!(!watcher.reload_from(&path).unwrap());

    let edited = SAMPLE.replace("buckets: 32", "buckets: 4").replace(
        "  - name: slow\n    value_type: latency\n    value:\n      latency_ms: 2\n      settings:\n        read_latency_ms: \"1\"\n",
        "",
    );
    write_config(&dir, &edited);
    assert!(watcher.reload_from(&path).unwrap());
    assert!(revisions.has_changed().unwrap());

    let next = revisions.borrow_and_update().clone();
    let changes = registry.apply_config(&next).unwrap();
    assert_eq!(changes.resized, vec!["sessions"]);
    assert_eq!(changes.closed, vec!["slow"]);
    assert_eq!(
        registry.read_only("sessions", b"user:7", &[]).unwrap(),
        Some(b"token".to_vec())
    );
}

#[test]
fn test_invalid_reload_keeps_current_revision() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, SAMPLE);
    let watcher = ConfigWatcher::new(ServerConfig::from_file(&path).unwrap());

    write_config(&dir, "caches: [ { name: a }, { name: a } ]");
    assert!(watcher.reload_from(&path).is_err());
    assert_eq!(watcher.current().caches.len(), 2);
}
