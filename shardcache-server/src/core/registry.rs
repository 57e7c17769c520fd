//! Cache registry
//!
//! The per-process context object that owns every named cache, the value type
//! table and the metrics families. Nothing here is static, so several
//! registries can live side by side in one process.

use super::engine::CacheEngine;
use super::error::{CacheError, Result};
use super::maintenance::{MaintenanceRequest, MaintenanceResponse};
use super::types::EngineConfig;
use super::values::{ValueConfig, ValueTypeRegistry};
use crate::config::ServerConfig;
use crate::metrics::{CacheMetrics, MetricsFamily};
use crate::monitoring::{CacheInfo, RegistryInfo};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

struct CacheEntry {
    engine: Arc<CacheEngine>,
    metrics: Arc<CacheMetrics>,
    value_type: Option<String>,
    /// Created by `apply_config`, so removed when the config drops it
    managed: bool,
}

/// What `apply_config` changed
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigChanges {
    pub created: Vec<String>,
    pub closed: Vec<String>,
    pub resized: Vec<String>,
    pub retyped: Vec<String>,
    pub reconfigured: Vec<String>,
}

impl ConfigChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.closed.is_empty()
            && self.resized.is_empty()
            && self.retyped.is_empty()
            && self.reconfigured.is_empty()
    }
}

/// Named caches plus the shared context they are built from
pub struct CacheRegistry {
    caches: RwLock<HashMap<String, CacheEntry>>,
    value_types: ValueTypeRegistry,
    metrics: MetricsFamily,
    prometheus: prometheus::Registry,
    started: Instant,
}

impl CacheRegistry {
    pub fn new(value_types: ValueTypeRegistry) -> Self {
        Self::with_prometheus(value_types, prometheus::Registry::new())
    }

    /// Registry whose metrics land in an existing Prometheus registry
    pub fn with_prometheus(value_types: ValueTypeRegistry, prometheus: prometheus::Registry) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            metrics: MetricsFamily::new(&prometheus),
            value_types,
            prometheus,
            started: Instant::now(),
        }
    }

    /// Registry with the built-in value types and every cache in `config`
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let registry = Self::new(ValueTypeRegistry::with_builtins());
        registry.apply_config(config)?;
        Ok(registry)
    }

    pub fn value_types(&self) -> &ValueTypeRegistry {
        &self.value_types
    }

    pub fn prometheus(&self) -> &prometheus::Registry {
        &self.prometheus
    }

    /// Create a cache. `value_type` of `None` leaves it without a factory
    /// until one is installed.
    pub fn create_cache(
        &self,
        name: &str,
        value_type: Option<&str>,
        engine: &EngineConfig,
        value: &ValueConfig,
    ) -> Result<Arc<CacheEngine>> {
        self.insert_cache(name, value_type, engine, value, false)
    }

    fn insert_cache(
        &self,
        name: &str,
        value_type: Option<&str>,
        engine: &EngineConfig,
        value: &ValueConfig,
        managed: bool,
    ) -> Result<Arc<CacheEngine>> {
        let mut caches = self.caches.write();
        if caches.contains_key(name) {
            return Err(CacheError::CacheExists(name.to_string()));
        }

        let factory = value_type
            .map(|type_name| self.value_types.create(type_name, value))
            .transpose()?;
        let metrics = self.metrics.for_cache(name);
        let cache = match CacheEngine::new(name, engine, factory, metrics.clone()) {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                self.metrics.remove_cache(name);
                return Err(e);
            }
        };

        caches.insert(
            name.to_string(),
            CacheEntry {
                engine: cache.clone(),
                metrics,
                value_type: value_type.map(str::to_string),
                managed,
            },
        );
        info!(
            "Cache {} created (type={}, buckets={}, bins_per_bucket={})",
            name,
            value_type.unwrap_or("none"),
            engine.buckets,
            engine.bins_per_bucket
        );
        Ok(cache)
    }

    /// Close and forget a cache; false when it did not exist
    pub fn remove_cache(&self, name: &str) -> bool {
        let Some(entry) = self.caches.write().remove(name) else {
            return false;
        };
        entry.engine.close();
        self.metrics.remove_cache(name);
        info!("Cache {} removed", name);
        true
    }

    /// Install a value type on an existing cache, optionally upgrading the
    /// values it already holds. Returns the upgrade fault count.
    pub fn set_value_type(&self, name: &str, value_type: &str, upgrade: bool) -> Result<usize> {
        let cache = self.cache(name)?;
        let config = cache
            .factory()
            .map(|factory| factory.configuration())
            .unwrap_or_default();
        let factory = self.value_types.create(value_type, &config)?;
        let faults = cache.replace_factory(factory, upgrade);

        if let Some(entry) = self.caches.write().get_mut(name) {
            entry.value_type = Some(value_type.to_string());
        }
        Ok(faults)
    }

    pub fn cache(&self, name: &str) -> Result<Arc<CacheEngine>> {
        self.caches
            .read()
            .get(name)
            .map(|entry| entry.engine.clone())
            .ok_or_else(|| CacheError::UnknownCache(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.caches.read().contains_key(name)
    }

    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn write_only(&self, cache: &str, key: &[u8], request: Option<&[u8]>) -> Result<()> {
        self.cache(cache)?.write_only(key, request)
    }

    /// Apply one request to every key in order. Every key is attempted; the
    /// first failure is returned afterwards.
    pub fn write_many(&self, cache: &str, keys: &[&[u8]], request: Option<&[u8]>) -> Result<()> {
        let engine = self.cache(cache)?;
        first_error(keys.iter().map(|key| engine.write_only(key, request)))
    }

    /// Apply `requests[i]` to `keys[i]`, with the same failure rule as `write_many`
    pub fn write_pairs(
        &self,
        cache: &str,
        keys: &[&[u8]],
        requests: &[Option<&[u8]>],
    ) -> Result<()> {
        check_paired(keys.len(), requests.len())?;
        let engine = self.cache(cache)?;
        first_error(
            keys.iter()
                .zip(requests)
                .map(|(key, request)| engine.write_only(key, *request)),
        )
    }

    pub fn read_only(&self, cache: &str, key: &[u8], request: &[u8]) -> Result<Option<Vec<u8>>> {
        self.cache(cache)?.read_only(key, request)
    }

    /// Read every key with one request. A key that is absent or fails yields
    /// `None` at its position.
    pub fn read_many(
        &self,
        cache: &str,
        keys: &[&[u8]],
        request: &[u8],
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let engine = self.cache(cache)?;
        engine.factory()?;
        Ok(keys
            .iter()
            .map(|key| absorb(cache, engine.read_only(key, request)))
            .collect())
    }

    /// Read `keys[i]` with `requests[i]`, with the same rule as `read_many`
    pub fn read_pairs(
        &self,
        cache: &str,
        keys: &[&[u8]],
        requests: &[&[u8]],
    ) -> Result<Vec<Option<Vec<u8>>>> {
        check_paired(keys.len(), requests.len())?;
        let engine = self.cache(cache)?;
        engine.factory()?;
        Ok(keys
            .iter()
            .zip(requests)
            .map(|(key, request)| absorb(cache, engine.read_only(key, request)))
            .collect())
    }

    pub fn delete(&self, cache: &str, key: &[u8]) -> Result<bool> {
        Ok(self.cache(cache)?.delete(key))
    }

    pub fn flush(&self, cache: &str, duration_ms: u64) -> Result<u64> {
        Ok(self.cache(cache)?.flush(duration_ms))
    }

    pub fn item_count(&self, cache: &str) -> Result<u64> {
        Ok(self.cache(cache)?.get_item_count())
    }

    fn engines(&self) -> Vec<Arc<CacheEngine>> {
        self.caches
            .read()
            .values()
            .map(|entry| entry.engine.clone())
            .collect()
    }

    /// Sweep every cache with the same request and sum the results
    pub fn do_maintenance(&self, request: &MaintenanceRequest) -> MaintenanceResponse {
        let mut total = MaintenanceResponse::default();
        for engine in self.engines() {
            total.merge(&engine.do_maintenance(request));
        }
        total
    }

    /// Bring the cache set in line with `config`.
    ///
    /// Caches named in the config are created or updated in place. Caches a
    /// previous config created and this one omits are closed. Caches created
    /// through `create_cache` are never removed here.
    pub fn apply_config(&self, config: &ServerConfig) -> Result<ConfigChanges> {
        let mut changes = ConfigChanges::default();

        for cache in &config.caches {
            let engine_config = config.engine_config(cache);
            let value_type = cache.value_type.as_deref();

            let existing = self.caches.read().get(&cache.name).map(|entry| {
                (entry.engine.clone(), entry.value_type.clone())
            });
            let Some((engine, current_type)) = existing else {
                self.insert_cache(&cache.name, value_type, &engine_config, &cache.value, true)?;
                changes.created.push(cache.name.clone());
                continue;
            };

            let before = engine.stats();
            engine.reconfigure(&engine_config)?;
            if before.bucket_count != engine_config.buckets
                || before.bins_per_bucket != engine_config.bins_per_bucket
            {
                changes.resized.push(cache.name.clone());
            }

            match value_type {
                Some(type_name) if current_type.as_deref() != Some(type_name) => {
                    let factory = self.value_types.create(type_name, &cache.value)?;
                    let faults = engine.replace_factory(factory, true);
                    if faults > 0 {
                        warn!("Cache {}: {} values failed to upgrade", cache.name, faults);
                    }
                    if let Some(entry) = self.caches.write().get_mut(&cache.name) {
                        entry.value_type = Some(type_name.to_string());
                    }
                    changes.retyped.push(cache.name.clone());
                }
                Some(_) => {
                    let unchanged = engine
                        .factory()
                        .is_ok_and(|factory| factory.configuration() == cache.value);
                    if !unchanged {
                        let faults = engine.update_configuration(&cache.value)?;
                        if faults > 0 {
                            warn!("Cache {}: {} values rejected new settings", cache.name, faults);
                        }
                        changes.reconfigured.push(cache.name.clone());
                    }
                }
                None => {
                    if current_type.is_some() {
                        engine.set_factory(None);
                        if let Some(entry) = self.caches.write().get_mut(&cache.name) {
                            entry.value_type = None;
                        }
                        changes.retyped.push(cache.name.clone());
                    }
                }
            }
        }

        let stale: Vec<String> = self
            .caches
            .read()
            .iter()
            .filter(|(name, entry)| {
                entry.managed && !config.caches.iter().any(|cache| &cache.name == *name)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if self.remove_cache(&name) {
                changes.closed.push(name);
            }
        }

        if !changes.is_empty() {
            info!(
                "Configuration applied: {} created, {} closed, {} resized, {} retyped, {} reconfigured",
                changes.created.len(),
                changes.closed.len(),
                changes.resized.len(),
                changes.retyped.len(),
                changes.reconfigured.len()
            );
        }
        Ok(changes)
    }

    /// INFO-style view of every cache
    pub fn info(&self) -> RegistryInfo {
        let caches = self.caches.read();
        let mut infos: Vec<CacheInfo> = caches
            .iter()
            .map(|(name, entry)| {
                CacheInfo::collect(
                    name,
                    entry.value_type.as_deref(),
                    &entry.engine,
                    entry.metrics.snapshot(),
                )
            })
            .collect();
        drop(caches);
        infos.sort_by(|a, b| a.name.cmp(&b.name));

        RegistryInfo::new(self.started.elapsed().as_secs(), infos)
    }

    /// Close every cache's factory; the caches stay registered
    pub fn close(&self) {
        for engine in self.engines() {
            engine.close();
        }
        debug!("All caches closed");
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new(ValueTypeRegistry::with_builtins())
    }
}

fn check_paired(keys: usize, requests: usize) -> Result<()> {
    if keys != requests {
        return Err(CacheError::InvalidRequest(format!(
            "{keys} keys paired with {requests} requests"
        )));
    }
    Ok(())
}

fn first_error(results: impl Iterator<Item = Result<()>>) -> Result<()> {
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

fn absorb(cache: &str, result: Result<Option<Vec<u8>>>) -> Option<Vec<u8>> {
    result.unwrap_or_else(|e| {
        debug!("Batch read on {} failed for one key: {}", cache, e);
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn registry_with(name: &str) -> CacheRegistry {
        let registry = CacheRegistry::default();
        registry
            .create_cache(name, Some("bytes"), &EngineConfig::default(), &ValueConfig::default())
            .unwrap();
        registry
    }

    #[test]
    fn test_unknown_cache() {
        let registry = CacheRegistry::default();
        assert!(matches!(
            registry.write_only("nope", b"k", Some(b"v")),
            Err(CacheError::UnknownCache(_))
        ));
        assert!(matches!(
            registry.read_many("nope", &[b"k".as_slice()], &[]),
            Err(CacheError::UnknownCache(_))
        ));
    }

    #[test]
    fn test_duplicate_cache_rejected() {
        let registry = registry_with("c");
        assert!(matches!(
            registry.create_cache("c", None, &EngineConfig::default(), &ValueConfig::default()),
            Err(CacheError::CacheExists(_))
        ));
    }

    #[test]
    fn test_oversized_bin_capacity_is_a_configuration_error() {
        let registry = CacheRegistry::default();
        let engine = EngineConfig {
            bin_capacity: usize::MAX,
            ..Default::default()
        };

        let err = registry
            .create_cache("huge", Some("bytes"), &engine, &ValueConfig::default())
            .err().unwrap();
        assert!(err.is_configuration_error());
        assert!(!registry.contains("huge"));
        assert!(!crate::metrics::encode_text(registry.prometheus()).contains("cache=\"huge\""));
    }

    #[test]
    fn test_unknown_value_type_creates_nothing() {
        let registry = CacheRegistry::default();
        assert!(matches!(
            registry.create_cache("c", Some("tiles"), &EngineConfig::default(), &ValueConfig::default()),
            Err(CacheError::UnknownValueType(_))
        ));
        assert!(!registry.contains("c"));
    }

    #[test]
    fn test_empty_batches() {
        let registry = registry_with("c");
        registry.write_many("c", &[], Some(b"v")).unwrap();
        assert!(registry.read_many("c", &[], &[]).unwrap().is_empty());
        assert_eq!(registry.item_count("c").unwrap(), 0);
    }

    #[test]
    fn test_paired_length_mismatch() {
        let registry = registry_with("c");
        assert!(matches!(
            registry.write_pairs("c", &[b"a".as_slice(), b"b"], &[Some(b"1".as_slice())]),
            Err(CacheError::InvalidRequest(_))
        ));
        assert!(matches!(
            registry.read_pairs("c", &[b"a".as_slice()], &[]),
            Err(CacheError::InvalidRequest(_))
        ));
        assert_eq!(registry.item_count("c").unwrap(), 0);
    }

    #[test]
    fn test_cache_without_factory() {
        let registry = CacheRegistry::default();
        registry
            .create_cache("bare", None, &EngineConfig::default(), &ValueConfig::default())
            .unwrap();

        assert!(matches!(
            registry.write_only("bare", b"k", Some(b"v")),
            Err(CacheError::NoFactory(_))
        ));
        assert!(matches!(
            registry.read_many("bare", &[b"k".as_slice()], &[]),
            Err(CacheError::NoFactory(_))
        ));

        registry.set_value_type("bare", "bytes", false).unwrap();
        registry.write_only("bare", b"k", Some(b"v")).unwrap();
        assert_eq!(registry.item_count("bare").unwrap(), 1);
    }

    #[test]
    fn test_apply_config_lifecycle() {
        let registry = CacheRegistry::default();
        let mut config = ServerConfig::default();
        config.caches = vec![CacheConfig::named("sessions"), CacheConfig::named("pages")];

        let changes = registry.apply_config(&config).unwrap();
        assert_eq!(changes.created.len(), 2);

        registry.write_only("sessions", b"user:1", Some(b"token")).unwrap();

        config.caches[0].buckets = 3;
        config.caches[0].value.max_age_ms = 120_000;
        config.caches.truncate(1);
        let changes = registry.apply_config(&config).unwrap();

        assert_eq!(changes.resized, vec!["sessions".to_string()]);
        assert_eq!(changes.reconfigured, vec!["sessions".to_string()]);
        assert_eq!(changes.closed, vec!["pages".to_string()]);
        assert_eq!(registry.cache_names(), vec!["sessions".to_string()]);
        assert_eq!(
            registry.read_only("sessions", b"user:1", &[]).unwrap(),
            Some(b"token".to_vec())
        );

        // same config again changes nothing
        assert!(registry.apply_config(&config).unwrap().is_empty());
    }

    #[test]
    fn test_apply_config_leaves_programmatic_caches() {
        let registry = registry_with("manual");
        registry.apply_config(&ServerConfig::default()).unwrap();
        assert!(registry.contains("manual"));
    }

    #[test]
    fn test_remove_cache() {
        let registry = registry_with("c");
        assert!(registry.remove_cache("c"));
        assert!(!registry.remove_cache("c"));
        assert!(matches!(registry.item_count("c"), Err(CacheError::UnknownCache(_))));
    }

    #[test]
    fn test_info_lists_caches() {
        let registry = registry_with("b");
        registry
            .create_cache("a", Some("latency"), &EngineConfig::default(), &ValueConfig::default())
            .unwrap();
        registry.write_only("b", b"k", Some(b"v")).unwrap();

        let info = registry.info();
        let names: Vec<&str> = info.caches.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(info.caches[1].items, 1);
        assert_eq!(info.caches[0].value_type.as_deref(), Some("latency"));
    }
}
