//! Pluggable value types
//!
//! The engine never interprets what a slot holds. Each value type implements
//! [`CacheValue`] and owns its own timestamps, expiry horizon and size
//! accounting. Value types are produced by a [`ValueFactory`], looked up by
//! type identifier in a [`ValueTypeRegistry`].
//!
//! # Architecture
//! ```text
//! ValueTypeRegistry
//!   ├─ "bytes"   -> BytesFactory   -> BytesValue   (raw pass-through with TTL)
//!   └─ "latency" -> LatencyFactory -> LatencyValue (simulated I/O latency)
//! ```

use super::error::{CacheError, Result};
use super::fingerprint::KeyFingerprint;
use super::types::{Retention, Timestamp};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod bytes;
pub mod latency;

pub use bytes::{BytesFactory, BytesValue};
pub use latency::{LatencyFactory, LatencyValue};

/// Capability interface every cached value type implements
pub trait CacheValue: Send + Sync + 'static {
    /// Identifier of the value type, matching its registry entry
    fn type_name(&self) -> &'static str;

    /// Apply new type-level settings to this live value
    fn update_configuration(&mut self, config: &ValueConfig);

    /// Force values last written at or before `flush_horizon` to expire
    fn flush(&mut self, now: Timestamp, flush_horizon: Timestamp);

    /// Evaluate age against the horizon scaled by `memory_level_percent / 100`
    fn do_maintenance(&mut self, now: Timestamp, memory_level_percent: u32) -> Result<Retention>;

    /// Whether the owning slot may be discarded
    fn can_delete(&self) -> bool;

    /// Approximate heap footprint in bytes
    fn size(&self) -> usize;

    /// Apply a write; `None` clears the value
    fn write_only(&mut self, request: Option<&[u8]>) -> Result<()>;

    /// Answer a read. Runs under the slot's shared lock.
    fn read_only(&self, request: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Adopt state from an instance built by a previous factory
    fn upgrade_from(&mut self, _previous: &dyn CacheValue) {}

    fn as_any(&self) -> &dyn Any;
}

/// Produces value instances for one cache
pub trait ValueFactory: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn create_object(&self) -> Result<Box<dyn CacheValue>>;

    fn create_object_for_key(&self, _key: &KeyFingerprint) -> Result<Box<dyn CacheValue>> {
        self.create_object()
    }

    fn update_configuration(&self, config: &ValueConfig);

    fn configuration(&self) -> ValueConfig;

    /// Release factory resources; later creations fail
    fn close(&self) {}
}

/// Settings handed to value factories and live values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueConfig {
    /// Full age horizon in milliseconds; 0 disables age-based removal
    pub max_age_ms: u64,
    /// Simulated latency for reference value types
    pub latency_ms: u64,
    /// Free-form type-specific settings
    pub settings: HashMap<String, String>,
}

impl Default for ValueConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 3_600_000,
            latency_ms: 0,
            settings: HashMap::new(),
        }
    }
}

impl ValueConfig {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    /// Parse a setting, falling back to `default` when absent or malformed
    pub fn setting_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.setting(key)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default)
    }
}

/// Write/read timestamps and expiry decisions shared by the built-in types
#[derive(Debug)]
pub struct AgeTracker {
    written_at: Timestamp,
    last_read: AtomicU64,
    max_age_ms: u64,
    doomed: bool,
}

impl AgeTracker {
    pub fn new(now: Timestamp, max_age_ms: u64) -> Self {
        Self {
            written_at: now,
            last_read: AtomicU64::new(0),
            max_age_ms,
            doomed: false,
        }
    }

    pub fn record_write(&mut self, now: Timestamp) {
        self.written_at = now;
        self.doomed = false;
    }

    /// Reads only hold the shared lock, hence the atomic
    pub fn record_read(&self, now: Timestamp) {
        self.last_read.store(now, Ordering::Relaxed);
    }

    pub fn written_at(&self) -> Timestamp {
        self.written_at
    }

    pub fn last_read(&self) -> Timestamp {
        self.last_read.load(Ordering::Relaxed)
    }

    pub fn max_age_ms(&self) -> u64 {
        self.max_age_ms
    }

    pub fn set_max_age(&mut self, max_age_ms: u64) {
        self.max_age_ms = max_age_ms;
    }

    pub fn age(&self, now: Timestamp) -> u64 {
        now.saturating_sub(self.written_at)
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed
    }

    /// Past the full horizon or flushed
    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.doomed || (self.max_age_ms > 0 && self.age(now) >= self.max_age_ms)
    }

    /// Classify against the full and the pressure-scaled horizon, dooming the
    /// value when either is reached
    pub fn assess(&mut self, now: Timestamp, memory_level_percent: u32) -> Retention {
        if self.doomed {
            return Retention::Expired;
        }
        if self.max_age_ms == 0 {
            return Retention::Keep;
        }

        let age = self.age(now);
        let scaled = (u128::from(self.max_age_ms) * u128::from(memory_level_percent) / 100)
            .min(u128::from(u64::MAX)) as u64;

        let verdict = if age >= self.max_age_ms {
            Retention::Expired
        } else if age >= scaled {
            Retention::Evicted
        } else {
            Retention::Keep
        };
        self.doomed = verdict != Retention::Keep;
        verdict
    }

    /// Push the write timestamp to the epoch when it is at or before the horizon
    pub fn flush(&mut self, flush_horizon: Timestamp) {
        if self.written_at <= flush_horizon {
            self.written_at = 0;
            self.doomed = true;
        }
    }

    pub fn copy_from(&mut self, other: &AgeTracker) {
        self.written_at = other.written_at;
        self.last_read.store(other.last_read(), Ordering::Relaxed);
        self.doomed = other.doomed;
    }
}

/// Builds a factory for one value type from its settings
pub type FactoryConstructor = fn(&ValueConfig) -> Arc<dyn ValueFactory>;

/// Type identifier to factory constructor table
#[derive(Clone)]
pub struct ValueTypeRegistry {
    constructors: AHashMap<String, FactoryConstructor>,
}

impl ValueTypeRegistry {
    /// Registry without any value types
    pub fn empty() -> Self {
        Self {
            constructors: AHashMap::new(),
        }
    }

    /// Registry with the built-in `bytes` and `latency` types
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(bytes::TYPE_NAME, bytes::construct);
        registry.register(latency::TYPE_NAME, latency::construct);
        registry
    }

    /// Add or replace a value type
    pub fn register(&mut self, type_name: &str, constructor: FactoryConstructor) {
        self.constructors.insert(type_name.to_string(), constructor);
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub fn create(&self, type_name: &str, config: &ValueConfig) -> Result<Arc<dyn ValueFactory>> {
        self.constructors
            .get(type_name)
            .map(|constructor| constructor(config))
            .ok_or_else(|| CacheError::UnknownValueType(type_name.to_string()))
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ValueTypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
