//! Prometheus Metrics for Shardcache
//!
//! Counter families are created once per [`prometheus::Registry`] and handed to
//! each cache engine as a [`CacheObserver`], labelled by cache name:
//! - Item count gauge
//! - Create / write / read (hit, miss) counters
//! - Expire / evict / flush counters
//! - Lock contention and value fault counters
//!
//! Every notification is fire-and-forget. A metrics failure never reaches the
//! caller of a cache operation.

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Operations a value fault can be reported for
pub const FAULT_OPERATIONS: &[&str] = &[
    "create_object",
    "write_only",
    "read_only",
    "flush",
    "do_maintenance",
    "can_delete",
    "update_configuration",
    "upgrade_from",
];

/// Notifications a cache engine emits while serving requests
pub trait CacheObserver: Send + Sync {
    /// Live item count changed by `delta`
    fn item_count_delta(&self, delta: i64);
    /// A new value slot was created through the factory
    fn created(&self);
    /// A value accepted a write
    fn written(&self);
    /// A read completed; `hit` is false when nothing was returned
    fn read(&self, hit: bool);
    /// Entries removed at their full age horizon
    fn expired(&self, count: u64);
    /// Entries removed early because of memory pressure
    fn evicted(&self, count: u64);
    /// Entries removed by a caller-requested flush
    fn flushed(&self, count: u64);
    /// A slot lock was contended before being acquired
    fn lock_contended(&self, exclusive: bool);
    /// A value type faulted during `operation`
    fn fault(&self, operation: &str);
}

/// Observer that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CacheObserver for NoopObserver {
    fn item_count_delta(&self, _delta: i64) {}
    fn created(&self) {}
    fn written(&self) {}
    fn read(&self, _hit: bool) {}
    fn expired(&self, _count: u64) {}
    fn evicted(&self, _count: u64) {}
    fn flushed(&self, _count: u64) {}
    fn lock_contended(&self, _exclusive: bool) {}
    fn fault(&self, _operation: &str) {}
}

/// Counter families shared by all caches registered in one registry
#[derive(Clone)]
pub struct MetricsFamily {
    events: IntCounterVec,
    items: IntGaugeVec,
    contention: IntCounterVec,
    faults: IntCounterVec,
}

impl MetricsFamily {
    /// Create the families and register them in `registry`.
    ///
    /// Registration errors are logged; the families still count in memory.
    pub fn new(registry: &Registry) -> Self {
        let events = IntCounterVec::new(
            Opts::new(
                "shardcache_events_total",
                "Cache events by cache name and event type",
            ),
            &["cache", "event"],
        )
        .expect("valid metric definition");
        let items = IntGaugeVec::new(
            Opts::new("shardcache_items", "Live items per cache"),
            &["cache"],
        )
        .expect("valid metric definition");
        let contention = IntCounterVec::new(
            Opts::new(
                "shardcache_lock_contention_total",
                "Slot lock acquisitions that had to wait",
            ),
            &["cache", "mode"],
        )
        .expect("valid metric definition");
        let faults = IntCounterVec::new(
            Opts::new("shardcache_value_faults_total", "Value type faults"),
            &["cache", "operation"],
        )
        .expect("valid metric definition");

        for collector in [
            Box::new(events.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(items.clone()),
            Box::new(contention.clone()),
            Box::new(faults.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                warn!("Metric registration failed: {}", e);
            }
        }

        Self {
            events,
            items,
            contention,
            faults,
        }
    }

    /// Observer bound to one cache name
    pub fn for_cache(&self, cache: &str) -> Arc<CacheMetrics> {
        let event = |name: &str| self.events.with_label_values(&[cache, name]);
        Arc::new(CacheMetrics {
            cache: cache.to_string(),
            creates: event("create"),
            writes: event("write"),
            hits: event("hit"),
            misses: event("miss"),
            expires: event("expire"),
            evictions: event("evict"),
            flushes: event("flush"),
            items: self.items.with_label_values(&[cache]),
            shared_waits: self.contention.with_label_values(&[cache, "shared"]),
            exclusive_waits: self.contention.with_label_values(&[cache, "exclusive"]),
            faults: self.faults.clone(),
        })
    }

    /// Drop every series labelled with `cache`
    pub fn remove_cache(&self, cache: &str) {
        for event in [
            "create", "write", "hit", "miss", "expire", "evict", "flush",
        ] {
            let _ = self.events.remove_label_values(&[cache, event]);
        }
        let _ = self.items.remove_label_values(&[cache]);
        for mode in ["shared", "exclusive"] {
            let _ = self.contention.remove_label_values(&[cache, mode]);
        }
        for operation in FAULT_OPERATIONS {
            let _ = self.faults.remove_label_values(&[cache, *operation]);
        }
    }
}

/// Prometheus-backed observer for a single cache
pub struct CacheMetrics {
    cache: String,
    creates: prometheus::IntCounter,
    writes: prometheus::IntCounter,
    hits: prometheus::IntCounter,
    misses: prometheus::IntCounter,
    expires: prometheus::IntCounter,
    evictions: prometheus::IntCounter,
    flushes: prometheus::IntCounter,
    items: prometheus::IntGauge,
    shared_waits: prometheus::IntCounter,
    exclusive_waits: prometheus::IntCounter,
    faults: IntCounterVec,
}

impl CacheMetrics {
    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.get();
        let misses = self.misses.get();
        let total = hits + misses;
        MetricsSnapshot {
            items: self.items.get(),
            creates: self.creates.get(),
            writes: self.writes.get(),
            hits,
            misses,
            expires: self.expires.get(),
            evictions: self.evictions.get(),
            flushes: self.flushes.get(),
            lock_waits: self.shared_waits.get() + self.exclusive_waits.get(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

impl CacheObserver for CacheMetrics {
    fn item_count_delta(&self, delta: i64) {
        self.items.add(delta);
    }

    fn created(&self) {
        self.creates.inc();
    }

    fn written(&self) {
        self.writes.inc();
    }

    fn read(&self, hit: bool) {
        if hit {
            self.hits.inc();
        } else {
            self.misses.inc();
        }
    }

    fn expired(&self, count: u64) {
        self.expires.inc_by(count);
    }

    fn evicted(&self, count: u64) {
        self.evictions.inc_by(count);
    }

    fn flushed(&self, count: u64) {
        self.flushes.inc_by(count);
    }

    fn lock_contended(&self, exclusive: bool) {
        if exclusive {
            self.exclusive_waits.inc();
        } else {
            self.shared_waits.inc();
        }
    }

    fn fault(&self, operation: &str) {
        self.faults
            .with_label_values(&[self.cache.as_str(), operation])
            .inc();
    }
}

/// Counter values for one cache
#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub items: i64,
    pub creates: u64,
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    pub expires: u64,
    pub evictions: u64,
    pub flushes: u64,
    pub lock_waits: u64,
    /// `hits / (hits + misses)`, or `0.0` before any read
    pub hit_rate: f64,
}

/// Encode everything in `registry` in Prometheus text format
pub fn encode_text(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
