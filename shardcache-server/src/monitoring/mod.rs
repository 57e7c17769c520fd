//! INFO-style monitoring
//!
//! Point-in-time view of every cache in a registry:
//! - SERVER: version, uptime
//! - CACHES: per-cache items, shape, bucket index state, memory estimate
//! - STATS: counters and hit rate from the cache's metrics

use crate::core::CacheEngine;
use crate::core::bucket_index::BucketIndexInfo;
use crate::metrics::MetricsSnapshot;
use serde::Serialize;
use std::fmt::Write;

/// One cache's section
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub name: String,
    pub value_type: Option<String>,
    pub items: u64,
    pub bucket_count: usize,
    pub bins_per_bucket: usize,
    pub bucket_index: BucketIndexInfo,
    /// Bytes retained after the last maintenance sweep
    pub retained_bytes: usize,
    pub retained_human: String,
    pub stats: MetricsSnapshot,
}

impl CacheInfo {
    pub fn collect(
        name: &str,
        value_type: Option<&str>,
        engine: &CacheEngine,
        stats: MetricsSnapshot,
    ) -> Self {
        let engine_stats = engine.stats();
        Self {
            name: name.to_string(),
            value_type: value_type.map(str::to_string),
            items: engine_stats.item_count as u64,
            bucket_count: engine_stats.bucket_count,
            bins_per_bucket: engine_stats.bins_per_bucket,
            bucket_index: engine.bucket_index_info(),
            retained_bytes: engine_stats.retained_bytes,
            retained_human: format_bytes(engine_stats.retained_bytes),
            stats,
        }
    }
}

/// Whole-registry INFO report
#[derive(Debug, Clone, Serialize)]
pub struct RegistryInfo {
    pub version: String,
    pub uptime_in_seconds: u64,
    pub total_items: u64,
    pub retained_bytes: usize,
    pub retained_human: String,
    pub caches: Vec<CacheInfo>,
}

impl RegistryInfo {
    pub fn new(uptime_in_seconds: u64, caches: Vec<CacheInfo>) -> Self {
        let total_items = caches.iter().map(|c| c.items).sum();
        let retained_bytes = caches.iter().map(|c| c.retained_bytes).sum();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_in_seconds,
            total_items,
            retained_bytes,
            retained_human: format_bytes(retained_bytes),
            caches,
        }
    }

    /// JSON document of the whole report
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Redis-style `key:value` text with `# Section` headers
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Server");
        let _ = writeln!(out, "version:{}", self.version);
        let _ = writeln!(out, "uptime_in_seconds:{}", self.uptime_in_seconds);
        let _ = writeln!(out);

        let _ = writeln!(out, "# Memory");
        let _ = writeln!(out, "retained_bytes:{}", self.retained_bytes);
        let _ = writeln!(out, "retained_human:{}", self.retained_human);
        let _ = writeln!(out);

        let _ = writeln!(out, "# Caches");
        for cache in &self.caches {
            let _ = writeln!(
                out,
                "{}:type={},items={},buckets={}/{},bins={},hits={},misses={},hit_rate={:.2}",
                cache.name,
                cache.value_type.as_deref().unwrap_or("none"),
                cache.items,
                cache.bucket_index.active_count,
                cache.bucket_count,
                cache.bins_per_bucket,
                cache.stats.hits,
                cache.stats.misses,
                cache.stats.hit_rate
            );
        }
        out
    }
}

/// Human-readable byte count (`1.50KB`, `3MB`)
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if size.fract() < 0.01 {
        format!("{:.0}{}", size, UNITS[unit_idx])
    } else {
        format!("{:.2}{}", size, UNITS[unit_idx])
    }
}
