use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}

/// What a value type decided during a maintenance pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    /// Value stays
    #[default]
    Keep,
    /// Past its full, unscaled age horizon
    Expired,
    /// Past the horizon scaled down by memory pressure, but not the full one
    Evicted,
}

/// Point-in-time structural statistics of one cache engine
#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineStats {
    /// Live slots across all bins
    pub item_count: usize,
    /// Configured bucket count
    pub bucket_count: usize,
    /// Buckets currently holding bins
    pub active_buckets: usize,
    /// Bucket count before the last resize
    pub previous_bucket_count: usize,
    /// Bins per bucket
    pub bins_per_bucket: usize,
    /// Sum of value sizes reported by the last maintenance sweep
    pub retained_bytes: usize,
}

/// Shape and tuning of one cache engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of buckets (coarse shards)
    pub buckets: usize,
    /// Bins per bucket (fine shards)
    pub bins_per_bucket: usize,
    /// Target slot count of each bin's map
    pub bin_capacity: usize,
    /// Request fingerprints kept for reuse
    pub fingerprint_pool: usize,
    /// Non-forced sweeps closer together than this are skipped
    pub min_sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buckets: 64,
            bins_per_bucket: 16,
            bin_capacity: 64,
            fingerprint_pool: 256,
            min_sweep_interval_ms: 0,
        }
    }
}
