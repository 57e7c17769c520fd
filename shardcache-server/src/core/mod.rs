pub mod bin;
pub mod bucket_index;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod maintenance;
pub mod pool;
pub mod registry;
pub mod slot;
pub mod types;
pub mod values;

pub use bin::Bin;
pub use bucket_index::{BucketIndex, BucketIndexInfo};
pub use engine::CacheEngine;
pub use error::{CacheError, Result};
pub use fingerprint::KeyFingerprint;
pub use maintenance::{MaintenanceRequest, MaintenanceResponse, MemoryPressure};
pub use pool::{FingerprintPool, PooledFingerprint};
pub use registry::{CacheRegistry, ConfigChanges};
pub use slot::ValueSlot;
pub use types::{EngineConfig, EngineStats, Retention, Timestamp};
pub use values::{
    BytesFactory, BytesValue, CacheValue, LatencyFactory, LatencyValue, ValueConfig,
    ValueFactory, ValueTypeRegistry,
};
