pub mod config;
pub mod core;
pub mod metrics;
pub mod monitoring;

// Re-export commonly used types
pub use config::{CacheConfig, ConfigWatcher, ServerConfig};
pub use core::{
    CacheEngine, CacheError, CacheRegistry, CacheValue, EngineConfig, KeyFingerprint,
    MaintenanceRequest, MaintenanceResponse, ValueConfig, ValueFactory,
    ValueTypeRegistry,
};
pub use metrics::{CacheObserver, MetricsFamily, NoopObserver};
pub use monitoring::{CacheInfo, RegistryInfo};
