use thiserror::Error;

/// Main error type for cache engine operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Unknown cache: {0}")]
    UnknownCache(String),

    #[error("Cache already exists: {0}")]
    CacheExists(String),

    #[error("No value factory configured for cache: {0}")]
    NoFactory(String),

    #[error("Unknown value type: {0}")]
    UnknownValueType(String),

    #[error("Value factory failed for cache {cache}: {message}")]
    FactoryFailed { cache: String, message: String },

    #[error("Value fault during {operation}: {message}")]
    ValueFault { operation: String, message: String },

    #[error("Invalid bucket count: {0}")]
    InvalidBucketCount(usize),

    #[error("Invalid bin count: {0}")]
    InvalidBinCount(usize),

    #[error("Invalid {setting}: {value}")]
    InvalidCapacity { setting: String, value: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Build a value fault for the given operation
    pub fn value_fault(operation: &str, message: impl Into<String>) -> Self {
        Self::ValueFault {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Whether this error stems from cache configuration rather than a request
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownCache(_)
                | Self::CacheExists(_)
                | Self::NoFactory(_)
                | Self::UnknownValueType(_)
                | Self::FactoryFailed { .. }
                | Self::InvalidBucketCount(_)
                | Self::InvalidBinCount(_)
                | Self::InvalidCapacity { .. }
        )
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
