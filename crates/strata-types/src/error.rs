//! Shared error types for the Strata system.

use thiserror::Error;

/// Top-level error type for the Strata system.
#[derive(Error, Debug)]
pub enum StrataError {
    /// The packet is malformed and was rejected before any write.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A lineage cycle was detected (at write time or during traversal).
    #[error("Lineage integrity violation: {0}")]
    LineageIntegrity(String),

    /// An embedding provider or external notification target failed.
    #[error("Provider degraded: {0}")]
    ProviderDegraded(String),

    /// The underlying store could not serve the request.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Whether a caller may safely retry the failed operation.
    ///
    /// Writes are idempotent through the dedup key, so storage and provider
    /// failures can always be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StrataError::StorageUnavailable(_) | StrataError::ProviderDegraded(_)
        )
    }

    /// Stable snake_case name of the variant, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            StrataError::Validation(_) => "validation_error",
            StrataError::LineageIntegrity(_) => "lineage_integrity_error",
            StrataError::ProviderDegraded(_) => "provider_degraded",
            StrataError::StorageUnavailable(_) => "storage_unavailable",
            StrataError::NotFound(_) => "not_found",
            StrataError::Serialization(_) => "serialization_error",
            StrataError::Config(_) => "config_error",
            StrataError::Io(_) => "io_error",
            StrataError::Internal(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

/// Alias for Result with StrataError.
pub type StrataResult<T> = Result<T, StrataError>;
