//! Error types for the autoscale control plane
//!
//! This module provides the error taxonomy shared by every component:
//! configuration failures, authorization failures, conditional-write
//! collisions, transient I/O, license exhaustion and election timeouts.

use thiserror::Error;

/// Result type for control-plane operations
pub type Result<T> = std::result::Result<T, AutoscaleError>;

/// Control-plane errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AutoscaleError {
    /// A required configuration key is absent
    #[error("Required setting missing: {key}")]
    ConfigurationMissing { key: String },

    /// VM identity check failed
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// A conditional write collided with a concurrent writer
    #[error("Conditional write lost on {resource}")]
    RaceLost { resource: String },

    /// Retryable platform I/O failure
    #[error("Transient I/O failure during {operation}: {reason}")]
    TransientIo { operation: String, reason: String },

    /// No assignable license remains in the pool
    #[error("No license available for product {product}")]
    LicenseExhausted { product: String },

    /// A bounded election waiter ran out of execution time
    #[error("Primary election timed out while {vm_id} was waiting")]
    ElectionTimeout { vm_id: String },

    /// Record finalization failed and the lifecycle hook was abandoned
    #[error("Lifecycle action abandoned for {vm_id}")]
    LifecycleAbandon { vm_id: String },

    /// An expected record was not found
    #[error("Record not found in {table}: {key}")]
    RecordNotFound { table: String, key: String },

    /// Non-retryable platform failure
    #[error("Platform operation {operation} failed: {reason}")]
    Platform { operation: String, reason: String },

    /// Payload encode/decode failure
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl AutoscaleError {
    /// Checks whether this error is a conditional-write collision
    pub fn is_race_lost(&self) -> bool {
        matches!(self, Self::RaceLost { .. })
    }

    /// Checks whether the caller may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RaceLost { .. } | Self::TransientIo { .. })
    }

    /// Maps the error onto the HTTP status code surfaced to the device
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized { .. } => 403,
            _ => 500,
        }
    }

    /// Shorthand for a race-lost error on a named resource
    pub fn race_lost(resource: impl Into<String>) -> Self {
        Self::RaceLost {
            resource: resource.into(),
        }
    }

    /// Shorthand for a missing-record error
    pub fn not_found(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::RecordNotFound {
            table: table.into(),
            key: key.into(),
        }
    }
}

impl From<serde_json::Error> for AutoscaleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
