//! Error types shared by the backing-store clients.
//!
//! Subsystems define their own error enums next to the code that raises them
//! (`LockError`, `QueueError`, `PoolError`, ...). Every one of them wraps
//! [`StoreError`] for failures of the shared Redis store.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Failure of a round-trip to the backing key/value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Stored data could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The call did not complete within the configured store timeout.
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// A stored record was present but malformed.
    #[error("Corrupt record at '{key}': {reason}")]
    CorruptRecord { key: String, reason: String },
}

impl StoreError {
    /// Returns true for failures that are expected to clear on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout(_) | StoreError::ConnectionFailed(_) => true,
            StoreError::Redis(e) => {
                e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
            }
            StoreError::Serialization(_) | StoreError::CorruptRecord { .. } => false,
        }
    }
}

/// Runs a store future under a deadline.
///
/// Every Redis call in the crate goes through this so that a hung connection
/// surfaces as [`StoreError::Timeout`] instead of blocking the control loop.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, redis::RedisError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
