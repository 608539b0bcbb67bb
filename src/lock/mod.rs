//! Distributed mutual exclusion with TTL, renewal and release.
//!
//! A lock is an expiring record keyed by resource. The holder proves
//! ownership with an opaque [`LockToken`]; renew and release are
//! compare-and-act operations on that token, so a process can never extend or
//! delete a lock it no longer owns.
//!
//! # Failure semantics
//!
//! Errors are *fail closed*: callers must treat an `Err` from
//! [`DistributedLock::acquire`] as "not acquired" and an `Err` from
//! [`DistributedLock::renew`] as "lock lost". The master abdicates on the
//! latter rather than risk two active masters.
//!
//! # Sizing the TTL
//!
//! The TTL has to outlive the longest expected gap between renewals. The
//! orchestrator default is ten renewal intervals.

pub mod memory;
pub mod redis;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::StoreError;

pub use self::memory::MemoryLock;
pub use self::redis::RedisLock;

/// Errors that can occur during lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The backing store failed or timed out.
    #[error("Lock store error: {0}")]
    Store(#[from] StoreError),

    /// A zero TTL would create a lock that is already expired.
    #[error("Lock TTL must be greater than zero")]
    InvalidTtl,
}

/// Opaque proof of ownership returned by a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(String);

impl LockToken {
    /// Creates a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub resource_key: String,
    pub token: LockToken,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// TTL-based mutual exclusion primitive.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquires the lock if no live holder exists.
    ///
    /// Returns `Ok(None)` when another holder owns the resource; that is the
    /// normal outcome for all but one contender.
    async fn acquire(&self, resource_key: &str, ttl: Duration) -> Result<Option<Lock>, LockError>;

    /// Extends the expiry if `token` is still the current holder.
    ///
    /// Returns `Ok(false)` when the lock expired or changed hands.
    async fn renew(&self, resource_key: &str, token: &LockToken, ttl: Duration)
        -> Result<bool, LockError>;

    /// Deletes the lock if `token` is still the current holder.
    async fn release(&self, resource_key: &str, token: &LockToken) -> Result<bool, LockError>;
}

fn check_ttl(ttl: Duration) -> Result<(), LockError> {
    if ttl.is_zero() {
        return Err(LockError::InvalidTtl);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = LockToken::generate();
        let b = LockToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        assert!(matches!(check_ttl(Duration::ZERO), Err(LockError::InvalidTtl)));
        assert!(check_ttl(Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_lock_error_display() {
        let err = LockError::Store(StoreError::Timeout(Duration::from_secs(2)));
        assert!(err.to_string().contains("timed out"));
    }
}
