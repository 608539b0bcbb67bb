//! In-process lock with the same expiry semantics as [`RedisLock`](super::RedisLock).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{check_ttl, DistributedLock, Lock, LockError, LockToken};

/// In-memory [`DistributedLock`]; shares state only within one process.
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<String, (LockToken, Instant)>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops a lock regardless of owner, as if its TTL had elapsed.
    pub async fn force_expire(&self, resource_key: &str) {
        self.held.lock().await.remove(resource_key);
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, resource_key: &str, ttl: Duration) -> Result<Option<Lock>, LockError> {
        check_ttl(ttl)?;
        let now = Instant::now();
        let mut held = self.held.lock().await;

        if let Some((_, expires)) = held.get(resource_key) {
            if *expires > now {
                return Ok(None);
            }
        }

        let token = LockToken::generate();
        held.insert(resource_key.to_string(), (token.clone(), now + ttl));
        Ok(Some(Lock {
            resource_key: resource_key.to_string(),
            token,
            acquired_at: Utc::now(),
            ttl,
        }))
    }

    async fn renew(
        &self,
        resource_key: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        check_ttl(ttl)?;
        let now = Instant::now();
        let mut held = self.held.lock().await;

        match held.get_mut(resource_key) {
            Some((owner, expires)) if owner == token && *expires > now => {
                *expires = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, resource_key: &str, token: &LockToken) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut held = self.held.lock().await;

        let owned = matches!(held.get(resource_key), Some((owner, expires)) if owner == token && *expires > now);
        if owned {
            held.remove(resource_key);
        }
        Ok(owned)
    }
}
