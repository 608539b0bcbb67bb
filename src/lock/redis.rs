//! Redis lock: `SET NX PX` to acquire, Lua compare-and-act to renew/release.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::with_timeout;
use crate::store::KeySpace;

use super::{check_ttl, DistributedLock, Lock, LockError, LockToken};

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed [`DistributedLock`].
pub struct RedisLock {
    redis: ConnectionManager,
    keys: KeySpace,
    timeout: Duration,
    renew_script: redis::Script,
    release_script: redis::Script,
}

impl RedisLock {
    /// Creates a lock client; `timeout` bounds every round-trip.
    pub fn new(redis: ConnectionManager, keys: KeySpace, timeout: Duration) -> Self {
        Self {
            redis,
            keys,
            timeout,
            renew_script: redis::Script::new(RENEW_SCRIPT),
            release_script: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u64::MAX as u128) as u64
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, resource_key: &str, ttl: Duration) -> Result<Option<Lock>, LockError> {
        check_ttl(ttl)?;
        let token = LockToken::generate();
        let key = self.keys.lock(resource_key);
        let mut conn = self.redis.clone();

        let reply: Option<String> = with_timeout(
            self.timeout,
            redis::cmd("SET")
                .arg(&key)
                .arg(token.as_str())
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn),
        )
        .await?;

        if reply.is_none() {
            debug!(resource = %resource_key, "Lock held by another owner");
            return Ok(None);
        }

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
        let mut conn = self.redis.clone();
        let renewed: i64 = with_timeout(
            self.timeout,
            self.renew_script
                .key(self.keys.lock(resource_key))
                .arg(token.as_str())
                .arg(ttl_millis(ttl))
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, resource_key: &str, token: &LockToken) -> Result<bool, LockError> {
        let mut conn = self.redis.clone();
        let released: i64 = with_timeout(
            self.timeout,
            self.release_script
                .key(self.keys.lock(resource_key))
                .arg(token.as_str())
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(released == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_floor() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(300)), 300_000);
    }
}
