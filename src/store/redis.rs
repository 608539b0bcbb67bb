//! Redis-backed coordination state.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::{with_timeout, StoreError};
use crate::orchestrator::{ControlCommand, MasterRegistration};
use crate::pool::{Heartbeat, WorkerRecord};

use super::keys::KeySpace;
use super::StateStore;

/// Deletes the master registration only when it still names the caller.
const CLEAR_MASTER_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local ok, rec = pcall(cjson.decode, raw)
if not ok then return 0 end
if tostring(rec['pid']) == ARGV[1] and rec['hostname'] == ARGV[2] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

/// Connects to Redis and returns a connection manager.
///
/// The manager reconnects on its own; cloning it is cheap and every component
/// holds its own clone.
///
/// # Errors
///
/// Returns `StoreError::ConnectionFailed` if the URL is invalid or the initial
/// connection cannot be made within `timeout`.
pub async fn connect(redis_url: &str, timeout: Duration) -> Result<ConnectionManager, StoreError> {
    let client =
        redis::Client::open(redis_url).map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

    match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(StoreError::ConnectionFailed(e.to_string())),
        Err(_) => Err(StoreError::ConnectionFailed(format!(
            "no connection to {} within {:?}",
            redis_url, timeout
        ))),
    }
}

/// Redis implementation of [`StateStore`].
#[derive(Clone)]
pub struct RedisStateStore {
    redis: ConnectionManager,
    keys: KeySpace,
    timeout: Duration,
}

impl RedisStateStore {
    /// Creates a store from an existing connection manager.
    pub fn new(redis: ConnectionManager, keys: KeySpace, timeout: Duration) -> Self {
        Self {
            redis,
            keys,
            timeout,
        }
    }

    /// Returns the key space.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = with_timeout(self.timeout, conn.get(key)).await?;
        match raw {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn set_json_px<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(value)?;
        let mut conn = self.redis.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        with_timeout(
            self.timeout,
            redis::cmd("SET")
                .arg(key)
                .arg(serialized)
                .arg("PX")
                .arg(ttl_ms)
                .query_async::<_, ()>(&mut conn),
        )
        .await
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn write_heartbeat(&self, heartbeat: &Heartbeat, ttl: Duration) -> Result<(), StoreError> {
        self.set_json_px(&self.keys.heartbeat(&heartbeat.worker_id), heartbeat, ttl)
            .await
    }

    async fn read_heartbeat(&self, worker_id: &str) -> Result<Option<Heartbeat>, StoreError> {
        self.get_json(&self.keys.heartbeat(worker_id)).await
    }

    async fn clear_heartbeat(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        with_timeout(self.timeout, conn.del::<_, ()>(self.keys.heartbeat(worker_id))).await
    }

    async fn save_worker(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(record)?;
        let mut conn = self.redis.clone();
        with_timeout(
            self.timeout,
            conn.hset::<_, _, _, ()>(self.keys.workers(), &record.id, serialized),
        )
        .await
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        with_timeout(self.timeout, conn.hdel::<_, _, ()>(self.keys.workers(), worker_id)).await
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let entries: HashMap<String, String> =
            with_timeout(self.timeout, conn.hgetall(self.keys.workers())).await?;

        let mut records = Vec::with_capacity(entries.len());
        for (id, data) in entries {
            match serde_json::from_str::<WorkerRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => warn!(worker_id = %id, error = %e, "Skipping malformed worker record"),
            }
        }
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    async fn publish_master(
        &self,
        registration: &MasterRegistration,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.set_json_px(&self.keys.master(), registration, ttl).await
    }

    async fn read_master(&self) -> Result<Option<MasterRegistration>, StoreError> {
        self.get_json(&self.keys.master()).await
    }

    async fn clear_master(&self, pid: u32, hostname: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let script = redis::Script::new(CLEAR_MASTER_SCRIPT);
        let cleared: i64 = with_timeout(
            self.timeout,
            script
                .key(self.keys.master())
                .arg(pid.to_string())
                .arg(hostname)
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(cleared == 1)
    }

    async fn submit_command(&self, command: &ControlCommand) -> Result<bool, StoreError> {
        let serialized = serde_json::to_string(command)?;
        let mut conn = self.redis.clone();
        let stored: Option<String> = with_timeout(
            self.timeout,
            redis::cmd("SET")
                .arg(self.keys.command())
                .arg(serialized)
                .arg("NX")
                .query_async(&mut conn),
        )
        .await?;
        Ok(stored.is_some())
    }

    async fn take_command(&self) -> Result<Option<ControlCommand>, StoreError> {
        let key = self.keys.command();
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic().get(&key).del(&key).ignore();
        let (raw,): (Option<String>,) = with_timeout(self.timeout, pipe.query_async(&mut conn)).await?;

        match raw {
            Some(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| StoreError::CorruptRecord {
                    key,
                    reason: format!("{}: {}", e, data),
                }),
            None => Ok(None),
        }
    }

    async fn append_log(&self, line: &str, history: usize) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let keep = history.max(1) as isize;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .rpush(self.keys.logs(), line)
            .ignore()
            .ltrim(self.keys.logs(), -keep, -1)
            .ignore()
            .set(self.keys.latest_log(), line)
            .ignore();
        with_timeout(self.timeout, pipe.query_async::<_, ()>(&mut conn)).await
    }

    async fn latest_log(&self) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        with_timeout(self.timeout, conn.get(self.keys.latest_log())).await
    }

    async fn publish_metrics(&self, text: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        with_timeout(self.timeout, conn.set::<_, _, ()>(self.keys.metrics(), text)).await
    }
}
