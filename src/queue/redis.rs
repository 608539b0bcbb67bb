//! Redis task queue.
//!
//! # Key layout
//!
//! ```text
//! {root}:task:{id}       hash with the task fields
//! {root}:seq             enqueue counter (FIFO order)
//! {root}:types           set of task types seen
//! {root}:ready:{type}    zset of claimable ids scored by seq
//! {root}:delayed         zset of ids waiting out a backoff, scored by visible_at (ms)
//! {root}:claimed         zset of claimed ids scored by visibility deadline (ms)
//! {root}:dead            list of dead ids, newest first
//! ```
//!
//! Every state transition is a single Lua script so that two claimants, or a
//! worker racing the orphan sweep, cannot both win the same task. Settling a
//! task requires the claimant recorded at claim time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::with_timeout;
use crate::store::KeySpace;

use super::{
    check_task_type, QueueError, QueueStats, RetryPolicy, RetrySettings, Task, TaskQueue, COMPLETED_RETENTION,
};

const CLAIM_SCRIPT: &str = r#"
while true do
    local id = redis.call('ZRANGE', KEYS[1], 0, 0)[1]
    if not id then
        return false
    end
    redis.call('ZREM', KEYS[1], id)
    local key = ARGV[1] .. ':task:' .. id
    if redis.call('EXISTS', key) == 1 then
        redis.call('HSET', key, 'state', 'claimed', 'claimed_by', ARGV[2],
            'claimed_at', ARGV[3], 'visible_at', ARGV[4])
        redis.call('ZADD', KEYS[2], ARGV[4], id)
        return redis.call('HGETALL', key)
    end
end
"#;

const ACK_SCRIPT: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[2]) then
    return 0
end
local key = ARGV[1] .. ':task:' .. ARGV[2]
if redis.call('HGET', key, 'claimed_by') ~= ARGV[5] then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('HSET', key, 'state', 'completed', 'finished_at', ARGV[3])
redis.call('EXPIRE', key, ARGV[4])
return 1
"#;

// Returns 1 when rescheduled, 0 when dead-lettered, -1 when not claimed.
// An empty ARGV[7] skips the claimant check (orphan sweep).
const FAIL_SCRIPT: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[2]) then
    return -1
end
local key = ARGV[1] .. ':task:' .. ARGV[2]
if redis.call('EXISTS', key) == 0 then
    redis.call('ZREM', KEYS[1], ARGV[2])
    return -1
end
if ARGV[7] ~= '' and redis.call('HGET', key, 'claimed_by') ~= ARGV[7] then
    return -1
end
redis.call('ZREM', KEYS[1], ARGV[2])
local attempts = redis.call('HINCRBY', key, 'attempts', 1)
local max_attempts = tonumber(redis.call('HGET', key, 'max_attempts') or '1')
redis.call('HSET', key, 'last_error', ARGV[3])
if attempts < max_attempts then
    local delay = tonumber(ARGV[5]) * (2 ^ (attempts - 1))
    local cap = tonumber(ARGV[6])
    if delay > cap then
        delay = cap
    end
    local visible = tonumber(ARGV[4]) + delay
    redis.call('HDEL', key, 'claimed_by', 'claimed_at')
    redis.call('HSET', key, 'state', 'pending', 'visible_at', string.format('%d', visible))
    redis.call('ZADD', KEYS[2], visible, ARGV[2])
    return 1
end
redis.call('HSET', key, 'state', 'dead', 'finished_at', ARGV[4])
redis.call('LPUSH', KEYS[3], ARGV[2])
return 0
"#;

const PROMOTE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
local moved = 0
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    local fields = redis.call('HMGET', ARGV[1] .. ':task:' .. id, 'type', 'seq')
    if fields[1] and fields[2] then
        redis.call('ZADD', ARGV[1] .. ':ready:' .. fields[1], fields[2], id)
        moved = moved + 1
    end
end
return moved
"#;

const CLEAR_SCRIPT: &str = r#"
local removed = 0
local function drop_all(zset)
    for _, id in ipairs(redis.call('ZRANGE', zset, 0, -1)) do
        redis.call('DEL', ARGV[1] .. ':task:' .. id)
        removed = removed + 1
    end
    redis.call('DEL', zset)
end
for _, task_type in ipairs(redis.call('SMEMBERS', KEYS[1])) do
    drop_all(ARGV[1] .. ':ready:' .. task_type)
end
drop_all(KEYS[2])
drop_all(KEYS[3])
return removed
"#;

/// Redis-backed [`TaskQueue`].
///
/// The scripts derive task keys from the queue root passed in ARGV, so all
/// queue keys must live on one node: standalone Redis, or a cluster with a
/// hash-tagged prefix such as `{dialer}`.
pub struct RedisTaskQueue {
    redis: ConnectionManager,
    keys: KeySpace,
    timeout: Duration,
    retry: RetrySettings,
    claim_script: redis::Script,
    ack_script: redis::Script,
    fail_script: redis::Script,
    promote_script: redis::Script,
    clear_script: redis::Script,
}

impl RedisTaskQueue {
    /// Creates a queue client; `timeout` bounds every round-trip.
    pub fn new(redis: ConnectionManager, keys: KeySpace, timeout: Duration) -> Self {
        if keys.hash_tag().is_none() {
            debug!(prefix = %keys.prefix(), "Queue prefix has no hash tag; standalone Redis only");
        }
        Self {
            redis,
            keys,
            timeout,
            retry: RetrySettings::default(),
            claim_script: redis::Script::new(CLAIM_SCRIPT),
            ack_script: redis::Script::new(ACK_SCRIPT),
            fail_script: redis::Script::new(FAIL_SCRIPT),
            promote_script: redis::Script::new(PROMOTE_SCRIPT),
            clear_script: redis::Script::new(CLEAR_SCRIPT),
        }
    }

    /// Sets the backoff applied between failed attempts.
    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        let max_attempts = self.retry.max_attempts();
        self.retry.set(retry, max_attempts);
        self
    }

    /// Sets the attempt limit for tasks enqueued via [`TaskQueue::enqueue`].
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        self.retry.set(self.retry.policy(), max_attempts);
        self
    }

    fn decode(&self, id: &str, fields: &HashMap<String, String>) -> Result<Task, QueueError> {
        Task::from_fields(fields).map_err(|reason| QueueError::CorruptTask {
            id: id.to_string(),
            reason,
        })
    }

    /// Runs the fail transition; `claimant` of `None` settles whoever holds
    /// the claim.
    async fn fail_at(
        &self,
        task_id: &str,
        claimant: Option<&str>,
        reason: &str,
        now_ms: i64,
    ) -> Result<i64, QueueError> {
        let retry = self.retry.policy();
        let mut conn = self.redis.clone();
        let outcome: i64 = with_timeout(
            self.timeout,
            self.fail_script
                .key(self.keys.queue_claimed())
                .key(self.keys.queue_delayed())
                .key(self.keys.queue_dead())
                .arg(self.keys.queue_root())
                .arg(task_id)
                .arg(reason)
                .arg(now_ms)
                .arg(duration_millis(retry.base))
                .arg(duration_millis(retry.max))
                .arg(claimant.unwrap_or(""))
                .invoke_async(&mut conn),
        )
        .await?;

        match outcome {
            1 => debug!(task_id = %task_id, reason = %reason, "Task scheduled for retry"),
            0 => warn!(task_id = %task_id, reason = %reason, "Task moved to dead letter"),
            _ => debug!(task_id = %task_id, "Fail ignored, task not claimed"),
        }
        Ok(outcome)
    }
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    fn default_max_attempts(&self) -> u32 {
        self.retry.max_attempts()
    }

    fn configure_retries(&self, retry: RetryPolicy, max_attempts: u32) {
        self.retry.set(retry, max_attempts);
    }

    async fn enqueue_with_attempts(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Result<String, QueueError> {
        check_task_type(task_type)?;
        let mut conn = self.redis.clone();

        let seq: u64 = with_timeout(self.timeout, conn.incr(self.keys.queue_seq(), 1u64)).await?;
        let task = Task::new(Uuid::new_v4().to_string(), task_type, payload, max_attempts, seq);
        let fields = task.to_fields()?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(self.keys.queue_task(&task.id), &fields)
            .ignore()
            .zadd(self.keys.queue_ready(task_type), &task.id, seq)
            .ignore()
            .sadd(self.keys.queue_types(), task_type)
            .ignore();
        with_timeout(self.timeout, pipe.query_async::<_, ()>(&mut conn)).await?;

        debug!(task_id = %task.id, task_type = %task_type, seq, "Enqueued task");
        Ok(task.id)
    }

    async fn claim(
        &self,
        task_type: &str,
        claimant: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Task>, QueueError> {
        check_task_type(task_type)?;
        let now_ms = Utc::now().timestamp_millis();
        let deadline_ms = now_ms.saturating_add(duration_millis(visibility_timeout));
        let mut conn = self.redis.clone();

        let fields: Option<HashMap<String, String>> = with_timeout(
            self.timeout,
            self.claim_script
                .key(self.keys.queue_ready(task_type))
                .key(self.keys.queue_claimed())
                .arg(self.keys.queue_root())
                .arg(claimant)
                .arg(now_ms)
                .arg(deadline_ms)
                .invoke_async(&mut conn),
        )
        .await?;

        match fields {
            Some(fields) if !fields.is_empty() => {
                let id = fields.get("id").cloned().unwrap_or_default();
                let task = self.decode(&id, &fields)?;
                debug!(task_id = %task.id, claimant = %claimant, "Claimed task");
                Ok(Some(task))
            }
            _ => Ok(None),
        }
    }

    async fn ack(&self, task_id: &str, claimant: &str) -> Result<bool, QueueError> {
        if claimant.is_empty() {
            return Ok(false);
        }
        let mut conn = self.redis.clone();
        let acked: i64 = with_timeout(
            self.timeout,
            self.ack_script
                .key(self.keys.queue_claimed())
                .arg(self.keys.queue_root())
                .arg(task_id)
                .arg(Utc::now().timestamp_millis())
                .arg(COMPLETED_RETENTION.as_secs())
                .arg(claimant)
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(acked == 1)
    }

    async fn fail(&self, task_id: &str, claimant: &str, reason: &str) -> Result<bool, QueueError> {
        if claimant.is_empty() {
            return Ok(false);
        }
        let outcome = self
            .fail_at(task_id, Some(claimant), reason, Utc::now().timestamp_millis())
            .await?;
        Ok(outcome >= 0)
    }

    async fn process_retries(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let moved: i64 = with_timeout(
            self.timeout,
            self.promote_script
                .key(self.keys.queue_delayed())
                .arg(self.keys.queue_root())
                .arg(Utc::now().timestamp_millis())
                .invoke_async(&mut conn),
        )
        .await?;
        if moved > 0 {
            debug!(moved, "Promoted delayed tasks");
        }
        Ok(moved.max(0) as usize)
    }

    async fn recover_orphans(&self, grace: Duration) -> Result<usize, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let cutoff = now_ms.saturating_sub(duration_millis(grace));
        let mut conn = self.redis.clone();

        let expired: Vec<String> = with_timeout(
            self.timeout,
            conn.zrangebyscore(self.keys.queue_claimed(), "-inf", cutoff),
        )
        .await?;

        let mut recovered = 0;
        for task_id in expired {
            // Another sweep or a late ack may win the race; -1 means it did.
            if self
                .fail_at(&task_id, None, "visibility timeout expired", now_ms)
                .await?
                >= 0
            {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered orphaned tasks");
        }
        Ok(recovered)
    }

    async fn clear(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let removed: i64 = with_timeout(
            self.timeout,
            self.clear_script
                .key(self.keys.queue_types())
                .key(self.keys.queue_delayed())
                .key(self.keys.queue_claimed())
                .arg(self.keys.queue_root())
                .invoke_async(&mut conn),
        )
        .await?;
        info!(removed, "Cleared task queue");
        Ok(removed.max(0) as usize)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let mut types: Vec<String> =
            with_timeout(self.timeout, conn.smembers(self.keys.queue_types())).await?;
        types.sort();

        let mut pipe = redis::pipe();
        for task_type in &types {
            pipe.zcard(self.keys.queue_ready(task_type));
        }
        pipe.zcard(self.keys.queue_delayed())
            .zcard(self.keys.queue_claimed())
            .llen(self.keys.queue_dead());
        let counts: Vec<u64> = with_timeout(self.timeout, pipe.query_async(&mut conn)).await?;

        let mut stats = QueueStats::default();
        for (task_type, count) in types.iter().zip(counts.iter()) {
            stats.pending += count;
            stats.pending_by_type.insert(task_type.clone(), *count);
        }
        let tail = &counts[types.len().min(counts.len())..];
        if let [delayed, claimed, dead] = tail {
            stats.delayed = *delayed;
            stats.claimed = *claimed;
            stats.dead = *dead;
        }
        Ok(stats)
    }

    async fn dead_tasks(&self, limit: usize) -> Result<Vec<Task>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let stop = isize::try_from(limit - 1).unwrap_or(isize::MAX);
        let ids: Vec<String> =
            with_timeout(self.timeout, conn.lrange(self.keys.queue_dead(), 0, stop)).await?;

        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = self.get(&id).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> =
            with_timeout(self.timeout, conn.hgetall(self.keys.queue_task(task_id))).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        self.decode(task_id, &fields).map(Some)
    }
}
