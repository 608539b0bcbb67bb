//! Redis key layout.
//!
//! All keys live under one prefix so that several deployments can share a
//! Redis instance:
//!
//! ```text
//! {prefix}:lock:{resource}            master / per-resource locks (string, PX ttl)
//! {prefix}:master                     master registration (JSON)
//! {prefix}:workers                    worker registry (hash id -> JSON)
//! {prefix}:worker:{id}:heartbeat      worker heartbeat (JSON, ttl)
//! {prefix}:command                    pending control command (JSON, at most one)
//! {prefix}:logs / {prefix}:log:latest mirrored activity log
//! {prefix}:stats:latest|history       statistics snapshots
//! {prefix}:metrics                    Prometheus text exposition
//! {prefix}:campaigns:active           active-work snapshot (JSON array)
//! {prefix}:queue:*                    task queue (see queue::redis)
//! ```
//!
//! On Redis Cluster the prefix must carry a hash tag, e.g. `{dialer}`, so
//! every key maps to the same slot. The queue scripts build keys at run time
//! and fail with CROSSSLOT otherwise.

/// Builds every Redis key used by the orchestrator from a single prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Creates a key space rooted at `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Returns the prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the cluster hash tag of the prefix, if it has one.
    ///
    /// Follows the Redis rule: the text between the first `{` and the next
    /// `}`, provided it is not empty.
    pub fn hash_tag(&self) -> Option<&str> {
        let open = self.prefix.find('{')?;
        let rest = &self.prefix[open + 1..];
        let close = rest.find('}')?;
        (close > 0).then(|| &rest[..close])
    }

    pub fn lock(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.prefix, resource)
    }

    pub fn master(&self) -> String {
        format!("{}:master", self.prefix)
    }

    pub fn workers(&self) -> String {
        format!("{}:workers", self.prefix)
    }

    pub fn heartbeat(&self, worker_id: &str) -> String {
        format!("{}:worker:{}:heartbeat", self.prefix, worker_id)
    }

    pub fn command(&self) -> String {
        format!("{}:command", self.prefix)
    }

    pub fn logs(&self) -> String {
        format!("{}:logs", self.prefix)
    }

    pub fn latest_log(&self) -> String {
        format!("{}:log:latest", self.prefix)
    }

    pub fn stats_latest(&self) -> String {
        format!("{}:stats:latest", self.prefix)
    }

    pub fn stats_history(&self) -> String {
        format!("{}:stats:history", self.prefix)
    }

    pub fn metrics(&self) -> String {
        format!("{}:metrics", self.prefix)
    }

    pub fn active_campaigns(&self) -> String {
        format!("{}:campaigns:active", self.prefix)
    }

    /// Root of the task-queue keys; the Lua scripts derive the rest from it.
    pub fn queue_root(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    pub fn queue_seq(&self) -> String {
        format!("{}:queue:seq", self.prefix)
    }

    pub fn queue_types(&self) -> String {
        format!("{}:queue:types", self.prefix)
    }

    pub fn queue_ready(&self, task_type: &str) -> String {
        format!("{}:queue:ready:{}", self.prefix, task_type)
    }

    pub fn queue_delayed(&self) -> String {
        format!("{}:queue:delayed", self.prefix)
    }

    pub fn queue_claimed(&self) -> String {
        format!("{}:queue:claimed", self.prefix)
    }

    pub fn queue_dead(&self) -> String {
        format!("{}:queue:dead", self.prefix)
    }

    pub fn queue_task(&self, task_id: &str) -> String {
        format!("{}:queue:task:{}", self.prefix, task_id)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("dialer")
    }
}
