//! Task definitions for the queue.
//!
//! - `Task`: a unit of work with retry bookkeeping
//! - `TaskState`: where the task is in its lifecycle
//! - `RetryPolicy`: exponential backoff between attempts

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default maximum number of attempts for a task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle state of a task.
///
/// ```text
/// pending -> claimed -> completed
///               |
///               +-> (failed) -> pending   while attempts < max_attempts
///                           \-> dead      otherwise
/// ```
///
/// "failed" is a transition, not a resting state: a failure immediately
/// resolves to `pending` (with a backoff) or `dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Claimed,
    Completed,
    Dead,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Claimed => "claimed",
            TaskState::Completed => "completed",
            TaskState::Dead => "dead",
        }
    }

    /// Terminal states are never claimable again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Dead)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "claimed" => Ok(TaskState::Claimed),
            "completed" => Ok(TaskState::Completed),
            "dead" => Ok(TaskState::Dead),
            other => Err(format!("unknown task state '{}'", other)),
        }
    }
}

/// A unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier. Consumers de-duplicate on this.
    pub id: String,
    /// Task type; workers claim tasks of a single type.
    pub task_type: String,
    /// Opaque payload interpreted by the worker.
    pub payload: serde_json::Value,
    pub state: TaskState,
    /// Number of failed attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Enqueue order within the queue; FIFO ordering uses this.
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the task may be (re)claimed. For a claimed task this is
    /// the visibility deadline.
    pub visible_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Reason of the most recent failure; preserved on dead tasks.
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates a pending task that is visible immediately.
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        max_attempts: u32,
        seq: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_type: task_type.into(),
            payload,
            state: TaskState::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            seq,
            enqueued_at: now,
            visible_at: now,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            finished_at: None,
        }
    }

    /// Returns whether another attempt is allowed after the current failure count.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Flattens the task into Redis hash fields.
    pub(crate) fn to_fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut fields = vec![
            ("id", self.id.clone()),
            ("type", self.task_type.clone()),
            ("payload", serde_json::to_string(&self.payload)?),
            ("state", self.state.as_str().to_string()),
            ("attempts", self.attempts.to_string()),
            ("max_attempts", self.max_attempts.to_string()),
            ("seq", self.seq.to_string()),
            ("enqueued_at", self.enqueued_at.timestamp_millis().to_string()),
            ("visible_at", self.visible_at.timestamp_millis().to_string()),
        ];
        if let Some(ref by) = self.claimed_by {
            fields.push(("claimed_by", by.clone()));
        }
        if let Some(at) = self.claimed_at {
            fields.push(("claimed_at", at.timestamp_millis().to_string()));
        }
        if let Some(ref err) = self.last_error {
            fields.push(("last_error", err.clone()));
        }
        if let Some(at) = self.finished_at {
            fields.push(("finished_at", at.timestamp_millis().to_string()));
        }
        Ok(fields)
    }

    /// Rebuilds a task from Redis hash fields.
    pub(crate) fn from_fields(fields: &HashMap<String, String>) -> Result<Self, String> {
        let get = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| format!("missing field '{}'", name))
        };
        let parse_u64 = |name: &str| -> Result<u64, String> {
            get(name)?
                .parse::<u64>()
                .map_err(|e| format!("field '{}': {}", name, e))
        };
        let parse_u32 = |name: &str| -> Result<u32, String> {
            get(name)?
                .parse::<u32>()
                .map_err(|e| format!("field '{}': {}", name, e))
        };
        let parse_time = |name: &str| -> Result<DateTime<Utc>, String> {
            let ms: i64 = get(name)?
                .parse()
                .map_err(|e| format!("field '{}': {}", name, e))?;
            DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| format!("field '{}': timestamp out of range", name))
        };
        let opt_time = |name: &str| -> Result<Option<DateTime<Utc>>, String> {
            if fields.contains_key(name) {
                parse_time(name).map(Some)
            } else {
                Ok(None)
            }
        };

        Ok(Self {
            id: get("id")?.clone(),
            task_type: get("type")?.clone(),
            payload: serde_json::from_str(get("payload")?)
                .map_err(|e| format!("field 'payload': {}", e))?,
            state: get("state")?.parse()?,
            attempts: parse_u32("attempts")?,
            max_attempts: parse_u32("max_attempts")?,
            seq: parse_u64("seq")?,
            enqueued_at: parse_time("enqueued_at")?,
            visible_at: parse_time("visible_at")?,
            claimed_by: fields.get("claimed_by").cloned(),
            claimed_at: opt_time("claimed_at")?,
            last_error: fields.get("last_error").cloned(),
            finished_at: opt_time("finished_at")?,
        })
    }
}

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next attempt, given the failure count *including* the
    /// failure just recorded: `min(base * 2^(attempts-1), max)`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }
}

/// Retry settings of a shared queue client, replaceable at runtime.
#[derive(Debug)]
pub(crate) struct RetrySettings {
    base_ms: AtomicU64,
    max_ms: AtomicU64,
    max_attempts: AtomicU32,
}

impl RetrySettings {
    pub(crate) fn new(retry: RetryPolicy, max_attempts: u32) -> Self {
        let settings = Self {
            base_ms: AtomicU64::new(0),
            max_ms: AtomicU64::new(0),
            max_attempts: AtomicU32::new(0),
        };
        settings.set(retry, max_attempts);
        settings
    }

    pub(crate) fn set(&self, retry: RetryPolicy, max_attempts: u32) {
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        self.base_ms.store(millis(retry.base), Ordering::Relaxed);
        self.max_ms.store(millis(retry.max), Ordering::Relaxed);
        self.max_attempts.store(max_attempts.max(1), Ordering::Relaxed);
    }

    pub(crate) fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_ms.load(Ordering::Relaxed)),
            Duration::from_millis(self.max_ms.load(Ordering::Relaxed)),
        )
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        self.max_attempts.load(Ordering::Relaxed)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), DEFAULT_MAX_ATTEMPTS)
    }
}
