//! External collaborators of the master: the active-work source that drives
//! desired worker counts, and the sink that persists statistics snapshots.
//!
//! Both come in Redis and PostgreSQL flavours plus in-memory versions for
//! tests and local runs.

pub mod memory;
pub mod postgres;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StoreError;
use crate::orchestrator::StatsSnapshot;

pub use self::memory::{MemoryStatsSink, StaticCampaignSource};
pub use self::postgres::PgSources;
pub use self::redis::{RedisCampaignSource, RedisStatsSink};

/// Errors raised by campaign sources and stats sinks.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The Redis store failed or timed out.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Connection to the database failed.
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A database call exceeded its deadline.
    #[error("Database operation timed out after {0:?}")]
    Timeout(Duration),

    /// Data read from the source could not be interpreted.
    #[error("Malformed data from {origin}: {reason}")]
    Malformed { origin: String, reason: String },

    /// Schema setup failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// One runnable unit of campaign work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCampaign {
    pub id: String,
    /// Concurrent calls the campaign asks for.
    #[serde(alias = "concurrency", default = "default_concurrency")]
    pub desired_concurrency: u32,
    #[serde(default)]
    pub priority: i32,
}

fn default_concurrency() -> u32 {
    1
}

impl ActiveCampaign {
    pub fn new(id: impl Into<String>, desired_concurrency: u32, priority: i32) -> Self {
        Self {
            id: id.into(),
            desired_concurrency,
            priority,
        }
    }
}

/// Read-only view of the campaigns that are currently running.
#[async_trait]
pub trait CampaignSource: Send + Sync {
    /// Returns the running campaigns, highest priority first.
    async fn active_campaigns(&self) -> Result<Vec<ActiveCampaign>, SourceError>;
}

/// Append-only destination for periodic statistics snapshots.
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn record(&self, snapshot: &StatsSnapshot) -> Result<(), SourceError>;
}

/// Orders campaigns by descending priority, then id.
pub(crate) fn sort_by_priority(campaigns: &mut [ActiveCampaign]) {
    campaigns.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
}
