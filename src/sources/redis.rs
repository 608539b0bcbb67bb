//! Redis-backed campaign source and stats sink.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::with_timeout;
use crate::orchestrator::StatsSnapshot;
use crate::store::KeySpace;

use super::{sort_by_priority, ActiveCampaign, CampaignSource, SourceError, StatsSink};

/// Snapshots kept in the history list (one day at the default 60s cadence).
pub const DEFAULT_STATS_HISTORY: usize = 1440;

/// Reads the active campaigns from a JSON array maintained by the campaign
/// service at `{prefix}:campaigns:active`. A missing key means no campaigns.
pub struct RedisCampaignSource {
    redis: ConnectionManager,
    keys: KeySpace,
    timeout: Duration,
}

impl RedisCampaignSource {
    pub fn new(redis: ConnectionManager, keys: KeySpace, timeout: Duration) -> Self {
        Self { redis, keys, timeout }
    }
}

#[async_trait]
impl CampaignSource for RedisCampaignSource {
    async fn active_campaigns(&self) -> Result<Vec<ActiveCampaign>, SourceError> {
        let key = self.keys.active_campaigns();
        let mut conn = self.redis.clone();
        let raw: Option<String> = with_timeout(self.timeout, conn.get(&key)).await?;

        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        let mut campaigns: Vec<ActiveCampaign> =
            serde_json::from_str(&raw).map_err(|e| SourceError::Malformed {
                origin: key,
                reason: e.to_string(),
            })?;
        sort_by_priority(&mut campaigns);
        Ok(campaigns)
    }
}

/// Writes snapshots to `{prefix}:stats:latest` and a capped history list.
pub struct RedisStatsSink {
    redis: ConnectionManager,
    keys: KeySpace,
    timeout: Duration,
    history: usize,
}

impl RedisStatsSink {
    pub fn new(redis: ConnectionManager, keys: KeySpace, timeout: Duration) -> Self {
        Self {
            redis,
            keys,
            timeout,
            history: DEFAULT_STATS_HISTORY,
        }
    }

    /// Sets how many snapshots the history list keeps.
    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }
}

#[async_trait]
impl StatsSink for RedisStatsSink {
    async fn record(&self, snapshot: &StatsSnapshot) -> Result<(), SourceError> {
        let serialized = serde_json::to_string(snapshot).map_err(crate::error::StoreError::from)?;
        let history_key = self.keys.stats_history();
        let keep = isize::try_from(self.history).unwrap_or(isize::MAX);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.keys.stats_latest(), &serialized)
            .ignore()
            .lpush(&history_key, &serialized)
            .ignore()
            .ltrim(&history_key, 0, keep - 1)
            .ignore();

        let mut conn = self.redis.clone();
        with_timeout(self.timeout, pipe.query_async::<_, ()>(&mut conn)).await?;
        Ok(())
    }
}
