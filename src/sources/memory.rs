//! In-memory campaign source and stats sink.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::orchestrator::StatsSnapshot;

use super::{sort_by_priority, ActiveCampaign, CampaignSource, SourceError, StatsSink};

/// Campaign source whose contents are set by the caller.
#[derive(Default)]
pub struct StaticCampaignSource {
    campaigns: Mutex<Vec<ActiveCampaign>>,
}

impl StaticCampaignSource {
    pub fn new(campaigns: Vec<ActiveCampaign>) -> Self {
        Self {
            campaigns: Mutex::new(campaigns),
        }
    }

    /// Replaces the running campaigns.
    pub async fn set(&self, campaigns: Vec<ActiveCampaign>) {
        *self.campaigns.lock().await = campaigns;
    }
}

#[async_trait]
impl CampaignSource for StaticCampaignSource {
    async fn active_campaigns(&self) -> Result<Vec<ActiveCampaign>, SourceError> {
        let mut campaigns = self.campaigns.lock().await.clone();
        sort_by_priority(&mut campaigns);
        Ok(campaigns)
    }
}

/// Stats sink that keeps every snapshot in memory.
#[derive(Default)]
pub struct MemoryStatsSink {
    snapshots: Mutex<Vec<StatsSnapshot>>,
}

impl MemoryStatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshots(&self) -> Vec<StatsSnapshot> {
        self.snapshots.lock().await.clone()
    }
}

#[async_trait]
impl StatsSink for MemoryStatsSink {
    async fn record(&self, snapshot: &StatsSnapshot) -> Result<(), SourceError> {
        self.snapshots.lock().await.push(snapshot.clone());
        Ok(())
    }
}
