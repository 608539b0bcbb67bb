//! PostgreSQL campaign source and stats sink.
//!
//! Campaigns are read from the dialer's `campaigns` table. Snapshots are
//! appended to `orchestrator_stats`, which [`PgSources::run_migrations`]
//! creates if missing.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tracing::debug;

use crate::orchestrator::StatsSnapshot;

use super::{ActiveCampaign, CampaignSource, SourceError, StatsSink};

/// Schema statements, applied in order and tracked by name.
const SCHEMA: &[(&str, &str)] = &[
    (
        "orchestrator_stats_v1",
        r#"
        CREATE TABLE IF NOT EXISTS orchestrator_stats (
            id BIGSERIAL PRIMARY KEY,
            taken_at TIMESTAMPTZ NOT NULL,
            hostname TEXT NOT NULL,
            master_pid BIGINT NOT NULL,
            uptime_secs BIGINT NOT NULL,
            memory_bytes BIGINT NOT NULL,
            workers_total INTEGER NOT NULL,
            queue_pending BIGINT NOT NULL,
            queue_claimed BIGINT NOT NULL,
            queue_dead BIGINT NOT NULL,
            snapshot JSONB NOT NULL
        )
        "#,
    ),
    (
        "orchestrator_stats_taken_at_idx",
        "CREATE INDEX IF NOT EXISTS idx_orchestrator_stats_taken_at ON orchestrator_stats (taken_at)",
    ),
];

/// Campaign source and stats sink sharing one connection pool.
#[derive(Clone)]
pub struct PgSources {
    pool: PgPool,
    timeout: Duration,
}

impl PgSources {
    /// Connects to the database.
    pub async fn connect(database_url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .min_connections(1)
            .acquire_timeout(timeout)
            .connect(database_url)
            .await
            .map_err(|e| SourceError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool, timeout })
    }

    /// Creates sources from an existing pool.
    pub fn from_pool(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, SourceError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(SourceError::from),
            Err(_) => Err(SourceError::Timeout(self.timeout)),
        }
    }

    /// Creates the stats table. Safe to run repeatedly.
    pub async fn run_migrations(&self) -> Result<(), SourceError> {
        self.bounded(
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS _migrations (
                    id SERIAL PRIMARY KEY,
                    name VARCHAR(255) NOT NULL UNIQUE,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            )
            .execute(&self.pool),
        )
        .await?;

        for (name, statement) in SCHEMA {
            let applied: Option<(i32,)> = self
                .bounded(
                    sqlx::query_as("SELECT id FROM _migrations WHERE name = $1")
                        .bind(*name)
                        .fetch_optional(&self.pool),
                )
                .await?;
            if applied.is_some() {
                continue;
            }

            let mut tx = self.pool.begin().await?;
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| SourceError::MigrationFailed(format!("{}: {}", name, e)))?;
            sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
                .bind(*name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            debug!(migration = %name, "Applied migration");
        }
        Ok(())
    }
}

#[async_trait]
impl CampaignSource for PgSources {
    async fn active_campaigns(&self) -> Result<Vec<ActiveCampaign>, SourceError> {
        let rows = self
            .bounded(
                sqlx::query(
                    r#"
                    SELECT id::text AS id,
                           COALESCE(concurrency, 1)::int AS concurrency,
                           COALESCE(priority, 0)::int AS priority
                    FROM campaigns
                    WHERE status = 'running'
                    ORDER BY priority DESC, id
                    "#,
                )
                .fetch_all(&self.pool),
            )
            .await?;

        let mut campaigns = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let concurrency: i32 = row.try_get("concurrency")?;
            let priority: i32 = row.try_get("priority")?;
            campaigns.push(ActiveCampaign::new(
                id,
                u32::try_from(concurrency).unwrap_or(0),
                priority,
            ));
        }
        Ok(campaigns)
    }
}

#[async_trait]
impl StatsSink for PgSources {
    async fn record(&self, snapshot: &StatsSnapshot) -> Result<(), SourceError> {
        let document = serde_json::to_value(snapshot).map_err(|e| SourceError::Malformed {
            origin: "stats snapshot".to_string(),
            reason: e.to_string(),
        })?;
        let as_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);

        self.bounded(
            sqlx::query(
                r#"
                INSERT INTO orchestrator_stats (
                    taken_at, hostname, master_pid, uptime_secs, memory_bytes,
                    workers_total, queue_pending, queue_claimed, queue_dead, snapshot
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(snapshot.taken_at)
            .bind(&snapshot.hostname)
            .bind(i64::from(snapshot.master_pid))
            .bind(as_i64(snapshot.uptime_secs))
            .bind(as_i64(snapshot.memory_bytes))
            .bind(i32::try_from(snapshot.workers_total).unwrap_or(i32::MAX))
            .bind(as_i64(snapshot.queue.pending + snapshot.queue.delayed))
            .bind(as_i64(snapshot.queue.claimed))
            .bind(as_i64(snapshot.queue.dead))
            .bind(document)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}
