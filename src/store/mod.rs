use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;

/// Persistence boundary for monthly traffic buckets.
///
/// A bucket is keyed by `(hostname, month, year)` and holds a running byte
/// total for that calendar month. Implementations must make `upsert_add`
/// atomic so concurrent flush cycles cannot lose updates.
pub trait TrafficStore: Send + Sync {
    /// Creates the traffic table if it does not exist yet. Idempotent.
    fn ensure_schema(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Atomically inserts a bucket with `bytes = delta_bytes`, or adds
    /// `delta_bytes` to the existing bucket's value.
    fn upsert_add(
        &self,
        hostname: &str,
        month: u32,
        year: i32,
        delta_bytes: u64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

impl<S: TrafficStore> TrafficStore for std::sync::Arc<S> {
    fn ensure_schema(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        self.as_ref().ensure_schema()
    }

    fn upsert_add(
        &self,
        hostname: &str,
        month: u32,
        year: i32,
        delta_bytes: u64,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        self.as_ref().upsert_add(hostname, month, year, delta_bytes)
    }
}

/// Matches migration 001; kept inline so schema creation works without the
/// migration runner enabled.
const CREATE_TRAFFIC_TABLE: &str = "CREATE TABLE IF NOT EXISTS traffic (
    hostname VARCHAR(200) NOT NULL,
    month INTEGER NOT NULL,
    year INTEGER NOT NULL,
    bytes BIGINT NOT NULL,
    PRIMARY KEY (hostname, month, year)
)";

const UPSERT_ADD: &str = "INSERT INTO traffic (hostname, month, year, bytes) \
     VALUES ($1, $2, $3, $4) \
     ON CONFLICT (hostname, month, year) \
     DO UPDATE SET bytes = traffic.bytes + EXCLUDED.bytes";

/// PostgreSQL-backed traffic store.
pub struct PgTrafficStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgTrafficStore {
    /// Connects to the database described by `cfg`. Connection failure here
    /// is startup-fatal for the agent.
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.connect_timeout)
            .connect(&cfg.url)
            .await
            .context("connecting to PostgreSQL")?;

        Ok(Self {
            pool,
            statement_timeout: cfg.statement_timeout,
        })
    }

    /// Underlying connection pool, shared with the migration runner.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl TrafficStore for PgTrafficStore {
    async fn ensure_schema(&self) -> Result<()> {
        tokio::time::timeout(
            self.statement_timeout,
            sqlx::query(CREATE_TRAFFIC_TABLE).execute(&self.pool),
        )
        .await
        .context("schema creation timed out")?
        .context("creating traffic table")?;

        Ok(())
    }

    async fn upsert_add(
        &self,
        hostname: &str,
        month: u32,
        year: i32,
        delta_bytes: u64,
    ) -> Result<()> {
        let delta = i64::try_from(delta_bytes).unwrap_or(i64::MAX);

        tokio::time::timeout(
            self.statement_timeout,
            sqlx::query(UPSERT_ADD)
                .bind(hostname)
                .bind(month as i32)
                .bind(year)
                .bind(delta)
                .execute(&self.pool),
        )
        .await
        .with_context(|| format!("upsert for {hostname} timed out"))?
        .with_context(|| format!("upserting traffic bucket for {hostname}"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_statement_adds_instead_of_overwriting() {
        assert!(UPSERT_ADD.contains("ON CONFLICT (hostname, month, year)"));
        assert!(UPSERT_ADD.contains("traffic.bytes + EXCLUDED.bytes"));
    }

    #[test]
    fn test_schema_matches_bucket_key() {
        assert!(CREATE_TRAFFIC_TABLE.contains("IF NOT EXISTS"));
        assert!(CREATE_TRAFFIC_TABLE.contains("PRIMARY KEY (hostname, month, year)"));
    }
}
