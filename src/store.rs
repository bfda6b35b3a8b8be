use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, info};

/// Discord channel identifier (snowflake).
pub type ChannelId = i64;

/// One tracked `(channel, keyword)` pair with its watermark.
///
/// `last_seen` is the `created` timestamp of the newest listing already
/// notified for this entry; it only ever moves forward.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TrackedEntry {
    pub channel_id: ChannelId,
    pub keyword: String,
    pub last_seen: i64,
    pub found_count: i64,
}

/// Result of registering a new tracked pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    AlreadyTracked,
}

/// Aggregate view used by the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedCounts {
    pub unique_channels: i64,
    pub total_entries: i64,
}

/// Persistent store of tracked entries.
///
/// The engine owns the store exclusively at cycle boundaries, so
/// `reconnect` can take `&mut self` without further synchronization.
#[async_trait]
pub trait EntryStore {
    /// Whether the backend is currently reachable.
    async fn verify_connection(&self) -> bool;

    /// Re-establish the backend connection after a connectivity loss.
    async fn reconnect(&mut self) -> Result<()>;

    /// All tracked entries, ordered by channel then keyword.
    async fn list_all(&self) -> Result<Vec<TrackedEntry>>;

    /// Persist a new watermark. No-op when `new_ts` does not exceed the
    /// stored value, so the watermark is monotonic by construction.
    async fn advance_watermark(
        &self,
        channel_id: ChannelId,
        keyword: &str,
        new_ts: i64,
    ) -> Result<()>;

    /// Add `by` to the entry's running found-count.
    async fn bump_found_count(&self, channel_id: ChannelId, keyword: &str, by: i64) -> Result<()>;

    /// Register a new tracked pair with its initial watermark.
    async fn add_entry(
        &self,
        channel_id: ChannelId,
        keyword: &str,
        registered_at: i64,
    ) -> Result<InsertOutcome>;

    /// Remove one tracked pair. Returns `false` when it did not exist.
    async fn remove_entry(&self, channel_id: ChannelId, keyword: &str) -> Result<bool>;

    /// Remove every entry registered to a channel, returning how many.
    async fn remove_all_for_channel(&self, channel_id: ChannelId) -> Result<u64>;

    /// Entries registered to one channel, for keyword listings.
    async fn entries_for_channel(&self, channel_id: ChannelId) -> Result<Vec<TrackedEntry>>;

    /// Channel/entry totals for the status surface.
    async fn aggregate_counts(&self) -> Result<TrackedCounts>;
}

/// Postgres-backed entry store.
pub struct PgEntryStore {
    url: String,
    pool: PgPool,
}

impl PgEntryStore {
    /// Connect to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = Self::build_pool(url).await?;
        info!("Connected to entry database");
        Ok(Self {
            url: url.to_string(),
            pool,
        })
    }

    async fn build_pool(url: &str) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .context("failed to connect to entry database")
    }

    /// Create the tracked-entries table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tracked_entries (
                 channel_id  BIGINT NOT NULL,
                 keyword     TEXT   NOT NULL,
                 last_seen   BIGINT NOT NULL,
                 found_count BIGINT NOT NULL DEFAULT 0,
                 PRIMARY KEY (channel_id, keyword)
             )",
        )
        .execute(&self.pool)
        .await
        .context("failed to create tracked_entries table")?;
        Ok(())
    }
}

#[async_trait]
impl EntryStore for PgEntryStore {
    async fn verify_connection(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.pool.close().await;
        self.pool = Self::build_pool(&self.url).await?;
        info!("Re-established entry database connection");
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<TrackedEntry>> {
        let entries = sqlx::query_as::<_, TrackedEntry>(
            "SELECT channel_id, keyword, last_seen, found_count
             FROM tracked_entries
             ORDER BY channel_id, keyword",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load tracked entries")?;
        Ok(entries)
    }

    async fn advance_watermark(
        &self,
        channel_id: ChannelId,
        keyword: &str,
        new_ts: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tracked_entries
             SET last_seen = $3
             WHERE channel_id = $1 AND keyword = $2 AND last_seen < $3",
        )
        .bind(channel_id)
        .bind(keyword)
        .bind(new_ts)
        .execute(&self.pool)
        .await
        .context("failed to advance watermark")?;
        if result.rows_affected() == 1 {
            debug!("Watermark for ({channel_id}, \"{keyword}\") advanced to {new_ts}");
        }
        Ok(())
    }

    async fn bump_found_count(&self, channel_id: ChannelId, keyword: &str, by: i64) -> Result<()> {
        sqlx::query(
            "UPDATE tracked_entries
             SET found_count = found_count + $3
             WHERE channel_id = $1 AND keyword = $2",
        )
        .bind(channel_id)
        .bind(keyword)
        .bind(by)
        .execute(&self.pool)
        .await
        .context("failed to update found count")?;
        Ok(())
    }

    async fn add_entry(
        &self,
        channel_id: ChannelId,
        keyword: &str,
        registered_at: i64,
    ) -> Result<InsertOutcome> {
        let result = sqlx::query(
            "INSERT INTO tracked_entries (channel_id, keyword, last_seen, found_count)
             VALUES ($1, $2, $3, 0)
             ON CONFLICT (channel_id, keyword) DO NOTHING",
        )
        .bind(channel_id)
        .bind(keyword)
        .bind(registered_at)
        .execute(&self.pool)
        .await
        .context("failed to add tracked entry")?;

        if result.rows_affected() == 1 {
            Ok(InsertOutcome::Added)
        } else {
            Ok(InsertOutcome::AlreadyTracked)
        }
    }

    async fn remove_entry(&self, channel_id: ChannelId, keyword: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM tracked_entries WHERE channel_id = $1 AND keyword = $2",
        )
        .bind(channel_id)
        .bind(keyword)
        .execute(&self.pool)
        .await
        .context("failed to remove tracked entry")?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_all_for_channel(&self, channel_id: ChannelId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tracked_entries WHERE channel_id = $1")
            .bind(channel_id)
            .execute(&self.pool)
            .await
            .context("failed to remove channel entries")?;
        Ok(result.rows_affected())
    }

    async fn entries_for_channel(&self, channel_id: ChannelId) -> Result<Vec<TrackedEntry>> {
        let entries = sqlx::query_as::<_, TrackedEntry>(
            "SELECT channel_id, keyword, last_seen, found_count
             FROM tracked_entries
             WHERE channel_id = $1
             ORDER BY keyword",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load channel entries")?;
        Ok(entries)
    }

    async fn aggregate_counts(&self) -> Result<TrackedCounts> {
        let (unique_channels, total_entries): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(DISTINCT channel_id), COUNT(*) FROM tracked_entries",
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to aggregate entry counts")?;
        Ok(TrackedCounts {
            unique_channels,
            total_entries,
        })
    }
}
