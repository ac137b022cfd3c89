/// Storage module with PostgreSQL persistence
///
/// This module handles:
/// - Feed configuration rows (read by the scheduler, timestamp written back)
/// - Posted-item dedup records and initial top-listing snapshots
/// - The source-request ledger used for usage balancing
/// - Job run rows (progress counters while a run is live, summary at the end)
///
/// The relay core depends only on the `Storage` trait; `PgStorage` is the
/// production backend and `MemoryStorage` backs the test suite and dry runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use crate::feed::{Feed, Sorting};
use crate::job::JobSummary;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Feeds eligible for scheduling: enabled and bound to a channel.
    async fn list_enabled_feeds_with_channel(&self) -> Result<Vec<Feed>>;
    async fn save_feed(&self, feed: &Feed) -> Result<()>;

    async fn already_posted(&self, feed_id: &str, candidate_id: &str) -> Result<bool>;
    async fn record_posted(&self, feed_id: &str, candidate_id: &str) -> Result<()>;

    async fn snapshot_exists(&self, feed_id: &str, sorting: Sorting) -> Result<bool>;
    async fn record_snapshot(&self, feed_id: &str, sorting: Sorting, ids: &[String]) -> Result<()>;
    async fn in_snapshot(&self, feed_id: &str, sorting: Sorting, candidate_id: &str) -> Result<bool>;

    /// Side channel: one row per listing request, for balancing usage
    /// across source accounts.
    async fn record_request(&self, feed_id: &str, client: &str, at: DateTime<Utc>) -> Result<()>;

    /// Upsert live progress counters so observers can see "7/20 feeds
    /// processed" while a run is still going.
    async fn save_progress(&self, run_id: Uuid, selected: u32, completed: u32) -> Result<()>;
    async fn finish_run(&self, summary: &JobSummary) -> Result<()>;
    async fn latest_run(&self) -> Result<Option<JobSummary>>;
}

/// PostgreSQL-backed storage.
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Connect to the database, tolerating connection poolers the same way
    /// the rest of the deployment does.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let use_pooler = database_url.contains(":6543") || database_url.contains("pgbouncer=true");

        let mut pool_options = sqlx::postgres::PgPoolOptions::new().max_connections(10);

        if use_pooler {
            log::info!("Using connection pooler - disabling prepared statements");
            pool_options = pool_options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET statement_timeout = 0")
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            });
        }

        let pool = pool_options
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(PgStorage { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables if they don't exist.
    pub async fn initialize_schema(&self) -> Result<()> {
        log::info!("Initializing database schema...");

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS feeds (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                channel_id BIGINT,
                sorting TEXT NOT NULL DEFAULT 'hot',
                candidate_limit INT NOT NULL DEFAULT 25,
                number_of_posts INT NOT NULL DEFAULT 1,
                max_frequency BIGINT NOT NULL DEFAULT 60,
                quiet_hours_start SMALLINT,
                quiet_hours_end SMALLINT,
                quiet_hours_demultiplier DOUBLE PRECISION NOT NULL DEFAULT 1,
                last_post_time TIMESTAMPTZ,
                min_score BIGINT NOT NULL DEFAULT 0,
                allow_nsfw BOOLEAN NOT NULL DEFAULT FALSE,
                min_age_minutes BIGINT NOT NULL DEFAULT 0,
                image_only BOOLEAN NOT NULL DEFAULT FALSE,
                ignore_pinned BOOLEAN NOT NULL DEFAULT TRUE,
                is_test BOOLEAN NOT NULL DEFAULT FALSE,
                enabled BOOLEAN NOT NULL DEFAULT TRUE
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create feeds table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS posted_items (
                feed_id TEXT NOT NULL,
                candidate_id TEXT NOT NULL,
                posted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (feed_id, candidate_id)
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create posted_items table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS initial_snapshots (
                feed_id TEXT NOT NULL,
                sorting TEXT NOT NULL,
                candidate_id TEXT NOT NULL,
                captured_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (feed_id, sorting, candidate_id)
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create initial_snapshots table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS source_requests (
                id BIGSERIAL PRIMARY KEY,
                feed_id TEXT NOT NULL,
                client TEXT NOT NULL,
                requested_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create source_requests table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS job_runs (
                run_id UUID PRIMARY KEY,
                started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                finished_at TIMESTAMPTZ,
                duration_secs DOUBLE PRECISION,
                selected INT NOT NULL DEFAULT 0,
                completed INT NOT NULL DEFAULT 0,
                posted_count BIGINT NOT NULL DEFAULT 0,
                posted_bytes DOUBLE PRECISION NOT NULL DEFAULT 0,
                canceled BOOLEAN NOT NULL DEFAULT FALSE,
                max_seen_index BIGINT NOT NULL DEFAULT -1
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create job_runs table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create settings table")?;

        log::info!("Database schema ready");
        Ok(())
    }

    fn feed_from_row(row: &sqlx::postgres::PgRow) -> Result<Feed> {
        let sorting_raw: String = row.try_get("sorting")?;
        let sorting = Sorting::parse(&sorting_raw)
            .with_context(|| format!("Unknown sorting value in feeds table: {}", sorting_raw))?;
        Ok(Feed {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            channel_id: row.try_get("channel_id")?,
            sorting,
            limit: row.try_get::<i32, _>("candidate_limit")? as u32,
            number_of_posts: row.try_get::<i32, _>("number_of_posts")? as u32,
            max_frequency: row.try_get("max_frequency")?,
            quiet_hours_start: row.try_get::<Option<i16>, _>("quiet_hours_start")?.map(|h| h as u8),
            quiet_hours_end: row.try_get::<Option<i16>, _>("quiet_hours_end")?.map(|h| h as u8),
            quiet_hours_demultiplier: row.try_get("quiet_hours_demultiplier")?,
            last_post_time: row.try_get("last_post_time")?,
            min_score: row.try_get("min_score")?,
            allow_nsfw: row.try_get("allow_nsfw")?,
            min_age_minutes: row.try_get("min_age_minutes")?,
            image_only: row.try_get("image_only")?,
            ignore_pinned: row.try_get("ignore_pinned")?,
            test: row.try_get("is_test")?,
            enabled: row.try_get("enabled")?,
        })
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn list_enabled_feeds_with_channel(&self) -> Result<Vec<Feed>> {
        let rows = sqlx::query(
            "SELECT * FROM feeds WHERE enabled = TRUE AND channel_id IS NOT NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load feeds")?;

        rows.iter().map(Self::feed_from_row).collect()
    }

    async fn save_feed(&self, feed: &Feed) -> Result<()> {
        sqlx::query(
            "INSERT INTO feeds (
                id, name, channel_id, sorting, candidate_limit, number_of_posts,
                max_frequency, quiet_hours_start, quiet_hours_end,
                quiet_hours_demultiplier, last_post_time, min_score, allow_nsfw,
                min_age_minutes, image_only, ignore_pinned, is_test, enabled
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                channel_id = EXCLUDED.channel_id,
                sorting = EXCLUDED.sorting,
                candidate_limit = EXCLUDED.candidate_limit,
                number_of_posts = EXCLUDED.number_of_posts,
                max_frequency = EXCLUDED.max_frequency,
                quiet_hours_start = EXCLUDED.quiet_hours_start,
                quiet_hours_end = EXCLUDED.quiet_hours_end,
                quiet_hours_demultiplier = EXCLUDED.quiet_hours_demultiplier,
                last_post_time = EXCLUDED.last_post_time,
                min_score = EXCLUDED.min_score,
                allow_nsfw = EXCLUDED.allow_nsfw,
                min_age_minutes = EXCLUDED.min_age_minutes,
                image_only = EXCLUDED.image_only,
                ignore_pinned = EXCLUDED.ignore_pinned,
                is_test = EXCLUDED.is_test,
                enabled = EXCLUDED.enabled",
        )
        .bind(&feed.id)
        .bind(&feed.name)
        .bind(feed.channel_id)
        .bind(feed.sorting.as_str())
        .bind(feed.limit as i32)
        .bind(feed.number_of_posts as i32)
        .bind(feed.max_frequency)
        .bind(feed.quiet_hours_start.map(|h| h as i16))
        .bind(feed.quiet_hours_end.map(|h| h as i16))
        .bind(feed.quiet_hours_demultiplier)
        .bind(feed.last_post_time)
        .bind(feed.min_score)
        .bind(feed.allow_nsfw)
        .bind(feed.min_age_minutes)
        .bind(feed.image_only)
        .bind(feed.ignore_pinned)
        .bind(feed.test)
        .bind(feed.enabled)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save feed {}", feed.id))?;

        Ok(())
    }

    async fn already_posted(&self, feed_id: &str, candidate_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM posted_items WHERE feed_id = $1 AND candidate_id = $2",
        )
        .bind(feed_id)
        .bind(candidate_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check posted_items")?;

        Ok(row.is_some())
    }

    async fn record_posted(&self, feed_id: &str, candidate_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO posted_items (feed_id, candidate_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(feed_id)
        .bind(candidate_id)
        .execute(&self.pool)
        .await
        .context("Failed to record posted item")?;

        Ok(())
    }

    async fn snapshot_exists(&self, feed_id: &str, sorting: Sorting) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM initial_snapshots WHERE feed_id = $1 AND sorting = $2 LIMIT 1",
        )
        .bind(feed_id)
        .bind(sorting.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check initial_snapshots")?;

        Ok(row.is_some())
    }

    async fn record_snapshot(&self, feed_id: &str, sorting: Sorting, ids: &[String]) -> Result<()> {
        for id in ids {
            sqlx::query(
                "INSERT INTO initial_snapshots (feed_id, sorting, candidate_id)
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(feed_id)
            .bind(sorting.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to record snapshot entry")?;
        }
        Ok(())
    }

    async fn in_snapshot(&self, feed_id: &str, sorting: Sorting, candidate_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM initial_snapshots
             WHERE feed_id = $1 AND sorting = $2 AND candidate_id = $3",
        )
        .bind(feed_id)
        .bind(sorting.as_str())
        .bind(candidate_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check snapshot membership")?;

        Ok(row.is_some())
    }

    async fn record_request(&self, feed_id: &str, client: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO source_requests (feed_id, client, requested_at) VALUES ($1, $2, $3)",
        )
        .bind(feed_id)
        .bind(client)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to record source request")?;

        Ok(())
    }

    async fn save_progress(&self, run_id: Uuid, selected: u32, completed: u32) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_runs (run_id, selected, completed) VALUES ($1, $2, $3)
             ON CONFLICT (run_id) DO UPDATE SET
                selected = EXCLUDED.selected,
                completed = EXCLUDED.completed",
        )
        .bind(run_id)
        .bind(selected as i32)
        .bind(completed as i32)
        .execute(&self.pool)
        .await
        .context("Failed to save run progress")?;

        Ok(())
    }

    async fn finish_run(&self, summary: &JobSummary) -> Result<()> {
        sqlx::query(
            "UPDATE job_runs SET
                finished_at = $2,
                duration_secs = $3,
                selected = $4,
                completed = $5,
                posted_count = $6,
                posted_bytes = $7,
                canceled = $8,
                max_seen_index = $9
             WHERE run_id = $1",
        )
        .bind(summary.run_id)
        .bind(summary.finished_at)
        .bind(summary.duration_secs)
        .bind(summary.selected as i32)
        .bind(summary.completed as i32)
        .bind(summary.result.posted_count as i64)
        .bind(summary.result.posted_bytes)
        .bind(summary.result.canceled)
        .bind(summary.result.max_seen_index)
        .execute(&self.pool)
        .await
        .context("Failed to finish job run")?;

        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<JobSummary>> {
        let row = sqlx::query("SELECT * FROM job_runs ORDER BY started_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load latest job run")?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        Ok(Some(JobSummary {
            run_id: row.try_get("run_id")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            duration_secs: row.try_get("duration_secs")?,
            selected: row.try_get::<i32, _>("selected")? as u32,
            completed: row.try_get::<i32, _>("completed")? as u32,
            result: crate::job::JobResult {
                posted_count: row.try_get::<i64, _>("posted_count")? as u64,
                posted_bytes: row.try_get("posted_bytes")?,
                canceled: row.try_get("canceled")?,
                max_seen_index: row.try_get("max_seen_index")?,
            },
        }))
    }
}

/// In-memory storage used by the test suite and local dry runs.
#[derive(Default)]
pub struct MemoryStorage {
    feeds: Mutex<HashMap<String, Feed>>,
    posted: Mutex<HashSet<(String, String)>>,
    snapshots: Mutex<HashMap<(String, String), HashSet<String>>>,
    requests: Mutex<Vec<(String, String, DateTime<Utc>)>>,
    progress: Mutex<HashMap<Uuid, (u32, u32)>>,
    runs: Mutex<Vec<JobSummary>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn progress_for(&self, run_id: Uuid) -> Option<(u32, u32)> {
        self.progress.lock().unwrap().get(&run_id).copied()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn list_enabled_feeds_with_channel(&self) -> Result<Vec<Feed>> {
        let feeds = self.feeds.lock().unwrap();
        let mut out: Vec<Feed> = feeds
            .values()
            .filter(|f| f.enabled && f.channel_id.is_some())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn save_feed(&self, feed: &Feed) -> Result<()> {
        self.feeds
            .lock()
            .unwrap()
            .insert(feed.id.clone(), feed.clone());
        Ok(())
    }

    async fn already_posted(&self, feed_id: &str, candidate_id: &str) -> Result<bool> {
        Ok(self
            .posted
            .lock()
            .unwrap()
            .contains(&(feed_id.to_string(), candidate_id.to_string())))
    }

    async fn record_posted(&self, feed_id: &str, candidate_id: &str) -> Result<()> {
        self.posted
            .lock()
            .unwrap()
            .insert((feed_id.to_string(), candidate_id.to_string()));
        Ok(())
    }

    async fn snapshot_exists(&self, feed_id: &str, sorting: Sorting) -> Result<bool> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .contains_key(&(feed_id.to_string(), sorting.as_str().to_string())))
    }

    async fn record_snapshot(&self, feed_id: &str, sorting: Sorting, ids: &[String]) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap()
            .entry((feed_id.to_string(), sorting.as_str().to_string()))
            .or_default()
            .extend(ids.iter().cloned());
        Ok(())
    }

    async fn in_snapshot(&self, feed_id: &str, sorting: Sorting, candidate_id: &str) -> Result<bool> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .get(&(feed_id.to_string(), sorting.as_str().to_string()))
            .map(|set| set.contains(candidate_id))
            .unwrap_or(false))
    }

    async fn record_request(&self, feed_id: &str, client: &str, at: DateTime<Utc>) -> Result<()> {
        self.requests
            .lock()
            .unwrap()
            .push((feed_id.to_string(), client.to_string(), at));
        Ok(())
    }

    async fn save_progress(&self, run_id: Uuid, selected: u32, completed: u32) -> Result<()> {
        self.progress
            .lock()
            .unwrap()
            .insert(run_id, (selected, completed));
        Ok(())
    }

    async fn finish_run(&self, summary: &JobSummary) -> Result<()> {
        self.runs.lock().unwrap().push(summary.clone());
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<JobSummary>> {
        Ok(self.runs.lock().unwrap().last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_dedup_roundtrip() {
        let storage = MemoryStorage::new();
        assert!(!storage.already_posted("pics", "abc").await.unwrap());
        storage.record_posted("pics", "abc").await.unwrap();
        assert!(storage.already_posted("pics", "abc").await.unwrap());
        // Other feeds are unaffected.
        assert!(!storage.already_posted("news", "abc").await.unwrap());
    }

    #[tokio::test]
    async fn feeds_without_channel_are_not_listed() {
        let storage = MemoryStorage::new();
        let mut visible = Feed::new("pics", 100);
        visible.name = "pics".into();
        storage.save_feed(&visible).await.unwrap();

        let mut orphan = Feed::new("news", 0);
        orphan.channel_id = None;
        storage.save_feed(&orphan).await.unwrap();

        let mut disabled = Feed::new("funny", 101);
        disabled.enabled = false;
        storage.save_feed(&disabled).await.unwrap();

        let listed = storage.list_enabled_feeds_with_channel().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "pics");
    }
}
