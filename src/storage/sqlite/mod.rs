//! Relational backend on a single SQLite file.
//!
//! Timestamps are stored as INTEGER unix milliseconds. Uniqueness and cascade
//! deletes are enforced by the schema; constraint violations are mapped onto
//! the matching [`StoreError`] variants.

mod entries;
mod feeds;
mod schema;
mod search;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::types::{Entry, EntryFilter, Feed, FeedStats, FetchCommit, OverallStats, StoreError};
use super::Store;

#[derive(Clone)]
pub struct SqliteStore {
    pub(crate) pool: SqlitePool,
}

// ============================================================================
// Row Types
// ============================================================================

pub(crate) const FEED_COLUMNS: &str = "id, url, title, folder, etag, last_modified, \
     last_fetched_at, last_error, error_count, created_at";

pub(crate) const ENTRY_COLUMNS: &str = "id, feed_id, guid, title, link, author, content, \
     published_at, read, read_at, created_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    id: String,
    url: String,
    title: Option<String>,
    folder: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    last_fetched_at: Option<i64>,
    last_error: Option<String>,
    error_count: i64,
    created_at: i64,
}

impl FeedRow {
    pub(crate) fn into_feed(self) -> Result<Feed, StoreError> {
        Ok(Feed {
            last_fetched_at: opt_from_millis(self.last_fetched_at)?,
            created_at: from_millis(self.created_at)?,
            error_count: u32::try_from(self.error_count).unwrap_or(u32::MAX),
            id: self.id,
            url: self.url,
            title: self.title,
            folder: self.folder,
            etag: self.etag,
            last_modified: self.last_modified,
            last_error: self.last_error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    id: String,
    feed_id: String,
    guid: String,
    title: Option<String>,
    link: Option<String>,
    author: Option<String>,
    content: Option<String>,
    published_at: Option<i64>,
    read: bool,
    read_at: Option<i64>,
    created_at: i64,
}

impl EntryRow {
    pub(crate) fn into_entry(self) -> Result<Entry, StoreError> {
        Ok(Entry {
            published_at: opt_from_millis(self.published_at)?,
            read_at: opt_from_millis(self.read_at)?,
            created_at: from_millis(self.created_at)?,
            id: self.id,
            feed_id: self.feed_id,
            guid: self.guid,
            title: self.title,
            link: self.link,
            author: self.author,
            content: self.content,
            read: self.read,
        })
    }
}

pub(crate) fn into_entries(rows: Vec<EntryRow>) -> Result<Vec<Entry>, StoreError> {
    rows.into_iter().map(EntryRow::into_entry).collect()
}

// ============================================================================
// Conversions
// ============================================================================

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_millis).transpose()
}

pub(crate) fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn opt_millis(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(millis)
}

/// Maps a constraint violation onto a domain error, passing anything else
/// through as [`StoreError::Database`].
pub(crate) fn map_constraint(err: sqlx::Error, on_unique: StoreError) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return on_unique;
        }
        if db_err.is_foreign_key_violation() {
            return StoreError::NotFound;
        }
    }
    StoreError::Database(err)
}

/// Turns a zero-row UPDATE/DELETE into [`StoreError::NotFound`].
pub(crate) fn require_affected(rows: u64) -> Result<(), StoreError> {
    if rows == 0 {
        Err(StoreError::NotFound)
    } else {
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

#[async_trait]
impl Store for SqliteStore {
    async fn create_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        self.insert_feed(feed).await
    }

    async fn get_feed(&self, id: &str) -> Result<Feed, StoreError> {
        self.feed_by_id(id).await
    }

    async fn get_feed_by_url(&self, url: &str) -> Result<Feed, StoreError> {
        self.feed_by_url(url).await
    }

    async fn get_feed_by_prefix(&self, prefix: &str) -> Result<Feed, StoreError> {
        self.feed_by_prefix(prefix).await
    }

    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        self.all_feeds().await
    }

    async fn update_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        self.save_feed(feed).await
    }

    async fn delete_feed(&self, id: &str) -> Result<(), StoreError> {
        self.remove_feed(id).await
    }

    async fn update_fetch_state(
        &self,
        id: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.record_fetch(id, etag, last_modified, fetched_at).await
    }

    async fn update_error(&self, id: &str, message: &str) -> Result<(), StoreError> {
        self.record_error(id, message).await
    }

    async fn create_entry(&self, entry: &Entry) -> Result<(), StoreError> {
        self.insert_entry(entry).await
    }

    async fn get_entry(&self, id: &str) -> Result<Entry, StoreError> {
        self.entry_by_id(id).await
    }

    async fn get_entry_by_prefix(&self, prefix: &str) -> Result<Entry, StoreError> {
        self.entry_by_prefix(prefix).await
    }

    async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<Entry>, StoreError> {
        self.query_entries(filter).await
    }

    async fn update_entry(&self, entry: &Entry) -> Result<(), StoreError> {
        self.save_entry(entry).await
    }

    async fn delete_entry(&self, id: &str) -> Result<(), StoreError> {
        self.remove_entry(id).await
    }

    async fn mark_read(&self, id: &str) -> Result<(), StoreError> {
        self.set_read(id, true).await
    }

    async fn mark_unread(&self, id: &str) -> Result<(), StoreError> {
        self.set_read(id, false).await
    }

    async fn mark_read_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.set_read_before(cutoff).await
    }

    async fn entry_exists(&self, feed_id: &str, guid: &str) -> Result<bool, StoreError> {
        self.has_entry(feed_id, guid).await
    }

    async fn count_unread(&self, feed_id: Option<&str>) -> Result<u64, StoreError> {
        self.unread_count(feed_id).await
    }

    async fn commit_fetch(&self, commit: &FetchCommit) -> Result<usize, StoreError> {
        self.apply_fetch(commit).await
    }

    async fn feed_stats(&self, feed_id: &str) -> Result<FeedStats, StoreError> {
        self.stats_for_feed(feed_id).await
    }

    async fn overall_stats(&self) -> Result<OverallStats, StoreError> {
        self.stats_overall().await
    }

    async fn compact(&self) -> Result<(), StoreError> {
        self.optimize_search_index().await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        tracing::info!("database compacted");
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Entry>, StoreError> {
        self.search_entries(query, limit).await
    }
}
