//! Persistence for feeds and entries.
//!
//! Everything above this module talks to the [`Store`] trait. Two backends
//! implement it:
//!
//! - [`SqliteStore`] - a single SQLite file with an FTS5 index
//! - [`MarkdownStore`] - a directory with a `_feeds.yaml` registry and one
//!   YAML-front-matter file per entry
//!
//! Backends own identity (`url` and `(feed_id, guid)` uniqueness), cascade
//! deletes and the `read`/`read_at` invariant. [`migrate_data`] copies a whole
//! store from one backend to another.

mod markdown;
mod migrate;
mod sqlite;
mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::config::{Backend, Config};

pub use markdown::MarkdownStore;
pub use migrate::{migrate_data, MigrationReport};
pub use sqlite::SqliteStore;
pub use types::{
    new_id, now, Entry, EntryFilter, Feed, FeedStats, FetchCommit, OverallStats, StoreError,
    MIN_PREFIX_LEN,
};

/// File name of the relational database inside the data directory.
pub const SQLITE_FILE_NAME: &str = "rivulet.db";

/// Backend-independent storage operations.
///
/// Every method completes its write before returning; a failed write leaves
/// the store as it was.
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Feeds
    // ------------------------------------------------------------------

    /// Inserts a feed. Fails with [`StoreError::DuplicateUrl`] when the URL is taken.
    async fn create_feed(&self, feed: &Feed) -> Result<(), StoreError>;

    async fn get_feed(&self, id: &str) -> Result<Feed, StoreError>;

    async fn get_feed_by_url(&self, url: &str) -> Result<Feed, StoreError>;

    async fn get_feed_by_prefix(&self, prefix: &str) -> Result<Feed, StoreError>;

    /// All feeds, newest subscription first.
    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError>;

    /// Overwrites the mutable fields of an existing feed.
    async fn update_feed(&self, feed: &Feed) -> Result<(), StoreError>;

    /// Removes a feed and every entry that belongs to it.
    async fn delete_feed(&self, id: &str) -> Result<(), StoreError>;

    /// Records a successful fetch: stores validators and time, clears
    /// `last_error` and resets `error_count`.
    async fn update_fetch_state(
        &self,
        id: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Records a failed fetch: stores the message and increments `error_count`.
    async fn update_error(&self, id: &str, message: &str) -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------

    /// Inserts an entry. Fails with [`StoreError::DuplicateEntry`] when the
    /// `(feed_id, guid)` pair exists and [`StoreError::NotFound`] when the
    /// parent feed does not.
    async fn create_entry(&self, entry: &Entry) -> Result<(), StoreError>;

    async fn get_entry(&self, id: &str) -> Result<Entry, StoreError>;

    async fn get_entry_by_prefix(&self, prefix: &str) -> Result<Entry, StoreError>;

    /// Entries matching `filter`, newest `published_at` first, undated last.
    async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<Entry>, StoreError>;

    async fn update_entry(&self, entry: &Entry) -> Result<(), StoreError>;

    async fn delete_entry(&self, id: &str) -> Result<(), StoreError>;

    async fn mark_read(&self, id: &str) -> Result<(), StoreError>;

    async fn mark_unread(&self, id: &str) -> Result<(), StoreError>;

    /// Marks every unread entry published before `cutoff` as read and returns
    /// how many changed. Undated entries are left alone.
    async fn mark_read_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn entry_exists(&self, feed_id: &str, guid: &str) -> Result<bool, StoreError>;

    async fn count_unread(&self, feed_id: Option<&str>) -> Result<u64, StoreError>;

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Applies a successful fetch atomically: inserts the entries that are
    /// not present yet, records the title if the feed has none, and updates
    /// the fetch state. Returns the number of inserted entries.
    async fn commit_fetch(&self, commit: &FetchCommit) -> Result<usize, StoreError>;

    // ------------------------------------------------------------------
    // Stats and maintenance
    // ------------------------------------------------------------------

    async fn feed_stats(&self, feed_id: &str) -> Result<FeedStats, StoreError>;

    async fn overall_stats(&self) -> Result<OverallStats, StoreError>;

    /// Reclaims space where the backend supports it.
    async fn compact(&self) -> Result<(), StoreError>;

    /// Entries whose title or content matches `query`, newest first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Entry>, StoreError>;
}

/// Opens the backend selected in `config`, creating the data directory if needed.
pub async fn open(config: &Config) -> Result<Box<dyn Store>, StoreError> {
    open_backend(config.backend, &config.data_dir).await
}

/// Opens a specific backend rooted at `data_dir`.
pub async fn open_backend(
    backend: Backend,
    data_dir: &Path,
) -> Result<Box<dyn Store>, StoreError> {
    std::fs::create_dir_all(data_dir)?;
    match backend {
        Backend::Sqlite => {
            let store = SqliteStore::open(&data_dir.join(SQLITE_FILE_NAME)).await?;
            Ok(Box::new(store))
        }
        Backend::Markdown => Ok(Box::new(MarkdownStore::open(data_dir)?)),
    }
}
