use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;

use super::{
    map_constraint, millis, opt_millis, require_affected, FeedRow, SqliteStore, FEED_COLUMNS,
};
use crate::storage::types::{
    resolve_prefix, Entry, Feed, FeedStats, FetchCommit, OverallStats, StoreError, MIN_PREFIX_LEN,
};

impl SqliteStore {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    pub(crate) async fn insert_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feeds (id, url, title, folder, etag, last_modified,
                               last_fetched_at, last_error, error_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&feed.id)
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(&feed.folder)
        .bind(&feed.etag)
        .bind(&feed.last_modified)
        .bind(opt_millis(feed.last_fetched_at))
        .bind(&feed.last_error)
        .bind(i64::from(feed.error_count))
        .bind(millis(feed.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_constraint(e, StoreError::DuplicateUrl))?;

        tracing::debug!(feed_id = %feed.id, url = %feed.url, "feed created");
        Ok(())
    }

    pub(crate) async fn feed_by_id(&self, id: &str) -> Result<Feed, StoreError> {
        let row: Option<FeedRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or(StoreError::NotFound)?.into_feed()
    }

    pub(crate) async fn feed_by_url(&self, url: &str) -> Result<Feed, StoreError> {
        let row: Option<FeedRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"))
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or(StoreError::NotFound)?.into_feed()
    }

    pub(crate) async fn feed_by_prefix(&self, prefix: &str) -> Result<Feed, StoreError> {
        // Short prefixes only resolve through an exact id match.
        let rows: Vec<FeedRow> = if prefix.chars().count() < MIN_PREFIX_LEN {
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query_as(&format!(
                "SELECT {FEED_COLUMNS} FROM feeds WHERE substr(id, 1, length(?1)) = ?1"
            ))
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?
        };

        let feeds = rows
            .into_iter()
            .map(FeedRow::into_feed)
            .collect::<Result<Vec<_>, _>>()?;
        resolve_prefix(prefix, &feeds, |f| f.id.as_str()).cloned()
    }

    pub(crate) async fn all_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let rows: Vec<FeedRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FeedRow::into_feed).collect()
    }

    pub(crate) async fn save_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                url = ?, title = ?, folder = ?, etag = ?, last_modified = ?,
                last_fetched_at = ?, last_error = ?, error_count = ?
            WHERE id = ?
        "#,
        )
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(&feed.folder)
        .bind(&feed.etag)
        .bind(&feed.last_modified)
        .bind(opt_millis(feed.last_fetched_at))
        .bind(&feed.last_error)
        .bind(i64::from(feed.error_count))
        .bind(&feed.id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_constraint(e, StoreError::DuplicateUrl))?;

        require_affected(result.rows_affected())
    }

    /// Entries go with the feed through `ON DELETE CASCADE`.
    pub(crate) async fn remove_feed(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        require_affected(result.rows_affected())?;
        tracing::debug!(feed_id = %id, "feed deleted");
        Ok(())
    }

    pub(crate) async fn record_fetch(
        &self,
        id: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                etag = ?, last_modified = ?, last_fetched_at = ?,
                last_error = NULL, error_count = 0
            WHERE id = ?
        "#,
        )
        .bind(etag)
        .bind(last_modified)
        .bind(millis(fetched_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        require_affected(result.rows_affected())
    }

    pub(crate) async fn record_error(&self, id: &str, message: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE feeds SET last_error = ?, error_count = error_count + 1 WHERE id = ?",
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        require_affected(result.rows_affected())
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Inserts new entries and records fetch metadata in one transaction.
    ///
    /// `INSERT OR IGNORE` leaves existing `(feed_id, guid)` rows untouched, so
    /// read state survives re-ingest. The title is written only when the
    /// stored one is NULL or blank.
    pub(crate) async fn apply_fetch(&self, commit: &FetchCommit) -> Result<usize, StoreError> {
        // 12 bound columns per row keeps each statement well under SQLite's
        // variable limit.
        const BATCH_SIZE: usize = 50;

        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM feeds WHERE id = ?")
            .bind(&commit.feed_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        if let Some(title) = commit.title.as_deref().filter(|t| !t.trim().is_empty()) {
            sqlx::query(
                "UPDATE feeds SET title = ? WHERE id = ? AND (title IS NULL OR trim(title) = '')",
            )
            .bind(title)
            .bind(&commit.feed_id)
            .execute(&mut *tx)
            .await?;
        }

        let entries: Vec<Entry> = commit
            .entries
            .iter()
            .map(|entry| {
                let mut entry = entry.clone();
                entry.normalize();
                entry
            })
            .collect();

        let mut inserted: usize = 0;
        for chunk in entries.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO entries (id, feed_id, guid, title, link, author, content, \
                 published_at, read, read_at, created_at) ",
            );
            builder.push_values(chunk, |mut b, entry| {
                b.push_bind(&entry.id)
                    .push_bind(&commit.feed_id)
                    .push_bind(&entry.guid)
                    .push_bind(&entry.title)
                    .push_bind(&entry.link)
                    .push_bind(&entry.author)
                    .push_bind(&entry.content)
                    .push_bind(opt_millis(entry.published_at))
                    .push_bind(entry.read)
                    .push_bind(opt_millis(entry.read_at))
                    .push_bind(millis(entry.created_at));
            });

            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected() as usize;
        }

        sqlx::query(
            r#"
            UPDATE feeds SET
                etag = ?, last_modified = ?, last_fetched_at = ?,
                last_error = NULL, error_count = 0
            WHERE id = ?
        "#,
        )
        .bind(&commit.etag)
        .bind(&commit.last_modified)
        .bind(millis(commit.fetched_at))
        .bind(&commit.feed_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub(crate) async fn stats_for_feed(&self, feed_id: &str) -> Result<FeedStats, StoreError> {
        // NotFound for unknown feeds rather than zero counts
        self.feed_by_id(feed_id).await?;

        let (total, unread): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COALESCE(SUM(CASE WHEN read = 0 THEN 1 ELSE 0 END), 0)
            FROM entries
            WHERE feed_id = ?
        "#,
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(FeedStats {
            feed_id: feed_id.to_owned(),
            total: total as u64,
            unread: unread as u64,
        })
    }

    pub(crate) async fn stats_overall(&self) -> Result<OverallStats, StoreError> {
        let (feeds, entries, unread): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM feeds),
                (SELECT COUNT(*) FROM entries),
                (SELECT COUNT(*) FROM entries WHERE read = 0)
        "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OverallStats {
            feeds: feeds as u64,
            entries: entries as u64,
            unread: unread as u64,
        })
    }
}
