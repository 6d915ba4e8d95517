use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;

use super::{
    into_entries, map_constraint, millis, opt_millis, require_affected, EntryRow, SqliteStore,
    ENTRY_COLUMNS,
};
use crate::storage::types::{
    now, resolve_prefix, Entry, EntryFilter, StoreError, MIN_PREFIX_LEN,
};

impl SqliteStore {
    // ========================================================================
    // Entry Operations
    // ========================================================================

    pub(crate) async fn insert_entry(&self, entry: &Entry) -> Result<(), StoreError> {
        let mut entry = entry.clone();
        entry.normalize();

        sqlx::query(
            r#"
            INSERT INTO entries (id, feed_id, guid, title, link, author, content,
                                 published_at, read, read_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&entry.id)
        .bind(&entry.feed_id)
        .bind(&entry.guid)
        .bind(&entry.title)
        .bind(&entry.link)
        .bind(&entry.author)
        .bind(&entry.content)
        .bind(opt_millis(entry.published_at))
        .bind(entry.read)
        .bind(opt_millis(entry.read_at))
        .bind(millis(entry.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_constraint(e, StoreError::DuplicateEntry))?;
        Ok(())
    }

    pub(crate) async fn entry_by_id(&self, id: &str) -> Result<Entry, StoreError> {
        let row: Option<EntryRow> =
            sqlx::query_as(&format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or(StoreError::NotFound)?.into_entry()
    }

    pub(crate) async fn entry_by_prefix(&self, prefix: &str) -> Result<Entry, StoreError> {
        let rows: Vec<EntryRow> = if prefix.chars().count() < MIN_PREFIX_LEN {
            sqlx::query_as(&format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?"))
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query_as(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries WHERE substr(id, 1, length(?1)) = ?1"
            ))
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?
        };

        let entries = into_entries(rows)?;
        resolve_prefix(prefix, &entries, |e| e.id.as_str()).cloned()
    }

    /// Filtered listing, newest first with undated entries last.
    pub(crate) async fn query_entries(
        &self,
        filter: &EntryFilter,
    ) -> Result<Vec<Entry>, StoreError> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE 1 = 1"));

        if let Some(scope) = filter.scope() {
            if scope.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND feed_id IN (");
            let mut separated = builder.separated(", ");
            for feed_id in scope {
                separated.push_bind(feed_id.to_owned());
            }
            separated.push_unseparated(")");
        }
        if filter.unread_only {
            builder.push(" AND read = 0");
        }
        if let Some(since) = filter.since {
            builder.push(" AND published_at >= ").push_bind(millis(since));
        }
        if let Some(until) = filter.until {
            builder.push(" AND published_at < ").push_bind(millis(until));
        }

        builder.push(" ORDER BY published_at IS NULL, published_at DESC");

        if filter.limit.is_some() || filter.offset.is_some() {
            // SQLite treats a negative LIMIT as unbounded
            let limit = filter.limit.map_or(-1, |l| l as i64);
            let offset = filter.offset.unwrap_or(0) as i64;
            builder
                .push(" LIMIT ")
                .push_bind(limit)
                .push(" OFFSET ")
                .push_bind(offset);
        }

        let rows: Vec<EntryRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        into_entries(rows)
    }

    /// Overwrites the mutable fields. `id`, `feed_id`, `guid` and `created_at`
    /// are identity and stay as stored.
    pub(crate) async fn save_entry(&self, entry: &Entry) -> Result<(), StoreError> {
        let mut entry = entry.clone();
        entry.normalize();

        let result = sqlx::query(
            r#"
            UPDATE entries SET
                title = ?, link = ?, author = ?, content = ?,
                published_at = ?, read = ?, read_at = ?
            WHERE id = ?
        "#,
        )
        .bind(&entry.title)
        .bind(&entry.link)
        .bind(&entry.author)
        .bind(&entry.content)
        .bind(opt_millis(entry.published_at))
        .bind(entry.read)
        .bind(opt_millis(entry.read_at))
        .bind(&entry.id)
        .execute(&self.pool)
        .await?;
        require_affected(result.rows_affected())
    }

    pub(crate) async fn remove_entry(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM entries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        require_affected(result.rows_affected())
    }

    pub(crate) async fn set_read(&self, id: &str, read: bool) -> Result<(), StoreError> {
        let read_at = read.then(|| millis(now()));
        let result = sqlx::query("UPDATE entries SET read = ?, read_at = ? WHERE id = ?")
            .bind(read)
            .bind(read_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        require_affected(result.rows_affected())
    }

    pub(crate) async fn set_read_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE entries SET read = 1, read_at = ?
            WHERE read = 0 AND published_at IS NOT NULL AND published_at < ?
        "#,
        )
        .bind(millis(now()))
        .bind(millis(cutoff))
        .execute(&self.pool)
        .await?;

        tracing::debug!(count = result.rows_affected(), %cutoff, "marked entries read");
        Ok(result.rows_affected())
    }

    pub(crate) async fn has_entry(&self, feed_id: &str, guid: &str) -> Result<bool, StoreError> {
        let (found,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM entries WHERE feed_id = ? AND guid = ?)",
        )
        .bind(feed_id)
        .bind(guid)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    pub(crate) async fn unread_count(&self, feed_id: Option<&str>) -> Result<u64, StoreError> {
        let (count,): (i64,) = match feed_id {
            Some(feed_id) => {
                sqlx::query_as("SELECT COUNT(*) FROM entries WHERE read = 0 AND feed_id = ?")
                    .bind(feed_id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM entries WHERE read = 0")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }
}
