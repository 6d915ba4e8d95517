use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Sqlite, Transaction,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::SqliteStore;
use crate::storage::types::StoreError;

impl SqliteStore {
    /// Opens (creating if needed) the database file at `path` and brings the
    /// schema up to date.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        // SEC-010: create the file owner-only before SQLite touches it
        #[cfg(unix)]
        if !path.exists() {
            use std::os::unix::fs::OpenOptionsExt;
            if let Err(e) = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
            {
                tracing::debug!(path = %path.display(), error = %e, "pre-creating database file failed");
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // SQLite is single-writer; a handful of connections covers CLI readers.
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "opened sqlite store");
        Ok(store)
    }

    /// Private in-memory database, used by tests and as a scratch target.
    ///
    /// Every pooled connection to `:memory:` would see its own empty database,
    /// so the pool is pinned to one connection that is never recycled.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Runs every schema step inside one transaction.
    ///
    /// All statements are idempotent, so re-running on an up-to-date file is a
    /// no-op. Columns introduced after the first release are added through
    /// [`add_column_if_missing`] so older files upgrade in place.
    async fn migrate(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        create_schema(&mut tx)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        tx.commit().await?;
        Ok(())
    }
}

async fn create_schema(tx: &mut Transaction<'_, Sqlite>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feeds (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL UNIQUE,
            title TEXT,
            etag TEXT,
            last_modified TEXT,
            last_fetched_at INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL
        )
    "#,
    )
    .execute(&mut **tx)
    .await?;

    add_column_if_missing(tx, "feeds", "folder", "TEXT").await?;
    add_column_if_missing(tx, "feeds", "error_count", "INTEGER NOT NULL DEFAULT 0").await?;

    // `seq` is an explicit INTEGER PRIMARY KEY so VACUUM keeps rowids stable
    // for the external-content FTS index.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            seq INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,
            feed_id TEXT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
            guid TEXT NOT NULL,
            title TEXT,
            link TEXT,
            author TEXT,
            content TEXT,
            published_at INTEGER,
            read INTEGER NOT NULL DEFAULT 0,
            read_at INTEGER,
            created_at INTEGER NOT NULL,
            UNIQUE(feed_id, guid)
        )
    "#,
    )
    .execute(&mut **tx)
    .await?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_entries_feed ON entries(feed_id)",
        "CREATE INDEX IF NOT EXISTS idx_entries_read ON entries(read)",
        "CREATE INDEX IF NOT EXISTS idx_entries_published ON entries(published_at DESC)",
        // Per-feed unread counts
        "CREATE INDEX IF NOT EXISTS idx_entries_feed_read ON entries(feed_id, read)",
    ] {
        sqlx::query(statement).execute(&mut **tx).await?;
    }

    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts
        USING fts5(title, content, content=entries, content_rowid=seq)
    "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS entries_fts_insert AFTER INSERT ON entries BEGIN
            INSERT INTO entries_fts(rowid, title, content)
            VALUES (new.seq, new.title, new.content);
        END
    "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS entries_fts_delete AFTER DELETE ON entries BEGIN
            INSERT INTO entries_fts(entries_fts, rowid, title, content)
            VALUES ('delete', old.seq, old.title, old.content);
        END
    "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS entries_fts_update AFTER UPDATE OF title, content ON entries BEGIN
            INSERT INTO entries_fts(entries_fts, rowid, title, content)
            VALUES ('delete', old.seq, old.title, old.content);
            INSERT INTO entries_fts(rowid, title, content)
            VALUES (new.seq, new.title, new.content);
        END
    "#,
    )
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// `ALTER TABLE .. ADD COLUMN` guarded by a `pragma_table_info` lookup.
///
/// `table`, `column` and `decl` are compile-time constants from this module,
/// never user input.
async fn add_column_if_missing(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), sqlx::Error> {
    let (present,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(&mut **tx)
            .await?;

    if present == 0 {
        tracing::debug!(table, column, "adding column");
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}
