use super::{into_entries, EntryRow, SqliteStore, ENTRY_COLUMNS};
use crate::storage::types::{Entry, StoreError};

// ============================================================================
// FTS5 Query Validation
// ============================================================================

const MAX_QUERY_LENGTH: usize = 256;
const MAX_WILDCARDS: usize = 3;
const MAX_OR_OPERATORS: usize = 5;
const MAX_PARENTHESES: usize = 5;
const MAX_AND_OPERATORS: usize = 10;

/// Hard cap on rows returned by a single search.
const MAX_RESULTS: usize = 2000;

/// Rejects FTS5 queries whose expansion cost is unbounded.
///
/// Limits: 256 characters, 3 wildcards, 5 `OR`, 10 `AND`, 5 balanced
/// parenthesis pairs.
fn validate_fts_query(query: &str) -> Result<(), StoreError> {
    let reject = |msg: String| Err(StoreError::InvalidQuery(msg));

    if query.len() > MAX_QUERY_LENGTH {
        return reject(format!("longer than {MAX_QUERY_LENGTH} characters"));
    }
    if query.matches('*').count() > MAX_WILDCARDS {
        return reject(format!("more than {MAX_WILDCARDS} wildcards"));
    }

    let upper = query.to_uppercase();
    if upper.matches(" OR ").count() > MAX_OR_OPERATORS {
        return reject(format!("more than {MAX_OR_OPERATORS} OR operators"));
    }
    if upper.matches(" AND ").count() > MAX_AND_OPERATORS {
        return reject(format!("more than {MAX_AND_OPERATORS} AND operators"));
    }

    let open = query.chars().filter(|&c| c == '(').count();
    let close = query.chars().filter(|&c| c == ')').count();
    if open > MAX_PARENTHESES {
        return reject(format!("more than {MAX_PARENTHESES} parentheses"));
    }
    if open != close {
        return reject("unbalanced parentheses".to_owned());
    }

    Ok(())
}

/// Escapes `%`, `_` and `\` for a `LIKE .. ESCAPE '\'` pattern.
fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

impl SqliteStore {
    // ========================================================================
    // Search Operations
    // ========================================================================

    /// Full-text search over entry title and content.
    ///
    /// Queries FTS5 first; anything FTS5 refuses to parse (stray quotes,
    /// dangling operators) falls back to a substring `LIKE`.
    pub(crate) async fn search_entries(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Entry>, StoreError> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        validate_fts_query(query)?;

        let limit = limit.min(MAX_RESULTS) as i64;
        tracing::debug!(query = %query, limit, "searching entries");

        let fts_sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries \
             WHERE seq IN (SELECT rowid FROM entries_fts WHERE entries_fts MATCH ?) \
             ORDER BY published_at IS NULL, published_at DESC \
             LIMIT ?"
        );
        let fts_result: Result<Vec<EntryRow>, sqlx::Error> = sqlx::query_as(&fts_sql)
            .bind(query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await;

        let rows = match fts_result {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, query = %query, "FTS5 search failed, falling back to LIKE");
                let like_sql = format!(
                    "SELECT {ENTRY_COLUMNS} FROM entries \
                     WHERE title LIKE ?1 ESCAPE '\\' OR content LIKE ?1 ESCAPE '\\' \
                     ORDER BY published_at IS NULL, published_at DESC \
                     LIMIT ?2"
                );
                sqlx::query_as(&like_sql)
                    .bind(like_pattern(query))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        into_entries(rows)
    }

    /// Merges FTS5 index segments; run as part of `compact`.
    pub(crate) async fn optimize_search_index(&self) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO entries_fts(entries_fts) VALUES('optimize')")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
