use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Shortest id prefix accepted by the `*_by_prefix` lookups.
pub const MIN_PREFIX_LEN: usize = 6;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by every [`Store`](super::Store) backend.
///
/// The first group are domain outcomes callers match on; the rest are
/// storage failures that always carry the lower-level cause.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a feed with this URL already exists")]
    DuplicateUrl,

    #[error("an entry with this guid already exists in the feed")]
    DuplicateEntry,

    #[error("not found")]
    NotFound,

    #[error("prefix is ambiguous: matches {0} items")]
    AmbiguousPrefix(usize),

    #[error("prefix must be at least 6 characters")]
    PrefixTooShort,

    #[error("invalid search query: {0}")]
    InvalidQuery(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("schema migration failed: {0}")]
    Migration(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// True for the storage-class variants (as opposed to lookup or
    /// uniqueness outcomes).
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            StoreError::Database(_)
                | StoreError::Io(_)
                | StoreError::Yaml(_)
                | StoreError::Migration(_)
                | StoreError::Corrupt(_)
        )
    }
}

// ============================================================================
// Identity and time helpers
// ============================================================================

/// Fresh random identifier in canonical hex-dash form.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time at the precision both backends persist (milliseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Resolves a prefix lookup over candidate ids.
///
/// An exact id match always wins, even if it is shorter than
/// [`MIN_PREFIX_LEN`]. Otherwise the prefix must be long enough and must
/// select exactly one candidate.
pub(crate) fn resolve_prefix<'a, T>(
    prefix: &str,
    candidates: impl IntoIterator<Item = &'a T>,
    id_of: impl Fn(&T) -> &str,
) -> Result<&'a T, StoreError>
where
    T: 'a,
{
    let candidates: Vec<&'a T> = candidates.into_iter().collect();

    if let Some(exact) = candidates.iter().copied().find(|c| id_of(*c) == prefix) {
        return Ok(exact);
    }
    if prefix.chars().count() < MIN_PREFIX_LEN {
        return Err(StoreError::PrefixTooShort);
    }

    let matches: Vec<&'a T> = candidates
        .into_iter()
        .filter(|c| id_of(*c).starts_with(prefix))
        .collect();

    match matches.len() {
        0 => Err(StoreError::NotFound),
        1 => Ok(matches[0]),
        n => Err(StoreError::AmbiguousPrefix(n)),
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub last_fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Feed {
    /// New feed record with a fresh id and no fetch history.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            url: url.into(),
            title: None,
            folder: None,
            etag: None,
            last_modified: None,
            last_fetched_at: None,
            last_error: None,
            error_count: 0,
            created_at: now(),
        }
    }

    /// Title for display, falling back to the URL.
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.url)
    }

    /// True when no title has been recorded yet.
    pub fn has_title(&self) -> bool {
        self.title.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// A single item inside a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub feed_id: String,
    pub guid: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    /// New unread entry with a fresh id.
    pub fn new(feed_id: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            feed_id: feed_id.into(),
            guid: guid.into(),
            title: None,
            link: None,
            author: None,
            content: None,
            published_at: None,
            read: false,
            read_at: None,
            created_at: now(),
        }
    }

    /// Enforces `read == false <=> read_at == None`.
    pub fn normalize_read_state(&mut self) {
        if !self.read {
            self.read_at = None;
        } else if self.read_at.is_none() {
            self.read_at = Some(now());
        }
    }

    /// The shape both backends persist: consistent read state, and an empty
    /// body stored as no body.
    pub fn normalize(&mut self) {
        self.normalize_read_state();
        if self.content.as_deref().is_some_and(str::is_empty) {
            self.content = None;
        }
    }
}

/// Query filter for [`Store::list_entries`](super::Store::list_entries).
///
/// Every field is optional. When both `feed_id` and `feed_ids` are set,
/// `feed_ids` wins. `since` is inclusive, `until` exclusive; both compare
/// against `published_at`, so undated entries are excluded whenever either
/// bound is set.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub feed_id: Option<String>,
    pub feed_ids: Option<Vec<String>>,
    pub unread_only: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl EntryFilter {
    pub fn for_feed(feed_id: impl Into<String>) -> Self {
        Self {
            feed_id: Some(feed_id.into()),
            ..Self::default()
        }
    }

    /// Feed scope after applying the `feed_ids`-over-`feed_id` precedence.
    /// `None` means every feed.
    pub fn scope(&self) -> Option<Vec<&str>> {
        match (&self.feed_ids, &self.feed_id) {
            (Some(ids), _) => Some(ids.iter().map(String::as_str).collect()),
            (None, Some(id)) => Some(vec![id.as_str()]),
            (None, None) => None,
        }
    }

    /// In-memory predicate equivalent to the SQL filter.
    pub fn matches(&self, entry: &Entry) -> bool {
        if let Some(scope) = self.scope() {
            if !scope.contains(&entry.feed_id.as_str()) {
                return false;
            }
        }
        if self.unread_only && entry.read {
            return false;
        }
        if let Some(since) = self.since {
            if !entry.published_at.is_some_and(|p| p >= since) {
                return false;
            }
        }
        if let Some(until) = self.until {
            if !entry.published_at.is_some_and(|p| p < until) {
                return false;
            }
        }
        true
    }
}

/// Orders entries newest first with undated entries last.
pub(crate) fn sort_newest_first(entries: &mut [Entry]) {
    entries.sort_by(|a, b| match (a.published_at, b.published_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

/// Applies `offset`/`limit` after filtering and sorting.
pub(crate) fn paginate(entries: Vec<Entry>, filter: &EntryFilter) -> Vec<Entry> {
    let offset = filter.offset.unwrap_or(0);
    let iter = entries.into_iter().skip(offset);
    match filter.limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}

/// Entry counts for one feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    pub feed_id: String,
    pub total: u64,
    pub unread: u64,
}

/// Entry counts across the whole store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct OverallStats {
    pub feeds: u64,
    pub entries: u64,
    pub unread: u64,
}

/// Everything a successful fetch writes, applied atomically by
/// [`Store::commit_fetch`](super::Store::commit_fetch).
#[derive(Debug, Clone)]
pub struct FetchCommit {
    pub feed_id: String,
    /// Title to record; backends only apply it when the stored title is empty.
    pub title: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub fetched_at: DateTime<Utc>,
    /// Candidate entries; ones whose `(feed_id, guid)` already exists are skipped.
    pub entries: Vec<Entry>,
}
