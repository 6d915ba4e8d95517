//! The ingestion pipeline: fetch, parse, dedupe and commit.

use std::collections::HashSet;
use thiserror::Error;

use super::discovery::{discover_feed, DiscoveryError};
use super::fetcher::{FetchError, FetchOutcome, Fetcher};
use super::parser::{parse_feed, ParseError, ParsedEntry};
use crate::storage::{now, Entry, Feed, FetchCommit, Store, StoreError};

/// Why a single feed failed to refresh.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not parse feed: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a subscription could not be added.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a successful refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// Fresh body; this many entries were new
    Updated(usize),
    /// The server answered 304
    Cached,
}

/// Result for one feed in a batch.
#[derive(Debug)]
pub struct FeedOutcome {
    pub feed_id: String,
    /// Display title at the time of the refresh
    pub title: String,
    pub result: Result<FeedStatus, RefreshError>,
}

/// Totals for a batch refresh.
#[derive(Debug, Default)]
pub struct RefreshSummary {
    pub total: usize,
    pub new_entries: usize,
    pub cached: usize,
    pub errors: usize,
    /// Per-feed results in processing order
    pub outcomes: Vec<FeedOutcome>,
}

impl RefreshSummary {
    fn record(&mut self, outcome: FeedOutcome) {
        self.total += 1;
        match &outcome.result {
            Ok(FeedStatus::Updated(n)) => self.new_entries += n,
            Ok(FeedStatus::Cached) => self.cached += 1,
            Err(_) => self.errors += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// Refreshes every subscribed feed, one at a time.
///
/// A failing feed is recorded and the batch moves on. `on_outcome` is called
/// after each feed so callers can report progress as it happens.
pub async fn refresh_all(
    store: &dyn Store,
    fetcher: &Fetcher,
    force: bool,
    mut on_outcome: impl FnMut(&FeedOutcome),
) -> Result<RefreshSummary, StoreError> {
    let feeds = store.list_feeds().await?;
    let mut summary = RefreshSummary::default();

    for feed in &feeds {
        let result = refresh_one(store, fetcher, feed, force).await;
        let outcome = FeedOutcome {
            feed_id: feed.id.clone(),
            title: feed.display_title().to_owned(),
            result,
        };
        on_outcome(&outcome);
        summary.record(outcome);
    }

    tracing::info!(
        total = summary.total,
        new_entries = summary.new_entries,
        cached = summary.cached,
        errors = summary.errors,
        "refresh complete"
    );
    Ok(summary)
}

/// Refreshes a single feed.
///
/// With `force`, stored validators are not sent and the server has to return
/// a full body. Fetch and parse failures are recorded on the feed with
/// [`Store::update_error`] before being returned; the feed's validators and
/// `last_fetched_at` are left alone in that case.
pub async fn refresh_one(
    store: &dyn Store,
    fetcher: &Fetcher,
    feed: &Feed,
    force: bool,
) -> Result<FeedStatus, RefreshError> {
    let (etag, last_modified) = if force {
        (None, None)
    } else {
        (feed.etag.as_deref(), feed.last_modified.as_deref())
    };

    let body = match fetcher.fetch(&feed.url, etag, last_modified).await {
        Ok(FetchOutcome::Fresh(body)) => body,
        Ok(FetchOutcome::NotModified) => {
            store
                .update_fetch_state(
                    &feed.id,
                    feed.etag.as_deref(),
                    feed.last_modified.as_deref(),
                    now(),
                )
                .await?;
            tracing::debug!(feed_id = %feed.id, "feed not modified");
            return Ok(FeedStatus::Cached);
        }
        Err(e) => return Err(record_failure(store, feed, e.into()).await),
    };

    let parsed = match parse_feed(&body.body) {
        Ok(parsed) => parsed,
        Err(e) => return Err(record_failure(store, feed, e.into()).await),
    };

    let mut seen: HashSet<&str> = HashSet::new();
    let mut entries = Vec::new();
    for item in &parsed.entries {
        if !seen.insert(item.guid.as_str()) {
            continue;
        }
        if store.entry_exists(&feed.id, &item.guid).await? {
            continue;
        }
        entries.push(new_entry(&feed.id, item));
    }

    let commit = FetchCommit {
        feed_id: feed.id.clone(),
        title: parsed.title.filter(|_| !feed.has_title()),
        etag: body.etag,
        last_modified: body.last_modified,
        fetched_at: now(),
        entries,
    };
    let inserted = store.commit_fetch(&commit).await?;

    tracing::debug!(
        feed_id = %feed.id,
        parsed = parsed.entries.len(),
        inserted,
        "feed refreshed"
    );
    Ok(FeedStatus::Updated(inserted))
}

/// Stores the failure message on the feed and hands the error back.
async fn record_failure(store: &dyn Store, feed: &Feed, err: RefreshError) -> RefreshError {
    tracing::warn!(feed_id = %feed.id, url = %feed.url, error = %err, "feed refresh failed");
    if let Err(store_err) = store.update_error(&feed.id, &err.to_string()).await {
        tracing::warn!(feed_id = %feed.id, error = %store_err, "failed to record feed error");
    }
    err
}

fn new_entry(feed_id: &str, item: &ParsedEntry) -> Entry {
    let mut entry = Entry::new(feed_id, item.guid.clone());
    entry.title = item.title.clone();
    entry.link = item.link.clone();
    entry.author = item.author.clone();
    entry.content = item.content.clone();
    entry.published_at = item.published_at;
    entry
}

/// Discovers the feed behind `url` and subscribes to it.
///
/// An explicit `title` wins over the discovered one. Subscribing to a feed
/// URL that is already present fails with [`StoreError::DuplicateUrl`].
pub async fn subscribe(
    store: &dyn Store,
    fetcher: &Fetcher,
    url: &str,
    folder: Option<&str>,
    title: Option<&str>,
) -> Result<Feed, SubscribeError> {
    let discovered = discover_feed(fetcher, url).await?;

    let mut feed = Feed::new(discovered.url);
    feed.title = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .or(discovered.title);
    feed.folder = folder
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_owned);

    store.create_feed(&feed).await?;
    tracing::info!(feed_id = %feed.id, url = %feed.url, "subscribed");
    Ok(feed)
}
