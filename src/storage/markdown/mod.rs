//! File backend: a data directory of YAML-front-matter Markdown files.
//!
//! ```text
//! <data_dir>/
//!   _feeds.yaml                 ordered feed records, each with a `slug`
//!   .lock                       advisory lock file
//!   <feed-slug>/
//!     <entry-slug>-<id8>.md     front matter + raw content
//! ```
//!
//! `_feeds.yaml` is the source of truth for feed identity. Every operation
//! runs on the blocking pool under an in-process mutex plus an exclusive
//! `flock` on `.lock`, so concurrent CLI invocations serialize without
//! stalling the async runtime. Operations touching several files apply them
//! as one [`Batch`].

mod batch;
mod entry_file;
mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use self::batch::Batch;
use self::registry::{FeedRecord, Registry};
use super::types::{
    now, paginate, resolve_prefix, sort_newest_first, Entry, EntryFilter, Feed, FeedStats,
    FetchCommit, OverallStats, StoreError,
};
use super::Store;

const LOCK_FILE: &str = ".lock";

pub struct MarkdownStore {
    dir: Arc<DataDir>,
}

/// The directory itself. Shared with blocking tasks.
struct DataDir {
    root: PathBuf,
    guard: Mutex<()>,
}

impl MarkdownStore {
    /// Opens the store rooted at `root`, creating the directory if needed.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        tracing::debug!(root = %root.display(), "opened markdown store");
        Ok(Self {
            dir: Arc::new(DataDir {
                root: root.to_path_buf(),
                guard: Mutex::new(()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.dir.root
    }

    /// Runs `op` on the blocking pool while holding both locks.
    async fn locked<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&DataDir) -> Result<T, StoreError> + Send + 'static,
    {
        let dir = Arc::clone(&self.dir);
        tokio::task::spawn_blocking(move || dir.locked(op))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

impl DataDir {
    /// The flock is released when the lock file handle drops.
    fn locked<T>(&self, op: impl FnOnce(&Self) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _in_process = self.guard.lock().unwrap_or_else(PoisonError::into_inner);

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join(LOCK_FILE))?;
        lock_file.lock_exclusive()?;

        op(self)
    }

    fn feed_dir(&self, record: &FeedRecord) -> PathBuf {
        self.root.join(&record.slug)
    }

    fn feed_entries(&self, record: &FeedRecord) -> Result<Vec<(PathBuf, Entry)>, StoreError> {
        entry_file::read_dir_entries(&self.feed_dir(record))
    }

    /// Locates an entry by exact id, returning its owning record index and path.
    fn locate_entry(
        &self,
        registry: &Registry,
        id: &str,
    ) -> Result<(usize, PathBuf, Entry), StoreError> {
        let suffix = format!("-{}.{}", entry_file::id_tag(id), entry_file::ENTRY_EXTENSION);
        for (idx, record) in registry.records.iter().enumerate() {
            for path in entry_file::list_files(&self.feed_dir(record))? {
                let matches_tag = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(&suffix));
                if !matches_tag {
                    continue;
                }
                match entry_file::read_file(&path) {
                    Ok(entry) if entry.id == id => return Ok((idx, path, entry)),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "skipping unparseable entry file");
                    }
                }
            }
        }
        Err(StoreError::NotFound)
    }

    fn all_entries(&self, registry: &Registry) -> Result<Vec<(PathBuf, Entry)>, StoreError> {
        let mut all = Vec::new();
        for record in &registry.records {
            all.extend(self.feed_entries(record)?);
        }
        Ok(all)
    }

    /// Queues an entry file in its feed directory, recreating the directory
    /// if it went missing. Queues removal of `previous` if the name changed.
    fn stage_entry(
        &self,
        batch: &mut Batch,
        record: &FeedRecord,
        entry: &Entry,
        previous: Option<&Path>,
    ) -> Result<(), StoreError> {
        let dir = self.feed_dir(record);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(entry_file::file_name(entry));

        if let Some(previous) = previous.filter(|p| *p != path) {
            batch.remove(previous.to_path_buf());
        }
        batch.write(path, entry_file::render(entry)?);
        Ok(())
    }

    fn write_entry(
        &self,
        record: &FeedRecord,
        entry: &Entry,
        previous: Option<&Path>,
    ) -> Result<(), StoreError> {
        let mut batch = Batch::default();
        self.stage_entry(&mut batch, record, entry, previous)?;
        batch.commit()
    }

    fn set_read_state(&self, id: &str, read: bool) -> Result<(), StoreError> {
        let registry = Registry::load(&self.root)?;
        let (idx, path, mut entry) = self.locate_entry(&registry, id)?;
        entry.read = read;
        entry.read_at = read.then(now);
        self.write_entry(&registry.records[idx], &entry, Some(&path))
    }
}

#[async_trait]
impl Store for MarkdownStore {
    async fn create_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        let feed = feed.clone();
        self.locked(move |d| {
            let mut registry = Registry::load(&d.root)?;
            if registry.url_taken(&feed.url, None) {
                return Err(StoreError::DuplicateUrl);
            }
            if registry.find(&feed.id).is_some() {
                return Err(StoreError::Corrupt(format!("feed id {} already in use", feed.id)));
            }

            let slug = registry.assign_slug(&d.root, &feed);
            std::fs::create_dir_all(d.root.join(&slug))?;
            tracing::debug!(feed_id = %feed.id, url = %feed.url, "feed created");
            registry.records.push(FeedRecord { feed, slug });
            registry.save(&d.root)
        })
        .await
    }

    async fn get_feed(&self, id: &str) -> Result<Feed, StoreError> {
        let id = id.to_owned();
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            registry
                .find(&id)
                .map(|r| r.feed.clone())
                .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn get_feed_by_url(&self, url: &str) -> Result<Feed, StoreError> {
        let url = url.to_owned();
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            registry
                .records
                .into_iter()
                .find(|r| r.feed.url == url)
                .map(|r| r.feed)
                .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn get_feed_by_prefix(&self, prefix: &str) -> Result<Feed, StoreError> {
        let prefix = prefix.to_owned();
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            let feeds = registry.records.iter().map(|r| &r.feed);
            resolve_prefix(&prefix, feeds, |f| f.id.as_str()).cloned()
        })
        .await
    }

    async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        self.locked(|d| {
            let registry = Registry::load(&d.root)?;
            let mut feeds: Vec<Feed> = registry.records.into_iter().map(|r| r.feed).collect();
            feeds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(feeds)
        })
        .await
    }

    async fn update_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        let feed = feed.clone();
        self.locked(move |d| {
            let mut registry = Registry::load(&d.root)?;
            if registry.url_taken(&feed.url, Some(&feed.id)) {
                return Err(StoreError::DuplicateUrl);
            }
            let record = registry.find_mut(&feed.id).ok_or(StoreError::NotFound)?;
            // created_at is immutable
            let created_at = record.feed.created_at;
            record.feed = feed;
            record.feed.created_at = created_at;
            registry.save(&d.root)
        })
        .await
    }

    async fn delete_feed(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        self.locked(move |d| {
            let mut registry = Registry::load(&d.root)?;
            let idx = registry
                .records
                .iter()
                .position(|r| r.feed.id == id)
                .ok_or(StoreError::NotFound)?;
            let record = registry.records.remove(idx);

            // Registry first: once the record is gone its entries are
            // unreachable even if the directory removal below fails.
            registry.save(&d.root)?;
            match std::fs::remove_dir_all(d.feed_dir(&record)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(slug = %record.slug, error = %e, "could not remove feed directory");
                }
            }
            tracing::debug!(feed_id = %id, "feed deleted");
            Ok(())
        })
        .await
    }

    async fn update_fetch_state(
        &self,
        id: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let id = id.to_owned();
        let etag = etag.map(str::to_owned);
        let last_modified = last_modified.map(str::to_owned);
        self.locked(move |d| {
            let mut registry = Registry::load(&d.root)?;
            let record = registry.find_mut(&id).ok_or(StoreError::NotFound)?;
            record.feed.etag = etag;
            record.feed.last_modified = last_modified;
            record.feed.last_fetched_at = Some(fetched_at);
            record.feed.last_error = None;
            record.feed.error_count = 0;
            registry.save(&d.root)
        })
        .await
    }

    async fn update_error(&self, id: &str, message: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        let message = message.to_owned();
        self.locked(move |d| {
            let mut registry = Registry::load(&d.root)?;
            let record = registry.find_mut(&id).ok_or(StoreError::NotFound)?;
            record.feed.last_error = Some(message);
            record.feed.error_count = record.feed.error_count.saturating_add(1);
            registry.save(&d.root)
        })
        .await
    }

    async fn create_entry(&self, entry: &Entry) -> Result<(), StoreError> {
        let mut entry = entry.clone();
        entry.normalize();
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            let record = registry.find(&entry.feed_id).ok_or(StoreError::NotFound)?;
            if d.feed_entries(record)?.iter().any(|(_, e)| e.guid == entry.guid) {
                return Err(StoreError::DuplicateEntry);
            }
            d.write_entry(record, &entry, None)
        })
        .await
    }

    async fn get_entry(&self, id: &str) -> Result<Entry, StoreError> {
        let id = id.to_owned();
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            d.locate_entry(&registry, &id).map(|(_, _, entry)| entry)
        })
        .await
    }

    async fn get_entry_by_prefix(&self, prefix: &str) -> Result<Entry, StoreError> {
        let prefix = prefix.to_owned();
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            let entries: Vec<Entry> = d
                .all_entries(&registry)?
                .into_iter()
                .map(|(_, e)| e)
                .collect();
            resolve_prefix(&prefix, &entries, |e| e.id.as_str()).cloned()
        })
        .await
    }

    async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<Entry>, StoreError> {
        let filter = filter.clone();
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            let scope = filter.scope();

            let mut entries = Vec::new();
            for record in &registry.records {
                if scope
                    .as_ref()
                    .is_some_and(|ids| !ids.contains(&record.feed.id.as_str()))
                {
                    continue;
                }
                entries.extend(
                    d.feed_entries(record)?
                        .into_iter()
                        .map(|(_, e)| e)
                        .filter(|e| filter.matches(e)),
                );
            }

            sort_newest_first(&mut entries);
            Ok(paginate(entries, &filter))
        })
        .await
    }

    async fn update_entry(&self, entry: &Entry) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            let (idx, path, stored) = d.locate_entry(&registry, &entry.id)?;

            let mut updated = entry;
            updated.feed_id = stored.feed_id;
            updated.guid = stored.guid;
            updated.created_at = stored.created_at;
            updated.normalize();
            d.write_entry(&registry.records[idx], &updated, Some(&path))
        })
        .await
    }

    async fn delete_entry(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            let (_, path, _) = d.locate_entry(&registry, &id)?;
            std::fs::remove_file(path)?;
            Ok(())
        })
        .await
    }

    async fn mark_read(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        self.locked(move |d| d.set_read_state(&id, true)).await
    }

    async fn mark_unread(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        self.locked(move |d| d.set_read_state(&id, false)).await
    }

    async fn mark_read_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            let read_at = now();
            let mut batch = Batch::default();
            let mut changed = 0;

            for record in &registry.records {
                for (path, mut entry) in d.feed_entries(record)? {
                    if entry.read || !entry.published_at.is_some_and(|p| p < cutoff) {
                        continue;
                    }
                    entry.read = true;
                    entry.read_at = Some(read_at);
                    d.stage_entry(&mut batch, record, &entry, Some(&path))?;
                    changed += 1;
                }
            }

            if !batch.is_empty() {
                batch.commit()?;
            }
            tracing::debug!(count = changed, %cutoff, "marked entries read");
            Ok(changed)
        })
        .await
    }

    async fn entry_exists(&self, feed_id: &str, guid: &str) -> Result<bool, StoreError> {
        let feed_id = feed_id.to_owned();
        let guid = guid.to_owned();
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            match registry.find(&feed_id) {
                Some(record) => Ok(d.feed_entries(record)?.iter().any(|(_, e)| e.guid == guid)),
                None => Ok(false),
            }
        })
        .await
    }

    async fn count_unread(&self, feed_id: Option<&str>) -> Result<u64, StoreError> {
        let feed_id = feed_id.map(str::to_owned);
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            let mut unread = 0;
            for record in &registry.records {
                if feed_id.as_deref().is_some_and(|id| id != record.feed.id) {
                    continue;
                }
                unread += d
                    .feed_entries(record)?
                    .iter()
                    .filter(|(_, e)| !e.read)
                    .count() as u64;
            }
            Ok(unread)
        })
        .await
    }

    /// New entry files and the updated registry land as one batch: either
    /// all of them are visible afterwards or none are.
    async fn commit_fetch(&self, commit: &FetchCommit) -> Result<usize, StoreError> {
        let commit = commit.clone();
        self.locked(move |d| {
            let mut registry = Registry::load(&d.root)?;
            let record = registry.find(&commit.feed_id).ok_or(StoreError::NotFound)?;

            let mut seen: HashSet<String> = d
                .feed_entries(record)?
                .into_iter()
                .map(|(_, e)| e.guid)
                .collect();

            let mut batch = Batch::default();
            let mut inserted = 0;
            for entry in &commit.entries {
                if !seen.insert(entry.guid.clone()) {
                    continue;
                }
                let mut entry = entry.clone();
                entry.feed_id = commit.feed_id.clone();
                entry.normalize();
                d.stage_entry(&mut batch, record, &entry, None)?;
                inserted += 1;
            }

            let record = registry
                .find_mut(&commit.feed_id)
                .ok_or(StoreError::NotFound)?;
            if !record.feed.has_title() {
                if let Some(title) = commit.title.as_deref().filter(|t| !t.trim().is_empty()) {
                    record.feed.title = Some(title.to_owned());
                }
            }
            record.feed.etag = commit.etag;
            record.feed.last_modified = commit.last_modified;
            record.feed.last_fetched_at = Some(commit.fetched_at);
            record.feed.last_error = None;
            record.feed.error_count = 0;

            batch.write(Registry::path(&d.root), registry.render()?);
            batch.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn feed_stats(&self, feed_id: &str) -> Result<FeedStats, StoreError> {
        let feed_id = feed_id.to_owned();
        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            let record = registry.find(&feed_id).ok_or(StoreError::NotFound)?;
            let entries = d.feed_entries(record)?;
            Ok(FeedStats {
                total: entries.len() as u64,
                unread: entries.iter().filter(|(_, e)| !e.read).count() as u64,
                feed_id,
            })
        })
        .await
    }

    async fn overall_stats(&self) -> Result<OverallStats, StoreError> {
        self.locked(|d| {
            let registry = Registry::load(&d.root)?;
            let entries = d.all_entries(&registry)?;
            Ok(OverallStats {
                feeds: registry.records.len() as u64,
                entries: entries.len() as u64,
                unread: entries.iter().filter(|(_, e)| !e.read).count() as u64,
            })
        })
        .await
    }

    async fn compact(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Entry>, StoreError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        self.locked(move |d| {
            let registry = Registry::load(&d.root)?;
            let contains = |field: &Option<String>| {
                field
                    .as_deref()
                    .is_some_and(|text| text.to_lowercase().contains(&needle))
            };

            let mut hits: Vec<Entry> = d
                .all_entries(&registry)?
                .into_iter()
                .map(|(_, e)| e)
                .filter(|e| contains(&e.title) || contains(&e.content))
                .collect();
            sort_newest_first(&mut hits);
            hits.truncate(limit);
            Ok(hits)
        })
        .await
    }
}
