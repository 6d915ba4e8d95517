//! Store contract tests, run against both backends, plus migration between them.

mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;

use rivulet::storage::{
    migrate_data, now, Entry, EntryFilter, Feed, FetchCommit, MarkdownStore, MigrationReport,
    SqliteStore, Store, StoreError,
};

use common::{backends, TempDir};

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap()
}

fn feed(url: &str, title: Option<&str>, folder: Option<&str>) -> Feed {
    let mut feed = Feed::new(url);
    feed.title = title.map(str::to_owned);
    feed.folder = folder.map(str::to_owned);
    feed
}

fn entry(feed_id: &str, guid: &str, published: Option<DateTime<Utc>>) -> Entry {
    let mut entry = Entry::new(feed_id, guid);
    entry.title = Some(format!("Post {guid}"));
    entry.link = Some(format!("https://example.com/{guid}"));
    entry.content = Some(format!("<p>Body of {guid}</p>"));
    entry.published_at = published;
    entry
}

fn sorted_feeds(mut feeds: Vec<Feed>) -> Vec<Feed> {
    feeds.sort_by(|a, b| a.id.cmp(&b.id));
    feeds
}

async fn all_entries(store: &dyn Store) -> Vec<Entry> {
    let mut entries = store.list_entries(&EntryFilter::default()).await.unwrap();
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    entries
}

/// Two feeds and five entries, one of them read.
async fn populate(store: &dyn Store) -> (Feed, Feed) {
    let news = feed("https://example.com/news.xml", Some("News"), Some("daily"));
    let blog = feed("https://example.org/blog.xml", Some("Blog"), None);
    store.create_feed(&news).await.unwrap();
    store.create_feed(&blog).await.unwrap();

    for (i, guid) in ["n1", "n2", "n3"].into_iter().enumerate() {
        store
            .create_entry(&entry(&news.id, guid, Some(day(i as u32 + 1))))
            .await
            .unwrap();
    }
    store.create_entry(&entry(&blog.id, "b1", Some(day(5)))).await.unwrap();
    store.create_entry(&entry(&blog.id, "b2", None)).await.unwrap();

    let n2 = store
        .list_entries(&EntryFilter::for_feed(news.id.clone()))
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.guid == "n2")
        .unwrap();
    store.mark_read(&n2.id).await.unwrap();

    (news, blog)
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_duplicates_rejected() {
    for (name, store, _dir) in backends().await {
        let (news, _) = populate(store.as_ref()).await;

        let clash = Feed::new(news.url.clone());
        assert!(
            matches!(store.create_feed(&clash).await, Err(StoreError::DuplicateUrl)),
            "{name}"
        );
        assert!(
            matches!(
                store.create_entry(&entry(&news.id, "n1", None)).await,
                Err(StoreError::DuplicateEntry)
            ),
            "{name}"
        );
        assert!(store.entry_exists(&news.id, "n1").await.unwrap(), "{name}");
        assert!(!store.entry_exists(&news.id, "zz").await.unwrap(), "{name}");
    }
}

#[tokio::test]
async fn test_entry_needs_existing_feed() {
    for (name, store, _dir) in backends().await {
        let orphan = entry("0000000000000000", "x", None);
        assert!(
            matches!(store.create_entry(&orphan).await, Err(StoreError::NotFound)),
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_prefix_lookup() {
    for (name, store, _dir) in backends().await {
        let (news, _) = populate(store.as_ref()).await;

        let found = store.get_feed_by_prefix(&news.id[..8]).await.unwrap();
        assert_eq!(found.id, news.id, "{name}");
        assert!(
            matches!(
                store.get_feed_by_prefix(&news.id[..3]).await,
                Err(StoreError::PrefixTooShort)
            ),
            "{name}"
        );
        assert!(
            matches!(
                store.get_feed_by_prefix("zzzzzzzz").await,
                Err(StoreError::NotFound)
            ),
            "{name}"
        );

        let any = store.list_entries(&EntryFilter::default()).await.unwrap();
        let by_prefix = store.get_entry_by_prefix(&any[0].id[..10]).await.unwrap();
        assert_eq!(by_prefix, any[0], "{name}");
    }
}

// ============================================================================
// Read state
// ============================================================================

#[tokio::test]
async fn test_read_flag_and_timestamp_agree() {
    for (name, store, _dir) in backends().await {
        populate(store.as_ref()).await;
        let target = store.list_entries(&EntryFilter::default()).await.unwrap()[0].clone();

        store.mark_read(&target.id).await.unwrap();
        let read = store.get_entry(&target.id).await.unwrap();
        assert!(read.read && read.read_at.is_some(), "{name}");

        store.mark_unread(&target.id).await.unwrap();
        let unread = store.get_entry(&target.id).await.unwrap();
        assert!(!unread.read && unread.read_at.is_none(), "{name}");

        let mut edited = unread.clone();
        edited.read = true;
        edited.read_at = None;
        store.update_entry(&edited).await.unwrap();
        assert!(store.get_entry(&target.id).await.unwrap().read_at.is_some(), "{name}");

        for e in store.list_entries(&EntryFilter::default()).await.unwrap() {
            assert_eq!(e.read, e.read_at.is_some(), "{name}: {}", e.guid);
        }
    }
}

#[tokio::test]
async fn test_mark_read_before_counts_transitions() {
    for (name, store, _dir) in backends().await {
        populate(store.as_ref()).await;
        let before = all_entries(store.as_ref()).await;
        let cutoff = day(4);

        let changed = store.mark_read_before(cutoff).await.unwrap();
        let after = all_entries(store.as_ref()).await;

        let transitioned: Vec<&Entry> = after
            .iter()
            .zip(&before)
            .filter(|(a, b)| a.read && !b.read)
            .map(|(a, _)| a)
            .collect();
        // n1 and n3; n2 was already read, b1 is newer, b2 is undated
        assert_eq!(changed, 2, "{name}");
        assert_eq!(transitioned.len() as u64, changed, "{name}");
        assert!(
            transitioned.iter().all(|e| e.published_at.unwrap() < cutoff),
            "{name}"
        );

        assert_eq!(store.mark_read_before(cutoff).await.unwrap(), 0, "{name}");
    }
}

#[tokio::test]
async fn test_counts_and_stats() {
    for (name, store, _dir) in backends().await {
        let (news, blog) = populate(store.as_ref()).await;

        assert_eq!(store.count_unread(None).await.unwrap(), 4, "{name}");
        assert_eq!(store.count_unread(Some(&news.id)).await.unwrap(), 2, "{name}");

        let stats = store.feed_stats(&blog.id).await.unwrap();
        assert_eq!((stats.total, stats.unread), (2, 2), "{name}");

        let overall = store.overall_stats().await.unwrap();
        assert_eq!((overall.feeds, overall.entries, overall.unread), (2, 5, 4), "{name}");
    }
}

// ============================================================================
// Listing and search
// ============================================================================

#[tokio::test]
async fn test_list_filters_and_order() {
    for (name, store, _dir) in backends().await {
        let (news, blog) = populate(store.as_ref()).await;

        let all = store.list_entries(&EntryFilter::default()).await.unwrap();
        let order: Vec<&str> = all.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(order, ["b1", "n3", "n2", "n1", "b2"], "{name}");

        let unread = EntryFilter {
            unread_only: true,
            ..EntryFilter::for_feed(news.id.clone())
        };
        let guids: Vec<String> = store
            .list_entries(&unread)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.guid)
            .collect();
        assert_eq!(guids, ["n3", "n1"], "{name}");

        let window = EntryFilter {
            since: Some(day(2)),
            until: Some(day(5)),
            ..EntryFilter::default()
        };
        let guids: Vec<String> = store
            .list_entries(&window)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.guid)
            .collect();
        assert_eq!(guids, ["n3", "n2"], "{name}");

        let page = EntryFilter {
            feed_ids: Some(vec![news.id.clone(), blog.id.clone()]),
            limit: Some(2),
            offset: Some(1),
            ..EntryFilter::default()
        };
        let guids: Vec<String> = store
            .list_entries(&page)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.guid)
            .collect();
        assert_eq!(guids, ["n3", "n2"], "{name}");
    }
}

#[tokio::test]
async fn test_search_matches_title_and_content() {
    for (name, store, _dir) in backends().await {
        let (news, _) = populate(store.as_ref()).await;
        let mut special = entry(&news.id, "s1", Some(day(9)));
        special.title = Some("Rust release notes".into());
        special.content = Some("<p>borrow checker improvements</p>".into());
        store.create_entry(&special).await.unwrap();

        let by_title = store.search("release", 10).await.unwrap();
        assert_eq!(by_title.len(), 1, "{name}");
        assert_eq!(by_title[0].guid, "s1", "{name}");

        let by_content = store.search("checker", 10).await.unwrap();
        assert_eq!(by_content.len(), 1, "{name}");

        assert_eq!(store.search("Body", 2).await.unwrap().len(), 2, "{name}");
        assert!(store.search("absentterm", 10).await.unwrap().is_empty(), "{name}");
    }
}

// ============================================================================
// Deletion
// ============================================================================

#[tokio::test]
async fn test_delete_feed_removes_entries() {
    for (name, store, _dir) in backends().await {
        let (news, blog) = populate(store.as_ref()).await;

        store.delete_feed(&news.id).await.unwrap();
        assert!(
            matches!(store.get_feed(&news.id).await, Err(StoreError::NotFound)),
            "{name}"
        );
        assert!(
            store
                .list_entries(&EntryFilter::for_feed(news.id.clone()))
                .await
                .unwrap()
                .is_empty(),
            "{name}"
        );
        assert_eq!(store.feed_stats(&blog.id).await.unwrap().total, 2, "{name}");
        assert!(
            matches!(store.delete_feed(&news.id).await, Err(StoreError::NotFound)),
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_fetch_state_and_errors() {
    for (name, store, _dir) in backends().await {
        let (news, _) = populate(store.as_ref()).await;

        store.update_error(&news.id, "boom").await.unwrap();
        store.update_error(&news.id, "boom again").await.unwrap();
        let failed = store.get_feed(&news.id).await.unwrap();
        assert_eq!(failed.error_count, 2, "{name}");
        assert_eq!(failed.last_error.as_deref(), Some("boom again"), "{name}");

        let at = day(20);
        store
            .update_fetch_state(&news.id, Some("\"e\""), None, at)
            .await
            .unwrap();
        let ok = store.get_feed(&news.id).await.unwrap();
        assert_eq!(ok.error_count, 0, "{name}");
        assert_eq!(ok.last_error, None, "{name}");
        assert_eq!(ok.etag.as_deref(), Some("\"e\""), "{name}");
        assert_eq!(ok.last_fetched_at, Some(at), "{name}");
    }
}

// ============================================================================
// Migration
// ============================================================================

#[tokio::test]
async fn test_migration_round_trip_preserves_everything() {
    let sqlite_dir = TempDir::new("migrate-src");
    let source = SqliteStore::open(&sqlite_dir.path().join("rivulet.db"))
        .await
        .unwrap();
    populate(&source).await;
    let news = source
        .get_feed_by_url("https://example.com/news.xml")
        .await
        .unwrap();
    source
        .update_fetch_state(&news.id, Some("\"v9\""), Some("Tue, 02 Jan 2024 00:00:00 GMT"), day(3))
        .await
        .unwrap();

    let markdown_dir = TempDir::new("migrate-mid");
    let middle = MarkdownStore::open(markdown_dir.path()).unwrap();
    let there = migrate_data(&source, &middle).await.unwrap();
    assert_eq!(there, MigrationReport { feeds: 2, entries: 5 });

    let back = SqliteStore::open_in_memory().await.unwrap();
    let again = migrate_data(&middle, &back).await.unwrap();
    assert_eq!(again, there);

    assert_eq!(
        sorted_feeds(back.list_feeds().await.unwrap()),
        sorted_feeds(source.list_feeds().await.unwrap())
    );
    assert_eq!(all_entries(&back).await, all_entries(&source).await);

    let read: Vec<String> = all_entries(&back)
        .await
        .into_iter()
        .filter(|e| e.read)
        .map(|e| e.guid)
        .collect();
    assert_eq!(read, ["n2"]);
}

#[tokio::test]
async fn test_markdown_store_survives_reopen() {
    let dir = TempDir::new("reopen");
    let (news, _) = {
        let store = MarkdownStore::open(dir.path()).unwrap();
        populate(&store).await
    };

    let store = MarkdownStore::open(dir.path()).unwrap();
    assert_eq!(store.list_feeds().await.unwrap().len(), 2);
    assert_eq!(store.feed_stats(&news.id).await.unwrap().total, 3);
    let created = store.get_feed(&news.id).await.unwrap().created_at;
    assert!(created <= Utc::now() + Duration::seconds(1));
}

#[tokio::test]
async fn test_empty_content_reads_back_as_none() {
    for (name, store, _dir) in backends().await {
        let feed = feed("https://empty.example/feed", None, None);
        store.create_feed(&feed).await.unwrap();

        let mut created = entry(&feed.id, "created", Some(day(1)));
        created.content = Some(String::new());
        store.create_entry(&created).await.unwrap();
        assert_eq!(store.get_entry(&created.id).await.unwrap().content, None, "{name}");

        let mut updated = entry(&feed.id, "updated", Some(day(2)));
        store.create_entry(&updated).await.unwrap();
        updated.content = Some(String::new());
        store.update_entry(&updated).await.unwrap();
        assert_eq!(store.get_entry(&updated.id).await.unwrap().content, None, "{name}");

        let mut fetched = entry(&feed.id, "fetched", Some(day(3)));
        fetched.content = Some(String::new());
        let commit = FetchCommit {
            feed_id: feed.id.clone(),
            title: None,
            etag: None,
            last_modified: None,
            fetched_at: now(),
            entries: vec![fetched.clone()],
        };
        assert_eq!(store.commit_fetch(&commit).await.unwrap(), 1, "{name}");
        assert_eq!(store.get_entry(&fetched.id).await.unwrap().content, None, "{name}");
    }
}

// ============================================================================
// File backend locking
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_markdown_handles_race_for_same_guid() {
    let dir = TempDir::new("race-entry");
    let feed = feed("https://race.example/feed", Some("Race"), None);
    MarkdownStore::open(dir.path())
        .unwrap()
        .create_feed(&feed)
        .await
        .unwrap();

    for round in 0..10 {
        let guid = format!("race-{round}");
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                // Separate handles share nothing but the lock file
                let store = MarkdownStore::open(dir.path()).unwrap();
                let entry = entry(&feed.id, &guid, Some(day(1)));
                tokio::spawn(async move { store.create_entry(&entry).await })
            })
            .collect();

        let mut created = 0;
        let mut duplicates = 0;
        for result in futures::future::join_all(tasks).await {
            match result.unwrap() {
                Ok(()) => created += 1,
                Err(StoreError::DuplicateEntry) => duplicates += 1,
                Err(e) => panic!("round {round}: unexpected error {e}"),
            }
        }
        assert_eq!((created, duplicates), (1, 1), "round {round}");
    }

    let store = MarkdownStore::open(dir.path()).unwrap();
    assert_eq!(store.feed_stats(&feed.id).await.unwrap().total, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_markdown_concurrent_subscriptions_keep_registry_whole() {
    let dir = TempDir::new("race-feeds");
    let feeds: Vec<Feed> = (0..12)
        .map(|i| feed(&format!("https://site{i}.example/feed"), None, None))
        .collect();

    let tasks: Vec<_> = feeds
        .iter()
        .cloned()
        .map(|feed| {
            let store = MarkdownStore::open(dir.path()).unwrap();
            tokio::spawn(async move { store.create_feed(&feed).await })
        })
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let registry = std::fs::read_to_string(dir.path().join("_feeds.yaml")).unwrap();
    let records: Vec<serde_yaml::Value> = serde_yaml::from_str(&registry).unwrap();
    assert_eq!(records.len(), feeds.len());

    let store = MarkdownStore::open(dir.path()).unwrap();
    assert_eq!(
        sorted_feeds(store.list_feeds().await.unwrap()),
        sorted_feeds(feeds)
    );
}
