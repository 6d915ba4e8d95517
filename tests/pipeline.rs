//! End-to-end tests for discovery, fetching and ingestion against a local
//! HTTP server. Store-backed tests run against both backends.

mod common;

use pretty_assertions::assert_eq;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rivulet::feed::{
    discover_feed, refresh_all, subscribe, FetchError, FetchOutcome, Fetcher, SubscribeError,
};
use rivulet::storage::{EntryFilter, Feed, SqliteStore, Store, StoreError};

use common::{atom, backends, rss};

const PAGE: &str = r#"<!doctype html>
<html><head>
  <title>Demo site</title>
  <link rel="alternate" type="application/rss+xml" href="/feed.xml">
</head><body>hello</body></html>"#;

async fn mount_site(server: &MockServer, etag: &str) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(PAGE, "text/html; charset=utf-8"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("If-None-Match", etag))
        .respond_with(ResponseTemplate::new(304))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(rss("Demo", &[("x1", "First")]), "application/rss+xml")
                .insert_header("ETag", etag),
        )
        .mount(server)
        .await;
}

async fn mount_feed(server: &MockServer, body: String) {
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/xml"))
        .mount(server)
        .await;
}

async fn subscribed(store: &dyn Store, server: &MockServer) -> Feed {
    let feed = Feed::new(format!("{}/feed.xml", server.uri()));
    store.create_feed(&feed).await.unwrap();
    feed
}

async fn guids(store: &dyn Store, feed_id: &str) -> Vec<String> {
    let mut guids: Vec<String> = store
        .list_entries(&EntryFilter::for_feed(feed_id))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.guid)
        .collect();
    guids.sort_unstable();
    guids
}

// ============================================================================
// Discovery and subscription
// ============================================================================

#[tokio::test]
async fn test_discover_subscribe_and_fetch_from_html_page() {
    for (name, store, _dir) in backends().await {
        let server = MockServer::start().await;
        mount_site(&server, "\"v1\"").await;
        let fetcher = Fetcher::new().unwrap();
        let feed_url = format!("{}/feed.xml", server.uri());

        let found = discover_feed(&fetcher, &server.uri()).await.unwrap();
        assert_eq!(found.url, feed_url, "{name}");
        assert_eq!(found.title.as_deref(), Some("Demo"), "{name}");

        let feed = subscribe(store.as_ref(), &fetcher, &server.uri(), None, None)
            .await
            .unwrap();
        assert_eq!(feed.url, feed_url, "{name}");

        let summary = refresh_all(store.as_ref(), &fetcher, false, |_| {})
            .await
            .unwrap();
        assert_eq!(summary.total, 1, "{name}");
        assert_eq!(summary.new_entries, 1, "{name}");
        assert_eq!(summary.errors, 0, "{name}");

        let feeds = store.list_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1, "{name}");
        assert_eq!(feeds[0].url, feed_url, "{name}");
        assert_eq!(guids(store.as_ref(), &feed.id).await, ["x1"], "{name}");
    }
}

#[tokio::test]
async fn test_subscribe_twice_is_duplicate() {
    let server = MockServer::start().await;
    mount_site(&server, "\"v1\"").await;
    let store = SqliteStore::open_in_memory().await.unwrap();
    let fetcher = Fetcher::new().unwrap();

    subscribe(&store, &fetcher, &server.uri(), Some("news"), None)
        .await
        .unwrap();
    let again = subscribe(&store, &fetcher, &format!("{}/feed.xml", server.uri()), None, None).await;
    assert!(matches!(
        again,
        Err(SubscribeError::Store(StoreError::DuplicateUrl))
    ));
}

// ============================================================================
// Conditional fetch
// ============================================================================

#[tokio::test]
async fn test_second_fetch_is_cached() {
    for (name, store, _dir) in backends().await {
        let server = MockServer::start().await;
        mount_site(&server, "\"v1\"").await;
        let fetcher = Fetcher::new().unwrap();
        let feed = subscribe(store.as_ref(), &fetcher, &server.uri(), None, None)
            .await
            .unwrap();

        refresh_all(store.as_ref(), &fetcher, false, |_| {})
            .await
            .unwrap();
        let first = store.get_feed(&feed.id).await.unwrap();
        assert_eq!(first.etag.as_deref(), Some("\"v1\""), "{name}");

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let summary = refresh_all(store.as_ref(), &fetcher, false, |_| {})
            .await
            .unwrap();
        assert_eq!(summary.cached, 1, "{name}");
        assert_eq!(summary.new_entries, 0, "{name}");

        let second = store.get_feed(&feed.id).await.unwrap();
        assert_eq!(second.etag, first.etag, "{name}");
        assert_eq!(second.last_modified, first.last_modified, "{name}");
        assert!(second.last_fetched_at > first.last_fetched_at, "{name}");
        assert_eq!(guids(store.as_ref(), &feed.id).await, ["x1"], "{name}");
    }
}

#[tokio::test]
async fn test_fetcher_validators_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("If-None-Match", "\"abc\""))
        .and(header("If-Modified-Since", "Mon, 01 Jan 2024 00:00:00 GMT"))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(rss("Demo", &[]))
                .insert_header("ETag", "\"abc\"")
                .insert_header("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
        )
        .mount(&server)
        .await;
    let fetcher = Fetcher::new().unwrap();
    let url = format!("{}/feed.xml", server.uri());

    let body = match fetcher.fetch(&url, None, None).await.unwrap() {
        FetchOutcome::Fresh(body) => body,
        FetchOutcome::NotModified => panic!("first fetch must be fresh"),
    };
    let again = fetcher
        .fetch(&url, body.etag.as_deref(), body.last_modified.as_deref())
        .await
        .unwrap();
    assert!(matches!(again, FetchOutcome::NotModified));
}

// ============================================================================
// Idempotent ingestion
// ============================================================================

#[tokio::test]
async fn test_refetch_keeps_read_state() {
    for (name, store, _dir) in backends().await {
        let server = MockServer::start().await;
        mount_feed(&server, rss("Demo", &[("x1", "First"), ("x2", "Second")])).await;
        let fetcher = Fetcher::new().unwrap();
        let feed = subscribed(store.as_ref(), &server).await;

        refresh_all(store.as_ref(), &fetcher, false, |_| {})
            .await
            .unwrap();
        let entries = store.list_entries(&EntryFilter::default()).await.unwrap();
        let x1 = entries.iter().find(|e| e.guid == "x1").unwrap();
        store.mark_read(&x1.id).await.unwrap();
        let read_at = store.get_entry(&x1.id).await.unwrap().read_at;

        let summary = refresh_all(store.as_ref(), &fetcher, false, |_| {})
            .await
            .unwrap();
        assert_eq!(summary.new_entries, 0, "{name}");

        let after = store.get_entry(&x1.id).await.unwrap();
        assert!(after.read, "{name}");
        assert_eq!(after.read_at, read_at, "{name}");
        assert_eq!(store.count_unread(Some(&feed.id)).await.unwrap(), 1, "{name}");
    }
}

#[tokio::test]
async fn test_duplicate_guids_stored_once() {
    for (name, store, _dir) in backends().await {
        let server = MockServer::start().await;
        mount_feed(
            &server,
            rss("Demo", &[("a", "A"), ("b", "B"), ("a", "A twice"), ("b", "B twice")]),
        )
        .await;
        let fetcher = Fetcher::new().unwrap();
        let feed = subscribed(store.as_ref(), &server).await;

        for _ in 0..3 {
            refresh_all(store.as_ref(), &fetcher, true, |_| {})
                .await
                .unwrap();
        }
        assert_eq!(guids(store.as_ref(), &feed.id).await, ["a", "b"], "{name}");
    }
}

#[tokio::test]
async fn test_switch_from_rss_to_atom_adds_nothing() {
    for (name, store, _dir) in backends().await {
        let server = MockServer::start().await;
        let items = [("urn:post:1", "One"), ("urn:post:2", "Two")];
        mount_feed(&server, rss("Demo", &items)).await;
        let fetcher = Fetcher::new().unwrap();
        let feed = subscribed(store.as_ref(), &server).await;

        let first = refresh_all(store.as_ref(), &fetcher, false, |_| {})
            .await
            .unwrap();
        assert_eq!(first.new_entries, 2, "{name}");

        server.reset().await;
        mount_feed(&server, atom("Demo", &items)).await;

        let second = refresh_all(store.as_ref(), &fetcher, false, |_| {})
            .await
            .unwrap();
        assert_eq!(second.new_entries, 0, "{name}");
        assert_eq!(second.errors, 0, "{name}");
        assert_eq!(
            guids(store.as_ref(), &feed.id).await,
            ["urn:post:1", "urn:post:2"],
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_batch_reports_each_feed() {
    let server = MockServer::start().await;
    mount_feed(&server, rss("Demo", &[("x1", "First")])).await;
    Mock::given(method("GET"))
        .and(path("/gone.xml"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;
    let store = SqliteStore::open_in_memory().await.unwrap();
    let fetcher = Fetcher::new().unwrap();
    subscribed(&store, &server).await;
    let gone = Feed::new(format!("{}/gone.xml", server.uri()));
    store.create_feed(&gone).await.unwrap();

    let mut seen = Vec::new();
    let summary = refresh_all(&store, &fetcher, false, |outcome| {
        seen.push((outcome.feed_id.clone(), outcome.result.is_ok()));
    })
    .await
    .unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.new_entries, 1);
    assert_eq!(summary.errors, 1);
    assert_eq!(seen.len(), 2);
    assert!(seen.contains(&(gone.id.clone(), false)));

    let stored = store.get_feed(&gone.id).await.unwrap();
    assert_eq!(stored.error_count, 1);
    assert!(stored.last_error.unwrap().contains("410"));
}

// ============================================================================
// SSRF guard
// ============================================================================

#[tokio::test]
async fn test_private_address_blocked_loopback_allowed() {
    let fetcher = Fetcher::new().unwrap();

    let blocked = fetcher.fetch("http://10.0.0.5/feed.xml", None, None).await;
    assert!(matches!(
        blocked,
        Err(FetchError::PrivateAddressBlocked { .. })
    ));

    let server = MockServer::start().await;
    mount_feed(&server, rss("Demo", &[])).await;
    let local = fetcher
        .fetch(&format!("{}/feed.xml", server.uri()), None, None)
        .await
        .unwrap();
    assert!(matches!(local, FetchOutcome::Fresh(_)));
}
