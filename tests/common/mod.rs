//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use rivulet::storage::{MarkdownStore, SqliteStore, Store};

/// A scratch directory removed on drop.
pub struct TempDir(PathBuf);

impl TempDir {
    pub fn new(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("rivulet-{tag}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Each backend under test, with the directory that keeps it alive.
pub async fn backends() -> Vec<(&'static str, Box<dyn Store>, TempDir)> {
    let sqlite_dir = TempDir::new("sqlite");
    let sqlite = SqliteStore::open(&sqlite_dir.path().join("rivulet.db"))
        .await
        .unwrap();

    let markdown_dir = TempDir::new("markdown");
    let markdown = MarkdownStore::open(markdown_dir.path()).unwrap();

    vec![
        ("sqlite", Box::new(sqlite) as Box<dyn Store>, sqlite_dir),
        ("markdown", Box::new(markdown) as Box<dyn Store>, markdown_dir),
    ]
}

pub fn rss(title: &str, items: &[(&str, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(guid, title)| {
            format!(
                "<item><guid>{guid}</guid><title>{title}</title>\
                 <link>https://example.com/{guid}</link>\
                 <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>{title}</title>{items}</channel></rss>"#
    )
}

pub fn atom(title: &str, items: &[(&str, &str)]) -> String {
    let entries: String = items
        .iter()
        .map(|(id, title)| {
            format!(
                "<entry><id>{id}</id><title>{title}</title>\
                 <link href=\"https://example.com/{id}\"/>\
                 <updated>2024-01-01T00:00:00Z</updated></entry>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><feed xmlns="http://www.w3.org/2005/Atom"><title>{title}</title>{entries}</feed>"#
    )
}
