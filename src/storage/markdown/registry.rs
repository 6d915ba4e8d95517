use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::batch::write_atomic;
use crate::storage::types::{Feed, StoreError};
use crate::util::slugify;

const REGISTRY_FILE: &str = "_feeds.yaml";

/// One feed as stored in `_feeds.yaml`: the feed fields plus the directory
/// its entries live in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct FeedRecord {
    #[serde(flatten)]
    pub feed: Feed,
    pub slug: String,
}

/// Ordered list of feed records, in subscription order.
#[derive(Debug, Default)]
pub(super) struct Registry {
    pub records: Vec<FeedRecord>,
}

impl Registry {
    /// Reads the registry, treating a missing file as empty.
    pub fn load(root: &Path) -> Result<Self, StoreError> {
        let path = Self::path(root);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let records: Vec<FeedRecord> = serde_yaml::from_str(&text)?;
        Ok(Self { records })
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(REGISTRY_FILE)
    }

    pub fn render(&self) -> Result<String, StoreError> {
        Ok(serde_yaml::to_string(&self.records)?)
    }

    pub fn save(&self, root: &Path) -> Result<(), StoreError> {
        write_atomic(&Self::path(root), self.render()?.as_bytes())
    }

    pub fn find(&self, id: &str) -> Option<&FeedRecord> {
        self.records.iter().find(|r| r.feed.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut FeedRecord> {
        self.records.iter_mut().find(|r| r.feed.id == id)
    }

    pub fn url_taken(&self, url: &str, except_id: Option<&str>) -> bool {
        self.records
            .iter()
            .any(|r| r.feed.url == url && Some(r.feed.id.as_str()) != except_id)
    }

    /// Picks a directory name for a new feed: slug of the title, else of the
    /// URL host, else `feed`; suffixed `-2`, `-3`, ... until it collides with
    /// neither a registered slug nor an existing directory.
    pub fn assign_slug(&self, root: &Path, feed: &Feed) -> String {
        let base = feed
            .title
            .as_deref()
            .map(slugify)
            .filter(|s| !s.is_empty())
            .or_else(|| {
                url::Url::parse(&feed.url)
                    .ok()
                    .and_then(|u| u.host_str().map(slugify))
                    .filter(|s| !s.is_empty())
            })
            .unwrap_or_else(|| "feed".to_owned());

        let taken: HashSet<&str> = self.records.iter().map(|r| r.slug.as_str()).collect();
        let free = |candidate: &str| !taken.contains(candidate) && !root.join(candidate).exists();

        if free(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}-{n}");
            if free(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("rivulet-registry-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_missing_registry_is_empty() {
        let root = temp_root();
        assert!(Registry::load(&root).unwrap().records.is_empty());
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_slug_from_title_then_host() {
        let root = temp_root();
        let registry = Registry::default();

        let mut titled = Feed::new("https://blog.example.com/rss");
        titled.title = Some("My Blog!".into());
        assert_eq!(registry.assign_slug(&root, &titled), "my-blog");

        let untitled = Feed::new("https://blog.example.com/rss");
        assert_eq!(registry.assign_slug(&root, &untitled), "blog-example-com");
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_slug_disambiguation() {
        let root = temp_root();
        let mut registry = Registry::default();
        let mut feed = Feed::new("https://a.example/rss");
        feed.title = Some("News".into());
        registry.records.push(FeedRecord {
            feed: feed.clone(),
            slug: "news".into(),
        });
        // A stray directory also counts as taken
        std::fs::create_dir_all(root.join("news-2")).unwrap();

        assert_eq!(registry.assign_slug(&root, &feed), "news-3");
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_registry_round_trip() {
        let root = temp_root();
        let mut feed = Feed::new("https://example.com/feed");
        feed.title = Some("Example".into());
        feed.folder = Some("Tech".into());
        feed.last_fetched_at = Some(crate::storage::now());

        let registry = Registry {
            records: vec![FeedRecord {
                feed: feed.clone(),
                slug: "example".into(),
            }],
        };
        registry.save(&root).unwrap();

        let loaded = Registry::load(&root).unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].feed, feed);
        assert_eq!(loaded.records[0].slug, "example");
        std::fs::remove_dir_all(&root).unwrap();
    }
}
