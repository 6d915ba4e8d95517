use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::storage::types::{Entry, StoreError};
use crate::util::slugify;

pub(super) const ENTRY_EXTENSION: &str = "md";

const DELIMITER: &str = "---";

/// Everything but the content, serialized as the YAML front-matter block.
#[derive(Debug, Serialize, Deserialize)]
struct FrontMatter {
    id: String,
    feed_id: String,
    guid: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    read: bool,
    #[serde(default)]
    read_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

/// `<slug-of-title>-<first 8 chars of id>.md`, or `entry-<id8>.md` when the
/// title has nothing to slug.
pub(super) fn file_name(entry: &Entry) -> String {
    let slug = entry
        .title
        .as_deref()
        .map(slugify)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "entry".to_owned());
    format!("{slug}-{}.{ENTRY_EXTENSION}", id_tag(&entry.id))
}

/// The id fragment embedded in file names.
pub(super) fn id_tag(id: &str) -> String {
    id.chars().take(8).collect()
}

/// Renders an entry as front matter followed by the raw content.
pub(super) fn render(entry: &Entry) -> Result<String, StoreError> {
    let front = FrontMatter {
        id: entry.id.clone(),
        feed_id: entry.feed_id.clone(),
        guid: entry.guid.clone(),
        title: entry.title.clone(),
        link: entry.link.clone(),
        author: entry.author.clone(),
        published_at: entry.published_at,
        read: entry.read,
        read_at: entry.read_at,
        created_at: entry.created_at,
    };
    let yaml = serde_yaml::to_string(&front)?;

    let content = entry.content.as_deref().unwrap_or("");
    let mut out = String::with_capacity(yaml.len() + content.len() + 8);
    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(&yaml);
    if !yaml.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(content);
    Ok(out)
}

/// Parses a rendered entry. An empty body reads back as `content: None`.
pub(super) fn parse(text: &str) -> Result<Entry, StoreError> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
        .ok_or_else(|| StoreError::Corrupt("missing front matter".to_owned()))?;

    let (yaml, body) = split_front_matter(rest)
        .ok_or_else(|| StoreError::Corrupt("unterminated front matter".to_owned()))?;

    let front: FrontMatter = serde_yaml::from_str(yaml)?;
    let content = (!body.is_empty()).then(|| body.to_owned());

    Ok(Entry {
        id: front.id,
        feed_id: front.feed_id,
        guid: front.guid,
        title: front.title,
        link: front.link,
        author: front.author,
        content,
        published_at: front.published_at,
        read: front.read,
        read_at: front.read_at,
        created_at: front.created_at,
    })
}

/// Splits at the first line that is exactly `---`.
fn split_front_matter(rest: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == DELIMITER {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

/// Entry files in `dir`, skipping temp files and anything without the entry
/// extension. A missing directory yields nothing.
pub(super) fn list_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for item in read_dir {
        let path = item?.path();
        let visible = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.starts_with('.'));
        if visible && path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION) {
            files.push(path);
        }
    }
    Ok(files)
}

/// Reads and parses every entry file in `dir`. Unreadable or malformed files
/// are skipped.
pub(super) fn read_dir_entries(dir: &Path) -> Result<Vec<(PathBuf, Entry)>, StoreError> {
    let mut entries = Vec::new();
    for path in list_files(dir)? {
        match read_file(&path) {
            Ok(entry) => entries.push((path, entry)),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping unparseable entry file");
            }
        }
    }
    Ok(entries)
}

pub(super) fn read_file(path: &Path) -> Result<Entry, StoreError> {
    let text = std::fs::read_to_string(path)?;
    parse(&text)
}
