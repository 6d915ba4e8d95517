use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

use crate::storage::{Feed, Store, StoreError};
use crate::util::{check_literal_host, parse_http_url};

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
/// Prevents stack overflow attacks from maliciously crafted deeply nested OPMLs.
const MAX_OPML_DEPTH: usize = 50;

const OPML_TITLE: &str = "rivulet subscriptions";

/// Errors that can occur during OPML import and export.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// XML generation failed.
    #[error("XML write error: {0}")]
    XmlWrite(String),

    /// File I/O error.
    #[error("OPML file error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A feed subscription extracted from an OPML file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    /// `title` attribute, falling back to `text`
    pub title: Option<String>,
    pub xml_url: String,
    pub html_url: Option<String>,
    /// Title of the innermost enclosing category outline
    pub folder: Option<String>,
}

/// Counts from [`import`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub added: usize,
    /// Already subscribed
    pub skipped: usize,
}

/// Parses OPML content and extracts feed subscriptions.
///
/// Handles both nested and flat OPML structures. Category outlines (those
/// without `xmlUrl`) are not returned themselves but give their title to
/// the feeds inside them as `folder`.
///
/// Outlines whose `xmlUrl` is not http(s), or is a literal private address,
/// are skipped with a warning.
pub fn parse_opml(content: &str) -> Result<Vec<OpmlFeed>, OpmlError> {
    // SEC-002: XXE protection. quick-xml (0.37) never parses <!ENTITY> declarations from
    // DOCTYPE. Only the five XML builtins resolve; a custom entity like &xxe; fails
    // `decode_and_unescape_value()` with `EscapeError::UnrecognizedEntity`.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    let mut buf = Vec::new();
    // One slot per open <outline>: the category title, or None for a feed outline
    let mut open: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                // SEC-003: Reject excessively nested OPMLs
                if open.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                let outline = read_outline(&e, &reader)?;
                match outline {
                    Outline::Feed(feed) => {
                        feeds.extend(accept(feed, &open));
                        open.push(None);
                    }
                    Outline::Category(title) => open.push(title),
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                // Self-closing outline doesn't affect depth
                if let Outline::Feed(feed) = read_outline(&e, &reader)? {
                    feeds.extend(accept(feed, &open));
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                open.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(feeds)
}

enum Outline {
    Feed(OpmlFeed),
    Category(Option<String>),
}

fn read_outline(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Outline, OpmlError> {
    let mut xml_url = None;
    let mut html_url = None;
    let mut title = None;
    let mut text = None;

    let decoder = reader.decoder();
    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(decoder)
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?
            .trim()
            .to_owned();
        if value.is_empty() {
            continue;
        }
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value),
            b"htmlUrl" => html_url = Some(value),
            b"title" => title = Some(value),
            b"text" => text = Some(value),
            _ => {}
        }
    }

    let title = title.or(text);
    Ok(match xml_url {
        Some(xml_url) => Outline::Feed(OpmlFeed {
            title,
            xml_url,
            html_url,
            folder: None,
        }),
        None => Outline::Category(title),
    })
}

/// Validates the feed URL and fills in the folder from the open categories.
fn accept(mut feed: OpmlFeed, open: &[Option<String>]) -> Option<OpmlFeed> {
    let url = match parse_http_url(&feed.xml_url) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(url = %feed.xml_url, error = %e, "Skipping invalid feed URL");
            return None;
        }
    };
    if check_literal_host(&url).is_err() {
        tracing::warn!(url = %feed.xml_url, "Skipping private-address feed URL");
        return None;
    }

    if let Some(html) = &feed.html_url {
        if parse_http_url(html).is_err() {
            tracing::warn!(url = %html, "Ignoring invalid htmlUrl in OPML");
            feed.html_url = None;
        }
    }

    // Exporters (this one included) repeat the URL as text for untitled feeds
    if feed.title.as_deref() == Some(feed.xml_url.as_str()) {
        feed.title = None;
    }
    feed.folder = open.iter().rev().flatten().next().cloned();
    Some(feed)
}

/// Reads an OPML file and subscribes to every feed in it.
///
/// Feeds are created directly from their `xmlUrl` without discovery. URLs
/// that are already subscribed are counted as skipped.
pub async fn import(store: &dyn Store, path: &Path) -> Result<ImportReport, OpmlError> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut report = ImportReport::default();

    for item in parse_opml(&content)? {
        let mut feed = Feed::new(item.xml_url);
        feed.title = item.title;
        feed.folder = item.folder;

        match store.create_feed(&feed).await {
            Ok(()) => report.added += 1,
            Err(StoreError::DuplicateUrl) => {
                tracing::debug!(url = %feed.url, "already subscribed");
                report.skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(added = report.added, skipped = report.skipped, "OPML import finished");
    Ok(report)
}

fn write_event<'a>(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    event: Event<'a>,
) -> Result<(), OpmlError> {
    writer
        .write_event(event)
        .map_err(|e| OpmlError::XmlWrite(e.to_string()))
}

fn feed_outline(feed: &Feed) -> BytesStart<'_> {
    let mut outline = BytesStart::new("outline");
    outline.push_attribute(("type", "rss"));
    outline.push_attribute(("text", feed.display_title()));
    if let Some(title) = feed.title.as_deref().filter(|t| !t.trim().is_empty()) {
        outline.push_attribute(("title", title));
    }
    outline.push_attribute(("xmlUrl", feed.url.as_str()));
    outline
}

/// Renders feeds as an OPML 2.0 document.
///
/// Feeds without a folder are top-level outlines; the rest are grouped
/// under one category outline per folder, folders in name order.
pub fn export_opml(feeds: &[Feed]) -> Result<String, OpmlError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    write_event(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    write_event(&mut writer, Event::Start(opml))?;

    write_event(&mut writer, Event::Start(BytesStart::new("head")))?;
    write_event(&mut writer, Event::Start(BytesStart::new("title")))?;
    write_event(&mut writer, Event::Text(BytesText::new(OPML_TITLE)))?;
    write_event(&mut writer, Event::End(BytesEnd::new("title")))?;
    write_event(&mut writer, Event::End(BytesEnd::new("head")))?;

    write_event(&mut writer, Event::Start(BytesStart::new("body")))?;

    let mut folders: BTreeMap<&str, Vec<&Feed>> = BTreeMap::new();
    for feed in feeds {
        match feed.folder.as_deref().filter(|f| !f.trim().is_empty()) {
            Some(folder) => folders.entry(folder).or_default().push(feed),
            None => write_event(&mut writer, Event::Empty(feed_outline(feed)))?,
        }
    }

    for (folder, members) in folders {
        let mut category = BytesStart::new("outline");
        category.push_attribute(("text", folder));
        category.push_attribute(("title", folder));
        write_event(&mut writer, Event::Start(category))?;
        for feed in members {
            write_event(&mut writer, Event::Empty(feed_outline(feed)))?;
        }
        write_event(&mut writer, Event::End(BytesEnd::new("outline")))?;
    }

    write_event(&mut writer, Event::End(BytesEnd::new("body")))?;
    write_event(&mut writer, Event::End(BytesEnd::new("opml")))?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(|e| OpmlError::XmlWrite(e.to_string()))
}

/// Exports every subscribed feed as OPML.
pub async fn export(store: &dyn Store) -> Result<String, OpmlError> {
    let feeds = store.list_feeds().await?;
    export_opml(&feeds)
}

/// Writes an OPML document to `path` atomically.
///
/// Writes to a temporary file in the same directory, syncs to disk, then
/// renames over the destination so it is never left half-written.
pub fn export_to_file(content: &str, path: &Path) -> Result<(), OpmlError> {
    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));

    let result = (|| {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        std::io::Write::write_all(&mut file, content.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use pretty_assertions::assert_eq;

    fn feed(title: Option<&str>, url: &str, folder: Option<&str>) -> Feed {
        let mut feed = Feed::new(url);
        feed.title = title.map(str::to_owned);
        feed.folder = folder.map(str::to_owned);
        feed
    }

    #[test]
    fn test_parse_nested_folders() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Test Feeds</title></head>
  <body>
    <outline text="Blogs" title="Blogs">
      <outline type="rss" text="Example Blog" title="Example Blog" xmlUrl="https://example.com/feed.xml" htmlUrl="https://example.com"/>
      <outline text="Inner">
        <outline type="rss" text="Deep" xmlUrl="https://deep.example.com/rss"/>
      </outline>
      <outline type="rss" text="No HTML" xmlUrl="https://nohtml.com/rss"/>
    </outline>
    <outline type="rss" text="Top" xmlUrl="https://top.example.com/rss"/>
  </body>
</opml>"#;

        let feeds = parse_opml(content).unwrap();
        let summary: Vec<_> = feeds
            .iter()
            .map(|f| (f.title.as_deref(), f.folder.as_deref()))
            .collect();
        assert_eq!(
            summary,
            [
                (Some("Example Blog"), Some("Blogs")),
                (Some("Deep"), Some("Inner")),
                (Some("No HTML"), Some("Blogs")),
                (Some("Top"), None),
            ]
        );
        assert_eq!(feeds[0].html_url.as_deref(), Some("https://example.com"));
    }

    #[test]
    fn test_title_falls_back_to_text_then_none() {
        let content = r#"<opml version="2.0"><body>
            <outline type="rss" text="Text Only" xmlUrl="https://textonly.com/feed"/>
            <outline type="rss" xmlUrl="https://notitle.com/feed"/>
        </body></opml>"#;

        let feeds = parse_opml(content).unwrap();
        assert_eq!(feeds[0].title.as_deref(), Some("Text Only"));
        assert_eq!(feeds[1].title, None);
    }

    #[test]
    fn test_skip_invalid_and_private_urls() {
        let content = r#"<opml version="2.0"><body>
            <outline xmlUrl="https://valid.com/feed"/>
            <outline xmlUrl="http://192.168.1.1/feed"/>
            <outline xmlUrl="http://[fd00::1]/feed"/>
            <outline xmlUrl="file:///etc/passwd"/>
            <outline xmlUrl="not a url"/>
        </body></opml>"#;

        let feeds = parse_opml(content).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].xml_url, "https://valid.com/feed");
    }

    #[test]
    fn test_malformed_xml_error() {
        assert!(matches!(
            parse_opml("<opml><body><outline xmlUrl=\"x\"></body"),
            Err(OpmlError::XmlParse(_))
        ));
    }

    #[test]
    fn test_xxe_entity_not_expanded() {
        // SEC-002: quick-xml does not parse <!ENTITY> declarations, so the
        // reference either fails to decode or stays literal.
        let opml = r#"<?xml version="1.0"?>
<!DOCTYPE opml [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<opml version="2.0"><body>
    <outline text="&xxe;" xmlUrl="https://example.com/feed.xml"/>
</body></opml>"#;

        if let Ok(feeds) = parse_opml(opml) {
            for feed in &feeds {
                let title = feed.title.as_deref().unwrap_or_default();
                assert!(!title.contains("root:"), "entity expanded: {title}");
            }
        }
    }

    #[test]
    fn test_deeply_nested_opml_rejected() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..100 {
            opml.push_str(r#"<outline text="level">"#);
        }
        for _ in 0..100 {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let err = parse_opml(&opml).unwrap_err();
        assert!(matches!(err, OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH)));
    }

    #[test]
    fn test_nesting_at_depth_limit_allowed() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..MAX_OPML_DEPTH {
            opml.push_str(r#"<outline text="level">"#);
        }
        opml.push_str(r#"<outline text="Deep Feed" xmlUrl="https://deep.example.com/feed"/>"#);
        for _ in 0..MAX_OPML_DEPTH {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let feeds = parse_opml(&opml).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].folder.as_deref(), Some("level"));
    }

    #[test]
    fn test_export_groups_by_folder() {
        let feeds = vec![
            feed(Some("Loose"), "https://loose.example/rss", None),
            feed(Some("Rust Blog"), "https://blog.rust-lang.org/feed.xml", Some("Tech")),
            feed(None, "https://untitled.example/rss", Some("Tech")),
            feed(Some("Art"), "https://art.example/rss", Some("Arts")),
        ];

        let exported = export_opml(&feeds).unwrap();
        assert!(exported.contains(OPML_TITLE));

        let parsed = parse_opml(&exported).unwrap();
        let summary: Vec<_> = parsed
            .iter()
            .map(|f| (f.xml_url.as_str(), f.folder.as_deref()))
            .collect();
        assert_eq!(
            summary,
            [
                ("https://loose.example/rss", None),
                ("https://art.example/rss", Some("Arts")),
                ("https://blog.rust-lang.org/feed.xml", Some("Tech")),
                ("https://untitled.example/rss", Some("Tech")),
            ]
        );
        // Untitled feeds come back untitled
        assert_eq!(parsed[3].title, None);
    }

    #[test]
    fn test_export_xml_escaping() {
        let feeds = vec![feed(
            Some("Feed with <special> & \"chars\""),
            "https://example.com/feed?a=1&b=2",
            None,
        )];

        let exported = export_opml(&feeds).unwrap();
        let parsed = parse_opml(&exported).unwrap();
        assert_eq!(parsed[0].title.as_deref(), Some("Feed with <special> & \"chars\""));
        assert_eq!(parsed[0].xml_url, "https://example.com/feed?a=1&b=2");
    }

    #[tokio::test]
    async fn test_import_then_export_through_store() {
        let dir = std::env::temp_dir().join(format!("rivulet-opml-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("subs.opml");
        std::fs::write(
            &path,
            r#"<opml version="2.0"><body>
                <outline text="News">
                    <outline text="A" xmlUrl="https://a.example/rss"/>
                </outline>
                <outline text="B" xmlUrl="https://b.example/rss"/>
            </body></opml>"#,
        )
        .unwrap();

        let store = SqliteStore::open_in_memory().await.unwrap();
        let first = import(&store, &path).await.unwrap();
        assert_eq!(first, ImportReport { added: 2, skipped: 0 });
        let second = import(&store, &path).await.unwrap();
        assert_eq!(second, ImportReport { added: 0, skipped: 2 });

        let a = store.get_feed_by_url("https://a.example/rss").await.unwrap();
        assert_eq!(a.folder.as_deref(), Some("News"));
        assert_eq!(a.title.as_deref(), Some("A"));

        let out = dir.join("out.opml");
        export_to_file(&export(&store).await.unwrap(), &out).unwrap();
        let reparsed = parse_opml(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(reparsed.len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
