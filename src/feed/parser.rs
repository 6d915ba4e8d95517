//! RSS 2.0, RSS 1.0 (RDF) and Atom 1.0 into one entry model.
//!
//! The document is read with `quick-xml` into a small element tree first, so
//! field lookup does not depend on element order and the reader can be
//! lenient about mismatched end tags and unclosed elements at end of input.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use quick_xml::escape::{escape, resolve_predefined_entity, unescape_with};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::util::clean_inline;

/// Nesting limit for the element tree. Real feeds stay far below this.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    Xml(String),
    #[error("document nesting exceeds {0} levels")]
    TooDeep(usize),
    #[error("document has no root element")]
    Empty,
    #[error("not an RSS or Atom document (root element <{0}>)")]
    UnknownFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    pub guid: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub content: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFeed {
    pub title: Option<String>,
    /// Entries in document order
    pub entries: Vec<ParsedEntry>,
}

// ============================================================================
// Element tree
// ============================================================================

#[derive(Debug)]
struct Element {
    /// Qualified name as written, e.g. `content:encoded`
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

#[derive(Debug)]
enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    fn local(&self) -> &str {
        local_name(&self.name)
    }

    fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child with the given qualified name.
    fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// First child with the given local name, whatever its prefix.
    fn child_local(&self, local: &str) -> Option<&Element> {
        self.elements().find(|e| e.local() == local)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Concatenated text of this element and its descendants, trimmed.
    fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out.trim().to_owned()
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Element(e) => e.collect_text(out),
            }
        }
    }

    /// Children re-serialized as markup, for Atom `type="xhtml"` content.
    fn inner_markup(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            write_node(node, &mut out);
        }
        out.trim().to_owned()
    }
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Text(t) => out.push_str(&escape(t.as_str())),
        Node::Element(e) => {
            out.push('<');
            out.push_str(&e.name);
            for (k, v) in &e.attrs {
                out.push(' ');
                out.push_str(k);
                out.push_str("=\"");
                out.push_str(&escape(v.as_str()));
                out.push('"');
            }
            if e.children.is_empty() {
                out.push_str("/>");
                return;
            }
            out.push('>');
            for child in &e.children {
                write_node(child, out);
            }
            out.push_str("</");
            out.push_str(&e.name);
            out.push('>');
        }
    }
}

fn local_name(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, local)| local)
}

/// XML's five entities plus the HTML ones publishers most often leave
/// unescaped. Anything else is kept verbatim.
fn resolve_entity(name: &str) -> Option<&'static str> {
    resolve_predefined_entity(name).or(match name {
        "nbsp" => Some("\u{a0}"),
        "ndash" => Some("\u{2013}"),
        "mdash" => Some("\u{2014}"),
        "lsquo" => Some("\u{2018}"),
        "rsquo" => Some("\u{2019}"),
        "ldquo" => Some("\u{201c}"),
        "rdquo" => Some("\u{201d}"),
        "hellip" => Some("\u{2026}"),
        "copy" => Some("\u{a9}"),
        "reg" => Some("\u{ae}"),
        "trade" => Some("\u{2122}"),
        _ => None,
    })
}

/// Resolves entity and character references, leaving unknown or malformed
/// references in place instead of failing the whole text.
fn unescape_lenient(raw: &str) -> String {
    if let Ok(s) = unescape_with(raw, resolve_entity) {
        return s.into_owned();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let end = tail[1..]
            .find(|c: char| c == ';' || c == '&' || c.is_whitespace())
            .map(|i| i + 1);
        match end {
            Some(end) if tail[end..].starts_with(';') => {
                let reference = &tail[..=end];
                match unescape_with(reference, resolve_entity) {
                    Ok(s) => out.push_str(&s),
                    Err(_) => out.push_str(reference),
                }
                rest = &tail[end + 1..];
            }
            _ => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn start_element(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Element, ParseError> {
    let decoder = reader.decoder();
    let name = decoder
        .decode(e.name().as_ref())
        .map_err(|err| ParseError::Xml(err.to_string()))?
        .into_owned();

    let mut attrs = Vec::new();
    for attr in e.attributes().with_checks(false) {
        let Ok(attr) = attr else {
            continue;
        };
        let (Ok(key), Ok(value)) = (decoder.decode(attr.key.as_ref()), decoder.decode(&attr.value))
        else {
            continue;
        };
        attrs.push((key.into_owned(), unescape_lenient(&value)));
    }

    Ok(Element {
        name,
        attrs,
        children: Vec::new(),
    })
}

/// Attaches `element` to the innermost open element, or makes it the root if
/// nothing is open and no root has been seen yet.
fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

fn build_tree(bytes: &[u8]) -> Result<Element, ParseError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().check_end_names = false;

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(ParseError::TooDeep(MAX_DEPTH));
                }
                let element = start_element(&e, &reader)?;
                stack.push(element);
            }
            Ok(Event::Empty(e)) => {
                let element = start_element(&e, &reader)?;
                attach(&mut stack, &mut root, element);
            }
            Ok(Event::End(_)) => {
                if let Some(element) = stack.pop() {
                    attach(&mut stack, &mut root, element);
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(parent) = stack.last_mut() {
                    let raw = reader
                        .decoder()
                        .decode(&e)
                        .map_err(|err| ParseError::Xml(err.to_string()))?;
                    parent.children.push(Node::Text(unescape_lenient(&raw)));
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(parent) = stack.last_mut() {
                    let text = reader
                        .decoder()
                        .decode(&e)
                        .map_err(|err| ParseError::Xml(err.to_string()))?;
                    parent.children.push(Node::Text(text.into_owned()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ParseError::Xml(e.to_string())),
        }
        buf.clear();
    }

    // Close anything left open at end of input
    while let Some(element) = stack.pop() {
        attach(&mut stack, &mut root, element);
    }

    root.ok_or(ParseError::Empty)
}

// ============================================================================
// Dialects
// ============================================================================

/// Parses a feed document.
///
/// Entries keep document order. Fields missing from an entry are `None`;
/// only a structural failure (no XML, unknown root) is an error.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let root = build_tree(bytes)?;

    match root.local() {
        "rss" => {
            let channel = root.child_local("channel");
            let items = channel
                .into_iter()
                .flat_map(|c| c.elements())
                .filter(|e| e.local() == "item");
            Ok(ParsedFeed {
                title: channel.and_then(|c| inline_text(c.child_local("title"))),
                entries: items.map(rss_item).collect(),
            })
        }
        // RSS 1.0 keeps items beside the channel rather than inside it
        "RDF" => {
            let channel = root.child_local("channel");
            let items = root.elements().filter(|e| e.local() == "item");
            Ok(ParsedFeed {
                title: channel.and_then(|c| inline_text(c.child_local("title"))),
                entries: items.map(rss_item).collect(),
            })
        }
        "feed" => Ok(ParsedFeed {
            title: inline_text(root.child_local("title")),
            entries: root
                .elements()
                .filter(|e| e.local() == "entry")
                .map(atom_entry)
                .collect(),
        }),
        other => Err(ParseError::UnknownFormat(other.to_owned())),
    }
}

fn rss_item(item: &Element) -> ParsedEntry {
    let raw_title = item.child("title").map(Element::text).unwrap_or_default();
    let raw_date = item
        .child("pubDate")
        .or_else(|| item.child_local("date"))
        .map(Element::text)
        .unwrap_or_default();

    // An RSS <link> carries text; an atom:link inside an item carries href
    let link = item
        .elements()
        .filter(|e| e.local() == "link")
        .find_map(|e| non_empty(e.text()).or_else(|| e.attr("href").and_then(non_empty_str)));

    let guid = item
        .child_local("guid")
        .and_then(|g| non_empty(g.text()))
        .or_else(|| link.clone())
        .unwrap_or_else(|| fallback_guid(&raw_title, &raw_date));

    let author = inline_text(item.child("author")).or_else(|| inline_text(item.child_local("creator")));

    let content = item
        .child_local("encoded")
        .and_then(|e| non_empty(e.text()))
        .or_else(|| item.child("description").and_then(|e| non_empty(e.text())));

    ParsedEntry {
        guid,
        title: clean_title(&raw_title),
        link,
        author,
        content,
        published_at: parse_date(&raw_date),
    }
}

fn atom_entry(entry: &Element) -> ParsedEntry {
    let raw_title = entry.child_local("title").map(Element::text).unwrap_or_default();
    let raw_date = entry
        .child_local("published")
        .or_else(|| entry.child_local("updated"))
        .map(Element::text)
        .unwrap_or_default();

    let link = entry
        .elements()
        .filter(|e| e.local() == "link" && e.attr("rel") != Some("self"))
        .find_map(|e| e.attr("href").and_then(non_empty_str));

    let guid = entry
        .child_local("id")
        .and_then(|e| non_empty(e.text()))
        .or_else(|| link.clone())
        .unwrap_or_else(|| fallback_guid(&raw_title, &raw_date));

    let author = entry
        .child_local("author")
        .and_then(|a| inline_text(a.child_local("name")));

    let content = entry
        .child_local("content")
        .and_then(atom_text)
        .or_else(|| entry.child_local("summary").and_then(atom_text));

    ParsedEntry {
        guid,
        title: clean_title(&raw_title),
        link,
        author,
        content,
        published_at: parse_date(&raw_date),
    }
}

fn atom_text(element: &Element) -> Option<String> {
    if element.attr("type") == Some("xhtml") {
        non_empty(element.inner_markup())
    } else {
        non_empty(element.text())
    }
}

/// Stable identity for items with neither guid nor link.
fn fallback_guid(title: &str, raw_date: &str) -> String {
    let hash = Sha256::digest(format!("{title}|{raw_date}").as_bytes());
    format!("{:x}", hash)
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn non_empty_str(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_owned())
}

fn clean_title(raw: &str) -> Option<String> {
    non_empty(clean_inline(raw).into_owned())
}

fn inline_text(element: Option<&Element>) -> Option<String> {
    element.and_then(|e| clean_title(&e.text()))
}

/// Parses the date forms seen in the wild: RFC 822/1123/2822, RFC 3339,
/// and zone-less ISO forms (taken as UTC). Returns `None` for anything else.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let parsed = DateTime::parse_from_rfc2822(s)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })?;

    Some(parsed.trunc_subsecs(3))
}
