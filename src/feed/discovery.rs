use thiserror::Error;
use url::Url;

use super::fetcher::{FetchError, FetchOutcome, FetchedBody, Fetcher};
use super::parser::parse_feed;
use crate::util::parse_http_url;

/// Content types that mark a `<link rel="alternate">` as a feed.
const FEED_TYPES: [&str; 4] = [
    "application/rss+xml",
    "application/atom+xml",
    "application/xml",
    "text/xml",
];

/// Paths tried under the input URL when nothing else worked.
const COMMON_FEED_PATHS: [&str; 4] = ["/feed.xml", "/rss.xml", "/atom.xml", "/index.xml"];

/// A feed located from a user-supplied URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFeed {
    /// URL of the feed document itself
    pub url: String,
    /// Title from the parsed feed, if it had one
    pub title: Option<String>,
}

/// Errors that can occur during feed discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Neither the URL, its advertised links nor the common paths held a feed
    #[error("no feed found")]
    NoFeedFound,
    /// The input URL itself is unusable (bad URL or private address)
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Discovers an RSS/Atom feed from a URL.
///
/// Accepts either a direct feed URL or an HTML page URL. Strategies, first
/// success wins:
///
/// 1. the URL itself, if its body parses as a feed
/// 2. every `<link rel="alternate">` with a feed type, in document order
/// 3. `/feed.xml`, `/rss.xml`, `/atom.xml`, `/index.xml` under the URL's path
///
/// # Errors
///
/// Invalid or private input URLs fail immediately with
/// [`DiscoveryError::Fetch`]; any other failure of the direct fetch falls
/// through to the later strategies.
pub async fn discover_feed(fetcher: &Fetcher, url: &str) -> Result<DiscoveredFeed, DiscoveryError> {
    let input = parse_http_url(url).map_err(FetchError::from)?;

    let mut candidates = Vec::new();
    match fetcher.fetch(input.as_str(), None, None).await {
        Ok(FetchOutcome::Fresh(body)) => {
            if !is_html(&body) {
                if let Ok(parsed) = parse_feed(&body.body) {
                    tracing::debug!(url = %input, "input URL is a feed");
                    return Ok(DiscoveredFeed {
                        url: input.to_string(),
                        title: parsed.title,
                    });
                }
            }
            let html = String::from_utf8_lossy(&body.body);
            candidates = find_feed_links(&html, &body.final_url);
        }
        Ok(FetchOutcome::NotModified) => {}
        Err(e @ (FetchError::InvalidUrl(_) | FetchError::PrivateAddressBlocked { .. })) => {
            return Err(e.into());
        }
        Err(e) => {
            tracing::debug!(url = %input, error = %e, "direct fetch failed");
        }
    }

    for candidate in &candidates {
        if let Some(found) = try_candidate(fetcher, candidate).await {
            return Ok(found);
        }
    }

    for candidate in common_path_candidates(&input) {
        if let Some(found) = try_candidate(fetcher, &candidate).await {
            return Ok(found);
        }
    }

    Err(DiscoveryError::NoFeedFound)
}

/// Fetches and parses one candidate. Any failure just means "not here".
async fn try_candidate(fetcher: &Fetcher, url: &Url) -> Option<DiscoveredFeed> {
    let body = match fetcher.fetch(url.as_str(), None, None).await {
        Ok(FetchOutcome::Fresh(body)) => body,
        Ok(FetchOutcome::NotModified) => return None,
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "candidate fetch failed");
            return None;
        }
    };

    match parse_feed(&body.body) {
        Ok(parsed) => Some(DiscoveredFeed {
            url: url.to_string(),
            title: parsed.title,
        }),
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "candidate is not a feed");
            None
        }
    }
}

fn is_html(body: &FetchedBody) -> bool {
    body.content_type
        .as_deref()
        .is_some_and(|ct| ct.contains("text/html") || ct.contains("application/xhtml"))
}

fn is_feed_type(value: &str) -> bool {
    let mime = value.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    FEED_TYPES.contains(&mime.as_str())
}

/// Scans HTML for `<link>` tags with `rel` containing `alternate` and a feed
/// `type`, returning their resolved hrefs in document order.
///
/// Uses simple string scanning (no HTML parser dependency). Handles attribute
/// ordering variations and both quote styles.
fn find_feed_links(html: &str, base: &Url) -> Vec<Url> {
    let html_lower = html.to_ascii_lowercase();
    let mut found: Vec<Url> = Vec::new();
    let mut search_from = 0;

    while let Some(link_start) = html_lower[search_from..].find("<link") {
        let abs_start = search_from + link_start;
        let remaining = &html_lower[abs_start..];

        // Find the end of this <link> tag
        let Some(tag_end) = remaining.find('>') else {
            break;
        };
        search_from = abs_start + tag_end + 1;

        // `<linkage>` and friends are not link tags
        let after = remaining.as_bytes().get(5).copied().unwrap_or(b'>');
        if !(after.is_ascii_whitespace() || after == b'/' || after == b'>') {
            continue;
        }

        // Attribute values come from the original text so hrefs keep their case
        let tag = &html[abs_start..=abs_start + tag_end];

        let is_alternate = extract_attr_value(tag, "rel").is_some_and(|rel| {
            rel.split_ascii_whitespace()
                .any(|token| token.eq_ignore_ascii_case("alternate"))
        });
        if !is_alternate || !extract_attr_value(tag, "type").is_some_and(is_feed_type) {
            continue;
        }

        let Some(href) = extract_attr_value(tag, "href") else {
            continue;
        };
        match resolve_url(href, base) {
            Some(url) if !found.contains(&url) => found.push(url),
            Some(_) => {}
            None => tracing::debug!(href, "skipping unusable feed link"),
        }
    }

    found
}

/// Extracts the value of an attribute from a tag string (case-preserving).
///
/// The name must start at an attribute boundary, so `href` does not match
/// `data-href`. Quoted and bare values are accepted.
fn extract_attr_value<'a>(tag: &'a str, attr_name: &str) -> Option<&'a str> {
    let lower = tag.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut from = 0;

    while let Some(pos) = lower[from..].find(attr_name) {
        let start = from + pos;
        from = start + attr_name.len();

        let boundary = start > 0 && bytes[start - 1].is_ascii_whitespace();
        if !boundary {
            continue;
        }

        let rest = tag[from..].trim_start();
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        let rest = rest.trim_start();

        return match rest.as_bytes().first()? {
            quote @ (b'"' | b'\'') => {
                let inner = &rest[1..];
                let end = inner.find(*quote as char)?;
                Some(&inner[..end])
            }
            _ => {
                let end = rest
                    .find(|c: char| c.is_ascii_whitespace() || c == '>' || c == '/')
                    .unwrap_or(rest.len());
                Some(&rest[..end])
            }
        };
    }

    None
}

/// Resolves an href against the page URL. Absolute, protocol-relative,
/// root-relative and path-relative forms (including `..`) are supported;
/// anything that is not http(s) afterwards is dropped.
fn resolve_url(href: &str, base: &Url) -> Option<Url> {
    let href = href.trim().replace("&amp;", "&");
    if href.is_empty() {
        return None;
    }
    let resolved = base.join(&href).ok()?;
    parse_http_url(resolved.as_str()).ok()
}

/// The fallback candidates: common feed file names under the input's path, with
/// query and fragment dropped and any trailing slash trimmed.
fn common_path_candidates(input: &Url) -> Vec<Url> {
    let mut base = input.clone();
    base.set_query(None);
    base.set_fragment(None);
    let path = base.path().trim_end_matches('/').to_owned();

    COMMON_FEED_PATHS
        .iter()
        .map(|suffix| {
            let mut candidate = base.clone();
            candidate.set_path(&format!("{path}{suffix}"));
            candidate
        })
        .collect()
}
