//! Feed ingestion: everything between a URL and rows in the [`Store`].
//!
//! - [`fetcher`] - conditional HTTP GET with SSRF checks and size limits
//! - [`discovery`] - turns a page or feed URL into a subscribable feed URL
//! - [`parser`] - RSS 2.0, RSS 1.0 and Atom into [`ParsedFeed`]
//! - [`refresh`] - the per-feed and batch pipeline, plus subscribing
//! - [`opml`] - subscription list import and export
//!
//! # Example
//!
//! ```ignore
//! use rivulet::feed::{refresh_all, subscribe, Fetcher};
//!
//! let fetcher = Fetcher::new()?;
//! subscribe(store.as_ref(), &fetcher, "https://example.com/", None, None).await?;
//! let summary = refresh_all(store.as_ref(), &fetcher, false, |_| {}).await?;
//! ```
//!
//! [`Store`]: crate::storage::Store

pub mod discovery;
pub mod fetcher;
pub mod opml;
pub mod parser;
pub mod refresh;

pub use discovery::{discover_feed, DiscoveredFeed, DiscoveryError};
pub use fetcher::{FetchError, FetchOutcome, FetchedBody, Fetcher, MAX_FEED_SIZE};
pub use opml::{ImportReport, OpmlError, OpmlFeed};
pub use parser::{parse_date, parse_feed, ParseError, ParsedEntry, ParsedFeed};
pub use refresh::{
    refresh_all, refresh_one, subscribe, FeedOutcome, FeedStatus, RefreshError, RefreshSummary,
    SubscribeError,
};
