//! rivulet: a command-line RSS/Atom aggregator.
//!
//! The library holds the ingestion pipeline and storage so the binary stays
//! a thin command layer:
//!
//! - [`feed`] - fetch, discover, parse and refresh feeds; OPML
//! - [`storage`] - the [`storage::Store`] trait with SQLite and Markdown backends
//! - [`config`] - config file and data directory resolution
//! - [`util`] - URL safety checks and text helpers

pub mod config;
pub mod feed;
pub mod storage;
pub mod util;
