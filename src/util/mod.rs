//! Shared helpers for the ingestion pipeline and the CLI.
//!
//! - **URL guard**: scheme checks plus resolution-time SSRF protection
//! - **Text**: slugs for the file store, control-character stripping for
//!   publisher-supplied strings, and column-aware truncation for listings

mod text;
mod url_validator;

pub use text::{clean_inline, slugify, truncate_to_width};
pub use url_validator::{
    check_addresses, check_literal_host, is_blocked_ip, parse_http_url, resolve_host,
    UrlValidationError,
};
