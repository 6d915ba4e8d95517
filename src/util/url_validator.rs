use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use url::{Host, Url};

/// Errors that can occur during URL validation.
///
/// These cover both parsing failures and the SSRF (Server-Side Request
/// Forgery) policy applied before any request leaves the process.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The host resolves to a private, link-local or multicast address.
    #[error("address {0} is in a private network range")]
    PrivateAddress(IpAddr),
    /// Host resolution failed.
    #[error("could not resolve host {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

/// Parses a URL and checks that it is an absolute http(s) URL with a host.
///
/// This is the syntactic half of validation; [`check_literal_host`] and
/// [`check_addresses`] apply the network-range policy.
///
/// ```
/// use rivulet::util::parse_http_url;
///
/// assert!(parse_http_url("https://example.com/feed.xml").is_ok());
/// assert!(parse_http_url("file:///etc/passwd").is_err());
/// assert!(parse_http_url("not a url").is_err());
/// ```
pub fn parse_http_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlValidationError::MissingHost);
    }

    Ok(url)
}

/// Applies the address policy to a URL whose host is an IP literal.
///
/// Named hosts pass here; their addresses are checked when the HTTP client
/// resolves them for the connection, so the policy sees exactly the
/// addresses that get dialed.
pub fn check_literal_host(url: &Url) -> Result<(), UrlValidationError> {
    match url.host() {
        Some(Host::Ipv4(ip)) => check_addresses(&[IpAddr::V4(ip)]),
        Some(Host::Ipv6(ip)) => check_addresses(&[IpAddr::V6(ip)]),
        Some(Host::Domain(_)) => Ok(()),
        None => Err(UrlValidationError::MissingHost),
    }
}

/// Looks `host` up through the system resolver. No policy is applied.
pub async fn resolve_host(host: &str, port: u16) -> Result<Vec<SocketAddr>, UrlValidationError> {
    // Strip brackets from IPv6 literals before resolution
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| UrlValidationError::Resolve {
            host: host.to_owned(),
            source,
        })?;
    Ok(addrs.collect())
}

/// The SSRF policy over one host's resolved addresses.
///
/// - every address is loopback: allowed (local test servers)
/// - any non-loopback address is private, link-local, multicast,
///   unspecified or otherwise non-routable: rejected
/// - everything else: allowed
pub fn check_addresses(addrs: &[IpAddr]) -> Result<(), UrlValidationError> {
    if !addrs.is_empty() && addrs.iter().all(IpAddr::is_loopback) {
        return Ok(());
    }

    match addrs.iter().find(|ip| !ip.is_loopback() && is_blocked_ip(ip)) {
        Some(ip) => Err(UrlValidationError::PrivateAddress(*ip)),
        None => Ok(()),
    }
}

/// Returns true for addresses a feed fetch must never reach: private,
/// link-local, multicast, unspecified, broadcast, CGNAT and unique-local
/// ranges. Loopback is reported as blocked too; the loopback-only exemption
/// lives in [`check_addresses`].
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_v4(&mapped);
            }
            is_blocked_v6(v6)
        }
    }
}

fn is_blocked_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..128).contains(&b))
}

fn is_blocked_v6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }
    let first = ip.segments()[0];
    // Unique Local (fc00::/7)
    let is_unique_local = (first & 0xfe00) == 0xfc00;
    // Link-Local (fe80::/10)
    let is_link_local = (first & 0xffc0) == 0xfe80;
    is_unique_local || is_link_local
}
