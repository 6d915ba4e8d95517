use futures::StreamExt;
use reqwest::header::{
    HeaderName, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION,
    USER_AGENT,
};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{redirect, StatusCode};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::util::{
    check_addresses, check_literal_host, parse_http_url, resolve_host, UrlValidationError,
};

/// Largest body accepted from a feed server.
pub const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 5;

/// `User-Agent` sent with every request.
pub const USER_AGENT_VALUE: &str = concat!("rivulet/", env!("CARGO_PKG_VERSION"), " (RSS reader)");

/// Errors that can occur while fetching a feed document.
///
/// `NotModified` is not here: a 304 is a successful [`FetchOutcome`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// Malformed URL, non-http(s) scheme or unusable redirect target
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// The host resolved to a private or otherwise internal address
    #[error("refusing to fetch {host}: resolves to private address")]
    PrivateAddressBlocked { host: String },
    /// Host name could not be resolved
    #[error("could not resolve {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: std::io::Error,
    },
    /// Connection, TLS or read failure
    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),
    /// The request did not finish within the deadline
    #[error("request timed out")]
    Timeout,
    /// Any status other than 200 or 304 after following redirects
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),
    /// Response body exceeded the size limit
    #[error("response too large (limit {limit} bytes)")]
    ResponseTooLarge { limit: usize },
    /// Redirect chain longer than the hop limit, or a loop
    #[error("too many redirects")]
    TooManyRedirects,
}

impl FetchError {
    /// True for transport-level failures (DNS, connect, read, timeout).
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_) | FetchError::Dns { .. } | FetchError::Timeout
        )
    }
}

impl From<UrlValidationError> for FetchError {
    fn from(err: UrlValidationError) -> Self {
        match err {
            UrlValidationError::PrivateAddress(ip) => FetchError::PrivateAddressBlocked {
                host: ip.to_string(),
            },
            UrlValidationError::Resolve { host, source } => FetchError::Dns { host, source },
            other => FetchError::InvalidUrl(other.to_string()),
        }
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout;
    }

    // A refusal from GuardedResolver arrives wrapped in connect errors
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        match cause.downcast_ref::<UrlValidationError>() {
            Some(UrlValidationError::PrivateAddress(ip)) => {
                return FetchError::PrivateAddressBlocked {
                    host: ip.to_string(),
                }
            }
            Some(UrlValidationError::Resolve { host, source }) => {
                return FetchError::Dns {
                    host: host.clone(),
                    source: std::io::Error::new(source.kind(), source.to_string()),
                }
            }
            _ => source = cause.source(),
        }
    }
    FetchError::Network(err)
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// DNS resolver installed on the HTTP client. Applies the address policy to
/// the answer the connection will use, so a name cannot pass the check with
/// one address and then be dialed at another.
struct GuardedResolver<R> {
    inner: R,
}

impl<R: Resolve> Resolve for GuardedResolver<R> {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_owned();
        let lookup = self.inner.resolve(name);
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = lookup.await?.collect();
            let ips: Vec<IpAddr> = addrs.iter().map(SocketAddr::ip).collect();
            if let Err(e) = check_addresses(&ips) {
                tracing::warn!(host = %host, error = %e, "refusing resolved address");
                return Err(e.into());
            }
            Ok::<Addrs, BoxError>(Box::new(addrs.into_iter()))
        })
    }
}

/// Plain system lookup. reqwest fills in the port.
struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_owned();
        Box::pin(async move {
            let addrs = resolve_host(&host, 0).await?;
            Ok::<Addrs, BoxError>(Box::new(addrs.into_iter()))
        })
    }
}

/// A 200 response body plus the metadata the pipeline keeps.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub body: Vec<u8>,
    /// `ETag` header, verbatim
    pub etag: Option<String>,
    /// `Last-Modified` header, verbatim
    pub last_modified: Option<String>,
    /// Lowercased `Content-Type` header
    pub content_type: Option<String>,
    /// URL the body was served from after redirects
    pub final_url: Url,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fresh(FetchedBody),
    NotModified,
}

/// Conditional HTTP GET with SSRF checks on every hop.
///
/// Redirects are followed here rather than by reqwest so every hop is
/// re-validated. IP-literal hosts are checked before the request; named hosts
/// are checked by the client's resolver on the addresses it connects to.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_body: usize,
}

impl Fetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_resolver(SystemResolver)
    }

    fn with_resolver(inner: impl Resolve + 'static) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .dns_resolver(GuardedResolver { inner })
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(FetchError::Network)?;

        Ok(Self {
            client,
            timeout: REQUEST_TIMEOUT,
            max_body: MAX_FEED_SIZE,
        })
    }

    /// Overrides the per-request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the body size limit.
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    /// Fetches `url`, sending `If-None-Match` / `If-Modified-Since` for the
    /// validators that are present and non-empty.
    ///
    /// Dropping the returned future cancels the request.
    pub async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let etag = etag.filter(|v| !v.is_empty());
        let last_modified = last_modified.filter(|v| !v.is_empty());

        let mut current = parse_http_url(url)?;
        let mut visited: HashSet<Url> = HashSet::new();

        for hop in 0..=MAX_REDIRECTS {
            check_literal_host(&current)?;
            visited.insert(current.clone());

            let mut request = self
                .client
                .get(current.clone())
                .header(USER_AGENT, USER_AGENT_VALUE);
            if let Some(etag) = etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }

            let response = tokio::time::timeout(self.timeout, request.send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(classify)?;
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                tracing::debug!(url = %current, "not modified");
                return Ok(FetchOutcome::NotModified);
            }

            if status.is_redirection() {
                let next = redirect_target(&current, &response)?;
                if visited.contains(&next) {
                    tracing::warn!(url = %current, target = %next, "redirect loop");
                    return Err(FetchError::TooManyRedirects);
                }
                tracing::debug!(from = %current, to = %next, hop, "following redirect");
                current = next;
                continue;
            }

            if status != StatusCode::OK {
                return Err(FetchError::UnexpectedStatus(status.as_u16()));
            }

            let header = |name: HeaderName| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            };
            let etag = header(ETAG);
            let last_modified = header(LAST_MODIFIED);
            let content_type = header(CONTENT_TYPE).map(|ct| ct.to_lowercase());

            let body = tokio::time::timeout(self.timeout, read_limited_bytes(response, self.max_body))
                .await
                .map_err(|_| FetchError::Timeout)??;

            tracing::debug!(url = %current, bytes = body.len(), "fetched feed");
            return Ok(FetchOutcome::Fresh(FetchedBody {
                body,
                etag,
                last_modified,
                content_type,
                final_url: current,
            }));
        }

        Err(FetchError::TooManyRedirects)
    }
}

/// Resolves the `Location` header against the current URL and checks the
/// result is still http(s).
fn redirect_target(current: &Url, response: &reqwest::Response) -> Result<Url, FetchError> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| FetchError::UnexpectedStatus(response.status().as_u16()))?;

    let next = current
        .join(location)
        .map_err(|e| FetchError::InvalidUrl(format!("bad redirect target {location}: {e}")))?;
    Ok(parse_http_url(next.as_str())?)
}

/// Reads the body, failing as soon as it would exceed `limit` bytes.
async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge { limit });
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge { limit });
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
