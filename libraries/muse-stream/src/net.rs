//! Shared HTTP client construction and request headers
//!
//! Both the precacher and the offline library fetch raw audio bodies with
//! the same request shape: identity encoding (ranges must be byte-exact),
//! a mobile-client user agent, and `Accept: */*`.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, RANGE};
use reqwest::Client;
use std::time::Duration;

/// User agent matching a recent official mobile client build.
pub const MOBILE_USER_AGENT: &str =
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0.0.0 Mobile Safari/537.36";

/// Connect timeout applied to the precache client.
const PRECACHE_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Headers common to every body fetch.
fn base_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers
}

/// HTTP client for background precache downloads.
pub fn precache_client() -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(PRECACHE_CONNECT_TIMEOUT)
        .user_agent(MOBILE_USER_AGENT)
        .default_headers(base_headers())
        .build()
}

/// HTTP client for offline library downloads (backend-default connect
/// timeout; large bodies must not be bounded by an overall timeout).
pub fn download_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(MOBILE_USER_AGENT)
        .default_headers(base_headers())
        .build()
}

/// `Range: bytes=<from>-` continuation header value.
pub fn range_from(from: u64) -> HeaderValue {
    HeaderValue::from_str(&format!("bytes={from}-"))
        .unwrap_or_else(|_| HeaderValue::from_static("bytes=0-"))
}

/// `Range: bytes=a-b` inclusive segment header value.
pub fn range_bounded(start: u64, end_inclusive: u64) -> HeaderValue {
    HeaderValue::from_str(&format!("bytes={start}-{end_inclusive}"))
        .unwrap_or_else(|_| HeaderValue::from_static("bytes=0-"))
}

/// Name of the range header, re-exported so callers avoid a direct
/// `reqwest::header` import.
pub const RANGE_HEADER: reqwest::header::HeaderName = RANGE;
