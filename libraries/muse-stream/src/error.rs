//! Error types for stream resolution, caching, and downloads

use thiserror::Error;

/// Errors from the stream resolver.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Every provider client failed to produce a playable URL
    #[error("no client could resolve track {0}")]
    Unresolvable(String),

    /// A previously handed-out URL expired while in use
    #[error("stream URL expired mid-flight for track {0}")]
    ExpiredMidFlight(String),

    /// Transport failure talking to the provider
    #[error("resolver network error: {0}")]
    Network(String),

    /// The provider refused for quota or geo reasons
    #[error("provider refused (quota or geo): {0}")]
    QuotaOrGeo(String),
}

/// Errors from the byte cache. Every error that names a file also deletes it.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Body smaller than the validity floor
    #[error("cached body too small: {size} bytes")]
    TooSmall { size: u64 },

    /// Body size disagrees with the known content length
    #[error("cached body length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// Filesystem failure
    #[error("cache I/O: {0}")]
    IoFailed(#[from] std::io::Error),
}

/// Errors from the segmented downloader and the offline pipeline.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Socket / timeout / DNS / handshake class failure, retryable
    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    /// Unexpected HTTP status
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// Body shorter than allowed (missing percentage of expected bytes)
    #[error("incomplete body: {0:.1}% missing")]
    Incomplete(f64),

    /// Body failed the magic-byte header check
    #[error("corrupt body: {0}")]
    Corrupt(String),

    /// Cancelled by the owner of the task
    #[error("download cancelled")]
    Cancelled,

    /// Filesystem failure while sinking the body
    #[error("download I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Classify a `reqwest` failure by kind, never by message text.
    pub fn from_reqwest(err: reqwest::Error) -> DownloadError {
        if err.is_timeout() || err.is_connect() {
            return DownloadError::NetworkTransient(err.to_string());
        }
        if let Some(status) = err.status() {
            return DownloadError::HttpStatus(status.as_u16());
        }
        if err.is_body() || err.is_decode() || err.is_request() {
            // Early connection close while streaming the body lands here.
            return DownloadError::NetworkTransient(err.to_string());
        }
        DownloadError::NetworkTransient(err.to_string())
    }

    /// Whether the offline library should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, DownloadError::NetworkTransient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_formats_percentage() {
        let e = DownloadError::Incomplete(7.25);
        assert!(e.to_string().contains("7.2"));
    }

    #[test]
    fn transient_classification() {
        assert!(DownloadError::NetworkTransient("x".into()).is_transient());
        assert!(!DownloadError::HttpStatus(403).is_transient());
        assert!(!DownloadError::Cancelled.is_transient());
    }
}
