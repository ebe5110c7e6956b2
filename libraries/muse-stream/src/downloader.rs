//! Segmented body downloader
//!
//! Downloads a full audio body to a file, either as N parallel byte ranges
//! merged in order, or sequentially with range-continuation retries when the
//! server closes the connection early. Used by the precacher and by the
//! offline library.

use crate::error::DownloadError;
use crate::net::{range_bounded, range_from, RANGE_HEADER};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Smallest body worth splitting into parallel ranges.
const PARALLEL_FLOOR_BYTES: u64 = 1024 * 1024;

/// Target bytes per parallel range when computing the part count.
const BYTES_PER_PART: u64 = 512 * 1024;

/// Delay between range-continuation attempts.
const CONTINUATION_DELAY: Duration = Duration::from_millis(500);

/// Hard cap on follow-up range requests in one download.
const MAX_RANGE_ATTEMPTS: u32 = 10;

/// Budget of failed follow-up attempts before the loop gives up.
const RETRY_BUDGET: u32 = 5;

/// Minimum interval between progress callback invocations.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Shared cancellation flag, checked before every chunk and sink write.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Knobs supplied by the caller (settings-backed).
#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    /// Configured parallel part count, [2, 8]
    pub parallel_parts: u8,

    /// Bodies below this size always download sequentially
    pub parallel_min_bytes: u64,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            parallel_parts: 4,
            parallel_min_bytes: PARALLEL_FLOOR_BYTES,
        }
    }
}

/// Progress sink: `(downloaded_bytes, expected_bytes)`.
pub type ProgressFn<'a> = &'a mut (dyn FnMut(u64, Option<u64>) + Send);

/// Body downloader over a shared HTTP client.
#[derive(Clone)]
pub struct Downloader {
    client: Client,
}

impl Downloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Download `url` into `dest`, returning the number of bytes written.
    ///
    /// When `expected_bytes` is known and large enough, parallel byte
    /// ranges are attempted first; any parallel failure falls back to the
    /// sequential path. Cancellation aborts promptly and removes every
    /// partial file this call created.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        expected_bytes: Option<u64>,
        options: DownloadOptions,
        cancel: &CancelFlag,
        progress: ProgressFn<'_>,
    ) -> Result<u64, DownloadError> {
        let result = self
            .download_inner(url, dest, expected_bytes, options, cancel, progress)
            .await;

        if result.is_err() {
            cleanup_partials(dest, options.parallel_parts).await;
        }
        result
    }

    async fn download_inner(
        &self,
        url: &str,
        dest: &Path,
        expected_bytes: Option<u64>,
        options: DownloadOptions,
        cancel: &CancelFlag,
        progress: ProgressFn<'_>,
    ) -> Result<u64, DownloadError> {
        if let Some(expected) = expected_bytes {
            let min = options.parallel_min_bytes.max(PARALLEL_FLOOR_BYTES);
            if expected >= min {
                match self
                    .download_parallel(url, dest, expected, options.parallel_parts, cancel, progress)
                    .await
                {
                    Ok(written) => return Ok(written),
                    Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                    Err(e) => {
                        warn!(url, error = %e, "parallel download failed, falling back");
                        cleanup_partials(dest, options.parallel_parts).await;
                    }
                }
            }
        }

        self.download_sequential(url, dest, expected_bytes, cancel, progress)
            .await
    }

    /// Single GET, resumed with `Range: bytes=<downloaded>-` requests when
    /// the server closes the stream before the full body arrived.
    async fn download_sequential(
        &self,
        url: &str,
        dest: &Path,
        expected_bytes: Option<u64>,
        cancel: &CancelFlag,
        progress: ProgressFn<'_>,
    ) -> Result<u64, DownloadError> {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut downloaded: u64 = 0;
        let mut expected = expected_bytes;
        let mut throttle = Throttle::new(PROGRESS_INTERVAL);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(DownloadError::from_reqwest)?;
        if response.status() != StatusCode::OK {
            return Err(DownloadError::HttpStatus(response.status().as_u16()));
        }
        if expected.is_none() {
            expected = response.content_length().filter(|len| *len > 0);
        }

        let mut interrupted =
            sink_body(response, &mut file, &mut downloaded, cancel, &mut throttle, expected, progress)
                .await?;

        // Follow-up range requests while bytes remain.
        let mut attempts = 0u32;
        let mut failures = 0u32;
        while let Some(total) = expected {
            if downloaded >= total {
                break;
            }
            if attempts >= MAX_RANGE_ATTEMPTS || failures >= RETRY_BUDGET {
                debug!(
                    url,
                    downloaded, total, attempts, failures, "continuation budget exhausted"
                );
                break;
            }
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            tokio::time::sleep(CONTINUATION_DELAY).await;
            attempts += 1;
            interrupted = false;

            let response = match self
                .client
                .get(url)
                .header(RANGE_HEADER, range_from(downloaded))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    failures += 1;
                    debug!(url, error = %e, "continuation request failed");
                    continue;
                }
            };
            if response.status() != StatusCode::PARTIAL_CONTENT {
                failures += 1;
                debug!(url, status = %response.status(), "continuation got non-206");
                continue;
            }

            let before = downloaded;
            interrupted = sink_body(
                response,
                &mut file,
                &mut downloaded,
                cancel,
                &mut throttle,
                expected,
                progress,
            )
            .await?;

            if downloaded == before && !interrupted {
                // Empty follow-up response: server has nothing more for us.
                debug!(url, downloaded, "empty continuation response, treating as EOF");
                break;
            }
        }

        if interrupted && expected.is_none() {
            // Interrupted with no known length: cannot resume, cannot trust
            // what we have.
            return Err(DownloadError::NetworkTransient(
                "stream interrupted with unknown content length".to_string(),
            ));
        }

        file.flush().await?;
        progress(downloaded, expected);
        Ok(downloaded)
    }

    /// Split `[0, expected)` into contiguous ranges and download them
    /// concurrently, merging in order on success.
    async fn download_parallel(
        &self,
        url: &str,
        dest: &Path,
        expected: u64,
        configured_parts: u8,
        cancel: &CancelFlag,
        progress: ProgressFn<'_>,
    ) -> Result<u64, DownloadError> {
        let parts = part_count(expected, configured_parts);
        let ranges = split_ranges(expected, parts);
        debug!(url, expected, parts, "parallel download");

        let counter = Arc::new(AtomicU64::new(0));
        let abort = CancelFlag::new();
        let mut set: JoinSet<Result<(), DownloadError>> = JoinSet::new();

        for (i, (start, end)) in ranges.iter().copied().enumerate() {
            let client = self.client.clone();
            let url = url.to_string();
            let path = segment_path(dest, i);
            let counter = Arc::clone(&counter);
            let cancel = cancel.clone();
            let abort = abort.clone();
            set.spawn(async move {
                fetch_part(client, &url, &path, start, end, &cancel, &abort, &counter).await
            });
        }

        let mut first_error: Option<DownloadError> = None;
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                            abort.cancel();
                        }
                    }
                    Some(Err(join_err)) => {
                        if first_error.is_none() {
                            first_error = Some(DownloadError::NetworkTransient(
                                join_err.to_string(),
                            ));
                            abort.cancel();
                        }
                    }
                },
                _ = ticker.tick() => {
                    progress(counter.load(Ordering::Relaxed), Some(expected));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        // Merge the parts in order.
        let mut out = tokio::fs::File::create(dest).await?;
        let mut total: u64 = 0;
        for i in 0..ranges.len() {
            let path = segment_path(dest, i);
            let mut part = tokio::fs::File::open(&path).await?;
            total += tokio::io::copy(&mut part, &mut out).await?;
            let _ = tokio::fs::remove_file(&path).await;
        }
        out.flush().await?;

        if total != expected {
            let missing = (expected.saturating_sub(total)) as f64 / expected as f64 * 100.0;
            return Err(DownloadError::Incomplete(missing));
        }

        progress(total, Some(expected));
        Ok(total)
    }
}

/// Stream a response body into the sink.
///
/// Returns `Ok(true)` when the stream ended with a transient error (the
/// caller may continue with a range request) and `Ok(false)` on clean EOF.
async fn sink_body(
    response: reqwest::Response,
    file: &mut tokio::fs::File,
    downloaded: &mut u64,
    cancel: &CancelFlag,
    throttle: &mut Throttle,
    expected: Option<u64>,
    progress: ProgressFn<'_>,
) -> Result<bool, DownloadError> {
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let err = DownloadError::from_reqwest(e);
                if err.is_transient() {
                    debug!(error = %err, "body stream interrupted");
                    return Ok(true);
                }
                return Err(err);
            }
        };
        file.write_all(&chunk).await?;
        *downloaded += chunk.len() as u64;

        if throttle.ready() {
            progress(*downloaded, expected);
        }
    }
    Ok(false)
}

#[allow(clippy::too_many_arguments)]
async fn fetch_part(
    client: Client,
    url: &str,
    path: &Path,
    start: u64,
    end_inclusive: u64,
    cancel: &CancelFlag,
    abort: &CancelFlag,
    counter: &AtomicU64,
) -> Result<(), DownloadError> {
    let response = client
        .get(url)
        .header(RANGE_HEADER, range_bounded(start, end_inclusive))
        .send()
        .await
        .map_err(DownloadError::from_reqwest)?;
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return Err(DownloadError::HttpStatus(response.status().as_u16()));
    }

    let expected_len = end_inclusive - start + 1;
    let mut file = tokio::fs::File::create(path).await?;
    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if abort.is_cancelled() {
            // A sibling part failed; no point finishing this one.
            return Err(DownloadError::Cancelled);
        }
        let chunk = chunk.map_err(DownloadError::from_reqwest)?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    file.flush().await?;

    if written != expected_len {
        let missing = (expected_len.saturating_sub(written)) as f64 / expected_len as f64 * 100.0;
        return Err(DownloadError::Incomplete(missing));
    }
    Ok(())
}

/// Part count: one part per 512 KiB, at least 2, capped by configuration.
fn part_count(expected: u64, configured: u8) -> usize {
    let by_size = (expected / BYTES_PER_PART).max(2);
    by_size.min(configured.max(2) as u64) as usize
}

/// Contiguous inclusive ranges covering `[0, expected)`, remainder
/// distributed to the first ranges.
fn split_ranges(expected: u64, parts: usize) -> Vec<(u64, u64)> {
    let base = expected / parts as u64;
    let remainder = expected % parts as u64;
    let mut ranges = Vec::with_capacity(parts);
    let mut offset = 0u64;
    for i in 0..parts {
        let len = base + if (i as u64) < remainder { 1 } else { 0 };
        ranges.push((offset, offset + len - 1));
        offset += len;
    }
    ranges
}

/// Segment file sibling for part `i`, named from the final body stem.
fn segment_path(dest: &Path, i: usize) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let base = name
        .strip_suffix(".precache.part")
        .or_else(|| name.strip_suffix(".part"))
        .unwrap_or(&name);
    dest.with_file_name(format!("{base}.seg{i}.part"))
}

async fn cleanup_partials(dest: &Path, parts: u8) {
    let _ = tokio::fs::remove_file(dest).await;
    for i in 0..parts.max(2) as usize {
        let _ = tokio::fs::remove_file(segment_path(dest, i)).await;
    }
}

/// Minimal-interval gate for progress reporting.
struct Throttle {
    min_interval: Duration,
    last: Option<std::time::Instant>,
}

impl Throttle {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    fn ready(&mut self) -> bool {
        let now = std::time::Instant::now();
        match self.last {
            Some(prev) if now.duration_since(prev) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
