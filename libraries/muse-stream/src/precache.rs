//! Background precache scheduler
//!
//! Fetches upcoming queue tracks into the byte cache before they are
//! needed. A semaphore caps concurrent downloads at the configured worker
//! count (waiters are served in FIFO order); an in-flight set keeps the
//! same track from being fetched twice; the Wi-Fi-only policy gates the
//! whole scheduler.

use crate::cache::{ByteCache, CacheKey};
use crate::downloader::{CancelFlag, DownloadOptions, Downloader};
use crate::error::DownloadError;
use crate::resolver::StreamResolver;
use muse_core::{Connectivity, SettingsSnapshot, Track};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Most upcoming tracks considered per scheduling pass.
const LOOKAHEAD_CAP: usize = 3;

/// Growth log gate: at least this much new data…
const GROWTH_LOG_BYTES: u64 = 512 * 1024;

/// …and at least this much time between growth log lines.
const GROWTH_LOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Scheduler for background cache fills.
pub struct PrecacheScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    cache: Arc<ByteCache>,
    resolver: Arc<StreamResolver>,
    downloader: Downloader,
    connectivity: Arc<dyn Connectivity>,
    settings: watch::Receiver<SettingsSnapshot>,
    workers: Mutex<WorkerPool>,
    in_flight: Mutex<HashSet<String>>,
    cancel: CancelFlag,
}

struct WorkerPool {
    size: u8,
    semaphore: Arc<Semaphore>,
}

impl PrecacheScheduler {
    pub fn new(
        cache: Arc<ByteCache>,
        resolver: Arc<StreamResolver>,
        downloader: Downloader,
        connectivity: Arc<dyn Connectivity>,
        settings: watch::Receiver<SettingsSnapshot>,
    ) -> Self {
        let size = settings.borrow().cache_max_concurrent;
        Self {
            inner: Arc::new(Inner {
                cache,
                resolver,
                downloader,
                connectivity,
                settings,
                workers: Mutex::new(WorkerPool {
                    size,
                    semaphore: Arc::new(Semaphore::new(size as usize)),
                }),
                in_flight: Mutex::new(HashSet::new()),
                cancel: CancelFlag::new(),
            }),
        }
    }

    /// Schedule fetches for the tracks after the current index.
    ///
    /// Call whenever the queue changes, the current index advances, or
    /// settings change. Only the next `min(3, max_concurrent)` candidates
    /// are considered; tracks already in flight or already on disk are
    /// skipped inside their worker.
    pub fn schedule_ahead(&self, upcoming: &[Track]) {
        let settings = *self.inner.settings.borrow();

        let link = self.inner.connectivity.link_kind();
        if settings.cache_wifi_only && !link.is_unmetered() {
            debug!(?link, "precache skipped: Wi-Fi-only policy");
            return;
        }

        let lookahead = LOOKAHEAD_CAP.min(settings.cache_max_concurrent as usize);
        let mut accepted: Vec<Track> = Vec::new();
        for track in upcoming.iter().take(lookahead) {
            let mut in_flight = lock(&self.inner.in_flight);
            if in_flight.insert(track.id.clone()) {
                accepted.push(track.clone());
            }
        }
        if accepted.is_empty() {
            return;
        }

        // The local-file checks run as one batch off this thread; tracks
        // already in the offline library never need cache space.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let paths: Vec<_> = accepted
                .iter()
                .map(|t| t.local_path.clone().unwrap_or_default())
                .collect();
            let on_disk = crate::fs::stat_many(paths).await;

            for (track, has_local) in accepted.into_iter().zip(on_disk) {
                if has_local {
                    lock(&inner.in_flight).remove(&track.id);
                    continue;
                }
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    let result = precache_one(&inner, &track, settings).await;
                    lock(&inner.in_flight).remove(&track.id);
                    if let Err(err) = result {
                        if !matches!(err, DownloadError::Cancelled) {
                            warn!(track_id = %track.id, error = %err, "precache failed");
                        }
                    }
                });
            }
        });
    }

    /// Whether a fetch for this track is currently running or queued.
    pub fn is_in_flight(&self, track_id: &str) -> bool {
        lock(&self.inner.in_flight).contains(track_id)
    }

    /// Abort outstanding fetches (engine shutdown).
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

async fn precache_one(
    inner: &Arc<Inner>,
    track: &Track,
    settings: SettingsSnapshot,
) -> Result<(), DownloadError> {
    let semaphore = worker_semaphore(inner, settings.cache_max_concurrent);
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| DownloadError::Cancelled)?;
    if inner.cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    let metered = !inner.connectivity.link_kind().is_unmetered();
    let quality = settings.streaming_quality;

    let data = match inner.resolver.resolve(&track.id, quality, metered).await {
        Ok(d) => d,
        Err(e) => return Err(DownloadError::NetworkTransient(e.to_string())),
    };

    let key = CacheKey::new(&track.id, quality, data.format.bitrate);
    if inner
        .cache
        .open_for_read(&key, data.format.content_length)
        .await
        .map_err(io_of_cache)?
        .is_some()
    {
        return Ok(());
    }

    let Some(slot) = inner.cache.try_reserve_write(&key) else {
        debug!(track_id = %track.id, "precache skipped: writer already active");
        return Ok(());
    };

    let options = DownloadOptions {
        parallel_parts: settings.download_part_count,
        parallel_min_bytes: settings.parallel_min_bytes(),
    };

    let mut growth = GrowthLogger::new(track.id.clone());
    let mut progress = move |done: u64, total: Option<u64>| growth.observe(done, total);

    let temp = slot.temp_path().to_path_buf();
    let result = inner
        .downloader
        .download(
            &data.stream_url,
            &temp,
            data.format.content_length,
            options,
            &inner.cancel,
            &mut progress,
        )
        .await;

    let written = match result {
        Ok(n) => n,
        Err(err) if err.is_transient() => {
            // Stale URL (commonly a dead DNS name): drop it, resolve fresh,
            // and retry once before giving up.
            debug!(track_id = %track.id, error = %err, "precache retry with fresh URL");
            inner.resolver.clear(&track.id);
            let data = inner
                .resolver
                .resolve(&track.id, quality, metered)
                .await
                .map_err(|e| DownloadError::NetworkTransient(e.to_string()))?;
            inner
                .downloader
                .download(
                    &data.stream_url,
                    &temp,
                    data.format.content_length,
                    options,
                    &inner.cancel,
                    &mut progress,
                )
                .await?
        }
        Err(err) => return Err(err),
    };

    let committed = inner
        .cache
        .commit(slot, written, data.format.content_length, &data.format.mime_type)
        .await;
    match committed {
        Ok(path) => {
            info!(track_id = %track.id, file = %path.display(), bytes = written, "precached");
        }
        Err(e) => {
            warn!(track_id = %track.id, error = %e, "precache commit rejected");
            return Ok(());
        }
    }

    let limit = inner.settings.borrow().cache_limit_bytes();
    if let Err(e) = inner.cache.enforce_limit(limit).await {
        warn!(error = %e, "post-commit cache sweep failed");
    }
    Ok(())
}

/// Current worker semaphore, rebuilt when the configured size changes.
/// Workers holding permits of a replaced semaphore simply finish on it.
fn worker_semaphore(inner: &Inner, size: u8) -> Arc<Semaphore> {
    let mut pool = match inner.workers.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    if pool.size != size {
        pool.size = size;
        pool.semaphore = Arc::new(Semaphore::new(size as usize));
    }
    Arc::clone(&pool.semaphore)
}

fn lock(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    match set.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn io_of_cache(e: crate::error::CacheError) -> DownloadError {
    DownloadError::NetworkTransient(e.to_string())
}

/// Logs live cache growth, gated to ≥ 2 s and ≥ 512 KiB between lines.
struct GrowthLogger {
    track_id: String,
    last_at: Instant,
    last_bytes: u64,
}

impl GrowthLogger {
    fn new(track_id: String) -> Self {
        Self {
            track_id,
            last_at: Instant::now(),
            last_bytes: 0,
        }
    }

    fn observe(&mut self, done: u64, total: Option<u64>) {
        if done.saturating_sub(self.last_bytes) < GROWTH_LOG_BYTES {
            return;
        }
        if self.last_at.elapsed() < GROWTH_LOG_INTERVAL {
            return;
        }
        self.last_at = Instant::now();
        self.last_bytes = done;
        debug!(track_id = %self.track_id, done, ?total, "cache body growing");
    }
}
