//! On-disk byte cache
//!
//! LRU-bounded cache of fully downloaded audio bodies under
//! `<root>/stream_audio_cache/`. Bodies are keyed by
//! `(track_id, quality, bitrate)` so quality switches miss instead of
//! serving stale bytes. File mtime is the LRU key; readers touch it.
//!
//! Writers go through a reserve/commit protocol: `try_reserve_write` hands
//! out a `.precache.part` path and registers the key as in progress, and
//! `commit` atomically renames the temp file after validating it. Readers
//! only ever see either a committed, valid body or a miss.

use crate::error::CacheError;
use muse_core::{sanitize_filename, AudioQuality, SettingsSnapshot};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bodies below this size are never considered valid.
pub const MIN_VALID_BYTES: u64 = 50 * 1024;

/// Directory name under the cache root.
const CACHE_DIR: &str = "stream_audio_cache";

/// Interval of the background limit-enforcement sweep.
const JANITOR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(180);

/// Cache key for one downloaded body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub track_id: String,
    pub quality: AudioQuality,
    pub bitrate: u32,
}

impl CacheKey {
    pub fn new(track_id: &str, quality: AudioQuality, bitrate: u32) -> Self {
        Self {
            track_id: track_id.to_string(),
            quality,
            bitrate,
        }
    }

    /// Committed body file name: `<id>_<quality>_<bitrate>.audio`.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.audio",
            sanitize_filename(&self.track_id),
            self.quality.name(),
            self.bitrate
        )
    }
}

/// A reserved write for one key.
///
/// Dropping an uncommitted slot releases the key and removes the temp file,
/// so cancelled downloads leave no partial artifacts behind.
pub struct WriteSlot {
    file_name: String,
    temp_path: PathBuf,
    final_path: PathBuf,
    in_flight: Arc<Mutex<HashSet<String>>>,
    committed: bool,
}

impl WriteSlot {
    /// Path the downloader should sink bytes into (`*.audio.precache.part`).
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

impl Drop for WriteSlot {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.file_name);
        }
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// The on-disk LRU byte cache.
pub struct ByteCache {
    dir: PathBuf,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ByteCache {
    /// Open (and create if needed) the cache under `root/stream_audio_cache`.
    pub fn open(root: &Path) -> Result<ByteCache, CacheError> {
        let dir = root.join(CACHE_DIR);
        std::fs::create_dir_all(&dir)?;
        Ok(ByteCache {
            dir,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Directory holding the cache files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Look up a committed body.
    ///
    /// Returns the body path when it is valid (≥ 50 KiB, and exactly
    /// `expected_len` when that is known), touching its mtime so the LRU
    /// sweep sees the use. Invalid bodies are deleted and reported as a miss.
    pub async fn open_for_read(
        &self,
        key: &CacheKey,
        expected_len: Option<u64>,
    ) -> Result<Option<PathBuf>, CacheError> {
        let path = self.dir.join(key.file_name());
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let size = meta.len();
        if size < MIN_VALID_BYTES {
            warn!(file = %path.display(), size, "undersized cache body, deleting");
            self.delete(key).await?;
            return Ok(None);
        }
        if let Some(expected) = expected_len {
            if size != expected {
                warn!(
                    file = %path.display(),
                    size,
                    expected,
                    "cache body length mismatch, deleting"
                );
                self.delete(key).await?;
                return Ok(None);
            }
        }

        touch(&path);
        Ok(Some(path))
    }

    /// Reserve the key for writing.
    ///
    /// Returns `None` when another writer already holds the key, so
    /// concurrent precache attempts back off instead of racing.
    pub fn try_reserve_write(&self, key: &CacheKey) -> Option<WriteSlot> {
        let file_name = key.file_name();
        {
            let mut set = lock_set(&self.in_flight);
            if !set.insert(file_name.clone()) {
                return None;
            }
        }
        let final_path = self.dir.join(&file_name);
        let temp_path = self.dir.join(format!("{file_name}.precache.part"));
        Some(WriteSlot {
            file_name,
            temp_path,
            final_path,
            in_flight: Arc::clone(&self.in_flight),
            committed: false,
        })
    }

    /// Validate and atomically publish a finished write.
    ///
    /// Rejects bodies under 50 KiB and, when `expected_len` is known, any
    /// size mismatch; rejected temp files are deleted.
    pub async fn commit(
        &self,
        mut slot: WriteSlot,
        downloaded_bytes: u64,
        expected_len: Option<u64>,
        mime_type: &str,
    ) -> Result<PathBuf, CacheError> {
        let on_disk = tokio::fs::metadata(&slot.temp_path).await?.len();
        let size = on_disk.max(downloaded_bytes);

        if on_disk < MIN_VALID_BYTES {
            let _ = tokio::fs::remove_file(&slot.temp_path).await;
            return Err(CacheError::TooSmall { size });
        }
        if let Some(expected) = expected_len {
            if on_disk != expected {
                let _ = tokio::fs::remove_file(&slot.temp_path).await;
                return Err(CacheError::LengthMismatch {
                    expected,
                    actual: on_disk,
                });
            }
        }

        tokio::fs::rename(&slot.temp_path, &slot.final_path).await?;
        let mime_path = self.dir.join(format!("{}.mime", slot.file_name));
        if let Err(e) = tokio::fs::write(&mime_path, mime_type).await {
            warn!(error = %e, "failed to write mime sidecar");
        }
        slot.committed = true;

        info!(
            file = %slot.final_path.display(),
            bytes = on_disk,
            "cache body committed"
        );
        Ok(slot.final_path.clone())
    }

    /// Discard a reserved write and its temp artifacts.
    pub async fn abort(&self, slot: WriteSlot) {
        let _ = tokio::fs::remove_file(slot.temp_path()).await;
        // Drop releases the key and re-checks the temp file.
    }

    /// Remove a body and every sidecar artifact for the key.
    pub async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let stem = key.file_name();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == stem || name.starts_with(&format!("{stem}.")) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }

    /// Remove every committed body and sidecar not currently being
    /// written. Quality changes call this: keys embed quality and bitrate,
    /// so the old bodies can never be served again anyway.
    pub async fn clear_all(&self) -> Result<(), CacheError> {
        let in_flight = lock_set(&self.in_flight).clone();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let stem = name.split(".audio").next().unwrap_or(&name);
            let body_name = format!("{stem}.audio");
            if in_flight.contains(&body_name) {
                continue;
            }
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
        info!("byte cache cleared");
        Ok(())
    }

    /// Total size of committed bodies.
    pub async fn usage_bytes(&self) -> Result<u64, CacheError> {
        Ok(self
            .scan_bodies()
            .await?
            .into_iter()
            .map(|b| b.size)
            .sum())
    }

    /// Delete least-recently-used bodies until usage fits `limit_bytes`.
    ///
    /// Bodies whose key is currently reserved by a writer are never
    /// deleted, so the sweep is safe to run concurrently with downloads.
    /// Returns the number of bodies removed.
    pub async fn enforce_limit(&self, limit_bytes: u64) -> Result<usize, CacheError> {
        let mut bodies = self.scan_bodies().await?;
        let mut total: u64 = bodies.iter().map(|b| b.size).sum();
        if total <= limit_bytes {
            return Ok(0);
        }

        bodies.sort_by_key(|b| b.mtime);
        let in_flight = lock_set(&self.in_flight).clone();

        let mut removed = 0;
        for body in bodies {
            if total <= limit_bytes {
                break;
            }
            if in_flight.contains(&body.name) {
                continue;
            }
            match tokio::fs::remove_file(&body.path).await {
                Ok(()) => {
                    let _ = tokio::fs::remove_file(self.dir.join(format!("{}.mime", body.name)))
                        .await;
                    total = total.saturating_sub(body.size);
                    removed += 1;
                    debug!(file = %body.path.display(), size = body.size, "evicted");
                }
                Err(e) => warn!(file = %body.path.display(), error = %e, "evict failed"),
            }
        }

        if removed > 0 {
            info!(removed, usage = total, limit = limit_bytes, "cache limit enforced");
        }
        Ok(removed)
    }

    async fn scan_bodies(&self) -> Result<Vec<BodyEntry>, CacheError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".audio") {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            out.push(BodyEntry {
                path: entry.path(),
                name,
                size: meta.len(),
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(out)
    }
}

struct BodyEntry {
    path: PathBuf,
    name: String,
    size: u64,
    mtime: SystemTime,
}

/// Periodic limit enforcement, every three minutes, tracking the live
/// settings value.
pub fn spawn_janitor(
    cache: Arc<ByteCache>,
    settings: watch::Receiver<SettingsSnapshot>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let limit = settings.borrow().cache_limit_bytes();
            if let Err(e) = cache.enforce_limit(limit).await {
                warn!(error = %e, "cache sweep failed");
            }
        }
    })
}

fn touch(path: &Path) {
    let result = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        debug!(file = %path.display(), error = %e, "mtime touch failed");
    }
}

fn lock_set(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    match set.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
