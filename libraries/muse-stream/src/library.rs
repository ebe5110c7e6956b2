//! Offline library download pipeline
//!
//! Downloads full tracks into an app-private `audio/` directory named
//! `"{artist} - {title}{ext}"` with a sibling `.cover.jpg`. Transient
//! network failures retry with linear-capped backoff; corrupt bodies are
//! deleted and surfaced as failures; completed tasks are persisted through
//! the host key-value store so the library survives restarts.

use crate::downloader::{CancelFlag, DownloadOptions, Downloader};
use crate::error::DownloadError;
use crate::net;
use crate::resolver::StreamResolver;
use crate::validate::validate_downloaded_file;
use muse_core::{sanitize_filename, Connectivity, KvStore, SettingsSnapshot, Track};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum download attempts per task (first try + transient retries).
const MAX_ATTEMPTS: u32 = 8;

/// Cap on the retry backoff.
const BACKOFF_CAP_SECS: u64 = 30;

/// Minimum interval between outward task-progress events.
const EVENT_INTERVAL: Duration = Duration::from_millis(500);

/// Store key holding the map of completed download records.
const COMPLETED_KEY: &str = "offline_downloads_completed";

/// Lifecycle of one download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

/// Observable snapshot of one download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub track_id: String,
    pub status: DownloadStatus,
    /// Fraction in [0, 1]; 0 while the total is unknown
    pub progress: f32,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub error: Option<String>,
    pub local_path: Option<PathBuf>,
    /// Unix epoch milliseconds
    pub started_at_ms: u64,
}

impl DownloadTask {
    fn new(track_id: &str) -> Self {
        Self {
            track_id: track_id.to_string(),
            status: DownloadStatus::Queued,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            error: None,
            local_path: None,
            started_at_ms: epoch_ms(),
        }
    }
}

struct TaskEntry {
    task: DownloadTask,
    cancel: CancelFlag,
    last_emit: Instant,
}

/// Offline download manager.
pub struct OfflineLibrary {
    root: PathBuf,
    resolver: Arc<StreamResolver>,
    downloader: Downloader,
    cover_client: reqwest::Client,
    store: Arc<dyn KvStore>,
    connectivity: Arc<dyn Connectivity>,
    settings: watch::Receiver<SettingsSnapshot>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    events: broadcast::Sender<DownloadTask>,
}

impl OfflineLibrary {
    pub fn new(
        root: &Path,
        resolver: Arc<StreamResolver>,
        store: Arc<dyn KvStore>,
        connectivity: Arc<dyn Connectivity>,
        settings: watch::Receiver<SettingsSnapshot>,
    ) -> Result<Self, std::io::Error> {
        let root = root.join("audio");
        std::fs::create_dir_all(&root)?;
        // Range requests must be byte-exact, so both bodies and covers go
        // through the identity-encoding download client.
        let client = net::download_client().map_err(std::io::Error::other)?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            root,
            resolver,
            downloader: Downloader::new(client.clone()),
            cover_client: client,
            store,
            connectivity,
            settings,
            tasks: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Directory holding downloaded audio files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Subscribe to task snapshots (throttled to ≥ 500 ms per task).
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadTask> {
        self.events.subscribe()
    }

    /// Start downloading a track. A task already queued or running for the
    /// same id is left alone.
    pub fn start(self: &Arc<Self>, track: Track) -> Option<JoinHandle<()>> {
        {
            let mut tasks = lock(&self.tasks);
            if let Some(entry) = tasks.get(&track.id) {
                if matches!(
                    entry.task.status,
                    DownloadStatus::Queued | DownloadStatus::Downloading
                ) {
                    debug!(track_id = %track.id, "download already active");
                    return None;
                }
            }
            tasks.insert(
                track.id.clone(),
                TaskEntry {
                    task: DownloadTask::new(&track.id),
                    cancel: CancelFlag::new(),
                    last_emit: Instant::now()
                        .checked_sub(EVENT_INTERVAL)
                        .unwrap_or_else(Instant::now),
                },
            );
        }

        let lib = Arc::clone(self);
        Some(tokio::spawn(async move {
            lib.run_download(track).await;
        }))
    }

    /// Cancel a running download and clean up its partial files.
    pub fn cancel(&self, track_id: &str) {
        let cancel = {
            let tasks = lock(&self.tasks);
            tasks.get(track_id).map(|e| e.cancel.clone())
        };
        if let Some(cancel) = cancel {
            info!(track_id, "cancelling download");
            cancel.cancel();
        }
    }

    /// Snapshot of every known task.
    pub fn tasks(&self) -> Vec<DownloadTask> {
        lock(&self.tasks).values().map(|e| e.task.clone()).collect()
    }

    /// Snapshot of one task.
    pub fn task(&self, track_id: &str) -> Option<DownloadTask> {
        lock(&self.tasks).get(track_id).map(|e| e.task.clone())
    }

    /// Completed download records from the persistent store.
    pub fn completed_records(&self) -> HashMap<String, DownloadTask> {
        self.store
            .get(COMPLETED_KEY)
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    async fn run_download(self: &Arc<Self>, track: Track) {
        let cancel = match lock(&self.tasks).get(&track.id) {
            Some(e) => e.cancel.clone(),
            None => return,
        };
        self.update_task(&track.id, |t| t.status = DownloadStatus::Downloading);

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                self.finish_cancelled(&track).await;
                return;
            }

            match self.attempt_download(&track, &cancel, attempt > 0).await {
                Ok(path) => {
                    self.fetch_cover(&track, &path).await;
                    self.finish_completed(&track, path);
                    return;
                }
                Err(DownloadError::Cancelled) => {
                    self.finish_cancelled(&track).await;
                    return;
                }
                Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    let delay = backoff_secs(attempt);
                    warn!(
                        track_id = %track.id,
                        attempt,
                        delay_secs = delay,
                        error = %err,
                        "transient download failure, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(err) => {
                    self.finish_failed(&track, err).await;
                    return;
                }
            }
        }
    }

    async fn attempt_download(
        self: &Arc<Self>,
        track: &Track,
        cancel: &CancelFlag,
        refresh_url: bool,
    ) -> Result<PathBuf, DownloadError> {
        let settings = *self.settings.borrow();
        let metered = !self.connectivity.link_kind().is_unmetered();

        if refresh_url {
            self.resolver.clear(&track.id);
        }
        let data = self
            .resolver
            .resolve(&track.id, settings.download_quality, metered)
            .await
            .map_err(|e| DownloadError::NetworkTransient(e.to_string()))?;

        let dest = self.dest_path(track, data.format.extension());
        let temp = temp_path(&dest);
        let expected = data.format.content_length;
        self.update_task(&track.id, |t| t.total_bytes = expected);

        let options = DownloadOptions {
            parallel_parts: settings.download_part_count,
            parallel_min_bytes: settings.parallel_min_bytes(),
        };

        let lib = Arc::clone(self);
        let track_id = track.id.clone();
        let mut progress = move |done: u64, total: Option<u64>| {
            lib.report_progress(&track_id, done, total);
        };

        let written = self
            .downloader
            .download(&data.stream_url, &temp, expected, options, cancel, &mut progress)
            .await?;

        tokio::fs::rename(&temp, &dest).await?;

        if let Err(err) = validate_downloaded_file(&dest, expected).await {
            if matches!(err, DownloadError::Corrupt(_)) {
                warn!(track_id = %track.id, file = %dest.display(), "corrupt body, deleting");
                let _ = tokio::fs::remove_file(&dest).await;
            }
            return Err(err);
        }

        info!(
            track_id = %track.id,
            file = %dest.display(),
            bytes = written,
            "download complete"
        );
        Ok(dest)
    }

    /// Best-effort cover art fetch; failures only log.
    async fn fetch_cover(&self, track: &Track, audio_path: &Path) {
        let Some(url) = &track.thumbnail_url else {
            return;
        };
        let cover = audio_path.with_extension("cover.jpg");
        let result = async {
            let response = self.cover_client.get(url).send().await?;
            if !response.status().is_success() {
                return Ok::<_, reqwest::Error>(None);
            }
            let bytes = response.bytes().await?;
            Ok(Some(bytes))
        }
        .await;

        match result {
            Ok(Some(bytes)) => {
                if let Err(e) = tokio::fs::write(&cover, &bytes).await {
                    warn!(track_id = %track.id, error = %e, "cover write failed");
                }
            }
            Ok(None) => debug!(track_id = %track.id, "cover fetch returned non-success"),
            Err(e) => warn!(track_id = %track.id, error = %e, "cover fetch failed"),
        }
    }

    fn dest_path(&self, track: &Track, ext: &str) -> PathBuf {
        let name = format!(
            "{} - {}{}",
            sanitize_filename(&track.artist),
            sanitize_filename(&track.title),
            ext
        );
        self.root.join(name)
    }

    fn report_progress(&self, track_id: &str, done: u64, total: Option<u64>) {
        let mut tasks = lock(&self.tasks);
        let Some(entry) = tasks.get_mut(track_id) else {
            return;
        };
        entry.task.downloaded_bytes = done;
        if let Some(total) = total.or(entry.task.total_bytes) {
            if total > 0 {
                entry.task.progress = (done as f32 / total as f32).clamp(0.0, 1.0);
            }
        }
        if entry.last_emit.elapsed() >= EVENT_INTERVAL {
            entry.last_emit = Instant::now();
            let _ = self.events.send(entry.task.clone());
        }
    }

    fn finish_completed(&self, track: &Track, path: PathBuf) {
        self.update_task(&track.id, |t| {
            t.status = DownloadStatus::Completed;
            t.progress = 1.0;
            t.local_path = Some(path.clone());
            t.error = None;
        });
        self.persist_completed(&track.id);
    }

    async fn finish_failed(&self, track: &Track, err: DownloadError) {
        self.cleanup_artifacts(track).await;
        self.update_task(&track.id, |t| {
            t.status = DownloadStatus::Failed;
            t.error = Some(err.to_string());
        });
    }

    async fn finish_cancelled(&self, track: &Track) {
        self.cleanup_artifacts(track).await;
        self.update_task(&track.id, |t| t.status = DownloadStatus::Cancelled);
    }

    /// Remove every partial artifact a task may have left behind.
    async fn cleanup_artifacts(&self, track: &Track) {
        for ext in [".m4a", ".opus", ".webm", ".mp3", ".audio"] {
            let dest = self.dest_path(track, ext);
            let _ = tokio::fs::remove_file(temp_path(&dest)).await;
            let _ = tokio::fs::remove_file(dest.with_extension("cover.jpg")).await;
            let _ = tokio::fs::remove_file(&dest).await;
            for i in 0..8 {
                let seg = dest.with_file_name(format!(
                    "{}.seg{}.part",
                    dest.file_name().unwrap_or_default().to_string_lossy(),
                    i
                ));
                let _ = tokio::fs::remove_file(seg).await;
            }
        }
    }

    fn update_task(&self, track_id: &str, f: impl FnOnce(&mut DownloadTask)) {
        let mut tasks = lock(&self.tasks);
        if let Some(entry) = tasks.get_mut(track_id) {
            f(&mut entry.task);
            entry.last_emit = Instant::now();
            let _ = self.events.send(entry.task.clone());
        }
    }

    fn persist_completed(&self, track_id: &str) {
        let snapshot = match self.task(track_id) {
            Some(t) => t,
            None => return,
        };
        let mut records = self.completed_records();
        records.insert(track_id.to_string(), snapshot);
        match serde_json::to_value(&records) {
            Ok(value) => {
                if let Err(e) = self.store.put(COMPLETED_KEY, value) {
                    warn!(track_id, error = %e, "persisting download record failed");
                }
            }
            Err(e) => warn!(track_id, error = %e, "encoding download record failed"),
        }
    }
}

/// Backoff before retry `n` (1-based): `min(30, 2 + 3n)` seconds.
fn backoff_secs(n: u32) -> u64 {
    (2 + 3 * n as u64).min(BACKOFF_CAP_SECS)
}

fn temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dest.with_file_name(format!("{name}.part"))
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn lock(m: &Mutex<HashMap<String, TaskEntry>>) -> std::sync::MutexGuard<'_, HashMap<String, TaskEntry>> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
