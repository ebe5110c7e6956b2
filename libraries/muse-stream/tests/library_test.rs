//! Offline library pipeline: resolve → download → validate → persist

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Response, StatusCode};
use axum::routing::get;
use axum::Router;
use muse_core::connectivity::FixedConnectivity;
use muse_core::{AudioFormat, KvStore, LinkKind, MemoryKvStore, SettingsSnapshot, Track};
use muse_stream::error::ResolveError;
use muse_stream::library::{DownloadStatus, OfflineLibrary};
use muse_stream::resolver::{ResolvedStreams, StreamFormat, StreamResolver, TrackEndpointResolver};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::sync::watch;

const BODY_LEN: usize = 100 * 1024;

fn mp3_body() -> Vec<u8> {
    let mut body = b"ID3\x04\x00\x00".to_vec();
    body.resize(BODY_LEN, 0x55);
    body
}

fn garbage_body() -> Vec<u8> {
    vec![0x00; BODY_LEN]
}

async fn serve_body(State(data): State<Arc<Vec<u8>>>, headers: HeaderMap) -> Response<Body> {
    let total = data.len();
    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        let spec = range.trim_start_matches("bytes=");
        let mut parts = spec.splitn(2, '-');
        let start: usize = parts.next().unwrap_or("0").parse().unwrap_or(0);
        let end: usize = parts
            .next()
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
            .unwrap_or(total - 1)
            .min(total - 1);
        let slice = data[start..=end].to_vec();
        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))
            .body(Body::from(slice))
            .unwrap();
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, total)
        .body(Body::from(data.as_ref().clone()))
        .unwrap()
}

async fn spawn_server(data: Vec<u8>) -> String {
    let app = Router::new()
        .route("/stream", get(serve_body))
        .with_state(Arc::new(data));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/stream", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    url
}

struct FixedUrlBackend {
    url: String,
}

#[async_trait]
impl TrackEndpointResolver for FixedUrlBackend {
    async fn resolve(&self, _track_id: &str) -> Result<ResolvedStreams, ResolveError> {
        Ok(ResolvedStreams {
            formats: vec![StreamFormat {
                url: self.url.clone(),
                format: AudioFormat {
                    mime_type: "audio/mpeg".to_string(),
                    codecs: None,
                    bitrate: 256_000,
                    content_length: Some(BODY_LEN as u64),
                },
            }],
            expires_at: SystemTime::now() + Duration::from_secs(600),
        })
    }
}

fn track(id: &str) -> Track {
    Track {
        id: id.to_string(),
        title: format!("Song {id}"),
        artist: "Some Artist".to_string(),
        album: None,
        duration: Duration::from_secs(180),
        thumbnail_url: None,
        local_path: None,
    }
}

fn library(url: String, dir: &TempDir, store: Arc<MemoryKvStore>) -> Arc<OfflineLibrary> {
    let resolver = Arc::new(StreamResolver::new(Arc::new(FixedUrlBackend { url })));
    let (_tx, settings) = watch::channel(SettingsSnapshot::default());
    Arc::new(
        OfflineLibrary::new(
            dir.path(),
            resolver,
            store,
            Arc::new(FixedConnectivity(LinkKind::Wifi)),
            settings,
        )
        .unwrap(),
    )
}

async fn wait_for_status(
    lib: &OfflineLibrary,
    track_id: &str,
    wanted: DownloadStatus,
) -> muse_stream::library::DownloadTask {
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        if let Some(task) = lib.task(track_id) {
            if task.status == wanted {
                return task;
            }
            assert!(
                !matches!(
                    task.status,
                    DownloadStatus::Failed | DownloadStatus::Cancelled
                ) || matches!(wanted, DownloadStatus::Failed | DownloadStatus::Cancelled),
                "task ended in {:?}: {:?}",
                task.status,
                task.error
            );
        }
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {wanted:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn download_writes_named_file_and_persists_record() {
    let url = spawn_server(mp3_body()).await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryKvStore::new());
    let lib = library(url, &dir, Arc::clone(&store));

    let handle = lib.start(track("t1")).expect("task spawned");
    let task = wait_for_status(&lib, "t1", DownloadStatus::Completed).await;
    handle.await.unwrap();

    // File named "{artist} - {title}{ext}" under audio/.
    let expected = lib.root().join("Some Artist - Song t1.mp3");
    assert_eq!(task.local_path.as_deref(), Some(expected.as_path()));
    assert_eq!(std::fs::read(&expected).unwrap(), mp3_body());
    assert!((task.progress - 1.0).abs() < 1e-6);

    // The completed record survives in the store.
    let records = lib.completed_records();
    assert!(records.contains_key("t1"));
    assert_eq!(records["t1"].status, DownloadStatus::Completed);

    // No partial artifacts left in audio/.
    let partials: Vec<_> = std::fs::read_dir(lib.root())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
        .collect();
    assert!(partials.is_empty());
}

#[tokio::test]
async fn corrupt_body_fails_the_task_and_deletes_the_file() {
    let url = spawn_server(garbage_body()).await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryKvStore::new());
    let lib = library(url, &dir, Arc::clone(&store));

    let handle = lib.start(track("bad")).expect("task spawned");
    let task = wait_for_status(&lib, "bad", DownloadStatus::Failed).await;
    handle.await.unwrap();

    assert!(task.error.as_deref().unwrap_or("").contains("corrupt"));
    assert!(!lib.root().join("Some Artist - Song bad.mp3").exists());
    assert!(!lib.completed_records().contains_key("bad"));
}

#[tokio::test]
async fn duplicate_start_is_ignored_while_active() {
    let url = spawn_server(mp3_body()).await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryKvStore::new());
    let lib = library(url, &dir, store);

    let first = lib.start(track("t1"));
    assert!(first.is_some());
    // Second start for the same id while queued/downloading: no new task.
    let second = lib.start(track("t1"));
    assert!(second.is_none());

    wait_for_status(&lib, "t1", DownloadStatus::Completed).await;
    if let Some(h) = first {
        h.await.unwrap();
    }
}

#[tokio::test]
async fn kv_store_survives_multiple_completions() {
    let url = spawn_server(mp3_body()).await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryKvStore::new());
    let lib = library(url, &dir, Arc::clone(&store));

    for id in ["a", "b"] {
        let handle = lib.start(track(id)).unwrap();
        wait_for_status(&lib, id, DownloadStatus::Completed).await;
        handle.await.unwrap();
    }

    let records = lib.completed_records();
    assert_eq!(records.len(), 2);
    assert!(store.get("offline_downloads_completed").unwrap().is_some());
}
