//! Downloader integration tests against a loopback HTTP server
//!
//! Covers the sequential path with range continuation (server announces a
//! full content length, then closes early), the parallel byte-range path,
//! and cancellation cleanup.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Response, StatusCode};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use muse_stream::downloader::{CancelFlag, DownloadOptions, Downloader};
use muse_stream::error::DownloadError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

// ===== Test Server =====

#[derive(Clone)]
struct ServerState {
    data: Arc<Vec<u8>>,
    /// Truncate the first plain GET after this many bytes (still announcing
    /// the full content length), simulating an early connection close.
    truncate_first_get_at: Option<usize>,
    first_get_served: Arc<AtomicBool>,
    full_gets: Arc<AtomicUsize>,
    range_gets: Arc<AtomicUsize>,
}

impl ServerState {
    fn new(data: Vec<u8>, truncate_first_get_at: Option<usize>) -> Self {
        Self {
            data: Arc::new(data),
            truncate_first_get_at,
            first_get_served: Arc::new(AtomicBool::new(false)),
            full_gets: Arc::new(AtomicUsize::new(0)),
            range_gets: Arc::new(AtomicUsize::new(0)),
        }
    }
}

async fn serve_body(State(state): State<ServerState>, headers: HeaderMap) -> Response<Body> {
    let total = state.data.len();

    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        state.range_gets.fetch_add(1, Ordering::SeqCst);
        let (start, end) = parse_range(range, total);
        let slice = state.data[start..=end].to_vec();
        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{total}"),
            )
            .header(header::CONTENT_LENGTH, slice.len())
            .body(Body::from(slice))
            .unwrap();
    }

    state.full_gets.fetch_add(1, Ordering::SeqCst);
    let truncate = if !state.first_get_served.swap(true, Ordering::SeqCst) {
        state.truncate_first_get_at
    } else {
        None
    };

    match truncate {
        Some(n) => {
            // Announce the full length but end the body stream early; the
            // client observes a closed connection mid-body.
            let partial = Bytes::from(state.data[..n].to_vec());
            let stream = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(partial)]);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, total)
                .body(Body::from_stream(stream))
                .unwrap()
        }
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total)
            .body(Body::from(state.data.as_ref().clone()))
            .unwrap(),
    }
}

fn parse_range(value: &str, total: usize) -> (usize, usize) {
    let spec = value.trim_start_matches("bytes=");
    let mut parts = spec.splitn(2, '-');
    let start: usize = parts.next().unwrap_or("0").parse().unwrap_or(0);
    let end: usize = parts
        .next()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
        .unwrap_or(total - 1);
    (start, end.min(total - 1))
}

async fn spawn_server(state: ServerState) -> String {
    let app = Router::new()
        .route("/body", get(serve_body))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/body")
}

fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn sequential_only() -> DownloadOptions {
    DownloadOptions {
        parallel_parts: 4,
        parallel_min_bytes: u64::MAX,
    }
}

// ===== Sequential + Range Continuation =====

#[tokio::test]
async fn plain_download_round_trips() {
    let data = test_body(200_000);
    let url = spawn_server(ServerState::new(data.clone(), None)).await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("body.audio");

    let downloader = Downloader::new(reqwest::Client::new());
    let written = downloader
        .download(
            &url,
            &dest,
            Some(data.len() as u64),
            sequential_only(),
            &CancelFlag::new(),
            &mut |_, _| {},
        )
        .await
        .unwrap();

    assert_eq!(written, data.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn early_close_resumes_with_range_request() {
    // Server announces 1_200_000 bytes, closes after 700_000. The
    // downloader must resume with `Range: bytes=700000-` and produce the
    // exact body.
    let data = test_body(1_200_000);
    let state = ServerState::new(data.clone(), Some(700_000));
    let range_gets = Arc::clone(&state.range_gets);
    let url = spawn_server(state).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("body.audio");
    let downloader = Downloader::new(reqwest::Client::new());
    let written = downloader
        .download(
            &url,
            &dest,
            Some(data.len() as u64),
            sequential_only(),
            &CancelFlag::new(),
            &mut |_, _| {},
        )
        .await
        .unwrap();

    assert_eq!(written, data.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert!(range_gets.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn content_length_discovered_from_response() {
    // Caller does not know the length; the response header supplies it and
    // continuation still engages after the early close.
    let data = test_body(600_000);
    let url = spawn_server(ServerState::new(data.clone(), Some(250_000))).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("body.audio");
    let downloader = Downloader::new(reqwest::Client::new());
    let written = downloader
        .download(
            &url,
            &dest,
            None,
            sequential_only(),
            &CancelFlag::new(),
            &mut |_, _| {},
        )
        .await
        .unwrap();

    assert_eq!(written, data.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

// ===== Parallel Ranges =====

#[tokio::test]
async fn parallel_download_merges_in_order() {
    let data = test_body(2 * 1024 * 1024);
    let state = ServerState::new(data.clone(), None);
    let range_gets = Arc::clone(&state.range_gets);
    let full_gets = Arc::clone(&state.full_gets);
    let url = spawn_server(state).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("body.audio");
    let downloader = Downloader::new(reqwest::Client::new());
    let options = DownloadOptions {
        parallel_parts: 4,
        parallel_min_bytes: 1024 * 1024,
    };

    let written = downloader
        .download(
            &url,
            &dest,
            Some(data.len() as u64),
            options,
            &CancelFlag::new(),
            &mut |_, _| {},
        )
        .await
        .unwrap();

    assert_eq!(written, data.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    assert_eq!(range_gets.load(Ordering::SeqCst), 4);
    assert_eq!(full_gets.load(Ordering::SeqCst), 0);

    // No segment files survive the merge.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".seg"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn progress_reports_reach_expected_total() {
    let data = test_body(2 * 1024 * 1024);
    let url = spawn_server(ServerState::new(data.clone(), None)).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("body.audio");
    let downloader = Downloader::new(reqwest::Client::new());

    let mut last = (0u64, None::<u64>);
    downloader
        .download(
            &url,
            &dest,
            Some(data.len() as u64),
            DownloadOptions::default(),
            &CancelFlag::new(),
            &mut |done, total| last = (done, total),
        )
        .await
        .unwrap();

    assert_eq!(last.0, data.len() as u64);
    assert_eq!(last.1, Some(data.len() as u64));
}

// ===== Cancellation =====

#[tokio::test]
async fn pre_cancelled_download_cleans_up() {
    let data = test_body(300_000);
    let url = spawn_server(ServerState::new(data, None)).await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("body.audio");
    let downloader = Downloader::new(reqwest::Client::new());
    let cancel = CancelFlag::new();
    cancel.cancel();

    let err = downloader
        .download(
            &url,
            &dest,
            Some(300_000),
            sequential_only(),
            &cancel,
            &mut |_, _| {},
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::Cancelled));
    assert!(!dest.exists());
}
