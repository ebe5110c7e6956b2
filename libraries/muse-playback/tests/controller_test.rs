//! Controller integration tests
//!
//! Drive the full controller with simulated players and local-file tracks:
//! install → play → auto-advance, restart restore, previous-button
//! semantics, and Jams mode.

use async_trait::async_trait;
use muse_core::{KvStore, MemoryKvStore, Track};
use muse_playback::persist::PersistedQueue;
use muse_playback::{
    ControllerConfig, PlaybackController, PlaybackState, RelatedTracksProvider, SimPlayer,
};
use muse_core::connectivity::FixedConnectivity;
use muse_core::LinkKind;
use muse_stream::error::ResolveError;
use muse_stream::resolver::{ResolvedStreams, TrackEndpointResolver};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tokio::sync::watch;

// ===== Test Helpers =====

struct NoStreams;

#[async_trait]
impl TrackEndpointResolver for NoStreams {
    async fn resolve(&self, track_id: &str) -> Result<ResolvedStreams, ResolveError> {
        Err(ResolveError::Unresolvable(track_id.to_string()))
    }
}

struct NoRelated;

#[async_trait]
impl RelatedTracksProvider for NoRelated {
    async fn related(&self, _seed: &str, _limit: usize) -> Vec<Track> {
        Vec::new()
    }
}

/// Track backed by a real (small) local file so the source builder never
/// needs the network.
fn local_track(dir: &Path, id: &str, duration: Duration) -> Track {
    let path = dir.join(format!("{id}.opus"));
    std::fs::write(&path, vec![0u8; 20 * 1024]).unwrap();
    Track {
        id: id.to_string(),
        title: format!("Track {id}"),
        artist: "Artist".to_string(),
        album: None,
        duration,
        thumbnail_url: None,
        local_path: Some(path),
    }
}

fn start_controller(
    dir: &TempDir,
    store: Arc<MemoryKvStore>,
    durations: HashMap<String, Duration>,
    restore_queue: bool,
) -> (PlaybackController, Arc<SimPlayer>, Arc<SimPlayer>) {
    let primary = Arc::new(SimPlayer::with_durations(durations.clone()));
    let secondary = Arc::new(SimPlayer::with_durations(durations));
    let controller = PlaybackController::start(ControllerConfig {
        store,
        endpoint_resolver: Arc::new(NoStreams),
        related_provider: Arc::new(NoRelated),
        metadata_provider: None,
        connectivity: Arc::new(FixedConnectivity(LinkKind::Wifi)),
        primary_player: Arc::clone(&primary) as _,
        secondary_player: Arc::clone(&secondary) as _,
        cache_root: dir.path().to_path_buf(),
        restore_queue,
    })
    .unwrap();
    (controller, primary, secondary)
}

async fn wait_state(
    rx: &mut watch::Receiver<PlaybackState>,
    what: &str,
    pred: impl Fn(&PlaybackState) -> bool,
) {
    let result = tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            if pred(&rx.borrow()) {
                return;
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}

fn durations(pairs: &[(&str, u64)]) -> HashMap<String, Duration> {
    pairs
        .iter()
        .map(|(id, secs)| (id.to_string(), Duration::from_secs(*secs)))
        .collect()
}

// ===== Install and auto-advance =====

#[tokio::test(start_paused = true)]
async fn install_plays_first_track_and_advances_on_completion() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryKvStore::new());
    let (controller, _p1, _p2) =
        start_controller(&dir, store, durations(&[("t1", 1), ("t2", 30), ("t3", 30)]), false);

    let tracks = vec![
        local_track(dir.path(), "t1", Duration::from_secs(1)),
        local_track(dir.path(), "t2", Duration::from_secs(30)),
        local_track(dir.path(), "t3", Duration::from_secs(30)),
    ];

    let mut state_rx = controller.subscribe_state();
    let mut complete_rx = controller.subscribe_track_complete();
    controller
        .play_queue(tracks, 0, Some("album9".to_string()), false)
        .await
        .unwrap();

    wait_state(&mut state_rx, "t1 playing", |s| {
        s.current_index == Some(0)
            && s.current_track.as_ref().map(|t| t.id.as_str()) == Some("t1")
            && s.is_playing
    })
    .await;
    assert_eq!(state_rx.borrow().source_id.as_deref(), Some("album9"));
    assert!(!state_rx.borrow().is_radio_mode);

    // t1 is one second long; completion must advance to t2.
    wait_state(&mut state_rx, "advance to t2", |s| {
        s.current_index == Some(1)
            && s.current_track.as_ref().map(|t| t.id.as_str()) == Some("t2")
            && s.is_playing
    })
    .await;

    let finished = complete_rx.recv().await.unwrap();
    assert_eq!(finished.id, "t1");
}

#[tokio::test(start_paused = true)]
async fn revision_is_monotonic_across_commands() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryKvStore::new());
    let (controller, _p1, _p2) =
        start_controller(&dir, store, durations(&[("t1", 60), ("t2", 60)]), false);

    let tracks = vec![
        local_track(dir.path(), "t1", Duration::from_secs(60)),
        local_track(dir.path(), "t2", Duration::from_secs(60)),
    ];
    let extra = local_track(dir.path(), "t3", Duration::from_secs(60));

    let mut state_rx = controller.subscribe_state();
    controller.play_queue(tracks, 0, None, false).await.unwrap();
    wait_state(&mut state_rx, "queue installed", |s| s.queue.len() == 2).await;
    let r1 = state_rx.borrow().queue_revision;

    controller.add_to_queue(vec![extra]).await.unwrap();
    wait_state(&mut state_rx, "queue grew", |s| s.queue.len() == 3).await;
    let r2 = state_rx.borrow().queue_revision;
    assert!(r2 > r1);

    controller.toggle_shuffle().await.unwrap();
    wait_state(&mut state_rx, "shuffle on", |s| s.shuffle_enabled).await;
    let r3 = state_rx.borrow().queue_revision;
    assert!(r3 > r2);
}

// ===== Previous-button semantics =====

#[tokio::test(start_paused = true)]
async fn previous_seeks_to_zero_when_deep_into_the_track() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryKvStore::new());
    let (controller, _p1, _p2) =
        start_controller(&dir, store, durations(&[("t1", 60), ("t2", 60)]), false);

    let tracks = vec![
        local_track(dir.path(), "t1", Duration::from_secs(60)),
        local_track(dir.path(), "t2", Duration::from_secs(60)),
    ];

    let mut state_rx = controller.subscribe_state();
    let mut position_rx = controller.subscribe_position();
    controller.play_queue(tracks, 1, None, false).await.unwrap();
    wait_state(&mut state_rx, "t2 playing", |s| {
        s.current_index == Some(1) && s.is_playing
    })
    .await;

    // Let the clock run past the three-second threshold.
    let deep = tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            position_rx.changed().await.unwrap();
            if *position_rx.borrow() > Duration::from_secs(4) {
                return;
            }
        }
    })
    .await;
    assert!(deep.is_ok(), "position never advanced");

    controller.skip_to_previous().await.unwrap();

    // Restart, not navigation: index unchanged, position back at zero.
    let rewound = tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            position_rx.changed().await.unwrap();
            if *position_rx.borrow() < Duration::from_secs(1) {
                return;
            }
        }
    })
    .await;
    assert!(rewound.is_ok(), "position never rewound");
    assert_eq!(state_rx.borrow().current_index, Some(1));

    // A second press right away goes back for real.
    controller.skip_to_previous().await.unwrap();
    wait_state(&mut state_rx, "back to t1", |s| s.current_index == Some(0)).await;
}

// ===== Jams mode =====

#[tokio::test(start_paused = true)]
async fn jams_mode_never_auto_advances() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryKvStore::new());
    let (controller, _p1, _p2) =
        start_controller(&dir, store, durations(&[("t1", 1), ("t2", 30)]), false);

    let tracks = vec![
        local_track(dir.path(), "t1", Duration::from_secs(1)),
        local_track(dir.path(), "t2", Duration::from_secs(30)),
    ];

    let mut state_rx = controller.subscribe_state();
    let mut complete_rx = controller.subscribe_track_complete();
    controller.set_jams_mode(true).await.unwrap();
    controller.play_queue(tracks, 0, None, false).await.unwrap();
    wait_state(&mut state_rx, "t1 playing", |s| s.is_playing).await;

    // Completion arrives, but the engine must hold position.
    let finished = complete_rx.recv().await.unwrap();
    assert_eq!(finished.id, "t1");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(state_rx.borrow().current_index, Some(0));
    assert!(!state_rx.borrow().is_playing);

    // skip_to_next in Jams mode only re-announces completion.
    controller.skip_to_next().await.unwrap();
    let announced = complete_rx.recv().await.unwrap();
    assert_eq!(announced.id, "t1");
    assert_eq!(state_rx.borrow().current_index, Some(0));

    // The external controller advances explicitly.
    controller.set_jams_mode(false).await.unwrap();
    controller.skip_to_index(1).await.unwrap();
    wait_state(&mut state_rx, "t2 playing", |s| {
        s.current_index == Some(1) && s.is_playing
    })
    .await;
}

// ===== Restart restore =====

#[tokio::test(start_paused = true)]
async fn fresh_snapshot_restores_queue_index_and_position() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryKvStore::new());

    let tracks = vec![
        local_track(dir.path(), "t1", Duration::from_secs(60)),
        local_track(dir.path(), "t2", Duration::from_secs(60)),
        local_track(dir.path(), "t3", Duration::from_secs(60)),
    ];
    let doc = PersistedQueue {
        version: 1,
        queue: tracks,
        current_index: 1,
        position_ms: 42_000,
        saved_at_ms: epoch_ms(),
    };
    store
        .put("persisted_queue", serde_json::to_value(&doc).unwrap())
        .unwrap();

    let (controller, _p1, _p2) =
        start_controller(&dir, store, durations(&[("t2", 60)]), true);

    let state = controller.state();
    assert_eq!(state.current_index, Some(1));
    assert_eq!(state.current_track.as_ref().unwrap().id, "t2");
    assert_eq!(state.position, Duration::from_secs(42));
    assert_eq!(state.queue.len(), 3);
    assert!(!state.is_playing);
}

#[tokio::test(start_paused = true)]
async fn stale_snapshot_restores_nothing() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryKvStore::new());

    let doc = PersistedQueue {
        version: 1,
        queue: vec![local_track(dir.path(), "t1", Duration::from_secs(60))],
        current_index: 0,
        position_ms: 10_000,
        saved_at_ms: epoch_ms() - 6 * 60 * 1000,
    };
    store
        .put("persisted_queue", serde_json::to_value(&doc).unwrap())
        .unwrap();

    let (controller, _p1, _p2) = start_controller(&dir, store, HashMap::new(), true);

    let state = controller.state();
    assert!(state.queue.is_empty());
    assert_eq!(state.current_index, None);
}

#[tokio::test(start_paused = true)]
async fn pause_persists_synchronously() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryKvStore::new());
    let (controller, _p1, _p2) = start_controller(
        &dir,
        Arc::clone(&store),
        durations(&[("t1", 60)]),
        false,
    );

    let tracks = vec![local_track(dir.path(), "t1", Duration::from_secs(60))];
    let mut state_rx = controller.subscribe_state();
    controller.play_queue(tracks, 0, None, false).await.unwrap();
    wait_state(&mut state_rx, "playing", |s| s.is_playing).await;

    controller.pause().await.unwrap();
    wait_state(&mut state_rx, "paused", |s| !s.is_playing).await;

    let saved = store.get("persisted_queue").unwrap();
    assert!(saved.is_some(), "pause must write the queue snapshot");
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
