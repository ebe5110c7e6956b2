//! Playback controller
//!
//! The public façade of the engine. All state lives on a single actor task
//! fed by a command channel; player events from both handles arrive on the
//! same loop, so every mutation is serialized and every emitted state is
//! internally consistent.
//!
//! Observables:
//! - a coarse state stream that only wakes subscribers when something other
//!   than the position changed
//! - a raw position stream at the active player's tick rate
//! - a track-complete stream (the only signal in Jams mode)

use crate::engine::{DualPlayerEngine, OverlapParams};
use crate::error::{PlaybackError, Result};
use crate::persist::{QueuePersistor, TrackMetadataProvider, DEBOUNCE};
use crate::player::{PlayerEvent, PlayerHandle, PlayerStatus};
use crate::queue::QueueModel;
use crate::radio::{RadioExtender, RelatedTracksProvider, BATCH_LIMIT};
use crate::source::SourceBuilder;
use crate::state::{PlaybackState, SlotState};
use muse_core::{AudioQuality, Connectivity, KvStore, LoopMode, SettingsSnapshot, Track};
use muse_stream::cache::{spawn_janitor, ByteCache};
use muse_stream::downloader::Downloader;
use muse_stream::net;
use muse_stream::precache::PrecacheScheduler;
use muse_stream::resolver::{StreamResolver, TrackEndpointResolver};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Command channel depth.
const COMMAND_CAPACITY: usize = 64;

/// Minimum interval between position updates inside the coarse state.
const STATE_POSITION_INTERVAL: Duration = Duration::from_millis(500);

/// Delay before the radio pre-warm after `play_track`.
const RADIO_PREWARM_DELAY: Duration = Duration::from_millis(500);

/// Seek-to-zero threshold for `skip_to_previous`.
const PREVIOUS_RESTART_THRESHOLD: Duration = Duration::from_secs(3);

/// Everything the controller needs, injected by the host.
pub struct ControllerConfig {
    pub store: Arc<dyn KvStore>,
    pub endpoint_resolver: Arc<dyn TrackEndpointResolver>,
    pub related_provider: Arc<dyn RelatedTracksProvider>,
    pub metadata_provider: Option<Arc<dyn TrackMetadataProvider>>,
    pub connectivity: Arc<dyn Connectivity>,
    pub primary_player: Arc<dyn PlayerHandle>,
    pub secondary_player: Arc<dyn PlayerHandle>,
    /// Parent of the `stream_audio_cache/` directory
    pub cache_root: PathBuf,
    /// Restore the persisted queue on startup (TTL-gated)
    pub restore_queue: bool,
}

enum Command {
    PlayTrack { track: Track, radio: bool },
    PlayQueue {
        tracks: Vec<Track>,
        start_index: usize,
        source_id: Option<String>,
        is_radio_queue: bool,
    },
    AddToQueue(Vec<Track>),
    PlayNext(Track),
    RemoveFromQueue(usize),
    ReorderQueue { from: usize, to: usize },
    SkipToIndex(usize),
    ClearQueue,
    Play,
    Pause,
    Stop,
    Seek(Duration),
    SeekBy(i64),
    SkipToNext,
    SkipToPrevious,
    SetLoopMode(LoopMode),
    ToggleShuffle,
    SetSpeed(f64),
    SetAudioQuality(AudioQuality),
    SetCrossfadeMs(u32),
    SetJamsMode(bool),
    Shutdown,
    // internal
    CheckRadio,
    RadioFetched(Vec<Track>),
    PersistDebounced,
    DurationMigrated(Track),
    ArmRestored,
}

/// Handle to the controller actor.
///
/// Construct with [`PlaybackController::start`] after settings storage is
/// available; call [`PlaybackController::shutdown`] to stop both players
/// and flush persistence.
pub struct PlaybackController {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<PlaybackState>,
    position_rx: watch::Receiver<Duration>,
    complete_tx: broadcast::Sender<Track>,
    task: JoinHandle<()>,
    _janitor: JoinHandle<()>,
}

impl PlaybackController {
    /// Build the component graph and spawn the controller task.
    ///
    /// Must be called from within a Tokio runtime; the controller, cache
    /// janitor, and precache workers all live on it.
    pub fn start(config: ControllerConfig) -> Result<PlaybackController> {
        let settings = SettingsSnapshot::load(&*config.store).unwrap_or_else(|e| {
            warn!(error = %e, "settings unreadable, using defaults");
            SettingsSnapshot::default()
        });
        let (settings_tx, settings_rx) = watch::channel(settings);

        let cache = Arc::new(ByteCache::open(&config.cache_root)?);
        let resolver = Arc::new(StreamResolver::new(Arc::clone(&config.endpoint_resolver)));
        let client = net::precache_client()
            .map_err(|e| PlaybackError::BackendRefused(e.to_string()))?;
        let precache = Arc::new(PrecacheScheduler::new(
            Arc::clone(&cache),
            Arc::clone(&resolver),
            Downloader::new(client),
            Arc::clone(&config.connectivity),
            settings_rx.clone(),
        ));
        let sources = SourceBuilder::new(
            Arc::clone(&resolver),
            Arc::clone(&cache),
            Arc::clone(&precache),
            Arc::clone(&config.connectivity),
            settings_rx.clone(),
        );
        let engine = Arc::new(DualPlayerEngine::new(
            Arc::clone(&config.primary_player),
            Arc::clone(&config.secondary_player),
        ));

        let janitor = spawn_janitor(Arc::clone(&cache), settings_rx.clone());

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(PlaybackState::initial(settings));
        let (position_tx, position_rx) = watch::channel(Duration::ZERO);
        let (complete_tx, _) = broadcast::channel(16);

        let mut task = ControllerTask {
            store: Arc::clone(&config.store),
            settings_tx,
            connectivity: Arc::clone(&config.connectivity),
            resolver,
            cache,
            precache,
            sources,
            engine,
            related: Arc::clone(&config.related_provider),
            metadata: config.metadata_provider.clone(),
            queue: QueueModel::new(),
            radio: RadioExtender::new(),
            persistor: QueuePersistor::new(Arc::clone(&config.store)),
            state: PlaybackState::initial(settings),
            state_tx,
            position_tx,
            complete_tx: complete_tx.clone(),
            cmd_tx: cmd_tx.clone(),
            jams_mode: false,
            cleartext_blocked: false,
            pending_seek: None,
            duration_applied: false,
            advance_after_radio: false,
            is_fetching_radio: false,
            debounce: None,
            last_state_position: Instant::now()
                .checked_sub(STATE_POSITION_INTERVAL)
                .unwrap_or_else(Instant::now),
        };

        if config.restore_queue {
            task.restore_persisted_queue();
        }

        let primary = config.primary_player;
        let secondary = config.secondary_player;
        let handle = tokio::spawn(async move {
            task.run(cmd_rx, primary, secondary).await;
        });

        Ok(PlaybackController {
            cmd_tx,
            state_rx,
            position_rx,
            complete_tx,
            task: handle,
            _janitor: janitor,
        })
    }

    // ===== Observables =====

    /// Current coarse state snapshot.
    pub fn state(&self) -> PlaybackState {
        self.state_rx.borrow().clone()
    }

    /// Coarse state stream; wakes only when position-excluded equality
    /// changes.
    pub fn subscribe_state(&self) -> watch::Receiver<PlaybackState> {
        self.state_rx.clone()
    }

    /// Raw position stream at the active player's tick rate.
    pub fn subscribe_position(&self) -> watch::Receiver<Duration> {
        self.position_rx.clone()
    }

    /// Emits the finished track whenever the active player completes.
    pub fn subscribe_track_complete(&self) -> broadcast::Receiver<Track> {
        self.complete_tx.subscribe()
    }

    // ===== Commands =====

    pub async fn play_track(&self, track: Track, radio: bool) -> Result<()> {
        self.send(Command::PlayTrack { track, radio }).await
    }

    pub async fn play_queue(
        &self,
        tracks: Vec<Track>,
        start_index: usize,
        source_id: Option<String>,
        is_radio_queue: bool,
    ) -> Result<()> {
        self.send(Command::PlayQueue {
            tracks,
            start_index,
            source_id,
            is_radio_queue,
        })
        .await
    }

    pub async fn add_to_queue(&self, tracks: Vec<Track>) -> Result<()> {
        self.send(Command::AddToQueue(tracks)).await
    }

    pub async fn play_next(&self, track: Track) -> Result<()> {
        self.send(Command::PlayNext(track)).await
    }

    pub async fn remove_from_queue(&self, index: usize) -> Result<()> {
        self.send(Command::RemoveFromQueue(index)).await
    }

    pub async fn reorder_queue(&self, from: usize, to: usize) -> Result<()> {
        self.send(Command::ReorderQueue { from, to }).await
    }

    pub async fn skip_to_index(&self, index: usize) -> Result<()> {
        self.send(Command::SkipToIndex(index)).await
    }

    pub async fn clear_queue(&self) -> Result<()> {
        self.send(Command::ClearQueue).await
    }

    pub async fn play(&self) -> Result<()> {
        self.send(Command::Play).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    pub async fn seek(&self, position: Duration) -> Result<()> {
        self.send(Command::Seek(position)).await
    }

    /// Seek relative to the current position, millisecond delta.
    pub async fn seek_by(&self, delta_ms: i64) -> Result<()> {
        self.send(Command::SeekBy(delta_ms)).await
    }

    pub async fn skip_to_next(&self) -> Result<()> {
        self.send(Command::SkipToNext).await
    }

    pub async fn skip_to_previous(&self) -> Result<()> {
        self.send(Command::SkipToPrevious).await
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) -> Result<()> {
        self.send(Command::SetLoopMode(mode)).await
    }

    pub async fn toggle_shuffle(&self) -> Result<()> {
        self.send(Command::ToggleShuffle).await
    }

    pub async fn set_speed(&self, speed: f64) -> Result<()> {
        self.send(Command::SetSpeed(speed)).await
    }

    /// Persist the quality, drop both caches, and re-warm the lookahead.
    pub async fn set_audio_quality(&self, quality: AudioQuality) -> Result<()> {
        self.send(Command::SetAudioQuality(quality)).await
    }

    pub async fn set_crossfade_duration_ms(&self, ms: u32) -> Result<()> {
        self.send(Command::SetCrossfadeMs(ms)).await
    }

    /// Jams mode: the engine stops auto-advancing and only emits
    /// track-complete events. The external controller may respond with any
    /// of `skip_to_next`, `skip_to_index`, or `play_track`; `play` on a
    /// completed slot replays the current track. Crossfade is disabled
    /// while enabled.
    pub async fn set_jams_mode(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetJamsMode(enabled)).await
    }

    /// Stop both players, flush persistence, drain precache waiters, and
    /// end the controller task.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let _ = self.task.await;
        self._janitor.abort();
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| PlaybackError::ControllerClosed)
    }
}

// ===== Actor =====

struct ControllerTask {
    store: Arc<dyn KvStore>,
    settings_tx: watch::Sender<SettingsSnapshot>,
    connectivity: Arc<dyn Connectivity>,
    resolver: Arc<StreamResolver>,
    cache: Arc<ByteCache>,
    precache: Arc<PrecacheScheduler>,
    sources: SourceBuilder,
    engine: Arc<DualPlayerEngine>,
    related: Arc<dyn RelatedTracksProvider>,
    metadata: Option<Arc<dyn TrackMetadataProvider>>,
    queue: QueueModel,
    radio: RadioExtender,
    persistor: QueuePersistor,
    state: PlaybackState,
    state_tx: watch::Sender<PlaybackState>,
    position_tx: watch::Sender<Duration>,
    complete_tx: broadcast::Sender<Track>,
    cmd_tx: mpsc::Sender<Command>,
    jams_mode: bool,
    /// Platform refused loopback sources once; direct streaming for the
    /// rest of the process
    cleartext_blocked: bool,
    /// Seek stored while loading, keyed by track id
    pending_seek: Option<(String, Duration)>,
    /// Authoritative duration applied for the current source
    duration_applied: bool,
    /// Skip-next arrived at queue end in radio mode; advance once extended
    advance_after_radio: bool,
    is_fetching_radio: bool,
    debounce: Option<JoinHandle<()>>,
    last_state_position: Instant,
}

impl ControllerTask {
    async fn run(
        &mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        primary: Arc<dyn PlayerHandle>,
        secondary: Arc<dyn PlayerHandle>,
    ) {
        let mut events0 = primary.subscribe();
        let mut events1 = secondary.subscribe();
        info!("playback controller running");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                event = next_event(&mut events0) => {
                    self.handle_player_event(0, event).await;
                }
                event = next_event(&mut events1) => {
                    self.handle_player_event(1, event).await;
                }
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        info!("playback controller shutting down");
        self.engine.stop_all().await;
        self.precache.shutdown();
        if let Some(handle) = self.debounce.take() {
            handle.abort();
        }
        self.persistor.save_now(
            self.queue.tracks(),
            self.queue.current_index(),
            self.state.position,
        );
    }

    // ===== Commands =====

    async fn handle_command(&mut self, cmd: Command) {
        // Internal commands never touch the user-visible error.
        let internal = matches!(
            cmd,
            Command::CheckRadio
                | Command::RadioFetched(_)
                | Command::PersistDebounced
                | Command::DurationMigrated(_)
                | Command::ArmRestored
        );
        if !internal {
            self.state.error = None;
        }

        match cmd {
            Command::PlayTrack { track, radio } => {
                if radio {
                    self.radio.activate(&track);
                } else {
                    self.radio.deactivate();
                }
                self.queue.install(vec![track], 0, None);
                self.load_and_play_current().await;
                self.after_queue_change();
                self.schedule_radio_prewarm();
            }
            Command::PlayQueue {
                tracks,
                start_index,
                source_id,
                is_radio_queue,
            } => {
                let radio_mode = tracks.len() == 1 && !is_radio_queue;
                if radio_mode {
                    if let Some(first) = tracks.first() {
                        self.radio.activate(first);
                    }
                } else {
                    self.radio.deactivate();
                }
                let len = tracks.len();
                self.queue.install(tracks, start_index, source_id);
                self.load_and_play_current().await;
                self.after_queue_change();
                if self.radio.is_active() && len <= 2 {
                    self.start_radio_fetch();
                }
            }
            Command::AddToQueue(tracks) => {
                self.queue.append(tracks);
                self.after_queue_change();
                self.sync_and_publish();
            }
            Command::PlayNext(track) => {
                self.queue.insert_next(track);
                self.after_queue_change();
                self.sync_and_publish();
            }
            Command::RemoveFromQueue(index) => {
                let was_current = self.queue.current_index() == Some(index);
                if self.queue.remove_at(index).is_some() {
                    self.after_queue_change();
                    if was_current && !self.queue.is_empty() && self.state.is_playing {
                        self.load_and_play_current().await;
                    } else if self.queue.is_empty() {
                        self.engine.stop_all().await;
                        self.state.apply_slot(SlotState::Idle);
                    }
                    self.sync_and_publish();
                }
            }
            Command::ReorderQueue { from, to } => {
                if self.queue.reorder(from, to) {
                    self.after_queue_change();
                    self.sync_and_publish();
                }
            }
            Command::SkipToIndex(index) => {
                if self.queue.skip_to(index).is_some() {
                    self.load_and_play_current().await;
                    self.after_queue_change();
                }
            }
            Command::ClearQueue => {
                self.queue.clear();
                self.radio.deactivate();
                self.engine.stop_all().await;
                self.state.apply_slot(SlotState::Idle);
                self.state.current_playback_data = None;
                self.after_queue_change();
                self.sync_and_publish();
            }
            Command::Play => self.handle_play().await,
            Command::Pause => {
                self.engine.active_player().pause().await.ok();
                if !self.engine.is_crossfading() {
                    // The standby player only ever holds a preloaded next
                    // track; parked playback keeps no fade gain either.
                    self.engine.standby_player().stop().await.ok();
                    self.engine.active_player().set_volume(1.0).await.ok();
                }
                self.state.apply_slot(SlotState::Paused);
                // Synchronous save on pause.
                self.persistor.save_now(
                    self.queue.tracks(),
                    self.queue.current_index(),
                    self.state.position,
                );
                self.sync_and_publish();
            }
            Command::Stop => {
                self.engine.stop_all().await;
                self.state.apply_slot(SlotState::Idle);
                self.persistor.save_now(
                    self.queue.tracks(),
                    self.queue.current_index(),
                    self.state.position,
                );
                self.sync_and_publish();
            }
            Command::Seek(position) => self.handle_seek(position).await,
            Command::SeekBy(delta_ms) => {
                let current = self.engine.active_player().position();
                let target = if delta_ms >= 0 {
                    current + Duration::from_millis(delta_ms as u64)
                } else {
                    current.saturating_sub(Duration::from_millis((-delta_ms) as u64))
                };
                self.handle_seek(target).await;
            }
            Command::SkipToNext => self.handle_skip_next().await,
            Command::SkipToPrevious => self.handle_skip_previous().await,
            Command::SetLoopMode(mode) => {
                self.queue.set_loop_mode(mode);
                self.engine.set_loop_both(mode).await;
                self.after_queue_change();
                self.sync_and_publish();
            }
            Command::ToggleShuffle => {
                if self.queue.shuffle_enabled() {
                    self.queue.disable_shuffle();
                } else {
                    self.queue.enable_shuffle();
                }
                self.after_queue_change();
                self.sync_and_publish();
            }
            Command::SetSpeed(speed) => {
                self.engine.set_speed_both(speed).await;
                self.state.speed = speed;
                self.sync_and_publish();
            }
            Command::SetAudioQuality(quality) => self.handle_set_quality(quality).await,
            Command::SetCrossfadeMs(ms) => {
                self.update_settings(|s| s.crossfade_duration_ms = ms.min(12_000));
                self.sync_and_publish();
            }
            Command::SetJamsMode(enabled) => {
                info!(enabled, "jams mode");
                self.jams_mode = enabled;
                self.sync_and_publish();
            }
            // Consumed by the run loop before dispatch.
            Command::Shutdown => {}

            Command::CheckRadio => self.maybe_extend_radio(),
            Command::RadioFetched(batch) => self.handle_radio_fetched(batch).await,
            Command::PersistDebounced => {
                self.persistor.save_now(
                    self.queue.tracks(),
                    self.queue.current_index(),
                    self.state.position,
                );
            }
            Command::DurationMigrated(track) => {
                debug!(track_id = %track.id, "duration migration applied");
                self.queue.replace_current(track);
                self.sync_and_publish();
                self.schedule_debounced_save();
            }
            Command::ArmRestored => self.arm_restored_source().await,
        }
    }

    /// Attach the restored current track to the active player without
    /// starting playback, so the pending seek lands and the next `play`
    /// resumes instantly. Failures here are expected (offline startup) and
    /// stay silent; the next user command resolves again.
    async fn arm_restored_source(&mut self) {
        let Some(track) = self.queue.current_track().cloned() else {
            return;
        };

        self.state.apply_slot(SlotState::Loading);
        self.duration_applied = false;
        self.sync_and_publish();

        let build_result = if self.cleartext_blocked {
            self.sources.build_direct(&track).await
        } else {
            self.sources.build(&track).await
        };
        let armed = match build_result {
            Ok(built) => {
                self.state.current_playback_data = built.playback_data.clone();
                self.engine.load_only(built.spec).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = armed {
            debug!(track_id = %track.id, error = %e, "restored source not armed");
            self.state.current_playback_data = None;
            self.state.apply_slot(SlotState::Idle);
        }
        self.sync_and_publish();
    }

    async fn handle_play(&mut self) {
        let active = self.engine.active_player();
        if active.current_source().is_none() {
            self.load_and_play_current().await;
            return;
        }
        let expired = self
            .state
            .current_playback_data
            .as_ref()
            .map(|d| d.is_expired())
            .unwrap_or(false);
        if expired {
            // Stream URL went stale while paused: silent re-resolve.
            if let Some(track) = self.queue.current_track() {
                debug!(track_id = %track.id, "playback data expired, reloading");
            }
            if let Some(id) = self.queue.current_track().map(|t| t.id.clone()) {
                self.resolver.clear(&id);
            }
            self.load_and_play_current().await;
            return;
        }
        if let Err(e) = active.play().await {
            self.fail(e);
        }
        self.sync_and_publish();
    }

    async fn handle_seek(&mut self, position: Duration) {
        if self.state.is_loading {
            if let Some(track) = self.queue.current_track() {
                self.pending_seek = Some((track.id.clone(), position));
            }
            return;
        }
        if let Err(e) = self.engine.active_player().seek(position).await {
            if !matches!(e, PlaybackError::NoSource) {
                self.fail(e);
            }
            return;
        }
        let _ = self.position_tx.send(position);
        self.state.position = position;
        self.sync_and_publish();
    }

    async fn handle_skip_next(&mut self) {
        if self.jams_mode {
            // The external controller decides; only announce completion.
            if let Some(track) = self.queue.current_track() {
                let _ = self.complete_tx.send(track.clone());
            }
            return;
        }
        match self.queue.next_index() {
            Some(target) => self.advance_to(target).await,
            None => {
                if self.radio.is_active() {
                    self.advance_after_radio = true;
                    self.start_radio_fetch();
                }
                // Otherwise: end of queue, no-op.
            }
        }
    }

    async fn handle_skip_previous(&mut self) {
        let active = self.engine.active_player();
        if active.position() > PREVIOUS_RESTART_THRESHOLD {
            // Restart the current track; the index must not change.
            active.seek(Duration::ZERO).await.ok();
            let _ = self.position_tx.send(Duration::ZERO);
            self.state.position = Duration::ZERO;
            self.sync_and_publish();
            return;
        }
        if let Some(target) = self.queue.prev_index() {
            self.queue.skip_to(target);
            self.load_and_play_current().await;
            self.after_queue_change();
        }
    }

    async fn handle_set_quality(&mut self, quality: AudioQuality) {
        info!(?quality, "audio quality changed");
        self.update_settings(|s| s.streaming_quality = quality);
        self.state.audio_quality = quality;

        // Quality invalidates both caches: keys embed it, and stale URLs
        // would serve the wrong bitrate.
        self.resolver.clear_all();
        if let Err(e) = self.cache.clear_all().await {
            warn!(error = %e, "byte cache clear failed");
        }
        self.after_queue_change();
        self.sync_and_publish();
    }

    /// Queue mutated: precache ahead, warm the URL cache, and schedule the
    /// debounced persistence write.
    fn after_queue_change(&mut self) {
        let upcoming = self.queue.upcoming().to_vec();
        self.precache.schedule_ahead(&upcoming);

        let quality = self.settings_tx.borrow().streaming_quality;
        let metered = !self.connectivity.link_kind().is_unmetered();
        let ids: Vec<String> = upcoming.iter().map(|t| t.id.clone()).collect();
        if !ids.is_empty() {
            self.resolver.prefetch(ids, quality, metered);
        }

        self.schedule_debounced_save();
    }

    fn schedule_debounced_save(&mut self) {
        if let Some(handle) = self.debounce.take() {
            handle.abort();
        }
        let tx = self.cmd_tx.clone();
        self.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            let _ = tx.send(Command::PersistDebounced).await;
        }));
    }

    fn schedule_radio_prewarm(&self) {
        if !self.radio.is_active() {
            return;
        }
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RADIO_PREWARM_DELAY).await;
            let _ = tx.send(Command::CheckRadio).await;
        });
    }

    // ===== Loading and transitions =====

    async fn load_and_play_current(&mut self) {
        let Some(track) = self.queue.current_track().cloned() else {
            self.state.apply_slot(SlotState::Idle);
            self.state.current_playback_data = None;
            self.sync_and_publish();
            return;
        };

        self.state.apply_slot(SlotState::Loading);
        self.duration_applied = false;
        self.state.duration = if track.duration.is_zero() {
            None
        } else {
            Some(track.duration)
        };
        self.sync_and_publish();

        let build_result = if self.cleartext_blocked {
            self.sources.build_direct(&track).await
        } else {
            self.sources.build(&track).await
        };
        let built = match build_result {
            Ok(b) => b,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        self.state.current_playback_data = built.playback_data.clone();

        match self.engine.hard_switch(built.spec).await {
            Ok(()) => {}
            Err(PlaybackError::CleartextLoopbackBlocked) => {
                // The platform refuses loopback sources; pin this process
                // to direct streaming and retry once.
                warn!("cleartext loopback blocked, pinning to direct streams");
                self.cleartext_blocked = true;
                match self.sources.build_direct(&track).await {
                    Ok(direct) => {
                        self.state.current_playback_data = direct.playback_data.clone();
                        if let Err(e) = self.engine.hard_switch(direct.spec).await {
                            self.fail(e);
                            return;
                        }
                    }
                    Err(e) => {
                        self.fail(e);
                        return;
                    }
                }
            }
            Err(e) => {
                self.fail(e);
                return;
            }
        }

        self.sync_and_publish();
    }

    /// Advance to a target index, crossfading when the settings allow it.
    async fn advance_to(&mut self, target: usize) {
        let crossfade =
            Duration::from_millis(self.settings_tx.borrow().crossfade_duration_ms as u64);
        let use_crossfade = !crossfade.is_zero()
            && !self.jams_mode
            && self.queue.loop_mode() != LoopMode::One
            && self.state.is_playing;

        if use_crossfade {
            self.crossfade_to(target, crossfade).await;
        } else {
            self.queue.skip_to(target);
            self.load_and_play_current().await;
            self.after_queue_change();
        }
    }

    async fn crossfade_to(&mut self, target: usize, crossfade: Duration) {
        let Some(track) = self.queue.tracks().get(target).cloned() else {
            return;
        };

        let build_result = if self.cleartext_blocked {
            self.sources.build_direct(&track).await
        } else {
            self.sources.build(&track).await
        };
        let built = match build_result {
            Ok(b) => b,
            Err(e) => {
                // Fall back to a hard switch; a failed resolve must not
                // strand playback between players.
                warn!(track_id = %track.id, error = %e, "crossfade source build failed");
                self.queue.skip_to(target);
                self.load_and_play_current().await;
                return;
            }
        };

        let params = OverlapParams {
            crossfade,
            loop_mode: self.queue.loop_mode(),
            speed: self.state.speed,
        };

        match self.engine.begin_overlap(built.spec, params).await {
            Ok(outgoing) => {
                // Swap done: queue and state move together so subscribers
                // see index and track from the same revision.
                self.queue.skip_to(target);
                self.duration_applied = false;
                self.state.duration = if track.duration.is_zero() {
                    self.engine.active_player().duration()
                } else {
                    Some(track.duration)
                };
                self.state.current_playback_data = built.playback_data;
                self.state.apply_slot(SlotState::Playing);
                self.sync_and_publish();
                self.after_queue_change();

                let engine = Arc::clone(&self.engine);
                tokio::spawn(engine.run_overlap_ramp(outgoing, crossfade));
            }
            Err(e) => {
                warn!(error = %e, "overlap start failed, falling back to hard switch");
                self.queue.skip_to(target);
                self.load_and_play_current().await;
                self.after_queue_change();
            }
        }
    }

    // ===== Radio =====

    fn maybe_extend_radio(&mut self) {
        if self
            .radio
            .should_extend(self.queue.remaining_after_current(), self.is_fetching_radio)
        {
            self.start_radio_fetch();
        }
    }

    fn start_radio_fetch(&mut self) {
        if self.is_fetching_radio {
            return;
        }
        let Some(seed) = self.radio.pick_seed(self.queue.tracks()) else {
            return;
        };
        self.is_fetching_radio = true;
        self.state.is_fetching_radio = true;
        self.sync_and_publish();

        debug!(seed = %seed, "radio fetch");
        let related = Arc::clone(&self.related);
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let batch = related.related(&seed, BATCH_LIMIT).await;
            let _ = tx.send(Command::RadioFetched(batch)).await;
        });
    }

    async fn handle_radio_fetched(&mut self, batch: Vec<Track>) {
        self.is_fetching_radio = false;
        self.state.is_fetching_radio = false;

        let fresh = self.radio.absorb_batch(self.queue.tracks(), batch);
        if !fresh.is_empty() {
            info!(count = fresh.len(), "radio extended the queue");
            self.queue.append(fresh);
            self.after_queue_change();
        }
        self.sync_and_publish();

        if self.advance_after_radio {
            self.advance_after_radio = false;
            if let Some(target) = self.queue.next_index() {
                self.advance_to(target).await;
            }
        }
    }

    // ===== Player events =====

    async fn handle_player_event(&mut self, player_index: usize, event: PlayerEvent) {
        // Only the active player drives state; the standby player's events
        // are crossfade preparation noise.
        if player_index != self.engine.active_index() {
            return;
        }

        match event {
            PlayerEvent::Status(status) => self.handle_status(status).await,
            PlayerEvent::Position { position, buffered } => {
                self.handle_position_tick(position, buffered).await;
            }
            PlayerEvent::Duration(duration) => {
                self.state.duration = Some(duration);
                if !self.duration_applied {
                    self.duration_applied = true;
                    if let Some(current) = self.queue.current_track() {
                        if current.duration != duration {
                            let updated = current.with_duration(duration);
                            self.queue.replace_current(updated);
                        }
                    }
                }
                self.sync_and_publish();
            }
            PlayerEvent::Error(message) => {
                warn!(error = %message, "player error");
                self.state.error = Some(message);
                self.state.apply_slot(SlotState::Error);
                self.sync_and_publish();
            }
        }
    }

    async fn handle_status(&mut self, status: PlayerStatus) {
        match status {
            PlayerStatus::Ready => {
                self.state.apply_slot(SlotState::Ready);
                self.apply_pending_seek().await;
            }
            PlayerStatus::Loading => self.state.apply_slot(SlotState::Loading),
            PlayerStatus::Playing => {
                self.state.apply_slot(SlotState::Playing);
                self.apply_pending_seek().await;
            }
            PlayerStatus::Paused => self.state.apply_slot(SlotState::Paused),
            PlayerStatus::Buffering => self.state.apply_slot(SlotState::Buffering),
            PlayerStatus::Idle => {
                // stop() resets; nothing to derive.
            }
            PlayerStatus::Completed => {
                self.handle_completed().await;
                return;
            }
        }
        self.sync_and_publish();
    }

    async fn handle_completed(&mut self) {
        self.state.apply_slot(SlotState::Completed);
        if let Some(track) = self.queue.current_track() {
            let _ = self.complete_tx.send(track.clone());
        }
        self.sync_and_publish();

        if self.jams_mode {
            // The external controller owns progression.
            return;
        }

        match self.queue.next_index() {
            Some(target) => {
                self.queue.skip_to(target);
                self.load_and_play_current().await;
                self.after_queue_change();
            }
            None => {
                if self.radio.is_active() {
                    self.advance_after_radio = true;
                    self.start_radio_fetch();
                } else {
                    self.engine.stop_all().await;
                    self.state.apply_slot(SlotState::Idle);
                    self.sync_and_publish();
                }
            }
        }
    }

    async fn handle_position_tick(&mut self, position: Duration, buffered: Duration) {
        let _ = self.position_tx.send(position);

        // The coarse state only carries position at a 500 ms cadence, and
        // position alone never notifies subscribers.
        if self.last_state_position.elapsed() >= STATE_POSITION_INTERVAL {
            self.last_state_position = Instant::now();
            self.state.position = position;
            self.state.buffered_position = buffered;
            self.state_tx.send_if_modified(|s| {
                s.position = position;
                s.buffered_position = buffered;
                false
            });
        }

        self.engine.anti_stall_check().await;

        // Crossfade trigger.
        let crossfade =
            Duration::from_millis(self.settings_tx.borrow().crossfade_duration_ms as u64);
        if !crossfade.is_zero() {
            let duration = self
                .state
                .duration
                .or_else(|| self.queue.current_track().map(|t| t.duration))
                .unwrap_or_default();
            let remaining = duration.saturating_sub(position);
            let has_next = self.queue.next_index().is_some();
            if self.engine.should_crossfade(
                crossfade,
                remaining,
                has_next,
                self.queue.loop_mode(),
                self.jams_mode,
            ) {
                if let Some(target) = self.queue.next_index() {
                    self.crossfade_to(target, crossfade).await;
                    return;
                }
            }
        }

        // Radio lookahead.
        self.maybe_extend_radio();

        // Periodic persistence while playing.
        if self.state.is_playing && self.persistor.should_periodic_save(position) {
            self.persistor.save_now(
                self.queue.tracks(),
                self.queue.current_index(),
                position,
            );
        }
    }

    async fn apply_pending_seek(&mut self) {
        let Some((track_id, position)) = self.pending_seek.clone() else {
            return;
        };
        let matches = self
            .queue
            .current_track()
            .map(|t| t.id == track_id)
            .unwrap_or(false);
        if !matches {
            return;
        }
        self.pending_seek = None;
        debug!(track_id = %track_id, position_ms = position.as_millis() as u64, "applying pending seek");
        self.engine.active_player().seek(position).await.ok();
        self.state.position = position;
        let _ = self.position_tx.send(position);
    }

    // ===== Restore =====

    fn restore_persisted_queue(&mut self) {
        let Some(restored) = self.persistor.load() else {
            return;
        };
        info!(
            tracks = restored.queue.len(),
            index = ?restored.current_index,
            "restoring persisted queue"
        );

        let start = restored.current_index.unwrap_or(0);
        self.queue.install(restored.queue.clone(), start, None);
        if let Some(track) = self.queue.current_track() {
            self.pending_seek = Some((track.id.clone(), restored.position));
            // Arm the restored source once the actor is running; the seek
            // applies when the player reports readiness for this track.
            let _ = self.cmd_tx.try_send(Command::ArmRestored);
        }
        self.state.position = restored.position;

        if self.persistor.needs_duration_migration(&restored) {
            if let (Some(provider), Some(track)) =
                (self.metadata.clone(), self.queue.current_track().cloned())
            {
                self.persistor.mark_duration_migrated();
                let tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    if let Some(full) = provider.track(&track.id).await {
                        let _ = tx.send(Command::DurationMigrated(full)).await;
                    }
                });
            }
        }

        self.sync_from_queue();
        let _ = self.state_tx.send(self.state.clone());
    }

    // ===== State plumbing =====

    fn update_settings(&mut self, f: impl FnOnce(&mut SettingsSnapshot)) {
        let mut settings = *self.settings_tx.borrow();
        f(&mut settings);
        if let Err(e) = settings.store(&*self.store) {
            warn!(error = %e, "settings write failed");
        }
        let _ = self.settings_tx.send(settings);
        self.state.settings = settings;
    }

    fn fail(&mut self, error: PlaybackError) {
        match error {
            // Silent no-ops by design.
            PlaybackError::NoSource | PlaybackError::QueueEmpty => {
                debug!(error = %error, "ignored state error");
            }
            other => {
                warn!(error = %other, "playback command failed");
                self.state.error = Some(other.to_string());
                self.state.apply_slot(SlotState::Error);
            }
        }
        self.sync_and_publish();
    }

    fn sync_from_queue(&mut self) {
        self.state.queue = self.queue.tracks().to_vec();
        self.state.queue_revision = self.queue.revision();
        self.state.current_index = self.queue.current_index();
        self.state.current_track = self.queue.current_track().cloned();
        self.state.loop_mode = self.queue.loop_mode();
        self.state.shuffle_enabled = self.queue.shuffle_enabled();
        self.state.source_id = self.queue.source_id().map(String::from);
        self.state.is_radio_mode = self.radio.is_active();
        self.state.is_fetching_radio = self.is_fetching_radio;
    }

    /// Publish the current state; subscribers wake only on coarse changes.
    fn sync_and_publish(&mut self) {
        self.sync_from_queue();
        let snapshot = self.state.clone();
        self.state_tx.send_if_modified(move |current| {
            let changed = !current.coarse_eq(&snapshot);
            *current = snapshot;
            changed
        });
    }
}

/// Pull the next event, absorbing lag. A closed channel parks the arm
/// instead of busy-looping the select.
async fn next_event(rx: &mut broadcast::Receiver<PlayerEvent>) -> PlayerEvent {
    loop {
        match rx.recv().await {
            Ok(event) => return event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "player event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }
    }
}
