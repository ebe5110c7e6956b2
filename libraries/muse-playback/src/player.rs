//! Audio player handle abstraction
//!
//! The engine drives two opaque player handles. A handle accepts commands
//! (source, transport, volume, speed) and pushes events through a bounded
//! broadcast channel; platform backends implement the trait, and
//! [`SimPlayer`] provides a clock-driven implementation for tests and
//! headless deployments.

use crate::error::{PlaybackError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of each player's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What a player should play.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioSourceSpec {
    /// Local file (offline library or cached body)
    File { path: PathBuf, track_id: String },

    /// Direct network stream
    Remote { url: String, track_id: String },
}

impl AudioSourceSpec {
    pub fn track_id(&self) -> &str {
        match self {
            AudioSourceSpec::File { track_id, .. } => track_id,
            AudioSourceSpec::Remote { track_id, .. } => track_id,
        }
    }
}

/// Coarse status reported by a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Buffering,
    Completed,
}

/// Event pushed by a player handle.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Status(PlayerStatus),
    Position {
        position: Duration,
        buffered: Duration,
    },
    /// Authoritative duration, reported once the source is probed
    Duration(Duration),
    Error(String),
}

/// One audio player backend.
///
/// Command methods are cheap and non-blocking aside from I/O the backend
/// itself performs; events arrive asynchronously on the subscription.
#[async_trait]
pub trait PlayerHandle: Send + Sync {
    async fn set_source(&self, source: AudioSourceSpec, preload: bool) -> Result<()>;
    async fn play(&self) -> Result<()>;
    async fn pause(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn seek(&self, position: Duration) -> Result<()>;
    async fn set_volume(&self, volume: f64) -> Result<()>;
    async fn set_speed(&self, speed: f64) -> Result<()>;
    /// Loop the current source (LoopMode::One mirrored to the backend).
    async fn set_loop_source(&self, enabled: bool) -> Result<()>;

    fn volume(&self) -> f64;
    fn position(&self) -> Duration;
    fn buffered_position(&self) -> Duration;
    fn duration(&self) -> Option<Duration>;
    fn current_source(&self) -> Option<AudioSourceSpec>;
    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent>;
}

// ===== Simulated player =====

struct SimState {
    source: Option<AudioSourceSpec>,
    status: PlayerStatus,
    position: Duration,
    volume: f64,
    speed: f64,
    loop_source: bool,
    duration: Option<Duration>,
    generation: u64,
}

/// Clock-driven player: advances its position on a timer while playing and
/// reports `Completed` at the end of the source's duration. Durations come
/// from the track table handed to [`SimPlayer::with_durations`].
pub struct SimPlayer {
    state: Arc<Mutex<SimState>>,
    durations: HashMap<String, Duration>,
    events: broadcast::Sender<PlayerEvent>,
    tick: Duration,
}

impl SimPlayer {
    pub fn new() -> Self {
        Self::with_durations(HashMap::new())
    }

    /// `durations` maps track id → playback length; unknown tracks default
    /// to three minutes.
    pub fn with_durations(durations: HashMap<String, Duration>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(SimState {
                source: None,
                status: PlayerStatus::Idle,
                position: Duration::ZERO,
                volume: 1.0,
                speed: 1.0,
                loop_source: false,
                duration: None,
                generation: 0,
            })),
            durations,
            events,
            tick: Duration::from_millis(100),
        }
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    fn spawn_clock(&self, generation: u64) {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let tick = self.tick;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                let event = {
                    let mut s = match state.lock() {
                        Ok(g) => g,
                        Err(p) => p.into_inner(),
                    };
                    if s.generation != generation || s.status != PlayerStatus::Playing {
                        return;
                    }
                    let speed = s.speed.max(0.1);
                    s.position += tick.mul_f64(speed);
                    let duration = s.duration.unwrap_or(Duration::from_secs(180));
                    if s.position >= duration {
                        if s.loop_source {
                            s.position = Duration::ZERO;
                            PlayerEvent::Position {
                                position: Duration::ZERO,
                                buffered: duration,
                            }
                        } else {
                            s.position = duration;
                            s.status = PlayerStatus::Completed;
                            PlayerEvent::Status(PlayerStatus::Completed)
                        }
                    } else {
                        PlayerEvent::Position {
                            position: s.position,
                            buffered: (s.position + Duration::from_secs(10)).min(duration),
                        }
                    }
                };
                let _ = events.send(event);
            }
        });
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

impl Default for SimPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlayerHandle for SimPlayer {
    async fn set_source(&self, source: AudioSourceSpec, _preload: bool) -> Result<()> {
        let duration = self
            .durations
            .get(source.track_id())
            .copied()
            .unwrap_or(Duration::from_secs(180));
        {
            let mut s = self.locked();
            s.generation += 1;
            s.source = Some(source);
            s.status = PlayerStatus::Ready;
            s.position = Duration::ZERO;
            s.duration = Some(duration);
        }
        self.emit(PlayerEvent::Status(PlayerStatus::Ready));
        self.emit(PlayerEvent::Duration(duration));
        Ok(())
    }

    async fn play(&self) -> Result<()> {
        let generation = {
            let mut s = self.locked();
            if s.source.is_none() {
                return Err(PlaybackError::NoSource);
            }
            s.status = PlayerStatus::Playing;
            s.generation += 1;
            s.generation
        };
        self.emit(PlayerEvent::Status(PlayerStatus::Playing));
        self.spawn_clock(generation);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        {
            let mut s = self.locked();
            s.status = PlayerStatus::Paused;
            s.generation += 1;
        }
        self.emit(PlayerEvent::Status(PlayerStatus::Paused));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut s = self.locked();
            s.status = PlayerStatus::Idle;
            s.source = None;
            s.position = Duration::ZERO;
            s.duration = None;
            s.generation += 1;
        }
        self.emit(PlayerEvent::Status(PlayerStatus::Idle));
        Ok(())
    }

    async fn seek(&self, position: Duration) -> Result<()> {
        let (position, buffered) = {
            let mut s = self.locked();
            if s.source.is_none() {
                return Err(PlaybackError::NoSource);
            }
            let duration = s.duration.unwrap_or(Duration::from_secs(180));
            s.position = position.min(duration);
            (s.position, duration)
        };
        self.emit(PlayerEvent::Position {
            position,
            buffered,
        });
        Ok(())
    }

    async fn set_volume(&self, volume: f64) -> Result<()> {
        self.locked().volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    async fn set_speed(&self, speed: f64) -> Result<()> {
        self.locked().speed = speed.clamp(0.25, 3.0);
        Ok(())
    }

    async fn set_loop_source(&self, enabled: bool) -> Result<()> {
        self.locked().loop_source = enabled;
        Ok(())
    }

    fn volume(&self) -> f64 {
        self.locked().volume
    }

    fn position(&self) -> Duration {
        self.locked().position
    }

    fn buffered_position(&self) -> Duration {
        let s = self.locked();
        let duration = s.duration.unwrap_or_default();
        (s.position + Duration::from_secs(10)).min(duration)
    }

    fn duration(&self) -> Option<Duration> {
        self.locked().duration
    }

    fn current_source(&self) -> Option<AudioSourceSpec> {
        self.locked().source.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        debug!("player event subscription opened");
        self.events.subscribe()
    }
}
