//! Observable playback state
//!
//! One value type carries everything a subscriber can see. Equality for
//! emission purposes excludes `position` and `buffered_position`, so the
//! high-frequency position ticks never wake coarse-state subscribers.

use muse_core::{AudioQuality, LoopMode, PlaybackData, SettingsSnapshot, Track};
use std::time::Duration;

/// State of the currently loading/playing slot.
///
/// `Completed → Loading` happens automatically on auto-advance (never in
/// Jams mode); `Error` enables recovery on the next user command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Buffering,
    Completed,
    Error,
}

impl SlotState {
    pub fn is_playing(self) -> bool {
        matches!(self, SlotState::Playing | SlotState::Buffering)
    }
}

/// Full observable playback state.
#[derive(Debug, Clone, Default)]
pub struct PlaybackState {
    pub current_track: Option<Track>,
    pub queue: Vec<Track>,
    pub queue_revision: u64,
    /// `None` iff the queue is empty
    pub current_index: Option<usize>,
    pub slot: SlotState,
    pub is_playing: bool,
    pub is_buffering: bool,
    pub is_loading: bool,
    /// Excluded from coarse equality
    pub position: Duration,
    /// Excluded from coarse equality
    pub buffered_position: Duration,
    pub duration: Option<Duration>,
    pub speed: f64,
    pub loop_mode: LoopMode,
    pub shuffle_enabled: bool,
    /// Most recent recoverable error, cleared by the next successful command
    pub error: Option<String>,
    pub audio_quality: AudioQuality,
    pub current_playback_data: Option<PlaybackData>,
    pub source_id: Option<String>,
    pub is_radio_mode: bool,
    pub is_fetching_radio: bool,
    pub settings: SettingsSnapshot,
}

impl PlaybackState {
    pub fn initial(settings: SettingsSnapshot) -> Self {
        Self {
            speed: 1.0,
            audio_quality: settings.streaming_quality,
            settings,
            ..Default::default()
        }
    }

    /// Equality for emission: everything except the two position fields.
    pub fn coarse_eq(&self, other: &PlaybackState) -> bool {
        self.current_track == other.current_track
            && self.queue == other.queue
            && self.queue_revision == other.queue_revision
            && self.current_index == other.current_index
            && self.slot == other.slot
            && self.is_playing == other.is_playing
            && self.is_buffering == other.is_buffering
            && self.is_loading == other.is_loading
            && self.duration == other.duration
            && self.speed == other.speed
            && self.loop_mode == other.loop_mode
            && self.shuffle_enabled == other.shuffle_enabled
            && self.error == other.error
            && self.audio_quality == other.audio_quality
            && self.current_playback_data == other.current_playback_data
            && self.source_id == other.source_id
            && self.is_radio_mode == other.is_radio_mode
            && self.is_fetching_radio == other.is_fetching_radio
            && self.settings == other.settings
    }

    /// Apply a slot transition, keeping the derived booleans coherent.
    pub fn apply_slot(&mut self, slot: SlotState) {
        self.slot = slot;
        self.is_playing = slot.is_playing();
        self.is_buffering = slot == SlotState::Buffering;
        self.is_loading = slot == SlotState::Loading;
    }
}
