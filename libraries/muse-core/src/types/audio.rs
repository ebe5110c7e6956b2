//! Stream formats, resolved playback data, and playback enums

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// A concrete audio-only stream format offered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// MIME type, e.g. `audio/webm` or `audio/mp4`
    pub mime_type: String,

    /// Codec string, e.g. `opus` or `mp4a.40.2`
    pub codecs: Option<String>,

    /// Average bitrate in bits per second
    pub bitrate: u32,

    /// Total body length in bytes, when the provider reports one
    pub content_length: Option<u64>,
}

impl AudioFormat {
    /// File extension matching the container, used by the offline library.
    pub fn extension(&self) -> &'static str {
        if self.mime_type.contains("webm") {
            ".opus"
        } else if self.mime_type.contains("mp4") {
            ".m4a"
        } else if self.mime_type.contains("mpeg") {
            ".mp3"
        } else {
            ".audio"
        }
    }

    /// Whether this is an Opus/WebM format (preferred container for offline
    /// storage; see the resolver's selection policy).
    pub fn is_webm_opus(&self) -> bool {
        self.mime_type.contains("webm")
    }
}

/// A resolved, time-limited stream reference for one track.
///
/// Invariant: `expires_at > now` whenever a `PlaybackData` is handed out by
/// the resolver; consumers check [`PlaybackData::is_expired`] before reuse.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackData {
    /// Direct URL of the audio body
    pub stream_url: String,

    /// Selected format for this URL
    pub format: AudioFormat,

    /// Deadline after which the URL must not be used
    pub expires_at: SystemTime,
}

impl PlaybackData {
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }
}

/// Requested streaming quality.
///
/// The resolver maps this to a concrete format selection; `Auto` additionally
/// consults the network type (see `muse-stream`'s selection policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioQuality {
    /// Best quality the current network allows
    #[default]
    Auto,

    /// ~64 kbit/s target
    Low,

    /// ~128 kbit/s target
    Medium,

    /// ~256 kbit/s target
    High,

    /// Highest available bitrate
    Max,
}

impl AudioQuality {
    /// Stable ordinal used by the settings store.
    pub fn ordinal(self) -> u8 {
        match self {
            AudioQuality::Auto => 0,
            AudioQuality::Low => 1,
            AudioQuality::Medium => 2,
            AudioQuality::High => 3,
            AudioQuality::Max => 4,
        }
    }

    /// Inverse of [`AudioQuality::ordinal`]; unknown values fall back to Auto.
    pub fn from_ordinal(v: u8) -> AudioQuality {
        match v {
            1 => AudioQuality::Low,
            2 => AudioQuality::Medium,
            3 => AudioQuality::High,
            4 => AudioQuality::Max,
            _ => AudioQuality::Auto,
        }
    }

    /// Short lowercase name used in cache file stems.
    pub fn name(self) -> &'static str {
        match self {
            AudioQuality::Auto => "auto",
            AudioQuality::Low => "low",
            AudioQuality::Medium => "medium",
            AudioQuality::High => "high",
            AudioQuality::Max => "max",
        }
    }
}

/// Loop mode for the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopMode {
    /// Stop when the queue ends
    #[default]
    Off,

    /// Wrap to the first track after the last
    All,

    /// Repeat the current track
    One,
}
