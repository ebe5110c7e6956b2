//! Track metadata

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A single playable track sourced from the streaming provider.
///
/// The `id` is an opaque provider identifier and is the only field used for
/// identity comparisons. Metadata is eagerly populated so the queue never
/// has to touch storage during playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Opaque provider track identifier
    pub id: String,

    /// Track title
    pub title: String,

    /// Artist name
    pub artist: String,

    /// Album name (optional)
    pub album: Option<String>,

    /// Track duration. May be zero until the player reports an
    /// authoritative value; see [`Track::with_duration`].
    #[serde(with = "duration_ms")]
    pub duration: Duration,

    /// Thumbnail / cover art URL (optional)
    pub thumbnail_url: Option<String>,

    /// Path of a fully downloaded local copy, if one exists
    pub local_path: Option<PathBuf>,
}

impl Track {
    /// Returns a copy with the duration replaced.
    ///
    /// This is the single sanctioned mutation of a track: it is applied once
    /// after the active player reports the real duration of the stream.
    pub fn with_duration(&self, duration: Duration) -> Track {
        Track {
            duration,
            ..self.clone()
        }
    }

    /// Whether this track has a usable local file reference.
    pub fn has_local_file(&self) -> bool {
        self.local_path.is_some()
    }
}

/// Serialize `Duration` as integral milliseconds so the persisted queue
/// document stays stable across platforms.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> Track {
        Track {
            id: "t1".to_string(),
            title: "Song".to_string(),
            artist: "Artist".to_string(),
            album: Some("Album".to_string()),
            duration: Duration::from_secs(180),
            thumbnail_url: None,
            local_path: None,
        }
    }

    #[test]
    fn with_duration_replaces_only_duration() {
        let t = track();
        let updated = t.with_duration(Duration::from_secs(200));
        assert_eq!(updated.duration, Duration::from_secs(200));
        assert_eq!(updated.id, t.id);
        assert_eq!(updated.title, t.title);
    }

    #[test]
    fn serde_round_trip_preserves_millis() {
        let mut t = track();
        t.duration = Duration::from_millis(182_450);
        let json = serde_json::to_string(&t).unwrap();
        let back: Track = serde_json::from_str(&json).unwrap();
        assert_eq!(back.duration, Duration::from_millis(182_450));
    }
}
