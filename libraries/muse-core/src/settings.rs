//! Typed settings snapshot
//!
//! The host persists settings in a [`KvStore`]; this module owns the key
//! names, defaults, and range clamping so every consumer sees the same
//! values. A snapshot is a plain value type: the controller reloads it on
//! change notifications and hands copies to the schedulers.

use crate::kv::{KvError, KvStore};
use crate::types::AudioQuality;
use serde::{Deserialize, Serialize};
use serde_json::json;

mod keys {
    pub const STREAMING_QUALITY: &str = "streaming_quality";
    pub const CACHE_WIFI_ONLY: &str = "stream_cache_wifi_only";
    pub const CACHE_SIZE_LIMIT_MB: &str = "stream_cache_size_limit_mb";
    pub const CACHE_MAX_CONCURRENT: &str = "stream_cache_max_concurrent";
    pub const CROSSFADE_DURATION_MS: &str = "crossfade_duration_ms";
    pub const DOWNLOAD_QUALITY: &str = "download_quality";
    pub const DOWNLOAD_PART_COUNT: &str = "download_parallel_part_count";
    pub const DOWNLOAD_PARALLEL_MIN_MB: &str = "download_parallel_min_size_mb";
}

/// Immutable view of all playback/cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    /// Streaming quality selection
    pub streaming_quality: AudioQuality,

    /// Only precache over Wi-Fi / Ethernet
    pub cache_wifi_only: bool,

    /// On-disk byte cache limit, MiB, clamped to [128, 4096]
    pub cache_size_limit_mb: u32,

    /// Precache worker cap, clamped to [1, 4]
    pub cache_max_concurrent: u8,

    /// Crossfade duration, ms, clamped to [0, 12000]; 0 disables crossfade
    pub crossfade_duration_ms: u32,

    /// Offline download quality
    pub download_quality: AudioQuality,

    /// Parallel byte-range parts per download, clamped to [2, 8]
    pub download_part_count: u8,

    /// Minimum body size for parallel download, MiB, clamped to [1, 32]
    pub download_parallel_min_mb: u8,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            streaming_quality: AudioQuality::Auto,
            cache_wifi_only: false,
            cache_size_limit_mb: 1024,
            cache_max_concurrent: 2,
            crossfade_duration_ms: 0,
            download_quality: AudioQuality::High,
            download_part_count: 4,
            download_parallel_min_mb: 1,
        }
    }
}

impl SettingsSnapshot {
    /// Load a snapshot from the store, applying defaults for missing keys
    /// and clamping out-of-range values.
    pub fn load(store: &dyn KvStore) -> Result<SettingsSnapshot, KvError> {
        let defaults = SettingsSnapshot::default();

        let get_u64 = |key: &str| -> Result<Option<u64>, KvError> {
            Ok(store.get(key)?.and_then(|v| v.as_u64()))
        };
        let get_bool = |key: &str| -> Result<Option<bool>, KvError> {
            Ok(store.get(key)?.and_then(|v| v.as_bool()))
        };

        Ok(SettingsSnapshot {
            streaming_quality: get_u64(keys::STREAMING_QUALITY)?
                .map(|v| AudioQuality::from_ordinal(v as u8))
                .unwrap_or(defaults.streaming_quality),
            cache_wifi_only: get_bool(keys::CACHE_WIFI_ONLY)?.unwrap_or(defaults.cache_wifi_only),
            cache_size_limit_mb: get_u64(keys::CACHE_SIZE_LIMIT_MB)?
                .map(|v| (v as u32).clamp(128, 4096))
                .unwrap_or(defaults.cache_size_limit_mb),
            cache_max_concurrent: get_u64(keys::CACHE_MAX_CONCURRENT)?
                .map(|v| (v as u8).clamp(1, 4))
                .unwrap_or(defaults.cache_max_concurrent),
            crossfade_duration_ms: get_u64(keys::CROSSFADE_DURATION_MS)?
                .map(|v| (v as u32).min(12_000))
                .unwrap_or(defaults.crossfade_duration_ms),
            download_quality: get_u64(keys::DOWNLOAD_QUALITY)?
                .map(|v| AudioQuality::from_ordinal(v as u8))
                .unwrap_or(defaults.download_quality),
            download_part_count: get_u64(keys::DOWNLOAD_PART_COUNT)?
                .map(|v| (v as u8).clamp(2, 8))
                .unwrap_or(defaults.download_part_count),
            download_parallel_min_mb: get_u64(keys::DOWNLOAD_PARALLEL_MIN_MB)?
                .map(|v| (v as u8).clamp(1, 32))
                .unwrap_or(defaults.download_parallel_min_mb),
        })
    }

    /// Write every key of this snapshot back to the store.
    pub fn store(&self, store: &dyn KvStore) -> Result<(), KvError> {
        store.put(
            keys::STREAMING_QUALITY,
            json!(self.streaming_quality.ordinal()),
        )?;
        store.put(keys::CACHE_WIFI_ONLY, json!(self.cache_wifi_only))?;
        store.put(keys::CACHE_SIZE_LIMIT_MB, json!(self.cache_size_limit_mb))?;
        store.put(
            keys::CACHE_MAX_CONCURRENT,
            json!(self.cache_max_concurrent),
        )?;
        store.put(
            keys::CROSSFADE_DURATION_MS,
            json!(self.crossfade_duration_ms),
        )?;
        store.put(
            keys::DOWNLOAD_QUALITY,
            json!(self.download_quality.ordinal()),
        )?;
        store.put(keys::DOWNLOAD_PART_COUNT, json!(self.download_part_count))?;
        store.put(
            keys::DOWNLOAD_PARALLEL_MIN_MB,
            json!(self.download_parallel_min_mb),
        )?;
        Ok(())
    }

    /// Byte cache limit in bytes.
    pub fn cache_limit_bytes(&self) -> u64 {
        self.cache_size_limit_mb as u64 * 1024 * 1024
    }

    /// Parallel download threshold in bytes.
    pub fn parallel_min_bytes(&self) -> u64 {
        self.download_parallel_min_mb as u64 * 1024 * 1024
    }
}
