//! Muse Player - Core Types
//!
//! Platform-agnostic domain types shared by the streaming cache and the
//! playback engine:
//! - Track, stream format, and resolved playback data
//! - Audio quality and loop mode enums
//! - Typed settings snapshot with range clamping
//! - Generic persistent key-value store contract
//! - Connectivity probe contract (Wi-Fi-only policies)
//! - Filename sanitisation shared by the cache and the offline library
//!
//! This crate has no network, audio, or async dependencies. Anything
//! platform-specific (stream resolution, audio output, persistence backends)
//! is provided via traits.

pub mod connectivity;
pub mod kv;
pub mod sanitize;
pub mod settings;
pub mod types;

pub use connectivity::{Connectivity, LinkKind};
pub use kv::{KvError, KvStore, MemoryKvStore};
pub use sanitize::sanitize_filename;
pub use settings::SettingsSnapshot;
pub use types::{AudioFormat, AudioQuality, LoopMode, PlaybackData, Track};
