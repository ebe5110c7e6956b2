//! Muse Player - Playback Orchestration
//!
//! The playback core of Muse Player:
//! - Queue model with shuffle, loop modes, and a monotonic revision counter
//! - Dual-player engine with hard switches and equal-power crossfades
//! - Source builder (local file → cached body → direct stream)
//! - Radio auto-extension of near-empty queues
//! - Durable queue persistence with TTL-gated restore
//! - The [`PlaybackController`] façade that owns all of the above
//!
//! # Architecture
//!
//! Everything mutable lives on a single controller task: commands arrive on
//! a channel, player events from both handles arrive on the same loop, and
//! subscribers observe consistent snapshots through watch/broadcast
//! channels. Platform audio output is behind the [`PlayerHandle`] trait;
//! [`player::SimPlayer`] ships as a clock-driven implementation for tests
//! and headless use.

pub mod controller;
pub mod engine;
pub mod error;
pub mod persist;
pub mod player;
pub mod queue;
pub mod radio;
pub mod source;
pub mod state;

pub use controller::{ControllerConfig, PlaybackController};
pub use engine::{DualPlayerEngine, OverlapParams};
pub use error::{PlaybackError, Result};
pub use persist::{PersistedQueue, QueuePersistor, RestoredQueue, TrackMetadataProvider};
pub use player::{AudioSourceSpec, PlayerEvent, PlayerHandle, PlayerStatus, SimPlayer};
pub use queue::QueueModel;
pub use radio::{RadioExtender, RelatedTracksProvider};
pub use source::{BuiltSource, SourceBuilder};
pub use state::{PlaybackState, SlotState};
