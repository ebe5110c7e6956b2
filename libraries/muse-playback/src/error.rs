//! Error types for playback orchestration

use thiserror::Error;

/// Playback errors.
///
/// `NoSource` and `QueueEmpty` are silent no-ops at the controller surface;
/// everything else lands on `PlaybackState::error` and clears on the next
/// successful command.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// No source is attached to the active player
    #[error("no source attached")]
    NoSource,

    /// Queue is empty
    #[error("queue is empty")]
    QueueEmpty,

    /// The platform refuses cleartext loopback sources; proxy-based
    /// caching is disabled for the rest of the process
    #[error("cleartext loopback blocked by platform")]
    CleartextLoopbackBlocked,

    /// The audio backend refused a command
    #[error("audio backend refused: {0}")]
    BackendRefused(String),

    /// Stream resolution failed
    #[error(transparent)]
    Resolve(#[from] muse_stream::error::ResolveError),

    /// Byte cache failure during startup
    #[error(transparent)]
    Cache(#[from] muse_stream::error::CacheError),

    /// Controller task is gone
    #[error("playback controller has shut down")]
    ControllerClosed,
}

/// Result type for playback operations.
pub type Result<T> = std::result::Result<T, PlaybackError>;
