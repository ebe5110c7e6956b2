//! Stream resolution with URL caching
//!
//! The provider-facing resolver (multi-client fallback, protocol details)
//! lives behind [`TrackEndpointResolver`]; this module owns the policy on
//! top of it: an in-memory cache of unexpired [`PlaybackData`], per-track
//! in-flight deduplication for prefetch batches, and the quality-to-format
//! selection.

use crate::error::ResolveError;
use crate::selection::select_format;
use async_trait::async_trait;
use muse_core::{AudioFormat, AudioQuality, PlaybackData};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, warn};

/// One concrete stream variant offered by the provider.
#[derive(Debug, Clone)]
pub struct StreamFormat {
    /// Direct URL of this variant's audio body
    pub url: String,

    /// Format metadata for the variant
    pub format: AudioFormat,
}

/// Everything the provider returned for one track.
#[derive(Debug, Clone)]
pub struct ResolvedStreams {
    /// Audio-only variants, any order
    pub formats: Vec<StreamFormat>,

    /// Deadline shared by every URL in `formats`
    pub expires_at: SystemTime,
}

/// Provider-side resolver contract.
///
/// Implementations try a sequence of provider clients (web, mobile, TV)
/// until one yields playable URLs; that fallback bookkeeping is theirs.
/// [`TrackEndpointResolver::reset_client_failures`] is invoked after the
/// first success following a fallback so the implementation can return to
/// its preferred client.
#[async_trait]
pub trait TrackEndpointResolver: Send + Sync {
    async fn resolve(&self, track_id: &str) -> Result<ResolvedStreams, ResolveError>;

    fn reset_client_failures(&self) {}
}

/// Caching façade over a [`TrackEndpointResolver`].
pub struct StreamResolver {
    backend: Arc<dyn TrackEndpointResolver>,
    cache: Mutex<HashMap<(String, AudioQuality), PlaybackData>>,
    in_flight: Mutex<HashSet<String>>,
}

impl StreamResolver {
    pub fn new(backend: Arc<dyn TrackEndpointResolver>) -> Self {
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve a playable URL for `(track_id, quality)`.
    ///
    /// Serves from the URL cache when an unexpired entry exists. On an
    /// `ExpiredMidFlight` answer from the backend a single automatic
    /// re-resolve is attempted before the error is surfaced.
    pub async fn resolve(
        &self,
        track_id: &str,
        quality: AudioQuality,
        metered: bool,
    ) -> Result<PlaybackData, ResolveError> {
        if let Some(cached) = self.cached(track_id, quality) {
            return Ok(cached);
        }

        match self.resolve_uncached(track_id, quality, metered).await {
            Err(ResolveError::ExpiredMidFlight(_)) => {
                debug!(track_id, "stream expired mid-flight, re-resolving once");
                self.clear(track_id);
                self.resolve_uncached(track_id, quality, metered).await
            }
            other => other,
        }
    }

    async fn resolve_uncached(
        &self,
        track_id: &str,
        quality: AudioQuality,
        metered: bool,
    ) -> Result<PlaybackData, ResolveError> {
        let streams = self.backend.resolve(track_id).await?;

        let picked = select_format(&streams.formats, quality, metered)
            .ok_or_else(|| ResolveError::Unresolvable(track_id.to_string()))?;

        let data = PlaybackData {
            stream_url: picked.url.clone(),
            format: picked.format.clone(),
            expires_at: streams.expires_at,
        };

        if data.is_expired() {
            return Err(ResolveError::ExpiredMidFlight(track_id.to_string()));
        }

        debug!(
            track_id,
            bitrate = data.format.bitrate,
            mime = %data.format.mime_type,
            "resolved stream"
        );

        // A success lets the backend return to its preferred client after
        // a fallback episode.
        self.backend.reset_client_failures();

        let mut cache = lock(&self.cache);
        cache.insert((track_id.to_string(), quality), data.clone());
        Ok(data)
    }

    /// Fire-and-forget warm-up of the URL cache for upcoming tracks.
    ///
    /// Tracks already cached or already being resolved are skipped; each
    /// remaining id resolves on its own spawned task.
    pub fn prefetch(self: &Arc<Self>, ids: Vec<String>, quality: AudioQuality, metered: bool) {
        for id in ids {
            if self.cached(&id, quality).is_some() {
                continue;
            }
            {
                let mut in_flight = lock(&self.in_flight);
                if !in_flight.insert(id.clone()) {
                    continue;
                }
            }

            let resolver = Arc::clone(self);
            tokio::spawn(async move {
                let result = resolver.resolve(&id, quality, metered).await;
                lock(&resolver.in_flight).remove(&id);
                if let Err(err) = result {
                    warn!(track_id = %id, error = %err, "prefetch resolve failed");
                }
            });
        }
    }

    /// Whether any unexpired entry exists for this track.
    pub fn has_cached(&self, track_id: &str) -> bool {
        let cache = lock(&self.cache);
        cache
            .iter()
            .any(|((id, _), data)| id == track_id && !data.is_expired())
    }

    /// Drop every cached entry for a track.
    pub fn clear(&self, track_id: &str) {
        let mut cache = lock(&self.cache);
        cache.retain(|(id, _), _| id != track_id);
    }

    /// Drop the whole URL cache (quality changes invalidate every entry).
    pub fn clear_all(&self) {
        lock(&self.cache).clear();
    }

    fn cached(&self, track_id: &str, quality: AudioQuality) -> Option<PlaybackData> {
        let mut cache = lock(&self.cache);
        let key = (track_id.to_string(), quality);
        match cache.get(&key) {
            Some(data) if !data.is_expired() => Some(data.clone()),
            Some(_) => {
                cache.remove(&key);
                None
            }
            None => None,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // Cache maps hold plain data; a poisoned lock only means a panicking
    // reader, so the data is still usable.
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
