//! Source builder
//!
//! Turns a queued track into something a player can consume, preferring
//! the cheapest option available: local library file, then cached body,
//! then a direct network stream (with a background precache kicked off so
//! the next play is local).

use crate::error::Result;
use crate::player::AudioSourceSpec;
use muse_core::{Connectivity, PlaybackData, SettingsSnapshot, Track};
use muse_stream::cache::{ByteCache, CacheKey};
use muse_stream::precache::PrecacheScheduler;
use muse_stream::resolver::StreamResolver;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Local files below this size are treated as absent.
const MIN_LOCAL_FILE_BYTES: u64 = 10 * 1024;

/// A source ready to hand to a player.
#[derive(Debug, Clone)]
pub struct BuiltSource {
    pub spec: AudioSourceSpec,
    /// Present whenever the stream resolver was consulted
    pub playback_data: Option<PlaybackData>,
}

/// Builder over the resolver, byte cache, and precacher.
pub struct SourceBuilder {
    resolver: Arc<StreamResolver>,
    cache: Arc<ByteCache>,
    precache: Arc<PrecacheScheduler>,
    connectivity: Arc<dyn Connectivity>,
    settings: watch::Receiver<SettingsSnapshot>,
}

impl SourceBuilder {
    pub fn new(
        resolver: Arc<StreamResolver>,
        cache: Arc<ByteCache>,
        precache: Arc<PrecacheScheduler>,
        connectivity: Arc<dyn Connectivity>,
        settings: watch::Receiver<SettingsSnapshot>,
    ) -> Self {
        Self {
            resolver,
            cache,
            precache,
            connectivity,
            settings,
        }
    }

    /// Build the best available source for `track`.
    pub async fn build(&self, track: &Track) -> Result<BuiltSource> {
        // 1. Offline library file.
        if let Some(path) = &track.local_path {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                if meta.len() >= MIN_LOCAL_FILE_BYTES {
                    debug!(track_id = %track.id, file = %path.display(), "using local file");
                    return Ok(BuiltSource {
                        spec: AudioSourceSpec::File {
                            path: path.clone(),
                            track_id: track.id.clone(),
                        },
                        playback_data: None,
                    });
                }
            }
        }

        // 2. Resolve a stream.
        let settings = *self.settings.borrow();
        let metered = !self.connectivity.link_kind().is_unmetered();
        let data = self
            .resolver
            .resolve(&track.id, settings.streaming_quality, metered)
            .await?;

        // 3. Cached body.
        let key = CacheKey::new(&track.id, settings.streaming_quality, data.format.bitrate);
        if let Ok(Some(path)) = self
            .cache
            .open_for_read(&key, data.format.content_length)
            .await
        {
            debug!(track_id = %track.id, "serving from byte cache");
            return Ok(BuiltSource {
                spec: AudioSourceSpec::File {
                    path,
                    track_id: track.id.clone(),
                },
                playback_data: Some(data),
            });
        }

        // 4. Direct stream, with a background fill of the cache.
        self.precache.schedule_ahead(std::slice::from_ref(track));
        Ok(BuiltSource {
            spec: AudioSourceSpec::Remote {
                url: data.stream_url.clone(),
                track_id: track.id.clone(),
            },
            playback_data: Some(data),
        })
    }

    /// Direct-stream source, bypassing local files and the byte cache.
    ///
    /// Used after the platform rejects loopback/proxy sources: playback
    /// pins to the network URL while the precacher keeps filling the cache
    /// for future sessions.
    pub async fn build_direct(&self, track: &Track) -> Result<BuiltSource> {
        let settings = *self.settings.borrow();
        let metered = !self.connectivity.link_kind().is_unmetered();
        let data = self
            .resolver
            .resolve(&track.id, settings.streaming_quality, metered)
            .await?;
        self.precache.schedule_ahead(std::slice::from_ref(track));
        Ok(BuiltSource {
            spec: AudioSourceSpec::Remote {
                url: data.stream_url.clone(),
                track_id: track.id.clone(),
            },
            playback_data: Some(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use muse_core::connectivity::FixedConnectivity;
    use muse_core::{AudioFormat, LinkKind};
    use muse_stream::downloader::Downloader;
    use muse_stream::error::ResolveError;
    use muse_stream::resolver::{ResolvedStreams, StreamFormat, TrackEndpointResolver};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct FixedBackend;

    #[async_trait]
    impl TrackEndpointResolver for FixedBackend {
        async fn resolve(&self, track_id: &str) -> std::result::Result<ResolvedStreams, ResolveError> {
            Ok(ResolvedStreams {
                formats: vec![StreamFormat {
                    url: format!("https://example.test/{track_id}"),
                    format: AudioFormat {
                        mime_type: "audio/webm".to_string(),
                        codecs: Some("opus".to_string()),
                        bitrate: 128_000,
                        content_length: Some(1_000_000),
                    },
                }],
                expires_at: SystemTime::now() + Duration::from_secs(600),
            })
        }
    }

    fn builder(dir: &TempDir) -> (SourceBuilder, Arc<ByteCache>) {
        let cache = Arc::new(ByteCache::open(dir.path()).unwrap());
        let resolver = Arc::new(StreamResolver::new(Arc::new(FixedBackend)));
        let (_tx, settings) = watch::channel(SettingsSnapshot::default());
        let connectivity: Arc<dyn Connectivity> = Arc::new(FixedConnectivity(LinkKind::Wifi));
        let precache = Arc::new(PrecacheScheduler::new(
            Arc::clone(&cache),
            Arc::clone(&resolver),
            Downloader::new(reqwest::Client::new()),
            Arc::clone(&connectivity),
            settings.clone(),
        ));
        (
            SourceBuilder::new(resolver, Arc::clone(&cache), precache, connectivity, settings),
            cache,
        )
    }

    fn track(id: &str) -> Track {
        Track {
            id: id.to_string(),
            title: format!("Track {id}"),
            artist: "Artist".to_string(),
            album: None,
            duration: Duration::from_secs(180),
            thumbnail_url: None,
            local_path: None,
        }
    }

    #[tokio::test]
    async fn local_file_wins_when_large_enough() {
        let dir = TempDir::new().unwrap();
        let (builder, _cache) = builder(&dir);

        let local = dir.path().join("song.opus");
        tokio::fs::write(&local, vec![0u8; 20 * 1024]).await.unwrap();
        let mut t = track("t1");
        t.local_path = Some(local.clone());

        let built = builder.build(&t).await.unwrap();
        assert!(matches!(
            built.spec,
            AudioSourceSpec::File { ref path, .. } if *path == local
        ));
        assert!(built.playback_data.is_none());
    }

    #[tokio::test]
    async fn tiny_local_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let (builder, _cache) = builder(&dir);

        let local = dir.path().join("stub.opus");
        tokio::fs::write(&local, vec![0u8; 512]).await.unwrap();
        let mut t = track("t1");
        t.local_path = Some(local);

        let built = builder.build(&t).await.unwrap();
        assert!(matches!(built.spec, AudioSourceSpec::Remote { .. }));
        assert!(built.playback_data.is_some());
    }

    #[tokio::test]
    async fn cached_body_is_preferred_over_network() {
        let dir = TempDir::new().unwrap();
        let (builder, cache) = builder(&dir);

        // Commit a body under the key the resolver will produce.
        let key = CacheKey::new("t1", muse_core::AudioQuality::Auto, 128_000);
        let slot = cache.try_reserve_write(&key).unwrap();
        tokio::fs::write(slot.temp_path(), vec![0u8; 1_000_000])
            .await
            .unwrap();
        cache
            .commit(slot, 1_000_000, Some(1_000_000), "audio/webm")
            .await
            .unwrap();

        let built = builder.build(&track("t1")).await.unwrap();
        assert!(matches!(built.spec, AudioSourceSpec::File { .. }));
        assert!(built.playback_data.is_some());
    }

    #[tokio::test]
    async fn cache_miss_falls_back_to_direct_stream() {
        let dir = TempDir::new().unwrap();
        let (builder, _cache) = builder(&dir);

        let built = builder.build(&track("t1")).await.unwrap();
        match built.spec {
            AudioSourceSpec::Remote { url, track_id } => {
                assert_eq!(url, "https://example.test/t1");
                assert_eq!(track_id, "t1");
            }
            other => panic!("expected remote source, got {other:?}"),
        }
    }
}
