//! Muse Player - Streaming Cache
//!
//! Stream resolution and the on-disk byte cache for Muse Player:
//! - URL resolution with caching and prefetch ([`resolver`])
//! - Quality-to-format selection policy ([`selection`])
//! - LRU-bounded byte cache of downloaded audio bodies ([`cache`])
//! - Segmented/range-continuation downloader ([`downloader`])
//! - Background precache of upcoming queue tracks ([`precache`])
//! - Offline library download pipeline ([`library`])
//!
//! The provider protocol itself (client fallback, signatures) stays behind
//! the [`resolver::TrackEndpointResolver`] trait; everything in this crate
//! works against plain HTTPS bodies.

pub mod cache;
pub mod downloader;
pub mod error;
pub mod fs;
pub mod library;
pub mod net;
pub mod precache;
pub mod resolver;
pub mod selection;
pub mod validate;

pub use cache::{ByteCache, CacheKey, WriteSlot, MIN_VALID_BYTES};
pub use downloader::{CancelFlag, DownloadOptions, Downloader};
pub use error::{CacheError, DownloadError, ResolveError};
pub use library::{DownloadStatus, DownloadTask, OfflineLibrary};
pub use precache::PrecacheScheduler;
pub use resolver::{ResolvedStreams, StreamFormat, StreamResolver, TrackEndpointResolver};
