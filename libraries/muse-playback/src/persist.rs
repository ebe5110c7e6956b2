//! Durable queue persistence
//!
//! Saves `(queue, current_index, position)` to the host key-value store and
//! restores it on startup when the snapshot is fresh enough. Save cadence
//! is decided here (periodic and drift-forced); the controller owns the
//! debounce timer because saves must run on its task.

use async_trait::async_trait;
use muse_core::{KvStore, Track};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Store key of the persisted queue document.
const QUEUE_KEY: &str = "persisted_queue";

/// Store key of the one-shot duration-migration guard.
const MIGRATION_FLAG_KEY: &str = "queue_duration_migration_done";

/// Snapshots older than this are ignored on restore.
pub const RESTORE_TTL: Duration = Duration::from_secs(5 * 60);

/// Minimum interval between periodic saves while playing.
const PERIODIC_INTERVAL: Duration = Duration::from_secs(5);

/// Position drift that forces a save regardless of the interval.
const FORCE_DRIFT: Duration = Duration::from_secs(15);

/// Debounce applied after queue mutations.
pub const DEBOUNCE: Duration = Duration::from_secs(2);

/// External metadata lookup used by the one-shot duration migration.
#[async_trait]
pub trait TrackMetadataProvider: Send + Sync {
    async fn track(&self, track_id: &str) -> Option<Track>;
}

/// On-disk queue document, version 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedQueue {
    pub version: u32,
    pub queue: Vec<Track>,
    /// `-1` encodes an empty queue
    pub current_index: i64,
    pub position_ms: i64,
    pub saved_at_ms: i64,
}

/// A restored snapshot, already TTL-checked and clamped.
#[derive(Debug, Clone)]
pub struct RestoredQueue {
    pub queue: Vec<Track>,
    pub current_index: Option<usize>,
    pub position: Duration,
}

/// Persistence helper owned by the controller task.
pub struct QueuePersistor {
    store: Arc<dyn KvStore>,
    last_periodic: Option<Instant>,
    last_position: Duration,
}

impl QueuePersistor {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            last_periodic: None,
            last_position: Duration::ZERO,
        }
    }

    /// Serialize and write the snapshot immediately.
    pub fn save_now(&mut self, queue: &[Track], current_index: Option<usize>, position: Duration) {
        let doc = PersistedQueue {
            version: 1,
            queue: queue.to_vec(),
            current_index: current_index.map(|i| i as i64).unwrap_or(-1),
            position_ms: position.as_millis() as i64,
            saved_at_ms: epoch_ms(),
        };
        match serde_json::to_value(&doc) {
            Ok(value) => {
                if let Err(e) = self.store.put(QUEUE_KEY, value) {
                    warn!(error = %e, "queue save failed");
                    return;
                }
                self.last_periodic = Some(Instant::now());
                self.last_position = position;
                debug!(
                    tracks = doc.queue.len(),
                    index = doc.current_index,
                    position_ms = doc.position_ms,
                    "queue persisted"
                );
            }
            Err(e) => warn!(error = %e, "queue encode failed"),
        }
    }

    /// Periodic-save decision for position ticks while playing: at most
    /// every five seconds, forced early when the position drifted ≥ 15 s
    /// from the last persisted value (seeks).
    pub fn should_periodic_save(&self, position: Duration) -> bool {
        let drift = if position > self.last_position {
            position - self.last_position
        } else {
            self.last_position - position
        };
        if drift >= FORCE_DRIFT {
            return true;
        }
        match self.last_periodic {
            Some(at) => at.elapsed() >= PERIODIC_INTERVAL,
            None => true,
        }
    }

    /// TTL-gated restore. Returns `None` when nothing usable is stored.
    pub fn load(&self) -> Option<RestoredQueue> {
        let value = self.store.get(QUEUE_KEY).ok().flatten()?;
        let doc: PersistedQueue = match serde_json::from_value(value) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "persisted queue unreadable, ignoring");
                return None;
            }
        };
        if doc.version != 1 {
            warn!(version = doc.version, "unknown persisted queue version");
            return None;
        }

        let age_ms = epoch_ms().saturating_sub(doc.saved_at_ms);
        if age_ms as u128 > RESTORE_TTL.as_millis() {
            info!(age_ms, "persisted queue too old, starting empty");
            return None;
        }

        let current_index = if doc.queue.is_empty() || doc.current_index < 0 {
            None
        } else {
            Some((doc.current_index as usize).min(doc.queue.len() - 1))
        };

        Some(RestoredQueue {
            queue: doc.queue,
            current_index,
            position: Duration::from_millis(doc.position_ms.max(0) as u64),
        })
    }

    /// Whether the one-shot duration migration still needs to run for a
    /// restored current track without a known duration.
    pub fn needs_duration_migration(&self, restored: &RestoredQueue) -> bool {
        let zero_duration = restored
            .current_index
            .and_then(|i| restored.queue.get(i))
            .map(|t| t.duration.is_zero())
            .unwrap_or(false);
        if !zero_duration {
            return false;
        }
        !self
            .store
            .get(MIGRATION_FLAG_KEY)
            .ok()
            .flatten()
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Mark the migration as done; it runs at most once per install.
    pub fn mark_duration_migrated(&self) {
        if let Err(e) = self.store.put(MIGRATION_FLAG_KEY, serde_json::json!(true)) {
            warn!(error = %e, "migration flag write failed");
        }
    }
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
