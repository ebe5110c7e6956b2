//! Queue model
//!
//! Holds the play queue, the pre-shuffle order, the current index, and a
//! monotonic revision counter. Every mutation bumps the revision so
//! subscribers can match emitted state to a queue snapshot.

use muse_core::{LoopMode, Track};
use rand::seq::SliceRandom;
use rand::thread_rng;

/// The play queue and its navigation state.
///
/// Invariants:
/// - `current_index` is `None` iff the queue is empty
/// - `queue.len() == original_order.len()` outside of install/append
/// - `revision` strictly increases across mutations
#[derive(Debug, Default)]
pub struct QueueModel {
    queue: Vec<Track>,
    original_order: Vec<Track>,
    current_index: Option<usize>,
    shuffle_enabled: bool,
    loop_mode: LoopMode,
    source_id: Option<String>,
    revision: u64,
}

impl QueueModel {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Accessors =====

    pub fn tracks(&self) -> &[Track] {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current_index.and_then(|i| self.queue.get(i))
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn shuffle_enabled(&self) -> bool {
        self.shuffle_enabled
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn source_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    /// Tracks after the current index, in play order.
    pub fn upcoming(&self) -> &[Track] {
        match self.current_index {
            Some(i) if i + 1 < self.queue.len() => &self.queue[i + 1..],
            _ => &[],
        }
    }

    /// Number of tracks left after the current one.
    pub fn remaining_after_current(&self) -> usize {
        self.upcoming().len()
    }

    // ===== Mutations =====

    /// Replace the queue. `start_index` is clamped into the new queue.
    pub fn install(&mut self, tracks: Vec<Track>, start_index: usize, source_id: Option<String>) {
        self.original_order = tracks.clone();
        self.queue = tracks;
        self.current_index = if self.queue.is_empty() {
            None
        } else {
            Some(start_index.min(self.queue.len() - 1))
        };
        self.shuffle_enabled = false;
        self.source_id = source_id;
        self.bump();
    }

    /// Append tracks to the end of both orders.
    pub fn append(&mut self, tracks: Vec<Track>) {
        if tracks.is_empty() {
            return;
        }
        self.original_order.extend(tracks.iter().cloned());
        self.queue.extend(tracks);
        if self.current_index.is_none() {
            self.current_index = Some(0);
        }
        self.bump();
    }

    /// Insert a track immediately after the current one.
    pub fn insert_next(&mut self, track: Track) {
        match self.current_index {
            Some(i) => {
                self.queue.insert(i + 1, track.clone());
                // Keep the original order aligned by inserting after the
                // current track's position there as well.
                let pos = self
                    .current_track_id()
                    .and_then(|id| self.original_order.iter().position(|t| t.id == id))
                    .map(|p| p + 1)
                    .unwrap_or(self.original_order.len());
                self.original_order.insert(pos, track);
            }
            None => {
                self.queue.push(track.clone());
                self.original_order.push(track);
                self.current_index = Some(0);
            }
        }
        self.bump();
    }

    /// Remove the track at `index`. Returns it when the index was valid.
    pub fn remove_at(&mut self, index: usize) -> Option<Track> {
        if index >= self.queue.len() {
            return None;
        }
        let removed = self.queue.remove(index);
        if let Some(pos) = self.original_order.iter().position(|t| t.id == removed.id) {
            self.original_order.remove(pos);
        }

        self.current_index = match self.current_index {
            None => None,
            Some(_) if self.queue.is_empty() => None,
            Some(cur) if index < cur => Some(cur - 1),
            Some(cur) => Some(cur.min(self.queue.len() - 1)),
        };
        self.bump();
        Some(removed)
    }

    /// Move the track at `old_index` to `new_index`.
    pub fn reorder(&mut self, old_index: usize, new_index: usize) -> bool {
        let len = self.queue.len();
        if old_index >= len || new_index >= len {
            return false;
        }
        if old_index == new_index {
            return true;
        }

        let current_id = self.current_track_id();
        let track = self.queue.remove(old_index);
        self.queue.insert(new_index, track);

        // Current follows its track, wherever it moved.
        if let Some(id) = current_id {
            self.current_index = self.queue.iter().position(|t| t.id == id);
        }
        self.bump();
        true
    }

    /// Jump directly to `index`.
    pub fn skip_to(&mut self, index: usize) -> Option<&Track> {
        if index >= self.queue.len() {
            return None;
        }
        self.current_index = Some(index);
        self.bump();
        self.queue.get(index)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.original_order.clear();
        self.current_index = None;
        self.shuffle_enabled = false;
        self.source_id = None;
        self.bump();
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        if self.loop_mode != mode {
            self.loop_mode = mode;
            self.bump();
        }
    }

    /// Replace the current track in place (authoritative duration update).
    pub fn replace_current(&mut self, track: Track) {
        if let Some(i) = self.current_index {
            if let Some(slot) = self.queue.get_mut(i) {
                if slot.id == track.id {
                    *slot = track.clone();
                }
            }
            if let Some(orig) = self.original_order.iter_mut().find(|t| t.id == track.id) {
                *orig = track;
            }
            self.bump();
        }
    }

    // ===== Skip targets =====

    /// Index that `skip_to_next` would move to, honoring LoopMode::All
    /// wrap. `None` means no-op.
    pub fn next_index(&self) -> Option<usize> {
        let cur = self.current_index?;
        if cur + 1 < self.queue.len() {
            Some(cur + 1)
        } else if self.loop_mode == LoopMode::All && !self.queue.is_empty() {
            Some(0)
        } else {
            None
        }
    }

    /// Index that `skip_to_previous` would move to when the position rule
    /// does not apply. Symmetric to [`QueueModel::next_index`].
    pub fn prev_index(&self) -> Option<usize> {
        let cur = self.current_index?;
        if cur > 0 {
            Some(cur - 1)
        } else if self.loop_mode == LoopMode::All && !self.queue.is_empty() {
            Some(self.queue.len() - 1)
        } else {
            None
        }
    }

    // ===== Shuffle =====

    /// Fisher–Yates shuffle of the queue. The current track is moved to
    /// position 0 so playback continues uninterrupted.
    pub fn enable_shuffle(&mut self) {
        if self.shuffle_enabled || self.queue.len() < 2 {
            self.shuffle_enabled = true;
            self.bump();
            return;
        }

        let keep_id = self.current_track_id();
        self.queue.shuffle(&mut thread_rng());

        if let Some(id) = keep_id {
            if let Some(pos) = self.queue.iter().position(|t| t.id == id) {
                self.queue.swap(0, pos);
            }
            self.current_index = Some(0);
        }
        self.shuffle_enabled = true;
        self.bump();
    }

    /// Restore the pre-shuffle order, relocating the current track by
    /// identity (clamped to 0 when it is gone).
    pub fn disable_shuffle(&mut self) {
        let keep_id = self.current_track_id();
        self.queue = self.original_order.clone();
        self.current_index = match keep_id {
            Some(id) => Some(
                self.queue
                    .iter()
                    .position(|t| t.id == id)
                    .unwrap_or(0),
            ),
            None => {
                if self.queue.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
        };
        self.shuffle_enabled = false;
        self.bump();
    }

    fn current_track_id(&self) -> Option<String> {
        self.current_track().map(|t| t.id.clone())
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}
