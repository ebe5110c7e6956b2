//! Radio queue extension
//!
//! In radio mode the queue auto-extends with related tracks as it nears
//! exhaustion. The extender tracks every id it has ever offered so repeats
//! never come back, rotates its seed through the tail of the queue for
//! variety, and falls back to a fresh mid-queue seed when a whole batch
//! turned out to be duplicates.

use async_trait::async_trait;
use muse_core::Track;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashSet;
use tracing::debug;

/// Queue length (after the current track) at or below which an extension
/// is requested.
pub const EXTEND_THRESHOLD: usize = 5;

/// Most related tracks requested per extension.
pub const BATCH_LIMIT: usize = 25;

/// Fraction of the queue tail the rotating seed is drawn from.
const SEED_WINDOW_FRACTION: f64 = 0.3;

/// External recommender contract.
#[async_trait]
pub trait RelatedTracksProvider: Send + Sync {
    /// Up to `limit` tracks related to `seed_track_id`.
    async fn related(&self, seed_track_id: &str, limit: usize) -> Vec<Track>;
}

/// State machine for radio extension. All methods are synchronous; the
/// controller owns the actual provider call.
#[derive(Debug, Default)]
pub struct RadioExtender {
    active: bool,
    seen: HashSet<String>,
    fetch_count: u32,
    source_id: Option<String>,
}

impl RadioExtender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm radio mode around an initial track.
    pub fn activate(&mut self, seed: &Track) {
        self.active = true;
        self.seen.clear();
        self.seen.insert(seed.id.clone());
        self.fetch_count = 0;
        self.source_id = Some(seed.id.clone());
    }

    pub fn deactivate(&mut self) {
        self.active = false;
        self.seen.clear();
        self.fetch_count = 0;
        self.source_id = None;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current seed id (changes when batches keep coming back duplicated).
    pub fn source_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    /// Whether the queue has drained far enough to extend.
    pub fn should_extend(&self, remaining_after_current: usize, already_fetching: bool) -> bool {
        self.active && !already_fetching && remaining_after_current <= EXTEND_THRESHOLD
    }

    /// Pick the seed for the next fetch.
    ///
    /// The first fetch uses the initial seed; later fetches rotate through
    /// the last 30% of the queue, stepped by the fetch counter.
    pub fn pick_seed(&mut self, queue: &[Track]) -> Option<String> {
        let seed = if self.fetch_count == 0 || queue.is_empty() {
            self.source_id.clone()
        } else {
            let window = ((queue.len() as f64 * SEED_WINDOW_FRACTION).ceil() as usize).max(1);
            let start = queue.len() - window;
            let offset = (self.fetch_count as usize) % window;
            queue.get(start + offset).map(|t| t.id.clone())
        };
        self.fetch_count += 1;
        seed
    }

    /// Filter a fetched batch down to tracks the queue has never seen,
    /// recording every survivor. Rotates `source_id` into the new batch;
    /// when everything was a duplicate, a random mid-queue track becomes
    /// the next seed instead.
    pub fn absorb_batch(&mut self, queue: &[Track], fetched: Vec<Track>) -> Vec<Track> {
        let queue_ids: HashSet<&str> = queue.iter().map(|t| t.id.as_str()).collect();
        let fresh: Vec<Track> = fetched
            .into_iter()
            .filter(|t| !queue_ids.contains(t.id.as_str()) && !self.seen.contains(&t.id))
            .collect();

        for t in &fresh {
            self.seen.insert(t.id.clone());
        }

        if fresh.is_empty() {
            // Everything duplicated: reseed from the middle of the queue so
            // the next fetch explores a different neighborhood.
            let mid_start = queue.len() / 3;
            let mid = &queue[mid_start..(queue.len() * 2 / 3).max(mid_start + 1).min(queue.len())];
            if let Some(pick) = mid.choose(&mut thread_rng()) {
                debug!(seed = %pick.id, "radio batch fully duplicated, reseeding");
                self.source_id = Some(pick.id.clone());
            }
        } else if let Some(pick) = fresh.choose(&mut thread_rng()) {
            self.source_id = Some(pick.id.clone());
        }

        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

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

    fn tracks(n: usize) -> Vec<Track> {
        (0..n).map(|i| track(&format!("q{i}"))).collect()
    }

    #[test]
    fn threshold_gates_extension() {
        let mut radio = RadioExtender::new();
        assert!(!radio.should_extend(0, false));

        radio.activate(&track("seed"));
        assert!(radio.should_extend(5, false));
        assert!(radio.should_extend(0, false));
        assert!(!radio.should_extend(6, false));
        assert!(!radio.should_extend(3, true));
    }

    #[test]
    fn first_seed_is_the_initial_track() {
        let mut radio = RadioExtender::new();
        radio.activate(&track("seed"));
        let queue = tracks(10);
        assert_eq!(radio.pick_seed(&queue), Some("seed".to_string()));
    }

    #[test]
    fn later_seeds_rotate_through_the_tail() {
        let mut radio = RadioExtender::new();
        radio.activate(&track("seed"));
        let queue = tracks(10);

        let _ = radio.pick_seed(&queue);
        // Window = last 3 of 10; rotation steps through q7, q8, q9.
        let s1 = radio.pick_seed(&queue).unwrap();
        let s2 = radio.pick_seed(&queue).unwrap();
        let s3 = radio.pick_seed(&queue).unwrap();
        assert_eq!(s1, "q8");
        assert_eq!(s2, "q9");
        assert_eq!(s3, "q7");
    }

    #[test]
    fn absorb_filters_queue_and_history_duplicates() {
        let mut radio = RadioExtender::new();
        radio.activate(&track("seed"));
        let queue = tracks(6);

        let batch = vec![track("q2"), track("seed"), track("new1"), track("new2")];
        let fresh = radio.absorb_batch(&queue, batch);
        let fresh_ids: Vec<_> = fresh.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(fresh_ids, vec!["new1", "new2"]);

        // Once absorbed, the same tracks never survive again.
        let again = radio.absorb_batch(&queue, vec![track("new1")]);
        assert!(again.is_empty());
    }

    #[test]
    fn source_id_rotates_into_new_batches() {
        let mut radio = RadioExtender::new();
        radio.activate(&track("seed"));
        let queue = tracks(6);

        let fresh = radio.absorb_batch(&queue, vec![track("n1"), track("n2")]);
        assert!(!fresh.is_empty());
        let sid = radio.source_id().unwrap().to_string();
        assert!(sid == "n1" || sid == "n2");
    }

    #[test]
    fn all_duplicates_reseed_from_mid_queue() {
        let mut radio = RadioExtender::new();
        radio.activate(&track("seed"));
        let queue = tracks(9);

        let fresh = radio.absorb_batch(&queue, vec![track("q0"), track("q1")]);
        assert!(fresh.is_empty());
        let sid = radio.source_id().unwrap();
        assert_ne!(sid, "seed");
        assert!(sid.starts_with('q'));
    }
}
