//! Dual-player engine
//!
//! Owns two player handles. Exactly one is active at any time; the other
//! pre-loads the next track. Transitions are either a hard switch (stop,
//! attach, play) or an overlap crossfade: the standby player starts nearly
//! silent, the active slot swaps atomically, and an equal-power ramp trades
//! the gains before the outgoing player stops.

use crate::error::Result;
use crate::player::{AudioSourceSpec, PlayerHandle};
use muse_core::LoopMode;
use std::f64::consts::FRAC_PI_2;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Ramp step count for the equal-power fade.
const RAMP_STEPS: u32 = 24;

/// Bounds on a single ramp step.
const MIN_STEP: Duration = Duration::from_millis(10);
const MAX_STEP: Duration = Duration::from_millis(500);

/// Timeout on every volume write during a fade.
const VOLUME_WRITE_TIMEOUT: Duration = Duration::from_millis(1200);

/// Near-silent volume the incoming player warms up at.
const WARMUP_VOLUME: f64 = 0.12;

/// Buffer warm-up pause between starting the incoming player and ramping.
const WARMUP_DELAY: Duration = Duration::from_millis(90);

/// Settlement re-assertion schedule after the ramp.
const SETTLE_DELAYS_MS: [u64; 5] = [0, 120, 320, 700, 1400];

/// Floor below which the anti-stall check re-asserts full volume.
const ANTI_STALL_FLOOR: f64 = 0.95;

/// Rate limit on anti-stall re-assertions.
const ANTI_STALL_INTERVAL: Duration = Duration::from_millis(800);

/// Earliest trigger margin before the end of the track.
const TRIGGER_FLOOR: Duration = Duration::from_millis(300);

/// Extra margin added to the crossfade duration for the trigger window.
const TRIGGER_MARGIN: Duration = Duration::from_millis(120);

/// Parameters the incoming player must match before the swap.
#[derive(Debug, Clone, Copy)]
pub struct OverlapParams {
    pub crossfade: Duration,
    pub loop_mode: LoopMode,
    pub speed: f64,
}

/// The two-player transition engine.
pub struct DualPlayerEngine {
    players: [Arc<dyn PlayerHandle>; 2],
    active: AtomicUsize,
    crossfading: Arc<AtomicBool>,
    /// Set when the active source begins (or fails to begin) its fade and
    /// cleared when a new source is attached, so one source fires the
    /// trigger at most once
    fade_latched: AtomicBool,
    last_anti_stall: Mutex<Instant>,
}

impl DualPlayerEngine {
    pub fn new(primary: Arc<dyn PlayerHandle>, secondary: Arc<dyn PlayerHandle>) -> Self {
        Self {
            players: [primary, secondary],
            active: AtomicUsize::new(0),
            crossfading: Arc::new(AtomicBool::new(false)),
            fade_latched: AtomicBool::new(false),
            last_anti_stall: Mutex::new(
                Instant::now()
                    .checked_sub(ANTI_STALL_INTERVAL)
                    .unwrap_or_else(Instant::now),
            ),
        }
    }

    /// The player currently producing audio.
    pub fn active_player(&self) -> Arc<dyn PlayerHandle> {
        Arc::clone(&self.players[self.active_index()])
    }

    /// The standby player used for pre-loading.
    pub fn standby_player(&self) -> Arc<dyn PlayerHandle> {
        Arc::clone(&self.players[1 - self.active_index()])
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_crossfading(&self) -> bool {
        self.crossfading.load(Ordering::Acquire)
    }

    // ===== Hard switch =====

    /// Stop the standby player, attach the source to the active player,
    /// and start playback. Used on first load and whenever crossfade is
    /// disabled.
    pub async fn hard_switch(&self, source: AudioSourceSpec) -> Result<()> {
        debug!(track_id = %source.track_id(), "hard switch");
        let standby = self.standby_player();
        if let Err(e) = standby.stop().await {
            warn!(error = %e, "standby stop failed before hard switch");
        }
        self.fade_latched.store(false, Ordering::Release);

        let active = self.active_player();
        active.set_source(source, true).await?;
        active.play().await
    }

    /// Attach a source to the active player without starting playback
    /// (queue restore).
    pub async fn load_only(&self, source: AudioSourceSpec) -> Result<()> {
        let standby = self.standby_player();
        let _ = standby.stop().await;
        self.fade_latched.store(false, Ordering::Release);
        self.active_player().set_source(source, true).await
    }

    // ===== Overlap crossfade =====

    /// Trigger decision, evaluated on every active-player position tick.
    ///
    /// Never fires with crossfade disabled, in Jams mode, under
    /// `LoopMode::One`, while a fade is running, twice for one source, or
    /// without a next track to go to.
    pub fn should_crossfade(
        &self,
        crossfade: Duration,
        remaining: Duration,
        has_next: bool,
        loop_mode: LoopMode,
        jams_mode: bool,
    ) -> bool {
        if crossfade.is_zero()
            || jams_mode
            || loop_mode == LoopMode::One
            || !has_next
            || self.is_crossfading()
            || self.fade_latched.load(Ordering::Acquire)
        {
            return false;
        }
        remaining <= TRIGGER_FLOOR.max(crossfade + TRIGGER_MARGIN)
    }

    /// Phase one of the overlap: prepare the standby player and atomically
    /// swap it to active. Runs on the controller task so surrounding code
    /// only ever observes the new active player after the swap.
    ///
    /// Returns the previous active index; feed it to
    /// [`DualPlayerEngine::run_overlap_ramp`] on a spawned task.
    pub async fn begin_overlap(
        &self,
        source: AudioSourceSpec,
        params: OverlapParams,
    ) -> Result<usize> {
        let outgoing_index = self.active_index();
        let incoming = self.standby_player();

        info!(
            track_id = %source.track_id(),
            crossfade_ms = params.crossfade.as_millis() as u64,
            "overlap crossfade starting"
        );

        // The active source has fired its trigger. If preparing the
        // incoming player fails below, the latch keeps this source from
        // re-firing on every subsequent position tick; only attaching a
        // new source clears it.
        self.fade_latched.store(true, Ordering::Release);

        incoming.stop().await.ok();
        incoming
            .set_loop_source(params.loop_mode == LoopMode::One)
            .await
            .ok();
        incoming.set_speed(params.speed).await.ok();
        incoming.set_source(source, true).await?;
        set_volume_guarded(&incoming, WARMUP_VOLUME).await;

        // The swap: everything after this sees the incoming player as
        // active.
        self.active.store(1 - outgoing_index, Ordering::Release);
        self.crossfading.store(true, Ordering::Release);
        self.fade_latched.store(false, Ordering::Release);

        incoming.play().await?;
        Ok(outgoing_index)
    }

    /// Phase two: the equal-power ramp and settlement. Spawn this after
    /// [`DualPlayerEngine::begin_overlap`]; it never fails, it only logs.
    pub async fn run_overlap_ramp(self: Arc<Self>, outgoing_index: usize, crossfade: Duration) {
        tokio::time::sleep(WARMUP_DELAY).await;

        let outgoing = Arc::clone(&self.players[outgoing_index]);
        let incoming = Arc::clone(&self.players[1 - outgoing_index]);

        let step = Duration::from_millis(
            (crossfade.as_millis() as u64 / RAMP_STEPS as u64)
                .clamp(MIN_STEP.as_millis() as u64, MAX_STEP.as_millis() as u64),
        );

        for k in 1..=RAMP_STEPS {
            let t = k as f64 / RAMP_STEPS as f64;
            let out_gain = (t * FRAC_PI_2).cos();
            let in_gain = (t * FRAC_PI_2).sin();
            set_volume_guarded(&outgoing, out_gain).await;
            set_volume_guarded(&incoming, in_gain).await;
            tokio::time::sleep(step).await;
        }

        // Settlement: the outgoing player stops before the incoming volume
        // is asserted for the last time.
        outgoing.stop().await.ok();
        set_volume_guarded(&outgoing, 1.0).await;

        let mut last_delay = 0u64;
        for delay_ms in SETTLE_DELAYS_MS {
            tokio::time::sleep(Duration::from_millis(delay_ms - last_delay)).await;
            last_delay = delay_ms;
            set_volume_guarded(&incoming, 1.0).await;
            if incoming.volume() >= 0.98 {
                break;
            }
        }

        self.crossfading.store(false, Ordering::Release);
        debug!("overlap crossfade settled");
    }

    // ===== Steady-state guards =====

    /// Anti-stall: some backends re-emit stale volume after a source
    /// handoff. On position ticks outside a crossfade, a sagging active
    /// volume is pushed back to 1.0, at most every 800 ms.
    pub async fn anti_stall_check(&self) {
        if self.is_crossfading() {
            return;
        }
        let active = self.active_player();
        if active.volume() >= ANTI_STALL_FLOOR {
            return;
        }
        {
            let mut last = match self.last_anti_stall.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            if last.elapsed() < ANTI_STALL_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        debug!(volume = active.volume(), "anti-stall volume re-assert");
        set_volume_guarded(&active, 1.0).await;
    }

    /// Stop both players and restore both volumes to 1.0.
    pub async fn stop_all(&self) {
        for player in &self.players {
            player.stop().await.ok();
            set_volume_guarded(player, 1.0).await;
        }
        self.crossfading.store(false, Ordering::Release);
        self.fade_latched.store(false, Ordering::Release);
    }

    /// Mirror a setting to both players.
    pub async fn set_speed_both(&self, speed: f64) {
        for player in &self.players {
            player.set_speed(speed).await.ok();
        }
    }

    /// Mirror loop-source to both players (LoopMode::One only).
    pub async fn set_loop_both(&self, mode: LoopMode) {
        for player in &self.players {
            player.set_loop_source(mode == LoopMode::One).await.ok();
        }
    }
}

/// Volume write bounded by the fade timeout. A hung backend write must not
/// deadlock audio, so failures and timeouts only log.
async fn set_volume_guarded(player: &Arc<dyn PlayerHandle>, volume: f64) {
    match tokio::time::timeout(VOLUME_WRITE_TIMEOUT, player.set_volume(volume)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(volume, error = %e, "volume write refused"),
        Err(_) => warn!(volume, "volume write timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlaybackError;
    use crate::player::{PlayerEvent, SimPlayer};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    fn engine() -> DualPlayerEngine {
        DualPlayerEngine::new(Arc::new(SimPlayer::new()), Arc::new(SimPlayer::new()))
    }

    /// Backend that refuses every source, for the failure paths.
    struct RefusingPlayer {
        events: broadcast::Sender<PlayerEvent>,
    }

    impl RefusingPlayer {
        fn new() -> Self {
            let (events, _) = broadcast::channel(8);
            Self { events }
        }
    }

    #[async_trait]
    impl PlayerHandle for RefusingPlayer {
        async fn set_source(&self, _source: AudioSourceSpec, _preload: bool) -> Result<()> {
            Err(PlaybackError::BackendRefused("refused".to_string()))
        }
        async fn play(&self) -> Result<()> {
            Err(PlaybackError::NoSource)
        }
        async fn pause(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn seek(&self, _position: Duration) -> Result<()> {
            Err(PlaybackError::NoSource)
        }
        async fn set_volume(&self, _volume: f64) -> Result<()> {
            Ok(())
        }
        async fn set_speed(&self, _speed: f64) -> Result<()> {
            Ok(())
        }
        async fn set_loop_source(&self, _enabled: bool) -> Result<()> {
            Ok(())
        }
        fn volume(&self) -> f64 {
            1.0
        }
        fn position(&self) -> Duration {
            Duration::ZERO
        }
        fn buffered_position(&self) -> Duration {
            Duration::ZERO
        }
        fn duration(&self) -> Option<Duration> {
            None
        }
        fn current_source(&self) -> Option<AudioSourceSpec> {
            None
        }
        fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
            self.events.subscribe()
        }
    }

    #[test]
    fn equal_power_gains_sum_to_unit_power() {
        for k in 0..=RAMP_STEPS {
            let t = k as f64 / RAMP_STEPS as f64;
            let out = (t * FRAC_PI_2).cos();
            let inn = (t * FRAC_PI_2).sin();
            let power = out * out + inn * inn;
            assert!((power - 1.0).abs() < 1e-9, "power {power} at step {k}");
        }
    }

    #[test]
    fn trigger_rules() {
        let e = engine();
        let fade = Duration::from_secs(2);

        // Inside the window.
        assert!(e.should_crossfade(fade, Duration::from_millis(1900), true, LoopMode::Off, false));
        // Outside the window.
        assert!(!e.should_crossfade(fade, Duration::from_secs(10), true, LoopMode::Off, false));
        // Disabled fade.
        assert!(!e.should_crossfade(
            Duration::ZERO,
            Duration::from_millis(100),
            true,
            LoopMode::Off,
            false
        ));
        // LoopMode::One never fades.
        assert!(!e.should_crossfade(fade, Duration::from_millis(500), true, LoopMode::One, false));
        // Jams mode never fades.
        assert!(!e.should_crossfade(fade, Duration::from_millis(500), true, LoopMode::Off, true));
        // No next track.
        assert!(!e.should_crossfade(fade, Duration::from_millis(500), false, LoopMode::Off, false));
    }

    #[test]
    fn trigger_window_has_a_floor() {
        let e = engine();
        // 50 ms fade: the window is still max(300, 50+120) = 300 ms wide.
        let fade = Duration::from_millis(50);
        assert!(e.should_crossfade(fade, Duration::from_millis(299), true, LoopMode::Off, false));
        assert!(!e.should_crossfade(fade, Duration::from_millis(301), true, LoopMode::Off, false));
    }

    #[tokio::test]
    async fn hard_switch_targets_active_player() {
        let e = engine();
        let source = AudioSourceSpec::File {
            path: "/music/a.opus".into(),
            track_id: "a".to_string(),
        };
        e.hard_switch(source.clone()).await.unwrap();
        assert_eq!(e.active_index(), 0);
        assert_eq!(e.active_player().current_source(), Some(source));
        assert!(e.standby_player().current_source().is_none());
    }

    #[tokio::test]
    async fn begin_overlap_swaps_active_before_returning() {
        let e = engine();
        e.hard_switch(AudioSourceSpec::File {
            path: "/music/a.opus".into(),
            track_id: "a".to_string(),
        })
        .await
        .unwrap();

        let params = OverlapParams {
            crossfade: Duration::from_secs(2),
            loop_mode: LoopMode::Off,
            speed: 1.0,
        };
        let outgoing = e
            .begin_overlap(
                AudioSourceSpec::File {
                    path: "/music/b.opus".into(),
                    track_id: "b".to_string(),
                },
                params,
            )
            .await
            .unwrap();

        assert_eq!(outgoing, 0);
        assert_eq!(e.active_index(), 1);
        assert!(e.is_crossfading());
        assert_eq!(e.active_player().current_source().unwrap().track_id(), "b");
        // Incoming warms up nearly silent.
        assert!((e.active_player().volume() - WARMUP_VOLUME).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_settles_with_full_volume_and_stopped_outgoing() {
        let e = Arc::new(engine());
        e.hard_switch(AudioSourceSpec::File {
            path: "/music/a.opus".into(),
            track_id: "a".to_string(),
        })
        .await
        .unwrap();

        let params = OverlapParams {
            crossfade: Duration::from_secs(2),
            loop_mode: LoopMode::Off,
            speed: 1.0,
        };
        let outgoing = e
            .begin_overlap(
                AudioSourceSpec::File {
                    path: "/music/b.opus".into(),
                    track_id: "b".to_string(),
                },
                params,
            )
            .await
            .unwrap();

        Arc::clone(&e)
            .run_overlap_ramp(outgoing, params.crossfade)
            .await;

        assert!(!e.is_crossfading());
        assert!(e.active_player().volume() >= 0.98);
        // Outgoing player stopped and reset to full volume.
        assert!(e.standby_player().current_source().is_none());
        assert!((e.standby_player().volume() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_overlap_latches_the_trigger() {
        let e = DualPlayerEngine::new(Arc::new(SimPlayer::new()), Arc::new(RefusingPlayer::new()));
        e.hard_switch(AudioSourceSpec::File {
            path: "/music/a.opus".into(),
            track_id: "a".to_string(),
        })
        .await
        .unwrap();

        let fade = Duration::from_secs(2);
        let near_end = Duration::from_millis(500);
        assert!(e.should_crossfade(fade, near_end, true, LoopMode::Off, false));

        let params = OverlapParams {
            crossfade: fade,
            loop_mode: LoopMode::Off,
            speed: 1.0,
        };
        let result = e
            .begin_overlap(
                AudioSourceSpec::File {
                    path: "/music/b.opus".into(),
                    track_id: "b".to_string(),
                },
                params,
            )
            .await;
        assert!(result.is_err());

        // No swap happened, and the same source must not fire again.
        assert_eq!(e.active_index(), 0);
        assert!(!e.is_crossfading());
        assert!(!e.should_crossfade(fade, near_end, true, LoopMode::Off, false));

        // Attaching a fresh source re-arms the trigger.
        e.hard_switch(AudioSourceSpec::File {
            path: "/music/c.opus".into(),
            track_id: "c".to_string(),
        })
        .await
        .unwrap();
        assert!(e.should_crossfade(fade, near_end, true, LoopMode::Off, false));
    }

    #[tokio::test]
    async fn anti_stall_reasserts_sagging_volume() {
        let e = engine();
        e.hard_switch(AudioSourceSpec::File {
            path: "/music/a.opus".into(),
            track_id: "a".to_string(),
        })
        .await
        .unwrap();

        e.active_player().set_volume(0.3).await.unwrap();
        e.anti_stall_check().await;
        assert!((e.active_player().volume() - 1.0).abs() < 1e-9);
    }
}
