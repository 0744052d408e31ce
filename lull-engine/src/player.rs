//! The `AmbientPlayer` facade.
//!
//! Serializes user operations through a bounded priority queue, mirrors
//! engine state into current-value subjects, and listens to three inbound
//! streams: the engine's natural-end stream (track completion), a 0.5 s
//! position timer (subject refresh plus the proactive gapless trigger), and
//! the session coordinator's control signals (interruption, route change,
//! recovery).
//!
//! Transitions run as background tasks so the operation queue stays
//! responsive; the `transitions_active` counter is the guard that keeps the
//! timer trigger and the natural-end handler from stacking automatic
//! transitions, while still letting a manual change preempt an in-flight
//! fade through the replacement policy.

use crate::audio::cache::BufferCache;
use crate::audio::decode::PcmReader;
use crate::audio::types::Track;
use crate::config::{OverlayConfig, PlayerConfig};
use crate::error::{PlayerError, Result};
use crate::host::{AudioGraph, AudioSession};
use crate::playback::crossfade::{
    CrossfadeOrchestrator, CrossfadeOutcome, ReplacementPolicy,
};
use crate::playback::engine::EngineCore;
use crate::playback::opqueue::{OpPriority, OperationQueue, DEFAULT_DEPTH};
use crate::playback::overlay::OverlayScheduler;
use crate::playback::playlist::Playlist;
use crate::playback::sfx::{SfxPlayer, SoundEffect};
use crate::session::{ControlSignal, SessionCoordinator};
use lull_common::{
    CrossfadeKind, CrossfadeProgress, EngineEvent, EventBus, LoopMode, PlayerState, RepeatMode,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, sleep, Instant};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, error, info, warn};

/// Deadline for buffer loads triggered by playback operations.
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Fade used by plain pause/resume.
const PAUSE_FADE_SECONDS: f64 = 0.3;

/// Fades used by skip and seek (fade-out and fade-in each).
const SKIP_FADE_SECONDS: f64 = 0.3;

/// Default fade for `seek`.
pub const DEFAULT_SEEK_FADE_SECONDS: f64 = 0.1;

/// Default skip interval.
pub const DEFAULT_SKIP_INTERVAL_SECONDS: f64 = 15.0;

/// Default fade for `finish`.
pub const DEFAULT_FINISH_FADE_SECONDS: f64 = 3.0;

/// Minimum spacing between consecutive skip calls.
const SKIP_MIN_INTERVAL: Duration = Duration::from_millis(500);

/// Position subject emission interval.
const POSITION_INTERVAL: Duration = Duration::from_millis(500);

/// End-of-track guard for the fallback advance.
const END_GUARD_SECONDS: f64 = 0.5;

/// How long a replacement waits for a nearly-done crossfade.
const WAIT_FOR_COMPLETION: Duration = Duration::from_millis(1500);

/// Fade used when cancelling a transition for a replacement.
const REPLACEMENT_FADE_SECONDS: f64 = 0.3;

/// Event-stream buffer depth.
const EVENT_BUFFER: usize = 10;

/// Resident decoded-buffer bound.
const CACHE_ENTRIES: usize = 16;

/// Current playback position as published on the position subject.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaybackPosition {
    pub current_time: f64,
    pub duration: f64,
}

/// Direction for `skip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDirection {
    Forward,
    Backward,
}

/// Snapshot of engine internals for monitoring surfaces.
#[derive(Debug, Clone)]
pub struct EngineDiagnostics {
    pub active_slot: crate::playback::engine::SlotId,
    pub active_mixer_volume: f32,
    pub inactive_mixer_volume: f32,
    pub main_volume: f32,
    pub target_volume: f32,
    pub crossfade_in_progress: bool,
    pub position_seconds: f64,
    pub duration_seconds: Option<f64>,
}

/// Embeddable three-layer playback engine facade.
pub struct AmbientPlayer {
    config: Mutex<PlayerConfig>,
    playlist: Mutex<Playlist>,
    cache: Arc<BufferCache>,
    engine: Arc<EngineCore>,
    orchestrator: Arc<CrossfadeOrchestrator>,
    overlay: Arc<OverlayScheduler>,
    sfx: Arc<SfxPlayer>,
    session: Arc<SessionCoordinator>,
    queue: OperationQueue,
    events: EventBus,
    state_tx: watch::Sender<PlayerState>,
    track_tx: watch::Sender<Option<Track>>,
    position_tx: watch::Sender<PlaybackPosition>,
    last_skip: Mutex<Option<Instant>>,
    skip_in_progress: AtomicBool,
    /// Transitions currently running. Automatic triggers (timer, natural
    /// end) stand down while nonzero; manual changes may preempt via the
    /// replacement policy.
    transitions_active: AtomicU32,
    /// Completed single-track loops since the last start/skip
    loops_completed: AtomicU32,
}

impl AmbientPlayer {
    /// Build the full component stack over the supplied host.
    pub fn new(
        graph: Arc<dyn AudioGraph>,
        session: Arc<dyn AudioSession>,
        reader: Arc<dyn PcmReader>,
        config: PlayerConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let events = EventBus::new(EVENT_BUFFER);
        let cache = Arc::new(
            BufferCache::new(reader, config.normalization, CACHE_ENTRIES)
                .with_events(events.clone()),
        );

        let engine = EngineCore::new(Arc::clone(&graph), Arc::clone(&cache))?;
        engine.setup();
        engine.set_volume(config.volume);

        let orchestrator = CrossfadeOrchestrator::new(Arc::clone(&engine), events.clone());

        let (overlay_player, overlay_mixer) = graph.attach_player()?;
        let overlay = OverlayScheduler::new(
            overlay_player,
            overlay_mixer,
            Arc::clone(&cache),
            config.overlay,
            events.clone(),
            graph.output_sample_rate() as u32,
        );

        let (sfx_player, sfx_mixer) = graph.attach_player()?;
        let sfx = SfxPlayer::new(sfx_player, sfx_mixer, Arc::clone(&cache));

        let session = SessionCoordinator::new(session, config.session_mode, events.clone());
        session.run();

        let (state_tx, _) = watch::channel(PlayerState::Idle);
        let (track_tx, _) = watch::channel(None);
        let (position_tx, _) = watch::channel(PlaybackPosition::default());

        let player = Arc::new(Self {
            config: Mutex::new(config),
            playlist: Mutex::new(Playlist::default()),
            cache,
            engine,
            orchestrator,
            overlay,
            sfx,
            session,
            queue: OperationQueue::new(DEFAULT_DEPTH),
            events,
            state_tx,
            track_tx,
            position_tx,
            last_skip: Mutex::new(None),
            skip_in_progress: AtomicBool::new(false),
            transitions_active: AtomicU32::new(0),
            loops_completed: AtomicU32::new(0),
        });

        player.spawn_natural_end_listener();
        player.spawn_position_timer();
        player.spawn_session_listener();
        Ok(player)
    }

    // ------------------------------------------------------------------
    // Subjects and introspection
    // ------------------------------------------------------------------

    pub fn state(&self) -> PlayerState {
        self.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<PlayerState> {
        self.state_tx.subscribe()
    }

    pub fn current_track(&self) -> Option<Track> {
        self.track_tx.borrow().clone()
    }

    pub fn watch_track(&self) -> watch::Receiver<Option<Track>> {
        self.track_tx.subscribe()
    }

    pub fn position(&self) -> PlaybackPosition {
        *self.position_tx.borrow()
    }

    pub fn watch_position(&self) -> watch::Receiver<PlaybackPosition> {
        self.position_tx.subscribe()
    }

    /// State subject as an async stream.
    pub fn state_stream(&self) -> WatchStream<PlayerState> {
        WatchStream::new(self.state_tx.subscribe())
    }

    /// Position subject as an async stream; emits every 0.5 s while playing.
    pub fn position_stream(&self) -> WatchStream<PlaybackPosition> {
        WatchStream::new(self.position_tx.subscribe())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Event stream wrapper; lagged subscribers observe an error item and
    /// lose oldest events, per the bounded buffer.
    pub fn event_stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub fn crossfade_progress(&self) -> watch::Receiver<CrossfadeProgress> {
        self.orchestrator.subscribe_progress()
    }

    pub fn configuration(&self) -> PlayerConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn overlay_state(&self) -> lull_common::OverlayState {
        self.overlay.state()
    }

    /// Install the delegate fired when an externally-managed session
    /// reports a category this engine did not set.
    pub fn set_session_category_handler(&self, handler: crate::session::CategoryChangeHandler) {
        self.session.set_category_change_handler(handler);
    }

    /// Point-in-time view of the dual-player graph.
    pub fn diagnostics(&self) -> EngineDiagnostics {
        let active = self.engine.active_slot();
        EngineDiagnostics {
            active_slot: active,
            active_mixer_volume: self.engine.mixer_volume(active),
            inactive_mixer_volume: self.engine.mixer_volume(active.other()),
            main_volume: self.engine.main_volume(),
            target_volume: self.engine.target_volume(),
            crossfade_in_progress: self.engine.is_crossfade_in_progress(),
            position_seconds: self.engine.position(),
            duration_seconds: self.engine.duration(),
        }
    }

    fn set_state(&self, new_state: PlayerState) {
        let old_state = self.state_tx.borrow().clone();
        if old_state == new_state {
            return;
        }
        info!(?old_state, ?new_state, "playback state changed");
        let _ = self.state_tx.send(new_state.clone());
        self.events.emit_lossy(EngineEvent::PlaybackStateChanged {
            old_state,
            new_state,
            timestamp: chrono::Utc::now(),
        });
    }

    fn queue_closed<T>() -> Result<T> {
        Err(PlayerError::EngineStartFailed {
            reason: "player operation queue is shut down".to_string(),
        })
    }

    fn fade_curve(&self) -> lull_common::FadeCurve {
        self.config.lock().unwrap().fade_curve
    }

    // ------------------------------------------------------------------
    // Playlist management
    // ------------------------------------------------------------------

    /// Install a playlist; rejected while audio is running.
    pub fn load_playlist(&self, tracks: Vec<Track>) -> Result<()> {
        let state = self.state();
        if matches!(state, PlayerState::Playing | PlayerState::Preparing | PlayerState::FadingOut) {
            return Err(PlayerError::invalid_state(state, "load a playlist"));
        }
        self.playlist.lock().unwrap().replace(tracks);
        Ok(())
    }

    /// Install a playlist, crossfading into its first track when playing.
    pub async fn replace_playlist(self: &Arc<Self>, tracks: Vec<Track>) -> Result<()> {
        let player = Arc::clone(self);
        self.queue
            .submit(OpPriority::High, "replace_playlist", async move {
                player.do_replace_playlist(tracks).await
            })
            .await
            .unwrap_or_else(|| Self::queue_closed())
    }

    async fn do_replace_playlist(self: &Arc<Self>, tracks: Vec<Track>) -> Result<()> {
        if tracks.is_empty() {
            return Err(PlayerError::EmptyPlaylist);
        }
        let first = {
            let mut playlist = self.playlist.lock().unwrap();
            playlist.replace(tracks);
            playlist.current().cloned()
        };

        if self.state() == PlayerState::Playing {
            let track = first.expect("non-empty playlist has a current track");
            let duration = self.config.lock().unwrap().crossfade_duration;
            self.spawn_transition(track, CrossfadeKind::ManualChange, duration);
        }
        Ok(())
    }

    pub fn peek_next_track(&self) -> Option<Track> {
        let repeat = self.config.lock().unwrap().repeat_mode;
        self.playlist.lock().unwrap().peek_next(repeat).cloned()
    }

    /// Warm the buffer cache for an upcoming track.
    pub fn preload_track(&self, uri: &str) {
        self.cache.preload(uri);
    }

    pub fn peek_previous_track(&self) -> Option<Track> {
        let repeat = self.config.lock().unwrap().repeat_mode;
        self.playlist.lock().unwrap().peek_previous(repeat).cloned()
    }

    // ------------------------------------------------------------------
    // Core transport
    // ------------------------------------------------------------------

    /// Begin playback of the playlist's current track.
    pub async fn start_playing(self: &Arc<Self>, fade_in: f64) -> Result<()> {
        let player = Arc::clone(self);
        self.queue
            .submit(OpPriority::Normal, "start_playing", async move {
                player.do_start_playing(fade_in).await
            })
            .await
            .unwrap_or_else(|| Self::queue_closed())
    }

    async fn do_start_playing(self: &Arc<Self>, fade_in: f64) -> Result<()> {
        let state = self.state();
        if !matches!(state, PlayerState::Idle | PlayerState::Finished) {
            return Err(PlayerError::invalid_state(state, "start playing"));
        }

        let track = self
            .playlist
            .lock()
            .unwrap()
            .current()
            .cloned()
            .ok_or(PlayerError::EmptyPlaylist)?;
        let (options, curve) = {
            let config = self.config.lock().unwrap();
            (config.session_options, config.fade_curve)
        };

        info!(uri = %track.uri, fade_in, "start playing");
        self.session.configure(options, false)?;
        self.engine.start()?;
        self.set_state(PlayerState::Preparing);
        self.loops_completed.store(0, Ordering::SeqCst);

        let loaded = match self
            .engine
            .load_into_slot(self.engine.active_slot(), &track, LOAD_TIMEOUT)
            .await
        {
            Ok(loaded) => loaded,
            Err(error) => {
                self.set_state(PlayerState::Idle);
                return Err(error);
            }
        };
        self.playlist.lock().unwrap().update_current(loaded.clone());

        let fade = (fade_in > 0.0).then_some(fade_in);
        if let Err(error) = self.engine.schedule_active(fade, curve) {
            self.set_state(PlayerState::Idle);
            return Err(error);
        }

        self.set_state(PlayerState::Playing);
        let _ = self.track_tx.send(Some(loaded.clone()));
        self.events.emit_lossy(EngineEvent::TrackStarted {
            track_id: loaded.id,
            uri: loaded.uri.clone(),
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Pause the main layer, capturing a paused-crossfade snapshot when a
    /// transition is in flight. Idempotent in terminal states.
    pub async fn pause(self: &Arc<Self>) -> Result<()> {
        let player = Arc::clone(self);
        self.queue
            .submit(OpPriority::UserInteractive, "pause", async move {
                player.do_pause().await
            })
            .await
            .unwrap_or_else(|| Self::queue_closed())
    }

    async fn do_pause(&self) -> Result<()> {
        let state = self.state();
        if state.is_terminal() || matches!(state, PlayerState::Paused | PlayerState::Idle) {
            return Ok(());
        }

        if self.orchestrator.pause_current().await {
            debug!("paused mid-crossfade");
        } else {
            self.orchestrator
                .perform_simple_fade_out(PAUSE_FADE_SECONDS, self.fade_curve())
                .await;
            self.engine.pause();
        }
        self.set_state(PlayerState::Paused);
        Ok(())
    }

    /// Resume from pause, restoring a paused crossfade when one exists.
    /// Idempotent in terminal states.
    pub async fn resume(self: &Arc<Self>) -> Result<()> {
        let player = Arc::clone(self);
        self.queue
            .submit(OpPriority::Normal, "resume", async move {
                player.do_resume().await
            })
            .await
            .unwrap_or_else(|| Self::queue_closed())
    }

    async fn do_resume(self: &Arc<Self>) -> Result<()> {
        let state = self.state();
        if state.is_terminal() || state != PlayerState::Paused {
            return Ok(());
        }

        if self.orchestrator.has_paused_crossfade() {
            // Claim the transition slot before going Playing so the timer
            // trigger cannot race in an automatic crossfade
            self.transitions_active.fetch_add(1, Ordering::SeqCst);
            self.set_state(PlayerState::Playing);
            let player = Arc::clone(self);
            tokio::spawn(async move {
                let result = player.orchestrator.resume_crossfade().await;
                player.transitions_active.fetch_sub(1, Ordering::SeqCst);
                match result {
                    Ok(true) => player.publish_active_track(),
                    Ok(false) => {}
                    Err(error) => warn!(%error, "crossfade resume failed"),
                }
            });
            return Ok(());
        }

        self.engine.play()?;
        self.orchestrator
            .perform_simple_fade_in(PAUSE_FADE_SECONDS, self.fade_curve())
            .await;
        self.set_state(PlayerState::Playing);
        Ok(())
    }

    /// Stop the main layer. Always succeeds and lands in Finished.
    pub async fn stop(self: &Arc<Self>, fade_out: f64) -> Result<()> {
        let player = Arc::clone(self);
        self.queue
            .submit(OpPriority::UserInteractive, "stop", async move {
                player.do_stop(fade_out).await;
                Ok(())
            })
            .await
            .unwrap_or_else(|| Self::queue_closed())
    }

    async fn do_stop(&self, fade_out: f64) {
        let state = self.state();
        if self.orchestrator.is_crossfade_active() {
            self.orchestrator.rollback_current(REPLACEMENT_FADE_SECONDS).await;
        }
        self.orchestrator.clear_paused();

        if state == PlayerState::Playing && fade_out > 0.0 {
            self.set_state(PlayerState::FadingOut);
            self.orchestrator
                .perform_simple_fade_out(fade_out, self.fade_curve())
                .await;
        }

        if let Some(track) = self.current_track() {
            self.events.emit_lossy(EngineEvent::TrackCompleted {
                track_id: track.id,
                completed: false,
                timestamp: chrono::Utc::now(),
            });
        }

        self.engine.stop();
        let _ = self.track_tx.send(None);
        let _ = self.position_tx.send(PlaybackPosition::default());
        self.set_state(PlayerState::Finished);
    }

    /// Graceful ending: long fade-out, then stop. Requires Playing or
    /// Paused.
    pub async fn finish(self: &Arc<Self>, fade_out: f64) -> Result<()> {
        let player = Arc::clone(self);
        self.queue
            .submit(OpPriority::UserInteractive, "finish", async move {
                let state = player.state();
                if !matches!(state, PlayerState::Playing | PlayerState::Paused) {
                    return Err(PlayerError::invalid_state(state, "finish"));
                }
                player.do_stop(fade_out).await;
                Ok(())
            })
            .await
            .unwrap_or_else(|| Self::queue_closed())
    }

    /// Jump forward or backward within the current track using
    /// fade-seek-fade.
    pub async fn skip(self: &Arc<Self>, direction: SkipDirection, interval: f64) -> Result<()> {
        let player = Arc::clone(self);
        self.queue
            .submit(OpPriority::High, "skip", async move {
                player.do_skip(direction, interval).await
            })
            .await
            .unwrap_or_else(|| Self::queue_closed())
    }

    async fn do_skip(&self, direction: SkipDirection, interval: f64) -> Result<()> {
        let state = self.state();
        if !matches!(state, PlayerState::Playing | PlayerState::Paused) {
            return Err(PlayerError::invalid_state(state, "skip"));
        }

        let position = self.engine.position();
        let target = match direction {
            SkipDirection::Forward => position + interval,
            SkipDirection::Backward => (position - interval).max(0.0),
        };

        if state == PlayerState::Playing {
            self.orchestrator
                .perform_fade_seek_fade(target, SKIP_FADE_SECONDS, SKIP_FADE_SECONDS, self.fade_curve())
                .await?;
        } else {
            self.engine.seek(target)?;
        }
        Ok(())
    }

    /// Seek within the current track.
    pub async fn seek(self: &Arc<Self>, time: f64, fade: f64) -> Result<()> {
        let player = Arc::clone(self);
        self.queue
            .submit(OpPriority::High, "seek", async move {
                player.do_seek(time, fade).await
            })
            .await
            .unwrap_or_else(|| Self::queue_closed())
    }

    async fn do_seek(&self, time: f64, fade: f64) -> Result<()> {
        let state = self.state();
        if !matches!(state, PlayerState::Playing | PlayerState::Paused) {
            return Err(PlayerError::invalid_state(state, "seek"));
        }

        // A transition cannot survive a seek of its outgoing side
        if self.orchestrator.is_crossfade_active() || self.orchestrator.has_paused_crossfade() {
            self.orchestrator.rollback_current(DEFAULT_SEEK_FADE_SECONDS).await;
        }

        if state == PlayerState::Playing {
            self.orchestrator
                .perform_fade_seek_fade(time, fade, fade, self.fade_curve())
                .await?;
        } else {
            self.engine.seek(time)?;
        }
        Ok(())
    }

    /// Master volume; applied immediately, outside the operation queue.
    pub fn set_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 1.0);
        let old_volume = {
            let mut config = self.config.lock().unwrap();
            let old = config.volume;
            config.volume = clamped;
            old
        };
        self.engine.set_volume(clamped);
        self.events.emit_lossy(EngineEvent::VolumeChanged {
            old_volume,
            new_volume: clamped,
            timestamp: chrono::Utc::now(),
        });
    }

    pub fn set_repeat_mode(&self, repeat_mode: RepeatMode) {
        self.config.lock().unwrap().repeat_mode = repeat_mode;
        debug!(?repeat_mode, "repeat mode set");
    }

    /// Replace the configuration wholesale. Stops playback first.
    pub async fn update_configuration(self: &Arc<Self>, new_config: PlayerConfig) -> Result<()> {
        new_config.validate()?;
        {
            let config = self.config.lock().unwrap();
            if config.session_mode != new_config.session_mode {
                return Err(PlayerError::InvalidConfiguration {
                    reason: "session mode cannot change after construction".to_string(),
                });
            }
        }

        let player = Arc::clone(self);
        self.queue
            .submit(OpPriority::UserInteractive, "update_configuration", async move {
                player.do_stop(0.0).await;
                player.overlay.set_config(new_config.overlay);
                player.engine.set_volume(new_config.volume);
                *player.config.lock().unwrap() = new_config;
                Ok(())
            })
            .await
            .unwrap_or_else(|| Self::queue_closed())
    }

    // ------------------------------------------------------------------
    // Track changes
    // ------------------------------------------------------------------

    /// Rate-limit gate: rejects a skip within the minimum interval of the
    /// previous one or while another skip is mid-setup. On success the
    /// reentrancy flag is held until `change_track` finishes its
    /// synchronous part.
    fn check_skip_allowed(&self) -> Result<()> {
        let mut last_skip = self.last_skip.lock().unwrap();
        if self.skip_in_progress.swap(true, Ordering::SeqCst) {
            return Err(PlayerError::RateLimited);
        }
        let now = Instant::now();
        if let Some(previous) = *last_skip {
            if now.duration_since(previous) < SKIP_MIN_INTERVAL {
                self.skip_in_progress.store(false, Ordering::SeqCst);
                return Err(PlayerError::RateLimited);
            }
        }
        *last_skip = Some(now);
        Ok(())
    }

    /// Advance to the next track. Returns the target track immediately;
    /// the audio transition happens asynchronously.
    pub async fn skip_to_next(self: &Arc<Self>) -> Result<Track> {
        self.change_track(true).await
    }

    /// Return to the previous track, with the same contract as
    /// [`skip_to_next`](Self::skip_to_next).
    pub async fn skip_to_previous(self: &Arc<Self>) -> Result<Track> {
        self.change_track(false).await
    }

    async fn change_track(self: &Arc<Self>, forward: bool) -> Result<Track> {
        self.check_skip_allowed()?;

        let repeat = self.config.lock().unwrap().repeat_mode;
        let next = {
            let mut playlist = self.playlist.lock().unwrap();
            let peeked = if forward {
                playlist.peek_next(repeat).cloned()
            } else {
                playlist.peek_previous(repeat).cloned()
            };
            match peeked {
                Some(track) => {
                    if forward {
                        playlist.advance_next(repeat);
                    } else {
                        playlist.advance_previous(repeat);
                    }
                    track
                }
                None => {
                    self.skip_in_progress.store(false, Ordering::SeqCst);
                    return Err(if forward {
                        PlayerError::NoNextTrack
                    } else {
                        PlayerError::NoPreviousTrack
                    });
                }
            }
        };

        self.loops_completed.store(0, Ordering::SeqCst);

        if self.state() == PlayerState::Playing {
            let duration = self.config.lock().unwrap().crossfade_duration;
            self.spawn_transition(next.clone(), CrossfadeKind::ManualChange, duration);
        } else {
            let _ = self.track_tx.send(Some(next.clone()));
        }
        self.skip_in_progress.store(false, Ordering::SeqCst);
        Ok(next)
    }

    /// Launch a background crossfade transition to `track`, applying the
    /// replacement policy against anything already in flight. Automatic
    /// transitions never stack; manual changes preempt.
    fn spawn_transition(self: &Arc<Self>, track: Track, kind: CrossfadeKind, duration: f64) {
        let previously_active = self.transitions_active.fetch_add(1, Ordering::SeqCst);
        if kind == CrossfadeKind::AutomaticLoop && previously_active > 0 {
            self.transitions_active.fetch_sub(1, Ordering::SeqCst);
            debug!(uri = %track.uri, "automatic transition suppressed, one is already running");
            return;
        }

        let player = Arc::clone(self);
        tokio::spawn(async move {
            let result = player.run_transition(&track, kind, duration).await;
            player.transitions_active.fetch_sub(1, Ordering::SeqCst);
            match result {
                Ok(CrossfadeOutcome::Completed) => {}
                Ok(outcome) => debug!(?outcome, "transition ended without completion"),
                Err(error) => {
                    warn!(%error, uri = %track.uri, "transition failed");
                    player.events.emit_lossy(EngineEvent::FileLoadFailed {
                        uri: track.uri.clone(),
                        error: error.to_string(),
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
        });
    }

    async fn run_transition(
        self: &Arc<Self>,
        track: &Track,
        kind: CrossfadeKind,
        duration: f64,
    ) -> Result<CrossfadeOutcome> {
        // Replacement policy for a transition arriving mid-transition
        if self.orchestrator.is_crossfade_active() {
            let progress = self.orchestrator.current_progress().unwrap_or(0.0);
            match ReplacementPolicy::for_progress(progress) {
                ReplacementPolicy::Rollback => {
                    debug!(progress, "replacement: rolling back young crossfade");
                    self.orchestrator
                        .rollback_current(REPLACEMENT_FADE_SECONDS)
                        .await;
                }
                ReplacementPolicy::WaitForCompletion => {
                    debug!(progress, "replacement: waiting for crossfade to finish");
                    let deadline = Instant::now() + WAIT_FOR_COMPLETION;
                    while self.orchestrator.is_crossfade_active() && Instant::now() < deadline {
                        sleep(Duration::from_millis(50)).await;
                    }
                }
                ReplacementPolicy::FastForward => {
                    debug!(progress, "replacement: fast-forwarding crossfade");
                    self.orchestrator.fast_forward(REPLACEMENT_FADE_SECONDS).await;
                }
            }
        } else if self.orchestrator.has_paused_crossfade() {
            self.orchestrator
                .rollback_current(REPLACEMENT_FADE_SECONDS)
                .await;
        }

        let (curve, previous) = (self.fade_curve(), self.current_track());
        let outcome = self
            .orchestrator
            .start_crossfade(track, duration, curve, kind, LOAD_TIMEOUT)
            .await?;

        if outcome == CrossfadeOutcome::Completed {
            if let Some(previous) = previous {
                self.events.emit_lossy(EngineEvent::TrackCompleted {
                    track_id: previous.id,
                    completed: kind == CrossfadeKind::AutomaticLoop,
                    timestamp: chrono::Utc::now(),
                });
            }
            self.publish_active_track();
        }
        Ok(outcome)
    }

    fn publish_active_track(&self) {
        if let Some(track) = self.engine.slot_track(self.engine.active_slot()) {
            self.events.emit_lossy(EngineEvent::TrackStarted {
                track_id: track.id,
                uri: track.uri.clone(),
                timestamp: chrono::Utc::now(),
            });
            let _ = self.track_tx.send(Some(track));
        }
    }

    // ------------------------------------------------------------------
    // Overlay layer
    // ------------------------------------------------------------------

    pub async fn play_overlay(self: &Arc<Self>, uri: &str) -> Result<()> {
        let player = Arc::clone(self);
        let uri = uri.to_string();
        self.queue
            .submit(OpPriority::Normal, "play_overlay", async move {
                player.overlay.play(&uri).await
            })
            .await
            .unwrap_or_else(|| Self::queue_closed())
    }

    pub fn set_overlay_configuration(&self, config: OverlayConfig) -> Result<()> {
        config.validate()?;
        self.config.lock().unwrap().overlay = config;
        self.overlay.set_config(config);
        Ok(())
    }

    pub fn set_overlay_volume(&self, volume: f32) {
        self.overlay.set_volume(volume);
    }

    pub fn set_overlay_loop_mode(&self, loop_mode: LoopMode) {
        self.overlay.set_loop_mode(loop_mode);
    }

    pub fn set_overlay_loop_delay(&self, loop_delay: f64) {
        self.overlay.set_loop_delay(loop_delay);
    }

    pub async fn stop_overlay(self: &Arc<Self>, fade_out: f64) {
        let player = Arc::clone(self);
        let _ = self
            .queue
            .submit(OpPriority::Normal, "stop_overlay", async move {
                player.overlay.stop(fade_out).await;
            })
            .await;
    }

    pub fn pause_overlay(&self) {
        self.overlay.pause();
    }

    pub fn resume_overlay(&self) {
        self.overlay.resume();
    }

    /// Swap the overlay sound without restarting the layer.
    pub async fn replace_overlay(self: &Arc<Self>, uri: &str) -> Result<()> {
        let player = Arc::clone(self);
        let uri = uri.to_string();
        self.queue
            .submit(OpPriority::Normal, "replace_overlay", async move {
                player.overlay.replace_file(&uri).await
            })
            .await
            .unwrap_or_else(|| Self::queue_closed())
    }

    // ------------------------------------------------------------------
    // Sound effects layer
    // ------------------------------------------------------------------

    pub async fn play_sound_effect(&self, name: &str, fade_in: f64) -> Result<()> {
        self.sfx.play(name, fade_in).await
    }

    pub async fn stop_sound_effect(&self, fade_out: f64) {
        self.sfx.stop(fade_out).await;
    }

    pub fn set_sound_effect_volume(&self, volume: f32) {
        self.sfx.set_master_volume(volume);
    }

    pub async fn preload_sound_effects(&self, effects: &[SoundEffect]) -> Result<()> {
        self.sfx.preload(effects).await
    }

    pub async fn unload_sound_effects(&self, names: &[String]) {
        self.sfx.unload(names).await;
    }

    // ------------------------------------------------------------------
    // Whole-stack transport
    // ------------------------------------------------------------------

    /// Pause every layer at once. Used directly (bypassing fades) by
    /// session interruptions, which need silence within tens of
    /// milliseconds.
    pub async fn pause_all(self: &Arc<Self>) {
        self.do_pause_all().await;
    }

    async fn do_pause_all(&self) {
        if self.orchestrator.is_crossfade_active() {
            self.orchestrator.pause_current().await;
        } else if self.state() == PlayerState::Playing {
            self.engine.pause();
        }
        self.overlay.pause();
        self.sfx.pause();
        if matches!(self.state(), PlayerState::Playing | PlayerState::FadingOut) {
            self.set_state(PlayerState::Paused);
        }
    }

    /// Resume every layer.
    pub async fn resume_all(self: &Arc<Self>) -> Result<()> {
        self.do_resume().await?;
        self.overlay.resume();
        self.sfx.resume();
        Ok(())
    }

    /// Stop every layer.
    pub async fn stop_all(self: &Arc<Self>, fade_out: f64) {
        self.do_stop(fade_out).await;
        self.overlay.stop(fade_out).await;
        self.sfx.stop(fade_out).await;
    }

    // ------------------------------------------------------------------
    // Background listeners
    // ------------------------------------------------------------------

    fn spawn_natural_end_listener(self: &Arc<Self>) {
        let Some(mut natural_ends) = self.engine.take_natural_ends() else {
            return;
        };
        let player = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(slot) = natural_ends.recv().await {
                debug!(?slot, "natural end received");
                if player.transitions_active.load(Ordering::SeqCst) > 0 {
                    continue;
                }
                if let Err(error) = player.handle_natural_end().await {
                    error!(%error, "natural-end handling failed, stopping");
                    player.do_stop(0.0).await;
                }
            }
        });
    }

    /// A track ran to its end without a proactive crossfade: restart or
    /// advance without overlap.
    async fn handle_natural_end(self: &Arc<Self>) -> Result<()> {
        let (repeat, repeat_count, curve) = {
            let config = self.config.lock().unwrap();
            (config.repeat_mode, config.repeat_count, config.fade_curve)
        };

        match repeat {
            RepeatMode::SingleTrack => {
                let loops = self.loops_completed.fetch_add(1, Ordering::SeqCst) + 1;
                if repeat_count > 0 && loops >= repeat_count {
                    info!(loops, "single-track repeat count reached");
                    self.do_stop(0.0).await;
                    return Ok(());
                }
                self.engine.schedule_active(None, curve)?;
                self.publish_active_track();
            }
            RepeatMode::Off | RepeatMode::Playlist => {
                let next = self.playlist.lock().unwrap().advance_next(repeat);
                if let Some(previous) = self.current_track() {
                    self.events.emit_lossy(EngineEvent::TrackCompleted {
                        track_id: previous.id,
                        completed: true,
                        timestamp: chrono::Utc::now(),
                    });
                }
                match next {
                    Some(track) => {
                        let loaded = self
                            .engine
                            .load_into_slot(self.engine.active_slot(), &track, LOAD_TIMEOUT)
                            .await?;
                        self.playlist.lock().unwrap().update_current(loaded.clone());
                        self.engine.schedule_active(None, curve)?;
                        let _ = self.track_tx.send(Some(loaded.clone()));
                        self.events.emit_lossy(EngineEvent::TrackStarted {
                            track_id: loaded.id,
                            uri: loaded.uri,
                            timestamp: chrono::Utc::now(),
                        });
                    }
                    None => {
                        info!("playlist exhausted");
                        self.engine.stop();
                        let _ = self.track_tx.send(None);
                        self.set_state(PlayerState::Finished);
                    }
                }
            }
        }
        Ok(())
    }

    fn spawn_position_timer(self: &Arc<Self>) {
        let player = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(POSITION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if player.state() != PlayerState::Playing {
                    continue;
                }

                let current_time = player.engine.position();
                let duration = player.engine.duration().unwrap_or(0.0);
                let _ = player.position_tx.send(PlaybackPosition {
                    current_time,
                    duration,
                });

                if duration <= 0.0
                    || player.transitions_active.load(Ordering::SeqCst) > 0
                    || player.orchestrator.is_crossfade_active()
                    || player.skip_in_progress.load(Ordering::SeqCst)
                {
                    continue;
                }
                player.check_gapless_trigger(current_time, duration);
            }
        });
    }

    /// Proactive crossfade trigger: start the loop/advance fade early
    /// enough that the switch lands exactly at the track boundary.
    fn check_gapless_trigger(self: &Arc<Self>, current_time: f64, duration: f64) {
        let (repeat, repeat_count, crossfade) = {
            let config = self.config.lock().unwrap();
            (
                config.repeat_mode,
                config.repeat_count,
                config.crossfade_duration,
            )
        };

        match repeat {
            RepeatMode::SingleTrack => {
                // Short tracks get a shortened fade so the overlap never
                // exceeds 40% of the material
                let adapted = crossfade.min(0.4 * duration);
                if current_time < duration - adapted {
                    return;
                }
                let loops = self.loops_completed.fetch_add(1, Ordering::SeqCst) + 1;
                if repeat_count > 0 && loops >= repeat_count {
                    // Let the track run out; the natural end finishes it
                    self.loops_completed.store(repeat_count, Ordering::SeqCst);
                    return;
                }
                if let Some(track) = self.playlist.lock().unwrap().current().cloned() {
                    debug!(current_time, adapted, "gapless loop trigger");
                    self.spawn_transition(track, CrossfadeKind::AutomaticLoop, adapted);
                }
            }
            RepeatMode::Off | RepeatMode::Playlist => {
                if current_time < duration - END_GUARD_SECONDS {
                    return;
                }
                let next = {
                    let mut playlist = self.playlist.lock().unwrap();
                    if playlist.peek_next(repeat).is_none() {
                        None
                    } else {
                        playlist.advance_next(repeat)
                    }
                };
                if let Some(track) = next {
                    debug!(current_time, "end-of-track advance trigger");
                    let fade = crossfade.min((duration - current_time).max(END_GUARD_SECONDS));
                    self.spawn_transition(track, CrossfadeKind::AutomaticLoop, fade);
                }
                // None: Off mode at the end; the natural end finishes it
            }
        }
    }

    fn spawn_session_listener(self: &Arc<Self>) {
        let Some(mut signals) = self.session.take_signals() else {
            return;
        };
        let player = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                debug!(?signal, "session control signal");
                match signal {
                    ControlSignal::Pause { .. } | ControlSignal::CategoryIncompatible { .. } => {
                        player.do_pause_all().await;
                    }
                    ControlSignal::Resume => {
                        if let Err(error) = player.resume_all().await {
                            warn!(%error, "session-driven resume failed");
                        }
                    }
                    ControlSignal::Recover => {
                        player.recover().await;
                    }
                }
            }
        });
    }

    /// Media-services reset recovery: rebuild the session and graph, then
    /// restore the previous track, position, and transport state.
    async fn recover(self: &Arc<Self>) {
        self.events.emit_lossy(EngineEvent::RecoveryStarted {
            timestamp: chrono::Utc::now(),
        });
        let was_playing = self.state() == PlayerState::Playing;
        let position = self.engine.position();
        let track = self.playlist.lock().unwrap().current().cloned();
        let (options, curve) = {
            let config = self.config.lock().unwrap();
            (config.session_options, config.fade_curve)
        };

        info!(was_playing, position, "recovering from media services reset");
        self.orchestrator.clear_paused();
        self.engine.mark_reset();
        self.engine.stop();

        let result: Result<()> = async {
            self.session.configure(options, true)?;
            self.engine.setup();
            self.engine.start()?;

            if let Some(track) = track {
                self.engine
                    .load_into_slot(self.engine.active_slot(), &track, LOAD_TIMEOUT)
                    .await?;
                self.engine.schedule_active(None, curve)?;
                self.engine.seek(position)?;
                if was_playing {
                    self.set_state(PlayerState::Playing);
                } else {
                    self.engine.pause();
                    self.set_state(PlayerState::Paused);
                }
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.events.emit_lossy(EngineEvent::RecoveryCompleted {
                    resumed: was_playing,
                    timestamp: chrono::Utc::now(),
                });
                info!("recovery complete");
            }
            Err(error) => {
                error!(%error, "recovery failed");
                self.set_state(PlayerState::Failed {
                    reason: error.to_string(),
                });
            }
        }
    }
}
