//! Crossfade orchestrator: the state machine around every cross-slot
//! transition.
//!
//! A transition walks Preparing → Fading → Switching → Cleanup. While the
//! fade is in flight, three things can interrupt it — pause, rollback, and
//! fast-forward — all delivered by cooperative cancellation: the interloper
//! records its intent, trips the cancel flag, and waits; the driving task
//! observes the cancelled fade, performs the requested engine work, and
//! signals completion. Only the driver touches the engine mid-transition,
//! which keeps the interleavings tractable.
//!
//! A paused crossfade is an explicit snapshot value, not a pile of side
//! effects: volumes, positions, the active slot, and the remaining
//! duration, enough to resume losslessly or to decide a replacement policy
//! from fractional progress.

use crate::error::{PlayerError, Result};
use crate::playback::engine::{EngineCore, SlotId};
use crate::audio::types::Track;
use lull_common::{
    CrossfadeKind, CrossfadePhase, CrossfadeProgress, EngineEvent, EventBus, FadeCurve,
    PlayerState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Settle time after the switch before declaring the transition done.
const CLEANUP_SETTLE: Duration = Duration::from_millis(50);

/// How a transition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossfadeOutcome {
    /// The incoming track is now the active track
    Completed,
    /// Suspended mid-fade with a snapshot for later resume
    Paused,
    /// Rolled back to the outgoing track
    Cancelled,
}

/// Snapshot of a crossfade suspended mid-fade.
#[derive(Debug, Clone)]
pub struct PausedCrossfade {
    pub active_volume: f32,
    pub inactive_volume: f32,
    pub active_position: f64,
    pub inactive_position: f64,
    pub active_slot: SlotId,
    /// Seconds of fade left to run on resume
    pub remaining: f64,
    pub curve: FadeCurve,
    pub kind: CrossfadeKind,
}

/// What an interrupting caller asked the driver to do.
enum PendingAction {
    Pause,
    Rollback { duration: f64 },
    FastForward { duration: f64 },
}

struct CurrentFade {
    cancel: Arc<AtomicBool>,
    duration: f64,
    curve: FadeCurve,
    kind: CrossfadeKind,
    started: tokio::time::Instant,
}

struct OrchState {
    current: Option<CurrentFade>,
    pending: Option<PendingAction>,
    paused: Option<PausedCrossfade>,
}

/// Decision for an incoming manual change while a crossfade is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    /// Early in the fade: undo it, crossfade from the unchanged active track
    Rollback,
    /// Nearly done: wait briefly for completion, then crossfade fresh
    WaitForCompletion,
    /// Mid-fade: complete to the incoming track, then crossfade from it
    FastForward,
}

impl ReplacementPolicy {
    /// Policy thresholds over fractional progress.
    pub fn for_progress(progress: f32) -> Self {
        if progress < 0.2 {
            ReplacementPolicy::Rollback
        } else if progress > 0.9 {
            ReplacementPolicy::WaitForCompletion
        } else {
            ReplacementPolicy::FastForward
        }
    }
}

/// Orchestrates crossfades over the engine core.
pub struct CrossfadeOrchestrator {
    engine: Arc<EngineCore>,
    state: Mutex<OrchState>,
    progress_tx: watch::Sender<CrossfadeProgress>,
    events: EventBus,
    action_done: Notify,
}

impl CrossfadeOrchestrator {
    pub fn new(engine: Arc<EngineCore>, events: EventBus) -> Arc<Self> {
        let (progress_tx, _) = watch::channel(CrossfadeProgress::idle());
        Arc::new(Self {
            engine,
            state: Mutex::new(OrchState {
                current: None,
                pending: None,
                paused: None,
            }),
            progress_tx,
            events,
            action_done: Notify::new(),
        })
    }

    /// Current-value subject for crossfade progress.
    pub fn subscribe_progress(&self) -> watch::Receiver<CrossfadeProgress> {
        self.progress_tx.subscribe()
    }

    pub fn is_crossfade_active(&self) -> bool {
        self.state.lock().unwrap().current.is_some()
    }

    pub fn has_paused_crossfade(&self) -> bool {
        self.state.lock().unwrap().paused.is_some()
    }

    /// Fractional progress of the in-flight fade, if any.
    pub fn current_progress(&self) -> Option<f32> {
        let state = self.state.lock().unwrap();
        let current = state.current.as_ref()?;
        let elapsed = current.started.elapsed().as_secs_f64();
        Some((elapsed / current.duration.max(1e-9)).clamp(0.0, 1.0) as f32)
    }

    fn publish_phase(&self, phase: CrossfadePhase, duration: f64, elapsed: f64) {
        let progress = CrossfadeProgress {
            phase,
            duration: duration as f32,
            elapsed: elapsed as f32,
        };
        let _ = self.progress_tx.send(progress);
        self.events.emit_lossy(EngineEvent::CrossfadeProgressed {
            progress,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Run a full transition to `to_track`.
    ///
    /// The inactive slot is loaded and prepared, the fade executes, and on
    /// success the slots flip and the outgoing player is cleaned up.
    /// Returns how the transition ended; failures before the fade roll the
    /// engine back to the untouched active player and re-publish Idle.
    pub async fn start_crossfade(
        self: &Arc<Self>,
        to_track: &Track,
        duration: f64,
        curve: FadeCurve,
        kind: CrossfadeKind,
        load_timeout: Duration,
    ) -> Result<CrossfadeOutcome> {
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state.lock().unwrap();
            if state.current.is_some() {
                return Err(PlayerError::invalid_state(
                    PlayerState::Playing,
                    "start a crossfade while one is active",
                ));
            }
            if state.paused.is_some() {
                return Err(PlayerError::invalid_state(
                    PlayerState::Paused,
                    "start a crossfade while one is paused",
                ));
            }
            state.pending = None;
            state.current = Some(CurrentFade {
                cancel: Arc::clone(&cancel),
                duration,
                curve,
                kind,
                started: tokio::time::Instant::now(),
            });
        }

        // Preparing
        self.publish_phase(CrossfadePhase::Preparing, duration, 0.0);
        let prepared: Result<()> = async {
            let active = self.engine.active_slot();
            if !self.engine.is_slot_playing(active) {
                return Err(PlayerError::EngineStartFailed {
                    reason: "active slot is not playing".to_string(),
                });
            }
            self.engine
                .load_into_slot(active.other(), to_track, load_timeout)
                .await?;
            self.engine.prepare_inactive()?;
            Ok(())
        }
        .await;

        if let Err(error) = prepared {
            warn!(%error, "crossfade preparation failed");
            let pending = {
                let mut state = self.state.lock().unwrap();
                state.current = None;
                state.pending.take()
            };
            if pending.is_some() {
                // Unblock an interrupter that raced the failed preparation
                self.action_done.notify_one();
            }
            self.publish_phase(CrossfadePhase::Idle, 0.0, 0.0);
            return Err(error);
        }

        info!(uri = %to_track.uri, duration, ?kind, "crossfade started");
        // The fade clock starts now; load time must not count as progress
        {
            let mut state = self.state.lock().unwrap();
            if let Some(current) = state.current.as_mut() {
                current.started = tokio::time::Instant::now();
            }
        }
        let progress_fn = self.fading_progress_fn(duration);
        let completed = self
            .engine
            .execute_crossfade(duration, curve, Arc::clone(&cancel), progress_fn)
            .await;
        self.finish_fading(completed, duration).await
    }

    /// Resume a paused crossfade from its snapshot. Returns false when no
    /// snapshot exists.
    pub async fn resume_crossfade(self: &Arc<Self>) -> Result<bool> {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if state.current.is_some() {
                return Ok(false);
            }
            match state.paused.take() {
                Some(snapshot) => snapshot,
                None => return Ok(false),
            }
        };

        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state.lock().unwrap();
            state.pending = None;
            state.current = Some(CurrentFade {
                cancel: Arc::clone(&cancel),
                duration: snapshot.remaining,
                curve: snapshot.curve,
                kind: snapshot.kind,
                started: tokio::time::Instant::now(),
            });
        }

        info!(remaining = snapshot.remaining, "resuming paused crossfade");
        self.engine.resume_both();

        let progress_fn = self.fading_progress_fn(snapshot.remaining);
        let completed = self
            .engine
            .fade_from_volumes(
                snapshot.active_volume,
                snapshot.inactive_volume,
                snapshot.remaining,
                Arc::clone(&cancel),
                progress_fn,
            )
            .await;
        self.finish_fading(completed, snapshot.remaining).await?;
        Ok(true)
    }

    fn fading_progress_fn(self: &Arc<Self>, duration: f64) -> impl Fn(f32) + Send + Sync {
        let orchestrator = Arc::clone(self);
        move |fraction: f32| {
            let progress = CrossfadeProgress {
                phase: CrossfadePhase::Fading { fraction },
                duration: duration as f32,
                elapsed: duration as f32 * fraction,
            };
            let _ = orchestrator.progress_tx.send(progress);
        }
    }

    /// Shared tail of initial and resumed fades: on completion walk
    /// Switching/Cleanup; on cancellation execute whatever the interrupting
    /// caller recorded.
    async fn finish_fading(
        self: &Arc<Self>,
        completed: bool,
        duration: f64,
    ) -> Result<CrossfadeOutcome> {
        if completed {
            self.publish_phase(CrossfadePhase::Switching, duration, duration);
            self.engine.switch_active();

            self.publish_phase(CrossfadePhase::Cleanup, duration, duration);
            self.engine.stop_inactive().await;
            sleep(CLEANUP_SETTLE).await;

            // An interrupting caller may have raced the final fade step; its
            // recorded intent must still be acknowledged. A pause that lost
            // the race pauses the freshly switched track; rollback and
            // fast-forward have nothing left to act on.
            let pending = {
                let mut state = self.state.lock().unwrap();
                state.current = None;
                state.pending.take()
            };
            if let Some(action) = pending {
                if matches!(action, PendingAction::Pause) {
                    self.engine.pause();
                }
                self.action_done.notify_one();
            }

            self.publish_phase(CrossfadePhase::Idle, 0.0, 0.0);
            return Ok(CrossfadeOutcome::Completed);
        }

        let (pending, snapshot_basis) = {
            let mut state = self.state.lock().unwrap();
            let pending = state.pending.take();
            let basis = state.current.as_ref().map(|current| {
                let elapsed = current.started.elapsed().as_secs_f64();
                (
                    (current.duration - elapsed).max(0.0),
                    current.curve,
                    current.kind,
                )
            });
            (pending, basis)
        };

        match pending {
            Some(PendingAction::Pause) => {
                let (remaining, curve, kind) = snapshot_basis.unwrap_or((0.0, FadeCurve::Linear, CrossfadeKind::ManualChange));
                let active = self.engine.active_slot();
                let snapshot = PausedCrossfade {
                    active_volume: self.engine.mixer_volume(active),
                    inactive_volume: self.engine.mixer_volume(active.other()),
                    active_position: self.engine.slot_position(active),
                    inactive_position: self.engine.slot_position(active.other()),
                    active_slot: active,
                    remaining,
                    curve,
                    kind,
                };
                self.engine.pause_both();
                debug!(?snapshot, "crossfade paused mid-fade");
                {
                    let mut state = self.state.lock().unwrap();
                    state.paused = Some(snapshot);
                    state.current = None;
                }
                self.action_done.notify_one();
                Ok(CrossfadeOutcome::Paused)
            }
            Some(PendingAction::Rollback { duration }) => {
                self.engine.rollback(duration).await;
                self.state.lock().unwrap().current = None;
                self.publish_phase(CrossfadePhase::Idle, 0.0, 0.0);
                self.action_done.notify_one();
                Ok(CrossfadeOutcome::Cancelled)
            }
            Some(PendingAction::FastForward { duration }) => {
                self.engine.fast_forward(duration).await;
                self.engine.stop_inactive().await;
                self.state.lock().unwrap().current = None;
                self.publish_phase(CrossfadePhase::Idle, 0.0, 0.0);
                self.action_done.notify_one();
                Ok(CrossfadeOutcome::Completed)
            }
            None => {
                // Cancelled externally (engine stop); nothing to restore
                self.state.lock().unwrap().current = None;
                self.publish_phase(CrossfadePhase::Idle, 0.0, 0.0);
                Ok(CrossfadeOutcome::Cancelled)
            }
        }
    }

    /// Suspend the in-flight crossfade, recording a snapshot. Returns false
    /// when no fade is in flight.
    pub async fn pause_current(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            let cancel = match state.current.as_ref() {
                Some(current) => Arc::clone(&current.cancel),
                None => return false,
            };
            state.pending = Some(PendingAction::Pause);
            cancel.store(true, Ordering::SeqCst);
        }
        self.action_done.notified().await;
        true
    }

    /// Cancel the transition and restore the outgoing track. Works on both
    /// an in-flight fade and a paused snapshot.
    pub async fn rollback_current(&self, duration: f64) -> bool {
        let in_flight = {
            let mut state = self.state.lock().unwrap();
            match state.current.as_ref().map(|c| Arc::clone(&c.cancel)) {
                Some(cancel) => {
                    state.pending = Some(PendingAction::Rollback { duration });
                    cancel.store(true, Ordering::SeqCst);
                    true
                }
                None => false,
            }
        };
        if in_flight {
            self.action_done.notified().await;
            return true;
        }

        let had_snapshot = self.state.lock().unwrap().paused.take().is_some();
        if had_snapshot {
            self.engine.rollback(duration).await;
            self.publish_phase(CrossfadePhase::Idle, 0.0, 0.0);
        }
        had_snapshot
    }

    /// Complete the transition early to the incoming track. Works on both
    /// an in-flight fade and a paused snapshot.
    pub async fn fast_forward(&self, duration: f64) -> bool {
        let in_flight = {
            let mut state = self.state.lock().unwrap();
            match state.current.as_ref().map(|c| Arc::clone(&c.cancel)) {
                Some(cancel) => {
                    state.pending = Some(PendingAction::FastForward { duration });
                    cancel.store(true, Ordering::SeqCst);
                    true
                }
                None => false,
            }
        };
        if in_flight {
            self.action_done.notified().await;
            return true;
        }

        let had_snapshot = self.state.lock().unwrap().paused.take().is_some();
        if had_snapshot {
            self.engine.resume_both();
            self.engine.fast_forward(duration).await;
            self.engine.stop_inactive().await;
            self.publish_phase(CrossfadePhase::Idle, 0.0, 0.0);
        }
        had_snapshot
    }

    /// Fade out, seek, fade back in; manual skip within a track.
    pub async fn perform_fade_seek_fade(
        &self,
        target_time: f64,
        fade_out: f64,
        fade_in: f64,
        curve: FadeCurve,
    ) -> Result<()> {
        let active = self.engine.active_slot();
        let target = self.engine.target_volume();

        self.engine
            .fade_slot(active, None, 0.0, fade_out, curve, None)
            .await;
        self.engine.seek(target_time)?;
        self.engine
            .fade_slot(active, Some(0.0), target, fade_in, curve, None)
            .await;
        Ok(())
    }

    /// Fade the active mixer to silence; pause without a crossfade.
    pub async fn perform_simple_fade_out(&self, duration: f64, curve: FadeCurve) {
        let active = self.engine.active_slot();
        self.engine
            .fade_slot(active, None, 0.0, duration, curve, None)
            .await;
    }

    /// Fade the active mixer back to target; resume without a snapshot.
    pub async fn perform_simple_fade_in(&self, duration: f64, curve: FadeCurve) {
        let active = self.engine.active_slot();
        let target = self.engine.target_volume();
        self.engine
            .fade_slot(active, None, target, duration, curve, None)
            .await;
    }

    /// Paused-crossfade snapshot, if one exists.
    pub fn paused_snapshot(&self) -> Option<PausedCrossfade> {
        self.state.lock().unwrap().paused.clone()
    }

    /// Drop any paused snapshot without engine work (used by stop).
    pub fn clear_paused(&self) {
        self.state.lock().unwrap().paused = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replacement_policy_thresholds() {
        assert_eq!(
            ReplacementPolicy::for_progress(0.1),
            ReplacementPolicy::Rollback
        );
        assert_eq!(
            ReplacementPolicy::for_progress(0.19),
            ReplacementPolicy::Rollback
        );
        assert_eq!(
            ReplacementPolicy::for_progress(0.5),
            ReplacementPolicy::FastForward
        );
        assert_eq!(
            ReplacementPolicy::for_progress(0.91),
            ReplacementPolicy::WaitForCompletion
        );
    }
}
