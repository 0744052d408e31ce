//! Engine core: the dual-player graph and its primitives.
//!
//! Owns two player/mixer slots (A and B), exactly one of which is active.
//! Everything above this layer — crossfades, overlay, the facade — drives
//! playback through the primitives here; only this module writes slot mixer
//! volumes, which is what makes fades and `set_volume` interleave safely.
//!
//! # Generations
//!
//! Every schedule, stop, and seek bumps the slot's generation counter.
//! Completion callbacks carry the generation they were registered under;
//! the natural-end task forwards a completion only when its generation
//! still matches and its slot is still active. Stale callbacks (from a
//! stop, a replaced schedule, or the outgoing side of a crossfade) are
//! dropped without ceremony.

use crate::audio::cache::{BufferCache, LoadPriority};
use crate::audio::types::{DecodedBuffer, Track, TrackInfo};
use crate::error::{PlayerError, Result};
use crate::host::{AudioGraph, MixerNode, PlayerNode};
use lull_common::FadeCurve;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Frames of lead time when phase-locking the incoming player to the
/// render timeline (~186 ms at 44.1 kHz).
pub const CROSSFADE_SYNC_LEAD_FRAMES: u64 = 8192;

/// Safety fade applied before stopping the inactive player, long enough to
/// avoid a click, short enough to be inaudible as a fade.
const STOP_INACTIVE_FADE_SECONDS: f64 = 0.02;

/// Identifier for one of the two player slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub fn other(self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    fn index(self) -> usize {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }
}

/// Fade step rate buckets: more steps per second for short fades where
/// coarseness would be audible, fewer for long ambient ramps.
pub fn fade_steps_per_second(duration: f64) -> u32 {
    if duration < 1.0 {
        100
    } else if duration < 5.0 {
        50
    } else if duration < 15.0 {
        30
    } else {
        20
    }
}

/// One discrete volume ramp: write, sleep, check cancellation, repeat.
///
/// Writes the exact `to` value at the end unless cancelled; a cancelled
/// fade leaves the last stepped value in place so rollback/fast-forward can
/// take over from wherever it stopped. Returns whether the fade ran to
/// completion.
pub async fn run_fade(
    mixer: Arc<dyn MixerNode>,
    from: f32,
    to: f32,
    duration: f64,
    curve: FadeCurve,
    cancel: Option<Arc<AtomicBool>>,
) -> bool {
    let is_cancelled = || {
        cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    };

    if duration <= 0.0 {
        if !is_cancelled() {
            mixer.set_volume(to);
            return true;
        }
        return false;
    }

    let steps = ((fade_steps_per_second(duration) as f64) * duration).ceil().max(1.0) as u32;
    let step_duration = Duration::from_secs_f64(duration / steps as f64);

    for step in 1..=steps {
        if is_cancelled() {
            return false;
        }
        let progress = step as f32 / steps as f32;
        mixer.set_volume(curve.interpolate(from, to, progress));
        sleep(step_duration).await;
    }

    if is_cancelled() {
        return false;
    }
    mixer.set_volume(to);
    true
}

struct Slot {
    player: Arc<dyn PlayerNode>,
    mixer: Arc<dyn MixerNode>,
    generation: u64,
    buffer: Option<Arc<DecodedBuffer>>,
    track: Option<Track>,
    /// Playback offset within the file, in file-rate frames
    offset_frames: u64,
}

impl Slot {
    fn file_rate(&self) -> u32 {
        self.buffer.as_ref().map(|b| b.sample_rate).unwrap_or(44_100)
    }
}

struct EngineInner {
    slots: [Slot; 2],
    active: SlotId,
    target_volume: f32,
    crossfade_in_progress: bool,
    paused: bool,
    running: bool,
    /// Cancellation flag of the in-flight fade-in task, if any
    fade_in_cancel: Option<Arc<AtomicBool>>,
}

/// Dual-slot playback engine over an opaque host graph.
pub struct EngineCore {
    graph: Arc<dyn AudioGraph>,
    cache: Arc<BufferCache>,
    inner: Mutex<EngineInner>,
    completion_tx: mpsc::UnboundedSender<(SlotId, u64)>,
    completion_rx: Mutex<Option<mpsc::UnboundedReceiver<(SlotId, u64)>>>,
    natural_end_tx: mpsc::UnboundedSender<SlotId>,
    natural_end_rx: Mutex<Option<mpsc::UnboundedReceiver<SlotId>>>,
}

impl EngineCore {
    /// Attach both slots to the graph. Mixers start muted; `setup` applies
    /// the initial volume layout.
    pub fn new(graph: Arc<dyn AudioGraph>, cache: Arc<BufferCache>) -> Result<Arc<Self>> {
        let (player_a, mixer_a) = graph.attach_player()?;
        let (player_b, mixer_b) = graph.attach_player()?;
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (natural_end_tx, natural_end_rx) = mpsc::unbounded_channel();

        let make_slot = |player, mixer| Slot {
            player,
            mixer,
            generation: 0,
            buffer: None,
            track: None,
            offset_frames: 0,
        };

        Ok(Arc::new(Self {
            graph,
            cache,
            inner: Mutex::new(EngineInner {
                slots: [make_slot(player_a, mixer_a), make_slot(player_b, mixer_b)],
                active: SlotId::A,
                target_volume: 1.0,
                crossfade_in_progress: false,
                paused: false,
                running: false,
                fade_in_cancel: None,
            }),
            completion_tx,
            completion_rx: Mutex::new(Some(completion_rx)),
            natural_end_tx,
            natural_end_rx: Mutex::new(Some(natural_end_rx)),
        }))
    }

    /// Initial volume layout: both slot mixers muted, main mix at unity.
    pub fn setup(&self) {
        let inner = self.inner.lock().unwrap();
        for slot in &inner.slots {
            slot.mixer.set_volume(0.0);
        }
        self.graph.set_main_volume(1.0);
        debug!("engine graph configured");
    }

    /// Start the host graph and the natural-end filter task.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.graph
            .start()
            .map_err(|e| PlayerError::EngineStartFailed {
                reason: e.to_string(),
            })?;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.running = true;
        }

        if let Some(mut rx) = self.completion_rx.lock().unwrap().take() {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                while let Some((slot_id, generation)) = rx.recv().await {
                    let deliver = {
                        let inner = engine.inner.lock().unwrap();
                        inner.active == slot_id
                            && inner.slots[slot_id.index()].generation == generation
                    };
                    if deliver {
                        debug!(?slot_id, generation, "natural end");
                        let _ = engine.natural_end_tx.send(slot_id);
                    } else {
                        debug!(?slot_id, generation, "stale completion discarded");
                    }
                }
            });
        }
        info!("engine started");
        Ok(())
    }

    /// Halt playback: bump both generations first so in-flight completions
    /// go stale, then stop the players and zero the graph state.
    pub fn stop(&self) {
        let (players, mixers): (Vec<_>, Vec<_>) = {
            let mut inner = self.inner.lock().unwrap();
            for slot in &mut inner.slots {
                slot.generation += 1;
                slot.offset_frames = 0;
            }
            inner.paused = false;
            inner.crossfade_in_progress = false;
            inner.running = false;
            if let Some(flag) = inner.fade_in_cancel.take() {
                flag.store(true, Ordering::SeqCst);
            }
            (
                inner.slots.iter().map(|s| Arc::clone(&s.player)).collect(),
                inner.slots.iter().map(|s| Arc::clone(&s.mixer)).collect(),
            )
        };
        for player in players {
            player.stop();
            player.reset();
        }
        for mixer in mixers {
            mixer.set_volume(0.0);
        }
        self.graph.stop();
        info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    /// Take the filtered natural-end stream; a single consumer subscribes.
    pub fn take_natural_ends(&self) -> Option<mpsc::UnboundedReceiver<SlotId>> {
        self.natural_end_rx.lock().unwrap().take()
    }

    fn make_completion(&self, slot: SlotId, generation: u64) -> crate::host::ScheduleCompletion {
        let tx = self.completion_tx.clone();
        Box::new(move || {
            // Render-thread boundary: everything sent here is owned
            let _ = tx.send((slot, generation));
        })
    }

    /// Load a track's buffer into a slot via the cache.
    ///
    /// Returns the track augmented with format info. The new buffer is
    /// pinned against eviction; the slot's previous buffer is unpinned.
    pub async fn load_into_slot(
        &self,
        slot_id: SlotId,
        track: &Track,
        timeout: Duration,
    ) -> Result<Track> {
        let buffer = self
            .cache
            .get(&track.uri, LoadPriority::Immediate, timeout)
            .await?;

        let mut loaded = track.clone();
        loaded.info = Some(TrackInfo {
            duration_seconds: buffer.duration_seconds(),
            sample_rate: buffer.sample_rate,
            channels: buffer.channel_count() as u16,
            interleaved: false,
        });

        let previous_uri = {
            let mut inner = self.inner.lock().unwrap();
            let slot = &mut inner.slots[slot_id.index()];
            let previous = slot.track.as_ref().map(|t| t.uri.clone());
            slot.buffer = Some(buffer);
            slot.track = Some(loaded.clone());
            slot.offset_frames = 0;
            previous
        };

        self.cache.pin(&loaded.uri);
        if let Some(previous) = previous_uri {
            if previous != loaded.uri {
                self.cache.unpin(&previous);
            }
        }

        debug!(slot = ?slot_id, uri = %loaded.uri, "track loaded into slot");
        Ok(loaded)
    }

    /// Schedule the active slot's buffer from the start and begin playback,
    /// optionally ramping in.
    pub fn schedule_active(self: &Arc<Self>, fade_in: Option<f64>, curve: FadeCurve) -> Result<()> {
        let (player, mixer, buffer, generation, slot_id, target) = {
            let mut inner = self.inner.lock().unwrap();
            let active = inner.active;
            let target = inner.target_volume;
            let slot = &mut inner.slots[active.index()];
            let buffer = slot.buffer.clone().ok_or_else(|| {
                PlayerError::EngineStartFailed {
                    reason: "no buffer loaded in active slot".to_string(),
                }
            })?;
            slot.offset_frames = 0;
            slot.generation += 1;
            let generation = slot.generation;
            inner.paused = false;
            (
                Arc::clone(&inner.slots[active.index()].player),
                Arc::clone(&inner.slots[active.index()].mixer),
                buffer,
                generation,
                active,
                target,
            )
        };

        player.schedule(buffer, 0, Some(self.make_completion(slot_id, generation)))?;
        player.play();

        match fade_in {
            Some(duration) if duration > 0.0 => {
                mixer.set_volume(0.0);
                self.spawn_fade_in(mixer, duration, curve);
            }
            _ => mixer.set_volume(target),
        }
        Ok(())
    }

    /// Fade the active mixer from silence to the current target volume as a
    /// cancellable background task.
    fn spawn_fade_in(self: &Arc<Self>, mixer: Arc<dyn MixerNode>, duration: f64, curve: FadeCurve) {
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(previous) = inner.fade_in_cancel.replace(Arc::clone(&cancel)) {
                previous.store(true, Ordering::SeqCst);
            }
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            // Step toward the *current* target so a set_volume during the
            // ramp still lands on the right final value
            let steps =
                ((fade_steps_per_second(duration) as f64) * duration).ceil().max(1.0) as u32;
            let step_duration = Duration::from_secs_f64(duration / steps as f64);
            for step in 1..=steps {
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                let target = engine.inner.lock().unwrap().target_volume;
                let progress = step as f32 / steps as f32;
                mixer.set_volume(curve.fade_in(progress) * target);
                sleep(step_duration).await;
            }
            if !cancel.load(Ordering::SeqCst) {
                let target = engine.inner.lock().unwrap().target_volume;
                mixer.set_volume(target);
                engine.inner.lock().unwrap().fade_in_cancel = None;
            }
        });
    }

    /// Seek the active slot. Cancels any in-flight fade-in, reschedules the
    /// remainder of the file from the clamped offset, and resumes playback
    /// if the engine was not paused.
    pub fn seek(&self, time_seconds: f64) -> Result<()> {
        let (player, buffer, generation, slot_id, offset, was_paused) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(flag) = inner.fade_in_cancel.take() {
                flag.store(true, Ordering::SeqCst);
            }
            let active = inner.active;
            let was_paused = inner.paused;
            let slot = &mut inner.slots[active.index()];
            let buffer = slot.buffer.clone().ok_or_else(|| {
                PlayerError::EngineStartFailed {
                    reason: "no buffer loaded in active slot".to_string(),
                }
            })?;

            let frames = buffer.frames() as u64;
            let file_rate = buffer.sample_rate as f64;
            let clamped = (time_seconds.max(0.0) * file_rate) as u64;
            let offset = clamped.min(frames.saturating_sub(1));

            slot.generation += 1;
            slot.offset_frames = offset;
            (
                Arc::clone(&slot.player),
                buffer,
                slot.generation,
                active,
                offset,
                was_paused,
            )
        };

        player.stop();
        player.schedule(buffer, offset, Some(self.make_completion(slot_id, generation)))?;
        if !was_paused {
            player.play();
        }
        debug!(?slot_id, offset, "seek scheduled");
        Ok(())
    }

    /// Pause the active player. The in-flight fade-in, if any, is cancelled
    /// first. The position capture happens lazily at resume time, when the
    /// rendered-frame counter is folded into the slot offset and reset by
    /// the reschedule; until then position reads stay exact because the
    /// counter freezes with the player.
    pub fn pause(&self) {
        let player = {
            let mut inner = self.inner.lock().unwrap();
            if inner.paused {
                return;
            }
            if let Some(flag) = inner.fade_in_cancel.take() {
                flag.store(true, Ordering::SeqCst);
            }
            inner.paused = true;
            let active = inner.active;
            Arc::clone(&inner.slots[active.index()].player)
        };
        player.pause();
        debug!("engine paused");
    }

    /// Resume from pause by folding the frames rendered before the pause
    /// into the slot offset and rescheduling from there.
    pub fn play(&self) -> Result<()> {
        let (player, buffer, generation, slot_id, offset) = {
            let mut guard = self.inner.lock().unwrap();
            if !guard.paused {
                return Ok(());
            }
            let engine_rate = self.render_sample_rate();
            let inner = &mut *guard;
            inner.paused = false;
            let active = inner.active;
            let slot = &mut inner.slots[active.index()];
            let buffer = slot.buffer.clone().ok_or_else(|| {
                PlayerError::EngineStartFailed {
                    reason: "no buffer loaded in active slot".to_string(),
                }
            })?;

            let rendered = slot.player.rendered_frames();
            let file_rate = slot.file_rate() as f64;
            let delta = (rendered as f64 * file_rate / engine_rate) as u64;
            let frames = buffer.frames() as u64;
            slot.offset_frames = (slot.offset_frames + delta).min(frames.saturating_sub(1));
            slot.generation += 1;
            (
                Arc::clone(&slot.player),
                buffer,
                slot.generation,
                active,
                slot.offset_frames,
            )
        };

        player.stop();
        player.schedule(buffer, offset, Some(self.make_completion(slot_id, generation)))?;
        player.play();
        debug!(?slot_id, offset, "resumed from offset");
        Ok(())
    }

    /// Pause both players in place; used when a crossfade is suspended
    /// mid-flight. Neither slot is rescheduled, so a later `resume_both`
    /// continues both timelines exactly where they froze.
    pub fn pause_both(&self) {
        let (active, inactive) = {
            let mut inner = self.inner.lock().unwrap();
            inner.paused = true;
            if let Some(flag) = inner.fade_in_cancel.take() {
                flag.store(true, Ordering::SeqCst);
            }
            let active = inner.active;
            (
                Arc::clone(&inner.slots[active.index()].player),
                Arc::clone(&inner.slots[active.other().index()].player),
            )
        };
        active.pause();
        inactive.pause();
        debug!("both players paused");
    }

    /// Resume both players after a paused crossfade.
    pub fn resume_both(&self) {
        let (active, inactive) = {
            let mut inner = self.inner.lock().unwrap();
            inner.paused = false;
            let active = inner.active;
            (
                Arc::clone(&inner.slots[active.index()].player),
                Arc::clone(&inner.slots[active.other().index()].player),
            )
        };
        active.play();
        inactive.play();
    }

    /// Master volume. Clamps, records the target, writes the main mixer
    /// immediately, and mirrors to the active slot unless a crossfade or
    /// fade-in currently owns that mixer.
    pub fn set_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 1.0);
        let mixer = {
            let mut inner = self.inner.lock().unwrap();
            inner.target_volume = clamped;
            if inner.crossfade_in_progress || inner.fade_in_cancel.is_some() {
                None
            } else {
                let active = inner.active;
                Some(Arc::clone(&inner.slots[active.index()].mixer))
            }
        };
        self.graph.set_main_volume(clamped);
        if let Some(mixer) = mixer {
            mixer.set_volume(clamped);
        }
        debug!(volume = clamped, "target volume set");
    }

    /// Run a fade on one slot's mixer. `from` defaults to the mixer's
    /// current volume.
    pub async fn fade_slot(
        &self,
        slot_id: SlotId,
        from: Option<f32>,
        to: f32,
        duration: f64,
        curve: FadeCurve,
        cancel: Option<Arc<AtomicBool>>,
    ) -> bool {
        let mixer = {
            let inner = self.inner.lock().unwrap();
            Arc::clone(&inner.slots[slot_id.index()].mixer)
        };
        let from = from.unwrap_or_else(|| mixer.volume());
        run_fade(mixer, from, to, duration, curve, cancel).await
    }

    // ------------------------------------------------------------------
    // Crossfade primitives, driven by the orchestrator
    // ------------------------------------------------------------------

    /// Schedule the already-loaded file on the inactive slot at volume 0
    /// without starting playback.
    pub fn prepare_inactive(&self) -> Result<()> {
        let (player, mixer, buffer, generation, slot_id) = {
            let mut inner = self.inner.lock().unwrap();
            let inactive = inner.active.other();
            let slot = &mut inner.slots[inactive.index()];
            let buffer = slot.buffer.clone().ok_or_else(|| {
                PlayerError::EngineStartFailed {
                    reason: "no buffer loaded in inactive slot".to_string(),
                }
            })?;
            slot.offset_frames = 0;
            slot.generation += 1;
            (
                Arc::clone(&slot.player),
                Arc::clone(&slot.mixer),
                buffer,
                slot.generation,
                inactive,
            )
        };

        mixer.set_volume(0.0);
        player.schedule(buffer, 0, Some(self.make_completion(slot_id, generation)))?;
        debug!(?slot_id, "inactive slot prepared");
        Ok(())
    }

    /// Future render-clock anchor both players can agree on.
    pub fn synced_start_time(&self) -> Option<u64> {
        self.graph
            .render_clock()
            .map(|clock| clock.sample_time + CROSSFADE_SYNC_LEAD_FRAMES)
    }

    /// Ramp the active slot out and the inactive slot in over `duration`.
    ///
    /// Returns `true` when the ramp ran to completion (active = 0,
    /// inactive = target) and `false` when `cancel` tripped mid-fade, in
    /// which case the mixers hold whatever step was last written. The
    /// caller is responsible for `switch_active` on success and for
    /// rollback/fast-forward on cancellation.
    pub async fn execute_crossfade(
        &self,
        duration: f64,
        curve: FadeCurve,
        cancel: Arc<AtomicBool>,
        progress: impl Fn(f32) + Send + Sync,
    ) -> bool {
        let (active_mixer, inactive_mixer, inactive_player, target) = {
            let mut inner = self.inner.lock().unwrap();
            inner.crossfade_in_progress = true;
            let active = inner.active;
            (
                Arc::clone(&inner.slots[active.index()].mixer),
                Arc::clone(&inner.slots[active.other().index()].mixer),
                Arc::clone(&inner.slots[active.other().index()].player),
                inner.target_volume,
            )
        };

        // Phase-lock the incoming player to the shared timeline
        match self.synced_start_time() {
            Some(anchor) => inactive_player.play_at(anchor),
            None => inactive_player.play(),
        }

        let steps = ((fade_steps_per_second(duration) as f64) * duration).ceil().max(1.0) as u32;
        let step_duration = Duration::from_secs_f64(duration / steps as f64);

        for step in 1..=steps {
            if cancel.load(Ordering::SeqCst) {
                debug!("crossfade cancelled at step {step}/{steps}");
                return false;
            }
            let p = step as f32 / steps as f32;
            active_mixer.set_volume(curve.fade_out(p) * target);
            inactive_mixer.set_volume(curve.fade_in(p) * target);
            progress(p);
            sleep(step_duration).await;
        }

        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        active_mixer.set_volume(0.0);
        inactive_mixer.set_volume(target);
        true
    }

    /// Linearly interpolate both mixers from explicit starting volumes to
    /// `(0, target)`; the resume path of a paused crossfade.
    pub async fn fade_from_volumes(
        &self,
        active_from: f32,
        inactive_from: f32,
        duration: f64,
        cancel: Arc<AtomicBool>,
        progress: impl Fn(f32) + Send + Sync,
    ) -> bool {
        let (active_mixer, inactive_mixer, target) = {
            let mut inner = self.inner.lock().unwrap();
            inner.crossfade_in_progress = true;
            let active = inner.active;
            (
                Arc::clone(&inner.slots[active.index()].mixer),
                Arc::clone(&inner.slots[active.other().index()].mixer),
                inner.target_volume,
            )
        };

        let steps = ((fade_steps_per_second(duration) as f64) * duration).ceil().max(1.0) as u32;
        let step_duration = Duration::from_secs_f64(duration / steps as f64);
        let curve = FadeCurve::Linear;

        for step in 1..=steps {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
            let p = step as f32 / steps as f32;
            active_mixer.set_volume(curve.interpolate(active_from, 0.0, p));
            inactive_mixer.set_volume(curve.interpolate(inactive_from, target, p));
            progress(p);
            sleep(step_duration).await;
        }

        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        active_mixer.set_volume(0.0);
        inactive_mixer.set_volume(target);
        true
    }

    /// Undo an in-flight crossfade: restore the active mixer to target,
    /// silence and stop the incoming player. Returns the active mixer
    /// volume observed before the restore began.
    pub async fn rollback(&self, duration: f64) -> f32 {
        let (active_mixer, inactive_mixer, inactive_player, target) = {
            let inner = self.inner.lock().unwrap();
            let active = inner.active;
            (
                Arc::clone(&inner.slots[active.index()].mixer),
                Arc::clone(&inner.slots[active.other().index()].mixer),
                Arc::clone(&inner.slots[active.other().index()].player),
                inner.target_volume,
            )
        };

        let pre_rollback = active_mixer.volume();
        let up = run_fade(
            Arc::clone(&active_mixer),
            pre_rollback,
            target,
            duration,
            FadeCurve::Linear,
            None,
        );
        let down = run_fade(
            Arc::clone(&inactive_mixer),
            inactive_mixer.volume(),
            0.0,
            duration,
            FadeCurve::Linear,
            None,
        );
        tokio::join!(up, down);

        inactive_player.stop();
        inactive_player.reset();
        {
            let mut inner = self.inner.lock().unwrap();
            let inactive = inner.active.other();
            let slot = &mut inner.slots[inactive.index()];
            slot.generation += 1;
            slot.offset_frames = 0;
            inner.crossfade_in_progress = false;
        }
        info!("crossfade rolled back");
        pre_rollback
    }

    /// Complete an in-flight crossfade early: active to silence, incoming
    /// to target, then flip the active slot.
    pub async fn fast_forward(&self, duration: f64) {
        let (active_mixer, inactive_mixer, target) = {
            let inner = self.inner.lock().unwrap();
            let active = inner.active;
            (
                Arc::clone(&inner.slots[active.index()].mixer),
                Arc::clone(&inner.slots[active.other().index()].mixer),
                inner.target_volume,
            )
        };

        let down = run_fade(
            Arc::clone(&active_mixer),
            active_mixer.volume(),
            0.0,
            duration,
            FadeCurve::Linear,
            None,
        );
        let up = run_fade(
            Arc::clone(&inactive_mixer),
            inactive_mixer.volume(),
            target,
            duration,
            FadeCurve::Linear,
            None,
        );
        tokio::join!(down, up);
        self.switch_active();
        info!("crossfade fast-forwarded");
    }

    /// Silence and halt the inactive player with a click-eliminating fade,
    /// leaving the slot reset for the next transition.
    pub async fn stop_inactive(&self) {
        let (player, mixer, slot_id) = {
            let inner = self.inner.lock().unwrap();
            let inactive = inner.active.other();
            (
                Arc::clone(&inner.slots[inactive.index()].player),
                Arc::clone(&inner.slots[inactive.index()].mixer),
                inactive,
            )
        };

        run_fade(
            Arc::clone(&mixer),
            mixer.volume(),
            0.0,
            STOP_INACTIVE_FADE_SECONDS,
            FadeCurve::Linear,
            None,
        )
        .await;

        player.stop();
        player.reset();
        mixer.set_volume(0.0);
        {
            let mut inner = self.inner.lock().unwrap();
            let slot = &mut inner.slots[slot_id.index()];
            slot.generation += 1;
            slot.offset_frames = 0;
            inner.crossfade_in_progress = false;
        }
        debug!(?slot_id, "inactive slot stopped");
    }

    /// Flip which slot is active.
    pub fn switch_active(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active = inner.active.other();
        info!(active = ?inner.active, "active slot switched");
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    fn render_sample_rate(&self) -> f64 {
        self.graph
            .render_clock()
            .map(|clock| clock.sample_rate)
            .unwrap_or_else(|| self.graph.output_sample_rate())
    }

    /// Playback position in seconds within the active track.
    pub fn position(&self) -> f64 {
        let active = self.active_slot();
        self.slot_position(active)
    }

    /// Position of a specific slot: schedule offset at the file rate plus
    /// frames rendered since that schedule at the engine rate. The rendered
    /// counter freezes while the player is paused and resets on every
    /// reschedule, so the sum is exact in every state.
    pub fn slot_position(&self, slot_id: SlotId) -> f64 {
        let (player, offset, file_rate) = {
            let inner = self.inner.lock().unwrap();
            let slot = &inner.slots[slot_id.index()];
            (
                Arc::clone(&slot.player),
                slot.offset_frames,
                slot.file_rate() as f64,
            )
        };
        offset as f64 / file_rate + player.rendered_frames() as f64 / self.render_sample_rate()
    }

    /// Duration in seconds of the active track, if loaded.
    pub fn duration(&self) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        inner.slots[inner.active.index()]
            .buffer
            .as_ref()
            .map(|b| b.duration_seconds())
    }

    pub fn active_slot(&self) -> SlotId {
        self.inner.lock().unwrap().active
    }

    pub fn target_volume(&self) -> f32 {
        self.inner.lock().unwrap().target_volume
    }

    pub fn main_volume(&self) -> f32 {
        self.graph.main_volume()
    }

    pub fn mixer_volume(&self, slot_id: SlotId) -> f32 {
        self.inner.lock().unwrap().slots[slot_id.index()]
            .mixer
            .volume()
    }

    pub fn slot_generation(&self, slot_id: SlotId) -> u64 {
        self.inner.lock().unwrap().slots[slot_id.index()].generation
    }

    pub fn slot_track(&self, slot_id: SlotId) -> Option<Track> {
        self.inner.lock().unwrap().slots[slot_id.index()]
            .track
            .clone()
    }

    pub fn is_crossfade_in_progress(&self) -> bool {
        self.inner.lock().unwrap().crossfade_in_progress
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    pub fn is_slot_playing(&self, slot_id: SlotId) -> bool {
        let player = {
            let inner = self.inner.lock().unwrap();
            Arc::clone(&inner.slots[slot_id.index()].player)
        };
        player.is_playing()
    }

    /// Offsets both slots to zero and re-marks the engine stopped without
    /// touching the graph; used by media-services recovery before the graph
    /// is rebuilt.
    pub fn mark_reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.running = false;
        for slot in &mut inner.slots {
            slot.generation += 1;
        }
        warn!("engine marked reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::SimGraph;

    #[test]
    fn test_slot_other_flips() {
        assert_eq!(SlotId::A.other(), SlotId::B);
        assert_eq!(SlotId::B.other(), SlotId::A);
    }

    #[test]
    fn test_fade_step_rate_buckets() {
        assert_eq!(fade_steps_per_second(0.5), 100);
        assert_eq!(fade_steps_per_second(0.999), 100);
        assert_eq!(fade_steps_per_second(1.0), 50);
        assert_eq!(fade_steps_per_second(4.9), 50);
        assert_eq!(fade_steps_per_second(5.0), 30);
        assert_eq!(fade_steps_per_second(14.9), 30);
        assert_eq!(fade_steps_per_second(15.0), 20);
        assert_eq!(fade_steps_per_second(120.0), 20);
    }

    fn sim_mixer() -> Arc<dyn MixerNode> {
        let graph = SimGraph::new();
        let (_player, mixer) = crate::host::AudioGraph::attach_player(&graph).unwrap();
        mixer
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fade_writes_exact_endpoint() {
        let mixer = sim_mixer();
        let completed = run_fade(
            Arc::clone(&mixer),
            0.0,
            0.73,
            1.0,
            FadeCurve::EqualPower,
            None,
        )
        .await;
        assert!(completed);
        assert_eq!(mixer.volume(), 0.73);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_fade_zero_duration_is_immediate() {
        let mixer = sim_mixer();
        assert!(run_fade(Arc::clone(&mixer), 0.0, 1.0, 0.0, FadeCurve::Linear, None).await);
        assert_eq!(mixer.volume(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fade_skips_final_write() {
        let mixer = sim_mixer();
        mixer.set_volume(0.9);
        let cancel = Arc::new(AtomicBool::new(false));

        let fade = {
            let mixer = Arc::clone(&mixer);
            let cancel = Arc::clone(&cancel);
            tokio::spawn(async move {
                run_fade(mixer, 0.9, 0.0, 2.0, FadeCurve::Linear, Some(cancel)).await
            })
        };

        sleep(Duration::from_secs(1)).await;
        cancel.store(true, Ordering::SeqCst);
        let completed = fade.await.unwrap();

        assert!(!completed);
        // The fade stopped mid-ramp; the mixer holds the last step, not 0
        let held = mixer.volume();
        assert!(held > 0.2 && held < 0.7, "held volume {held}");
    }
}
