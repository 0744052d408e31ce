//! Simulated host graph and session.
//!
//! Drives schedule-completion callbacks from tokio timers instead of a real
//! render thread, so the full engine can run headless. Integration tests run
//! it under `tokio::test(start_paused = true)` where timers auto-advance;
//! embedders can also use it as a reference for bridging a platform graph.
//!
//! Playback is modeled as wall-clock progress through the scheduled region:
//! a segment of N frames at rate R "renders" for N/R seconds and then fires
//! its completion, exactly like a data-played-back callback. Stopping a
//! player fires the pending completion immediately, as platform graphs do,
//! which is what makes generation filtering in the engine observable.

use super::{
    AudioGraph, AudioSession, GraphError, MixerNode, PlayerNode, RenderClock, ScheduleCompletion,
    SessionCategory, SessionNotification, SessionOptions,
};
use crate::audio::types::DecodedBuffer;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

/// A mixer register: one clamped volume.
pub struct SimMixer {
    volume: Mutex<f32>,
}

impl SimMixer {
    fn new(initial: f32) -> Self {
        Self {
            volume: Mutex::new(initial),
        }
    }
}

impl MixerNode for SimMixer {
    fn set_volume(&self, volume: f32) {
        *self.volume.lock().unwrap() = volume.clamp(0.0, 1.0);
    }

    fn volume(&self) -> f32 {
        *self.volume.lock().unwrap()
    }
}

struct ScheduledSegment {
    duration_seconds: f64,
    completion: Option<ScheduleCompletion>,
}

struct PlayerState {
    scheduled: Option<ScheduledSegment>,
    playing: bool,
    started_at: Option<Instant>,
    /// Seconds of the current segment rendered before the latest pause
    played_seconds: f64,
    /// Bumped on every schedule/pause/stop to invalidate pending timers
    epoch: u64,
}

/// A player node whose rendering is a tokio timer.
pub struct SimPlayer {
    state: Arc<Mutex<PlayerState>>,
    output_sample_rate: f64,
}

impl SimPlayer {
    fn new(output_sample_rate: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlayerState {
                scheduled: None,
                playing: false,
                started_at: None,
                played_seconds: 0.0,
                epoch: 0,
            })),
            output_sample_rate,
        }
    }

    /// Spawn the completion timer for the remaining part of the segment.
    fn arm_completion(state: Arc<Mutex<PlayerState>>, epoch: u64, remaining: f64) {
        tokio::spawn(async move {
            sleep(Duration::from_secs_f64(remaining.max(0.0))).await;
            let completion = {
                let mut guard = state.lock().unwrap();
                if guard.epoch != epoch || !guard.playing {
                    return;
                }
                guard.playing = false;
                guard
                    .scheduled
                    .as_mut()
                    .and_then(|seg| seg.completion.take())
            };
            if let Some(completion) = completion {
                completion();
            }
        });
    }

    fn begin_playing(&self) {
        let (epoch, remaining) = {
            let mut guard = self.state.lock().unwrap();
            if guard.playing {
                return;
            }
            let Some(segment) = guard.scheduled.as_ref() else {
                return;
            };
            let remaining = segment.duration_seconds - guard.played_seconds;
            guard.playing = true;
            guard.started_at = Some(Instant::now());
            (guard.epoch, remaining)
        };
        Self::arm_completion(Arc::clone(&self.state), epoch, remaining);
    }
}

impl PlayerNode for SimPlayer {
    fn schedule(
        &self,
        buffer: Arc<DecodedBuffer>,
        from_frame: u64,
        completion: Option<ScheduleCompletion>,
    ) -> Result<(), GraphError> {
        let total_frames = buffer.frames() as u64;
        let frames = total_frames.saturating_sub(from_frame);
        let duration_seconds = frames as f64 / buffer.sample_rate.max(1) as f64;

        let mut guard = self.state.lock().unwrap();
        guard.epoch += 1;
        guard.played_seconds = 0.0;
        guard.started_at = None;
        guard.playing = false;
        guard.scheduled = Some(ScheduledSegment {
            duration_seconds,
            completion,
        });
        debug!(frames, duration_seconds, "sim player scheduled");
        Ok(())
    }

    fn play(&self) {
        self.begin_playing();
    }

    fn play_at(&self, _sample_time: u64) {
        // Phase anchoring collapses to "start now" in the simulation; the
        // 8192-sample lead is ~0.19 s of headroom on real hardware.
        self.begin_playing();
    }

    fn pause(&self) {
        let mut guard = self.state.lock().unwrap();
        if !guard.playing {
            return;
        }
        if let Some(started) = guard.started_at.take() {
            guard.played_seconds += started.elapsed().as_secs_f64();
        }
        guard.playing = false;
        guard.epoch += 1;
    }

    fn stop(&self) {
        let completion = {
            let mut guard = self.state.lock().unwrap();
            guard.epoch += 1;
            guard.playing = false;
            guard.started_at = None;
            guard.played_seconds = 0.0;
            guard
                .scheduled
                .take()
                .and_then(|mut seg| seg.completion.take())
        };
        // Stopping flushes the schedule; the host still reports the data
        // callback, which the engine discards via its generation token.
        if let Some(completion) = completion {
            completion();
        }
    }

    fn reset(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.epoch += 1;
        guard.scheduled = None;
        guard.playing = false;
        guard.started_at = None;
        guard.played_seconds = 0.0;
    }

    fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }

    fn rendered_frames(&self) -> u64 {
        let guard = self.state.lock().unwrap();
        let mut seconds = guard.played_seconds;
        if guard.playing {
            if let Some(started) = guard.started_at {
                seconds += started.elapsed().as_secs_f64();
            }
        }
        (seconds * self.output_sample_rate) as u64
    }
}

struct GraphState {
    running: bool,
    started_at: Option<Instant>,
    accumulated_samples: u64,
}

/// Simulated node graph.
pub struct SimGraph {
    state: Mutex<GraphState>,
    main_volume: Mutex<f32>,
    output_sample_rate: f64,
}

impl SimGraph {
    pub fn new() -> Self {
        Self::with_sample_rate(44_100.0)
    }

    pub fn with_sample_rate(output_sample_rate: f64) -> Self {
        Self {
            state: Mutex::new(GraphState {
                running: false,
                started_at: None,
                accumulated_samples: 0,
            }),
            main_volume: Mutex::new(1.0),
            output_sample_rate,
        }
    }
}

impl Default for SimGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioGraph for SimGraph {
    fn attach_player(&self) -> Result<(Arc<dyn PlayerNode>, Arc<dyn MixerNode>), GraphError> {
        Ok((
            Arc::new(SimPlayer::new(self.output_sample_rate)),
            Arc::new(SimMixer::new(0.0)),
        ))
    }

    fn start(&self) -> Result<(), GraphError> {
        let mut guard = self.state.lock().unwrap();
        if !guard.running {
            guard.running = true;
            guard.started_at = Some(Instant::now());
        }
        Ok(())
    }

    fn stop(&self) {
        let mut guard = self.state.lock().unwrap();
        if guard.running {
            if let Some(started) = guard.started_at.take() {
                guard.accumulated_samples +=
                    (started.elapsed().as_secs_f64() * self.output_sample_rate) as u64;
            }
            guard.running = false;
        }
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    fn set_main_volume(&self, volume: f32) {
        *self.main_volume.lock().unwrap() = volume.clamp(0.0, 1.0);
    }

    fn main_volume(&self) -> f32 {
        *self.main_volume.lock().unwrap()
    }

    fn render_clock(&self) -> Option<RenderClock> {
        let guard = self.state.lock().unwrap();
        let started = guard.started_at?;
        Some(RenderClock {
            sample_time: guard.accumulated_samples
                + (started.elapsed().as_secs_f64() * self.output_sample_rate) as u64,
            sample_rate: self.output_sample_rate,
        })
    }

    fn output_sample_rate(&self) -> f64 {
        self.output_sample_rate
    }
}

struct SessionState {
    category: SessionCategory,
    options: SessionOptions,
    active: bool,
    preferred_sample_rate: Option<f64>,
    preferred_buffer_duration: Option<f64>,
}

/// Simulated process-wide audio session.
///
/// Tests inject lifecycle events with [`SimSession::post`].
pub struct SimSession {
    state: Mutex<SessionState>,
    notifications: broadcast::Sender<SessionNotification>,
}

impl SimSession {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(32);
        Self {
            state: Mutex::new(SessionState {
                category: SessionCategory::SoloAmbient,
                options: SessionOptions::default(),
                active: false,
                preferred_sample_rate: None,
                preferred_buffer_duration: None,
            }),
            notifications,
        }
    }

    /// Inject a host notification, as the platform would.
    pub fn post(&self, notification: SessionNotification) {
        let _ = self.notifications.send(notification);
    }

    /// Mutate the category out from under the engine (external session mode).
    pub fn hijack_category(&self, category: SessionCategory) {
        self.state.lock().unwrap().category = category;
        self.post(SessionNotification::RouteChanged {
            reason: super::RouteChangeReason::CategoryChange,
        });
    }

    pub fn preferred_sample_rate(&self) -> Option<f64> {
        self.state.lock().unwrap().preferred_sample_rate
    }

    pub fn preferred_buffer_duration(&self) -> Option<f64> {
        self.state.lock().unwrap().preferred_buffer_duration
    }
}

impl Default for SimSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSession for SimSession {
    fn category(&self) -> SessionCategory {
        self.state.lock().unwrap().category
    }

    fn set_category(
        &self,
        category: SessionCategory,
        options: SessionOptions,
    ) -> Result<(), GraphError> {
        let mut guard = self.state.lock().unwrap();
        guard.category = category;
        guard.options = options;
        Ok(())
    }

    fn options(&self) -> SessionOptions {
        self.state.lock().unwrap().options
    }

    fn set_preferred_sample_rate(&self, rate: f64) -> Result<(), GraphError> {
        self.state.lock().unwrap().preferred_sample_rate = Some(rate);
        Ok(())
    }

    fn set_preferred_buffer_duration(&self, seconds: f64) -> Result<(), GraphError> {
        self.state.lock().unwrap().preferred_buffer_duration = Some(seconds);
        Ok(())
    }

    fn activate(&self) -> Result<(), GraphError> {
        self.state.lock().unwrap().active = true;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.notifications.subscribe()
    }
}
