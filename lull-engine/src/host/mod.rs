//! Opaque host surface: node graph and audio session.
//!
//! The engine never talks to a platform audio API directly. Everything it
//! needs is behind these traits: a graph that owns player/mixer nodes and a
//! render clock, and a process-wide session that reports lifecycle events.
//!
//! # Callback threading
//!
//! Schedule-completion callbacks are invoked on whatever thread the host
//! renders on. Implementations of the engine convert them into owned values
//! at the boundary (an `mpsc::UnboundedSender` send) and never hold
//! references past the callback; host implementers must uphold the same
//! discipline when bridging a real platform graph.

pub mod sim;

use crate::audio::types::DecodedBuffer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by graph and session hosts.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Node allocation/attachment failed
    #[error("failed to attach node: {0}")]
    AttachFailed(String),

    /// Engine start failed at the host layer
    #[error("graph start failed: {0}")]
    StartFailed(String),

    /// Operation requires a running graph
    #[error("graph is not running")]
    NotRunning,

    /// Session category/activation request rejected by the platform
    #[error("session request rejected: {0}")]
    SessionRejected(String),
}

/// A point on the host's render timeline.
///
/// `sample_time` advances monotonically while the graph runs, at
/// `sample_rate` samples per second. This rate belongs to the output
/// device and generally differs from any file's rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderClock {
    pub sample_time: u64,
    pub sample_rate: f64,
}

/// Callback fired when scheduled data has fully played back.
pub type ScheduleCompletion = Box<dyn FnOnce() + Send + 'static>;

/// A mixer node with a single volume control.
pub trait MixerNode: Send + Sync {
    /// Set volume, clamped to [0, 1].
    fn set_volume(&self, volume: f32);
    fn volume(&self) -> f32;
}

/// A player node that renders scheduled PCM through its mixer.
pub trait PlayerNode: Send + Sync {
    /// Schedule `buffer` from `from_frame` (in the buffer's own rate) to its
    /// end, replacing any previous schedule. `completion` fires once the
    /// scheduled data has been fully rendered.
    fn schedule(
        &self,
        buffer: Arc<DecodedBuffer>,
        from_frame: u64,
        completion: Option<ScheduleCompletion>,
    ) -> Result<(), GraphError>;

    /// Begin rendering at the next render cycle.
    fn play(&self);

    /// Begin rendering when the graph clock reaches `sample_time`.
    fn play_at(&self, sample_time: u64);

    /// Suspend rendering, keeping the schedule and position.
    fn pause(&self);

    /// Halt rendering and discard the current schedule.
    fn stop(&self);

    /// Reset internal state after a stop.
    fn reset(&self);

    fn is_playing(&self) -> bool;

    /// Frames rendered since the last schedule began, at the graph's
    /// output rate. Zero when nothing was ever scheduled.
    fn rendered_frames(&self) -> u64;
}

/// The host node graph.
///
/// The engine attaches its player/mixer pairs once during setup and owns
/// them exclusively afterwards; nodes are never shared across components.
pub trait AudioGraph: Send + Sync {
    /// Allocate and connect a player with its own mixer feeding the main mix.
    fn attach_player(&self) -> Result<(Arc<dyn PlayerNode>, Arc<dyn MixerNode>), GraphError>;

    fn start(&self) -> Result<(), GraphError>;
    fn stop(&self);
    fn is_running(&self) -> bool;

    /// Main mix volume after all per-player mixers.
    fn set_main_volume(&self, volume: f32);
    fn main_volume(&self) -> f32;

    /// Current render time, `None` before the first render cycle.
    fn render_clock(&self) -> Option<RenderClock>;

    /// Output device sample rate.
    fn output_sample_rate(&self) -> f64;
}

/// Audio session category, mirroring the platform's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCategory {
    Playback,
    PlayAndRecord,
    MultiRoute,
    Ambient,
    SoloAmbient,
    Record,
}

impl SessionCategory {
    pub fn name(&self) -> &'static str {
        match self {
            SessionCategory::Playback => "playback",
            SessionCategory::PlayAndRecord => "play_and_record",
            SessionCategory::MultiRoute => "multi_route",
            SessionCategory::Ambient => "ambient",
            SessionCategory::SoloAmbient => "solo_ambient",
            SessionCategory::Record => "record",
        }
    }
}

/// Platform option set applied together with the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default)]
    pub mix_with_others: bool,
    #[serde(default)]
    pub duck_others: bool,
    #[serde(default)]
    pub allow_bluetooth: bool,
    #[serde(default)]
    pub default_to_speaker: bool,
}

/// Why the audio route changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChangeReason {
    /// Previous output disappeared (headphones unplugged)
    OldDeviceUnavailable,
    /// A new output became available
    NewDeviceAvailable,
    /// An app overrode the output route
    Override,
    /// The session category was changed externally
    CategoryChange,
    Unknown,
}

/// Asynchronous session lifecycle notifications from the host.
///
/// Posted from arbitrary host threads; values are owned and `Send` so the
/// coordinator can rehome them onto its own task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotification {
    InterruptionBegan,
    /// `should_resume` is absent when the platform did not say either way;
    /// absence means do not auto-resume.
    InterruptionEnded { should_resume: Option<bool> },
    RouteChanged { reason: RouteChangeReason },
    MediaServicesReset,
}

/// The process-wide audio session.
pub trait AudioSession: Send + Sync {
    fn category(&self) -> SessionCategory;
    fn set_category(
        &self,
        category: SessionCategory,
        options: SessionOptions,
    ) -> Result<(), GraphError>;
    fn options(&self) -> SessionOptions;

    fn set_preferred_sample_rate(&self, rate: f64) -> Result<(), GraphError>;
    fn set_preferred_buffer_duration(&self, seconds: f64) -> Result<(), GraphError>;

    fn activate(&self) -> Result<(), GraphError>;
    fn is_active(&self) -> bool;

    /// Subscribe to lifecycle notifications.
    fn subscribe(&self) -> broadcast::Receiver<SessionNotification>;
}
