//! Shared vocabulary for the lull playback engine.
//!
//! Types in this crate are the common language between the engine crate and
//! host applications: fade curves, observable event types, and small
//! timing/gain conversion helpers. No playback logic lives here.

pub mod events;
pub mod fade_curves;
pub mod timing;

pub use events::{
    CrossfadeKind, CrossfadePhase, CrossfadeProgress, EngineEvent, EventBus, LoopMode,
    OverlayState, PlayerState, RepeatMode,
};
pub use fade_curves::FadeCurve;
