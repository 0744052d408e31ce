//! lull-engine: an embeddable audio playback engine for long-form
//! atmospheric content.
//!
//! Three independent layers play at once: a gapless main stream with
//! seamless crossfading between tracks, a looping overlay for ambience or
//! timed bells, and a one-shot sound-effects layer with a preload cache.
//! The platform's node graph and audio session sit behind the traits in
//! [`host`]; a simulated host ships in [`host::sim`] for tests and
//! headless use.
//!
//! Entry point: [`player::AmbientPlayer`].

pub mod audio;
pub mod config;
pub mod dsp;
pub mod error;
pub mod host;
pub mod playback;
pub mod player;
pub mod session;

pub use audio::{BufferCache, DecodedBuffer, PcmReader, SymphoniaReader, Track, TrackInfo};
pub use config::{OverlayConfig, PlayerConfig, SessionMode};
pub use error::{DecodeError, DspError, PlayerError, Result};
pub use player::{AmbientPlayer, EngineDiagnostics, PlaybackPosition, SkipDirection};
pub use session::{ControlSignal, SessionCoordinator, SessionValidation};

// Shared vocabulary re-exported for host applications
pub use lull_common::{
    CrossfadeKind, CrossfadePhase, CrossfadeProgress, EngineEvent, EventBus, FadeCurve, LoopMode,
    OverlayState, PlayerState, RepeatMode,
};

/// Install a default env-filtered tracing subscriber.
///
/// For embedders and quick experiments; hosts that configure their own
/// subscriber should skip this. Safe to call more than once.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
