//! Playback components: engine core, crossfade orchestration, overlay,
//! sound effects, playlist, and the operation queue.

pub mod crossfade;
pub mod engine;
pub mod opqueue;
pub mod overlay;
pub mod playlist;
pub mod sfx;

pub use crossfade::{CrossfadeOrchestrator, CrossfadeOutcome, PausedCrossfade, ReplacementPolicy};
pub use engine::{EngineCore, SlotId};
pub use opqueue::{OpPriority, OperationQueue};
pub use overlay::OverlayScheduler;
pub use playlist::Playlist;
pub use sfx::{SfxPlayer, SoundEffect};
