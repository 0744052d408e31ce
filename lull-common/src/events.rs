//! Event types and event bus for the lull engine.
//!
//! The engine communicates with host applications through three channels:
//! - **EventBus** (tokio::broadcast): one-to-many lifecycle events
//! - **Watch subjects** (tokio::sync::watch): current-value state/track/position
//! - **Command methods** (async fn on the facade): request → single handler
//!
//! Events are serializable so hosts can forward them to UI layers or logs.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Facade-level playback state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlayerState {
    /// Nothing loaded, nothing playing
    Idle,
    /// Loading and scheduling the first track
    Preparing,
    /// Audio is audible
    Playing,
    /// Paused with position retained
    Paused,
    /// A stop/finish fade-out is in flight
    FadingOut,
    /// Playback ended (stop, finish, or playlist exhausted)
    Finished,
    /// Unrecoverable failure; engine requires reconfiguration
    Failed { reason: String },
}

impl PlayerState {
    /// Terminal states ignore pause/resume rather than erroring.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlayerState::Finished | PlayerState::Failed { .. })
    }
}

/// Overlay layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayState {
    Idle,
    Preparing,
    Playing,
    Paused,
    Stopping,
}

/// Repeat behavior for the main playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Stop at the end of the playlist
    Off,
    /// Loop the current track seamlessly
    SingleTrack,
    /// Wrap around to the first track
    Playlist,
}

impl Default for RepeatMode {
    fn default() -> Self {
        RepeatMode::Off
    }
}

/// Loop behavior for the overlay layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Play the buffer once
    Once,
    /// Play a fixed number of iterations (must be > 0)
    Count(u32),
    /// Loop until stopped
    Infinite,
}

impl LoopMode {
    /// Whether iteration `i` (0-based) should still run.
    pub fn should_continue(&self, iteration: u32) -> bool {
        match self {
            LoopMode::Once => iteration < 1,
            LoopMode::Count(n) => iteration < *n,
            LoopMode::Infinite => true,
        }
    }

    /// Target iteration count, if bounded.
    pub fn target(&self) -> Option<u32> {
        match self {
            LoopMode::Once => Some(1),
            LoopMode::Count(n) => Some(*n),
            LoopMode::Infinite => None,
        }
    }
}

impl Default for LoopMode {
    fn default() -> Self {
        LoopMode::Infinite
    }
}

/// Why a crossfade was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossfadeKind {
    /// Natural end of a track with repeat active
    AutomaticLoop,
    /// User-initiated track change
    ManualChange,
}

/// Phase of an in-flight crossfade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum CrossfadePhase {
    Idle,
    Preparing,
    /// Volume ramp in progress; fraction ∈ [0, 1]
    Fading { fraction: f32 },
    Switching,
    Cleanup,
}

/// Crossfade progress as published on the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossfadeProgress {
    pub phase: CrossfadePhase,
    /// Total crossfade duration in seconds
    pub duration: f32,
    /// Elapsed time within the fade in seconds
    pub elapsed: f32,
}

impl CrossfadeProgress {
    pub fn idle() -> Self {
        Self {
            phase: CrossfadePhase::Idle,
            duration: 0.0,
            elapsed: 0.0,
        }
    }
}

/// Engine lifecycle events.
///
/// Broadcast via [`EventBus`]; serialized with a `type` tag so hosts can
/// route them without matching on the Rust enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Facade state transition
    PlaybackStateChanged {
        old_state: PlayerState,
        new_state: PlayerState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A track became the audible active track
    TrackStarted {
        track_id: Uuid,
        uri: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The active track finished or was replaced
    TrackCompleted {
        track_id: Uuid,
        /// false when the track was skipped or replaced mid-flight
        completed: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Master volume changed
    VolumeChanged {
        old_volume: f32,
        new_volume: f32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A buffer load began (cache miss)
    FileLoadStarted {
        uri: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A buffer load finished and entered the cache
    FileLoadCompleted {
        uri: String,
        duration_seconds: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A buffer load failed or timed out
    FileLoadFailed {
        uri: String,
        error: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Crossfade phase/progress update
    CrossfadeProgressed {
        progress: CrossfadeProgress,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Overlay layer state transition
    OverlayStateChanged {
        old_state: OverlayState,
        new_state: OverlayState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Non-fatal session configuration observation
    SessionWarning {
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An externally-managed session changed to a category the engine did not set
    SessionCategoryChanged {
        current: String,
        expected: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Media-services reset recovery began
    RecoveryStarted {
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Media-services reset recovery finished
    RecoveryCompleted {
        resumed: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl EngineEvent {
    /// Event type as string, for filtering and logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::PlaybackStateChanged { .. } => "PlaybackStateChanged",
            EngineEvent::TrackStarted { .. } => "TrackStarted",
            EngineEvent::TrackCompleted { .. } => "TrackCompleted",
            EngineEvent::VolumeChanged { .. } => "VolumeChanged",
            EngineEvent::FileLoadStarted { .. } => "FileLoadStarted",
            EngineEvent::FileLoadCompleted { .. } => "FileLoadCompleted",
            EngineEvent::FileLoadFailed { .. } => "FileLoadFailed",
            EngineEvent::CrossfadeProgressed { .. } => "CrossfadeProgressed",
            EngineEvent::OverlayStateChanged { .. } => "OverlayStateChanged",
            EngineEvent::SessionWarning { .. } => "SessionWarning",
            EngineEvent::SessionCategoryChanged { .. } => "SessionCategoryChanged",
            EngineEvent::RecoveryStarted { .. } => "RecoveryStarted",
            EngineEvent::RecoveryCompleted { .. } => "RecoveryCompleted",
        }
    }
}

/// Central event distribution bus.
///
/// Backed by tokio::broadcast: non-blocking publish, multiple concurrent
/// subscribers, lagged-message detection for slow consumers. The buffer is
/// bounded — a subscriber that falls more than `capacity` events behind
/// observes a `Lagged` error and loses the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; errors when no subscriber is listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: EngineEvent,
    ) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the no-subscriber case.
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
