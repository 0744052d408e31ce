//! Error types for the lull playback engine.
//!
//! Every public operation returns `Result<T>`; no panics cross the crate
//! boundary. Errors are grouped by subsystem with `#[from]` conversions so
//! `?` works across layers.

use crate::host::GraphError;
use lull_common::PlayerState;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the playback engine.
#[derive(Debug, Error)]
pub enum PlayerError {
    /// Playback was requested with an empty playlist
    #[error("playlist is empty")]
    EmptyPlaylist,

    /// Advance requested past the end with repeat off
    #[error("no next track in playlist")]
    NoNextTrack,

    /// Previous requested before the start with repeat off
    #[error("no previous track in playlist")]
    NoPreviousTrack,

    /// Guard violation in the facade state machine
    #[error("cannot {attempted} while {current:?}")]
    InvalidState {
        current: PlayerState,
        attempted: String,
    },

    /// Buffer load failed in the cache or decoder
    #[error("failed to load {uri}: {source}")]
    FileLoadFailed {
        uri: String,
        #[source]
        source: anyhow::Error,
    },

    /// Buffer load exceeded its deadline
    #[error("loading {uri} timed out after {duration:?}")]
    FileLoadTimeout { uri: String, duration: Duration },

    /// Audio session category/activation problem
    #[error("session configuration failed: {reason}")]
    SessionConfigurationFailed { reason: String },

    /// Engine graph prepare/start problem
    #[error("engine start failed: {reason}")]
    EngineStartFailed { reason: String },

    /// Skip called within the minimum interval or while another skip runs
    #[error("skip rate limited")]
    RateLimited,

    /// Rejected by configuration validation
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// DSP kernel errors
    #[error("dsp error: {0}")]
    Dsp(#[from] DspError),

    /// Decoder errors
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Host graph errors
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
}

/// Errors from the loudness normalization kernel.
#[derive(Debug, Error)]
pub enum DspError {
    /// Input buffer holds no frames
    #[error("buffer holds no frames")]
    EmptyBuffer,

    /// Input is not float32 non-interleaved after resampling
    #[error("unsupported buffer format: {0}")]
    UnsupportedFormat(String),

    /// Resampler construction failed
    #[error("converter init failed: {0}")]
    ConverterInitFailed(String),

    /// Resampler processing failed
    #[error("conversion failed: {0}")]
    ConversionFailed(String),
}

/// Errors from file decoding.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// File does not exist or is unreadable
    #[error("audio file not found: {uri}")]
    FileNotFound { uri: String },

    /// Container probe failed
    #[error("failed to probe format of {uri}: {message}")]
    ProbeFailed { uri: String, message: String },

    /// Container holds no audio tracks
    #[error("no audio tracks in {uri}")]
    NoAudioTracks { uri: String },

    /// Codec error mid-stream
    #[error("decode of {uri} failed: {message}")]
    DecodeFailed { uri: String, message: String },

    /// Sample format the engine cannot represent
    #[error("unsupported sample format in {uri}: {format}")]
    UnsupportedFormat { uri: String, format: String },
}

/// Result type alias using the engine error type.
pub type Result<T> = std::result::Result<T, PlayerError>;

impl PlayerError {
    /// Shorthand for facade guard violations.
    pub fn invalid_state(current: PlayerState, attempted: &str) -> Self {
        PlayerError::InvalidState {
            current,
            attempted: attempted.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_operation() {
        let err = PlayerError::invalid_state(PlayerState::Finished, "resume");
        let msg = err.to_string();
        assert!(msg.contains("resume"));
        assert!(msg.contains("Finished"));
    }

    #[test]
    fn test_dsp_error_converts() {
        fn inner() -> Result<()> {
            Err(DspError::EmptyBuffer)?
        }
        assert!(matches!(inner(), Err(PlayerError::Dsp(DspError::EmptyBuffer))));
    }

    #[test]
    fn test_file_load_failed_carries_cause() {
        let err = PlayerError::FileLoadFailed {
            uri: "file:///missing.flac".to_string(),
            source: anyhow::anyhow!("disk on fire"),
        };
        assert!(err.to_string().contains("missing.flac"));
        assert!(err.to_string().contains("disk on fire"));
    }
}
