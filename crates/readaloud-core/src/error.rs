//! Error types for the playback engine.
//!
//! Only [`PlaybackError`] ever reaches the reader surface. [`FetchError`] describes
//! a single failed synthesis attempt and is absorbed by the resolver's callers.

use thiserror::Error;

/// Session-level and per-unit failures reported by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Remote synthesis failed for unit {unit_index}: {message}")]
    NetworkFetchFailed { unit_index: usize, message: String },

    #[error("No remote or local voice is configured")]
    NoVoiceConfigured,

    #[error("Chapter {chapter_index} has no speakable content")]
    EmptyChapterContent { chapter_index: usize },

    #[error("Audio playback failed for unit {unit_index}: {message}")]
    AudioPrimitiveFailure { unit_index: usize, message: String },

    #[error("Playback interrupted by another audio source")]
    InterruptedExternally,

    #[error("Chapter {chapter_index} could not be loaded: {message}")]
    ChapterUnavailable { chapter_index: usize, message: String },

    #[error("Playback engine is no longer running")]
    EngineStopped,
}

impl PlaybackError {
    /// Whether the reader should be told about this error.
    ///
    /// Per-unit failures degrade playback instead of halting it.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            PlaybackError::NoVoiceConfigured
                | PlaybackError::EmptyChapterContent { .. }
                | PlaybackError::ChapterUnavailable { .. }
                | PlaybackError::EngineStopped
        )
    }
}

/// A single failed remote synthesis attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("synthesis returned an empty payload")]
    EmptyPayload,

    #[error("unexpected content type: {0}")]
    UnexpectedContentType(String),

    #[error("payload could not be decoded by the audio output")]
    Undecodable,
}

pub type Result<T> = std::result::Result<T, PlaybackError>;
