//! Text-to-speech playback engine for a chapter-based reading client.
//!
//! A [`PlaybackEngine`] speaks one chapter at a time, keeps the next few
//! paragraphs synthesized ahead of the cursor, falls back to an on-device
//! voice when remote synthesis is unavailable, and persists the reading
//! position. Hosts supply I/O through the traits in [`capabilities`].

pub mod cache;
pub mod capabilities;
pub mod config;
pub mod error;
pub(crate) mod events;
pub mod interruption;
pub mod prefetch;
pub mod progress;
pub mod resolver;
pub mod segmenter;
pub mod session;
pub mod sync;
pub mod voice;

#[cfg(test)]
mod test_support;

pub use capabilities::{
    AcceptAnyPayload, AudioOutput, ChapterSource, Collaborators, CompletionSignal, CursorEvent,
    KeepAlive, LocalVoice, NoKeepAlive, NoLocalVoice, PassThroughCleaner, PayloadProbe,
    ProgressBackend, ReaderObserver, RemoteSynthesizer, SynthesisRequest, SynthesizedAudio,
    TextCleaner, VoiceKind,
};
pub use config::EngineConfig;
pub use error::{FetchError, PlaybackError};
pub use interruption::{InterruptionEvent, RouteChange};
pub use progress::ProgressRecord;
pub use segmenter::{SpeakableUnit, segment};
pub use session::{BookInfo, Command, EngineHandle, Phase, PlaybackCursor, PlaybackEngine, StopReason};
pub use voice::VoiceProfile;
