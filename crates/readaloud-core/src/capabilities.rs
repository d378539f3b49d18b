//! Interfaces for everything the engine consumes but does not own.
//!
//! Hosts inject implementations when spawning a [`crate::PlaybackEngine`]:
//! chapter retrieval, text cleaning, remote synthesis, the audio primitive,
//! the on-device voice, durable progress and the reading surface.

use crate::error::PlaybackError;
use crate::events::{EngineEvent, VoiceProgress};
use crate::progress::ProgressRecord;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::time::Duration;

/// Source of raw (pre-cleaning) chapter text.
pub trait ChapterSource: Send + Sync {
    fn chapter_text(&self, book_id: &str, chapter_index: usize) -> anyhow::Result<String>;

    fn chapter_title(&self, _book_id: &str, _chapter_index: usize) -> String {
        String::new()
    }
}

/// Markup stripping plus user replacement rules.
pub trait TextCleaner: Send + Sync {
    fn clean(&self, raw: &str) -> String;
}

/// Cleaner that returns text unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughCleaner;

impl TextCleaner for PassThroughCleaner {
    fn clean(&self, raw: &str) -> String {
        raw.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest<'a> {
    pub voice_id: &'a str,
    pub text: &'a str,
    pub speech_rate: f32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Remote voice engine. Implementations must honor `request.timeout`.
pub trait RemoteSynthesizer: Send + Sync {
    fn synthesize(&self, request: &SynthesisRequest<'_>) -> anyhow::Result<SynthesizedAudio>;
}

/// Decides whether the audio primitive can play a payload.
pub trait PayloadProbe: Send + Sync {
    fn accepts(&self, bytes: &[u8]) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyPayload;

impl PayloadProbe for AcceptAnyPayload {
    fn accepts(&self, _bytes: &[u8]) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceKind {
    Remote,
    Local,
}

/// Handed to the audio primitive or local voice with every utterance.
///
/// The engine drops signals from utterances it has since cancelled, so an
/// implementation may report completion even after `stop` was called.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    ticket: u64,
    voice: VoiceKind,
    events: Sender<EngineEvent>,
}

impl CompletionSignal {
    pub(crate) fn new(ticket: u64, voice: VoiceKind, events: Sender<EngineEvent>) -> Self {
        Self {
            ticket,
            voice,
            events,
        }
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn started(&self) {
        self.send(VoiceProgress::Started);
    }

    pub fn finished(&self) {
        self.send(VoiceProgress::Finished);
    }

    pub fn failed(&self, message: impl Into<String>) {
        self.send(VoiceProgress::Failed(message.into()));
    }

    fn send(&self, progress: VoiceProgress) {
        // The engine may already be gone during shutdown.
        let _ = self.events.send(EngineEvent::Voice {
            ticket: self.ticket,
            voice: self.voice,
            progress,
        });
    }
}

/// Platform audio primitive playing opaque synthesized payloads.
pub trait AudioOutput: Send {
    fn play(&mut self, audio: Arc<[u8]>, signal: CompletionSignal) -> anyhow::Result<()>;
    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
}

/// On-device voice used when remote synthesis is unavailable.
pub trait LocalVoice: Send {
    fn is_available(&self) -> bool;
    fn speak(
        &mut self,
        text: &str,
        voice_id: Option<&str>,
        rate: f32,
        signal: CompletionSignal,
    ) -> anyhow::Result<()>;
    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
}

/// Host without an on-device voice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocalVoice;

impl LocalVoice for NoLocalVoice {
    fn is_available(&self) -> bool {
        false
    }

    fn speak(
        &mut self,
        _text: &str,
        _voice_id: Option<&str>,
        _rate: f32,
        _signal: CompletionSignal,
    ) -> anyhow::Result<()> {
        anyhow::bail!("no local voice is installed")
    }

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    fn stop(&mut self) {}
}

/// Inaudible looped tick that keeps a backgrounded host from being suspended.
pub trait KeepAlive: Send {
    fn begin(&mut self);
    fn end(&mut self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeepAlive;

impl KeepAlive for NoKeepAlive {
    fn begin(&mut self) {}

    fn end(&mut self) {}
}

/// Durable, idempotent progress storage.
pub trait ProgressBackend: Send + Sync {
    fn load(&self, book_id: &str, chapter_index: usize) -> anyhow::Result<Option<ProgressRecord>>;
    fn save(&self, record: &ProgressRecord) -> anyhow::Result<()>;
    fn clear(&self, book_id: &str, chapter_index: usize) -> anyhow::Result<()>;

    /// Upstream mirror of the fractional position for cross-device resume.
    fn report_position(
        &self,
        _book_id: &str,
        _chapter_index: usize,
        _fraction: f64,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorEvent {
    pub chapter_index: usize,
    pub unit_index: usize,
    pub char_offset: usize,
    pub is_title: bool,
}

/// The reading surface's view of the engine. Every method has a no-op default.
pub trait ReaderObserver: Send + Sync {
    fn on_cursor_changed(&self, _event: &CursorEvent) {}

    fn on_preloaded_set_changed(&self, _chapter_index: usize, _unit_indices: &[usize]) {}

    fn on_playback_state_changed(&self, _is_playing: bool, _is_paused: bool) {}

    /// Follow mode asks the surface to bring `unit_index` into view.
    fn on_scroll_requested(&self, _unit_index: usize) {}

    fn on_error(&self, _error: &PlaybackError) {}
}

/// All collaborators a [`crate::PlaybackEngine`] needs.
pub struct Collaborators {
    pub chapters: Arc<dyn ChapterSource>,
    pub cleaner: Arc<dyn TextCleaner>,
    pub synthesizer: Arc<dyn RemoteSynthesizer>,
    pub probe: Arc<dyn PayloadProbe>,
    pub output: Box<dyn AudioOutput>,
    pub local_voice: Box<dyn LocalVoice>,
    pub keepalive: Box<dyn KeepAlive>,
    pub progress: Arc<dyn ProgressBackend>,
    pub observer: Arc<dyn ReaderObserver>,
}
