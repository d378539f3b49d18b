//! Speaking units: chapter loads, audio dispatch, completions and chapter transitions.

use super::control::{FetchKey, SessionCore};
use super::state::{ActiveVoice, AwaitedUnit, Phase, PlaybackCursor, StopReason};
use crate::cache::ChapterScope;
use crate::capabilities::{
    ChapterSource, CompletionSignal, ProgressBackend, TextCleaner, VoiceKind,
};
use crate::error::{FetchError, PlaybackError};
use crate::events::{EngineEvent, LoadPurpose, LoadedChapter, PrefetchOutcome, VoiceProgress};
use crate::resolver::Resolution;
use crate::segmenter::{ChapterUnits, SpeakableUnit, is_trivial, segment};
use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything a loader thread needs to turn a chapter into units.
struct ChapterLoader {
    source: Arc<dyn ChapterSource>,
    cleaner: Arc<dyn TextCleaner>,
    progress: Arc<dyn ProgressBackend>,
    book_id: String,
    chunk_limit: usize,
    include_title: bool,
}

impl ChapterLoader {
    fn load(&self, chapter_index: usize, purpose: LoadPurpose) -> anyhow::Result<LoadedChapter> {
        let raw = self
            .source
            .chapter_text(&self.book_id, chapter_index)
            .with_context(|| format!("reading chapter {chapter_index}"))?;
        let title = self
            .cleaner
            .clean(&self.source.chapter_title(&self.book_id, chapter_index));
        let text = self.cleaner.clean(&raw);
        let units = segment(&text, title.trim(), self.include_title, self.chunk_limit);
        let saved = match purpose {
            LoadPurpose::Start { .. } => self
                .progress
                .load(&self.book_id, chapter_index)
                .unwrap_or_else(|err| {
                    warn!(chapter_index, "Failed to load progress: {err:#}");
                    None
                }),
            LoadPurpose::Preload => None,
        };
        debug!(chapter_index, units = units.len(), "Chapter segmented");
        Ok(LoadedChapter {
            units: ChapterUnits::new(chapter_index, units),
            saved,
        })
    }
}

impl SessionCore {
    pub(super) fn begin_load(&mut self, chapter_index: usize, purpose: LoadPurpose) {
        let generation = self.load_generation;
        let loader = ChapterLoader {
            source: Arc::clone(&self.source),
            cleaner: Arc::clone(&self.cleaner),
            progress: self.progress.backend(),
            book_id: self.book.book_id.clone(),
            chunk_limit: self.config.chunk_limit,
            include_title: self.config.include_title,
        };
        let events = self.events.clone();
        debug!(chapter_index, ?purpose, generation, "Loading chapter");
        let spawned = std::thread::Builder::new()
            .name(format!("chapter-load-{chapter_index}"))
            .spawn(move || {
                let result = loader
                    .load(chapter_index, purpose)
                    .map_err(|err| format!("{err:#}"));
                let _ = events.send(EngineEvent::ChapterLoaded {
                    generation,
                    purpose,
                    chapter_index,
                    result,
                });
            });
        if let Err(err) = spawned {
            let _ = self.events.send(EngineEvent::ChapterLoaded {
                generation,
                purpose,
                chapter_index,
                result: Err(format!("failed to spawn chapter loader: {err}")),
            });
        }
    }

    pub(super) fn on_chapter_loaded(
        &mut self,
        generation: u64,
        purpose: LoadPurpose,
        chapter_index: usize,
        result: Result<LoadedChapter, String>,
    ) {
        if generation != self.load_generation {
            debug!(chapter_index, generation, "Dropping stale chapter load");
            return;
        }
        match purpose {
            LoadPurpose::Start { target } => {
                self.loading_start = false;
                let loaded = match result {
                    Ok(loaded) => loaded,
                    Err(message) => {
                        self.refuse_start(PlaybackError::ChapterUnavailable {
                            chapter_index,
                            message,
                        });
                        return;
                    }
                };
                if loaded.units.is_empty() {
                    self.refuse_start(PlaybackError::EmptyChapterContent { chapter_index });
                    return;
                }
                if !self.resolver.has_remote_voice() && !self.local_voice.is_available() {
                    self.refuse_start(PlaybackError::NoVoiceConfigured);
                    return;
                }
                self.begin_session(loaded, target);
            }
            LoadPurpose::Preload => {
                if !self.phase.is_active() || chapter_index != self.cursor.chapter_index + 1 {
                    debug!(chapter_index, "Dropping preload for a chapter no longer next");
                    return;
                }
                self.chapters.next_loading = false;
                match result {
                    Ok(loaded) => {
                        info!(
                            chapter_index,
                            units = loaded.units.len(),
                            "Next chapter preloaded"
                        );
                        let scope = self.store.scope(chapter_index);
                        if self.resolver.has_remote_voice() {
                            self.pipeline.schedule_next_chapter(
                                &scope,
                                &loaded.units,
                                self.config.next_chapter_preload,
                            );
                        }
                        self.chapters.next = Some(loaded.units);
                        if self.chapters.transition_pending {
                            self.enter_next_chapter();
                        }
                    }
                    Err(message) => {
                        warn!(chapter_index, "Failed to preload chapter: {message}");
                        if self.chapters.transition_pending {
                            self.report(PlaybackError::ChapterUnavailable {
                                chapter_index,
                                message,
                            });
                            self.stop(StopReason::Error);
                        }
                    }
                }
            }
        }
    }

    fn refuse_start(&mut self, error: PlaybackError) {
        self.report(error);
        self.phase = Phase::Idle;
        self.notify_state();
    }

    fn begin_session(&mut self, loaded: LoadedChapter, target: Option<(usize, usize)>) {
        let LoadedChapter { units, saved } = loaded;
        let chapter_index = units.chapter_index;
        self.pipeline.cancel_all();
        let scope = self.store.begin_session(chapter_index);
        self.immediate_fetches.clear();

        let (unit_index, char_offset) = target
            .or_else(|| saved.map(|record| (record.unit_index, record.char_offset)))
            .unwrap_or((0, 0));
        let unit_index = unit_index.min(units.len().saturating_sub(1));
        let char_offset = units
            .get(unit_index)
            .map(|unit| char_offset.min(unit.len_utf16()))
            .unwrap_or(0);
        self.cursor = PlaybackCursor {
            chapter_index,
            unit_index,
            char_offset,
        };
        self.reader_hint = None;
        self.chapters.clear();
        self.chapters.current = Some(units);
        self.scope = Some(scope);
        self.preloaded.clear();
        info!(chapter_index, unit_index, char_offset, "Playback session started");
        self.phase = self.speaking_phase();
        self.notify_state();
        self.play_current();
    }

    /// Speak the unit under the cursor, skipping units with nothing to say.
    pub(super) fn play_current(&mut self) {
        let (Some(chapter), Some(scope)) = (self.chapters.current.clone(), self.scope.clone())
        else {
            return;
        };
        let unit = loop {
            let Some(unit) = chapter.get(self.cursor.unit_index) else {
                self.finish_chapter();
                return;
            };
            if is_trivial(unit.remaining_text(self.cursor.char_offset)) {
                debug!(unit_index = unit.index, "Skipping unit with nothing to speak");
                self.cursor.unit_index += 1;
                self.cursor.char_offset = 0;
                continue;
            }
            break unit.clone();
        };

        self.silence();
        self.phase = if unit.is_title {
            Phase::SpeakingTitle
        } else {
            Phase::SpeakingBody
        };
        self.announce_cursor();

        let char_offset = self.cursor.char_offset;
        if let Some(handle) = self.resolver.cached(&scope, unit.index, char_offset) {
            self.start_remote(unit.index, handle.audio);
        } else if !self.resolver.has_remote_voice() || self.store.is_fallback(&scope, unit.index) {
            self.start_local(&unit, char_offset);
        } else {
            self.await_audio(&scope, &unit, char_offset);
        }
        self.kick_prefetch();
    }

    /// Cancel whatever is sounding and invalidate its completion.
    pub(super) fn silence(&mut self) {
        self.ticket += 1;
        match std::mem::replace(&mut self.active, ActiveVoice::None) {
            ActiveVoice::Remote => self.output.stop(),
            ActiveVoice::Local => self.local_voice.stop(),
            ActiveVoice::None => {}
        }
        self.awaiting = None;
    }

    fn start_remote(&mut self, unit_index: usize, audio: Arc<[u8]>) {
        let signal = CompletionSignal::new(self.ticket, VoiceKind::Remote, self.events.clone());
        debug!(unit_index, ticket = self.ticket, bytes = audio.len(), "Playing synthesized audio");
        match self.output.play(audio, signal) {
            Ok(()) => self.active = ActiveVoice::Remote,
            Err(err) => self.fail_utterance(VoiceKind::Remote, format!("{err:#}")),
        }
    }

    fn start_local(&mut self, unit: &SpeakableUnit, char_offset: usize) {
        if !self.local_voice.is_available() {
            self.report(PlaybackError::NoVoiceConfigured);
            self.stop(StopReason::Error);
            return;
        }
        let signal = CompletionSignal::new(self.ticket, VoiceKind::Local, self.events.clone());
        debug!(unit_index = unit.index, ticket = self.ticket, "Speaking with the local voice");
        let spoken = self.local_voice.speak(
            unit.remaining_text(char_offset),
            self.config.local_voice.as_deref(),
            self.config.speech_rate,
            signal,
        );
        match spoken {
            Ok(()) => self.active = ActiveVoice::Local,
            Err(err) => self.fail_utterance(VoiceKind::Local, format!("{err:#}")),
        }
    }

    /// Route a refused utterance through the event queue like any other completion.
    fn fail_utterance(&mut self, voice: VoiceKind, message: String) {
        let _ = self.events.send(EngineEvent::Voice {
            ticket: self.ticket,
            voice,
            progress: VoiceProgress::Failed(message),
        });
    }

    fn await_audio(&mut self, scope: &ChapterScope, unit: &SpeakableUnit, char_offset: usize) {
        self.awaiting = Some(AwaitedUnit {
            chapter_index: scope.chapter_index,
            unit_index: unit.index,
            char_offset,
        });
        if char_offset == 0 {
            if self.pipeline.is_in_flight(scope, unit.index) {
                if let Some(error) = self.pipeline.failed_attempt(scope, unit.index) {
                    self.give_up_on_remote(unit, error);
                } else {
                    debug!(unit_index = unit.index, "Waiting for in-flight prefetch");
                }
                return;
            }
            self.pipeline.take_queued(scope, unit.index);
        }
        self.fetch_immediately(scope, unit, char_offset);
    }

    /// The unit under the cursor already had one failed attempt; speak it locally
    /// instead of sitting through the prefetcher's retries.
    fn give_up_on_remote(&mut self, unit: &SpeakableUnit, error: FetchError) {
        if !self.local_voice.is_available() {
            debug!(unit_index = unit.index, "No local voice; waiting for remote retries");
            return;
        }
        info!(
            unit_index = unit.index,
            "Remote attempt failed for the unit being read; using the local voice"
        );
        self.awaiting = None;
        self.fetch_settled();
        self.report(PlaybackError::NetworkFetchFailed {
            unit_index: unit.index,
            message: error.to_string(),
        });
        if self.phase.is_speaking() {
            self.start_local(unit, 0);
        }
    }

    /// Resolve one unit on its own thread. Fresh audio lands in the cache.
    fn fetch_immediately(&mut self, scope: &ChapterScope, unit: &SpeakableUnit, char_offset: usize) {
        let key: FetchKey = (scope.epoch, scope.chapter_index, unit.index, char_offset);
        if !self.immediate_fetches.insert(key) {
            debug!(unit_index = unit.index, char_offset, "Fetch already running");
            return;
        }
        let resolver = Arc::clone(&self.resolver);
        let store = self.store.clone();
        let events = self.events.clone();
        let job_scope = scope.clone();
        let job_unit = unit.clone();
        let spawned = std::thread::Builder::new()
            .name("unit-fetch".to_string())
            .spawn(move || {
                let result = resolver.resolve(&job_scope, &job_unit, char_offset);
                if let Ok(Resolution::Audio(handle)) = &result {
                    if !handle.from_cache {
                        store.insert(
                            &job_scope,
                            job_unit.index,
                            char_offset,
                            Arc::clone(&handle.audio),
                        );
                    }
                }
                let _ = events.send(EngineEvent::Resolved {
                    scope: job_scope,
                    unit_index: job_unit.index,
                    char_offset,
                    result,
                });
            });
        if let Err(err) = spawned {
            let _ = self.events.send(EngineEvent::Resolved {
                scope: scope.clone(),
                unit_index: unit.index,
                char_offset,
                result: Err(FetchError::Network(format!("failed to spawn fetch: {err}"))),
            });
        }
    }

    /// Paused seek: get the new position's audio ready before resume.
    pub(super) fn warm_current(&mut self) {
        let (Some(chapter), Some(scope)) = (self.chapters.current.clone(), self.scope.clone())
        else {
            return;
        };
        let Some(unit) = chapter.get(self.cursor.unit_index) else {
            return;
        };
        let char_offset = self.cursor.char_offset;
        if is_trivial(unit.remaining_text(char_offset))
            || !self.resolver.has_remote_voice()
            || self.store.is_fallback(&scope, unit.index)
            || self.store.contains(&scope, unit.index, char_offset)
            || (char_offset == 0 && self.pipeline.is_in_flight(&scope, unit.index))
        {
            return;
        }
        if char_offset == 0 {
            self.pipeline.take_queued(&scope, unit.index);
        }
        self.fetch_immediately(&scope, unit, char_offset);
    }

    pub(super) fn on_resolved(
        &mut self,
        scope: ChapterScope,
        unit_index: usize,
        char_offset: usize,
        result: Result<Resolution, FetchError>,
    ) {
        self.immediate_fetches
            .remove(&(scope.epoch, scope.chapter_index, unit_index, char_offset));
        if self.scope.as_ref() != Some(&scope) {
            debug!(unit_index, "Dropping resolution from an old scope");
            return;
        }
        let awaited = AwaitedUnit {
            chapter_index: scope.chapter_index,
            unit_index,
            char_offset,
        };
        if self.awaiting != Some(awaited) {
            debug!(unit_index, char_offset, "Resolved audio is not awaited");
            self.emit_preloaded();
            return;
        }
        self.awaiting = None;
        self.fetch_settled();
        if !self.phase.is_speaking() {
            return;
        }
        let Some(unit) = self.current_unit().cloned() else {
            return;
        };
        match result {
            Ok(Resolution::Audio(handle)) => self.start_remote(unit_index, handle.audio),
            Ok(Resolution::Fallback(reason)) => {
                debug!(unit_index, ?reason, "Using the local voice");
                self.start_local(&unit, char_offset);
            }
            Err(err) => {
                let error = PlaybackError::NetworkFetchFailed {
                    unit_index,
                    message: err.to_string(),
                };
                self.report(error);
                self.start_local(&unit, char_offset);
            }
        }
        self.emit_preloaded();
    }

    pub(super) fn on_prefetched(
        &mut self,
        scope: ChapterScope,
        unit_index: usize,
        outcome: PrefetchOutcome,
    ) {
        let Some(current) = self.scope.clone() else {
            return;
        };
        if scope.epoch != current.epoch {
            return;
        }
        if scope.chapter_index != current.chapter_index {
            debug!(chapter_index = scope.chapter_index, unit_index, ?outcome, "Next chapter unit ready");
            return;
        }
        let awaited = AwaitedUnit {
            chapter_index: scope.chapter_index,
            unit_index,
            char_offset: 0,
        };
        if self.awaiting == Some(awaited) {
            self.awaiting = None;
            self.fetch_settled();
            if self.phase.is_speaking() {
                self.continue_with_prefetched(&scope, unit_index, outcome);
            }
        } else if unit_index == self.cursor.unit_index + 1 {
            self.fetch_settled();
        }
        self.emit_preloaded();
        self.maybe_preload_next();
    }

    pub(super) fn on_prefetch_attempt_failed(
        &mut self,
        scope: ChapterScope,
        unit_index: usize,
        error: FetchError,
    ) {
        if self.scope.as_ref() != Some(&scope) {
            return;
        }
        let awaited = AwaitedUnit {
            chapter_index: scope.chapter_index,
            unit_index,
            char_offset: 0,
        };
        if self.awaiting != Some(awaited) {
            return;
        }
        let Some(unit) = self.current_unit().cloned() else {
            return;
        };
        self.give_up_on_remote(&unit, error);
        self.emit_preloaded();
    }

    fn continue_with_prefetched(
        &mut self,
        scope: &ChapterScope,
        unit_index: usize,
        outcome: PrefetchOutcome,
    ) {
        let Some(unit) = self.current_unit().cloned() else {
            return;
        };
        match outcome {
            PrefetchOutcome::Cached => match self.resolver.cached(scope, unit_index, 0) {
                Some(handle) => self.start_remote(unit_index, handle.audio),
                None => self.await_audio(scope, &unit, 0),
            },
            PrefetchOutcome::Fallback(reason) => {
                debug!(unit_index, ?reason, "Using the local voice");
                self.start_local(&unit, 0);
            }
            PrefetchOutcome::Trivial => self.advance(),
            PrefetchOutcome::Discarded => self.await_audio(scope, &unit, 0),
        }
    }

    pub(super) fn on_voice(&mut self, ticket: u64, voice: VoiceKind, progress: VoiceProgress) {
        if ticket != self.ticket {
            debug!(ticket, current = self.ticket, ?voice, "Ignoring stale utterance event");
            return;
        }
        match progress {
            VoiceProgress::Started => debug!(?voice, ticket, "Utterance started"),
            VoiceProgress::Finished => {
                self.active = ActiveVoice::None;
                self.advance();
            }
            VoiceProgress::Failed(message) => {
                self.report(PlaybackError::AudioPrimitiveFailure {
                    unit_index: self.cursor.unit_index,
                    message,
                });
                self.active = ActiveVoice::None;
                self.advance();
            }
        }
    }

    /// The current unit is done; move on if still speaking.
    pub(super) fn advance(&mut self) {
        self.cursor.unit_index += 1;
        self.cursor.char_offset = 0;
        if self.phase.is_speaking() {
            self.play_current();
        }
    }

    pub(super) fn finish_chapter(&mut self) {
        let finished = self.cursor.chapter_index;
        let next = finished + 1;
        if next >= self.book.chapter_count {
            info!(chapter_index = finished, "Reached the end of the book");
            self.stop(StopReason::Finished);
            return;
        }
        self.silence();
        info!(chapter_index = finished, next, "Chapter finished");
        self.progress.reset(&self.book.book_id, finished);
        let ready = self
            .chapters
            .next
            .as_ref()
            .map(|units| units.chapter_index == next)
            .unwrap_or(false);
        if ready {
            self.enter_next_chapter();
            return;
        }
        self.chapters.transition_pending = true;
        if !self.chapters.next_loading {
            self.chapters.next_loading = true;
            self.begin_load(next, LoadPurpose::Preload);
        }
    }

    fn enter_next_chapter(&mut self) {
        let Some(units) = self.chapters.next.take() else {
            return;
        };
        let chapter_index = units.chapter_index;
        let scope = self.store.promote(chapter_index);
        self.pipeline.promote(&scope);
        self.cursor = PlaybackCursor {
            chapter_index,
            unit_index: 0,
            char_offset: 0,
        };
        self.chapters.current = Some(units.clone());
        self.chapters.next_loading = false;
        self.chapters.transition_pending = false;
        self.scope = Some(scope);
        self.sync.reset();
        self.preloaded.clear();
        info!(chapter_index, units = units.len(), "Entered next chapter");
        if units.is_empty() {
            info!(chapter_index, "Skipping chapter with no speakable content");
            self.finish_chapter();
            return;
        }
        if self.phase.is_speaking() {
            self.play_current();
        } else {
            self.announce_cursor();
            self.kick_prefetch();
        }
    }

    /// Load the next chapter once the reader is past the midpoint or nearly out of audio.
    pub(super) fn maybe_preload_next(&mut self) {
        if !self.phase.is_active() || self.chapters.next.is_some() || self.chapters.next_loading {
            return;
        }
        let (Some(chapter), Some(scope)) = (self.chapters.current.as_ref(), self.scope.as_ref())
        else {
            return;
        };
        let next = chapter.chapter_index + 1;
        if next >= self.book.chapter_count {
            return;
        }
        let cursor = self.cursor.unit_index;
        let past_midpoint = cursor.saturating_mul(2) >= chapter.len();
        let unresolved = chapter
            .units
            .iter()
            .skip(cursor + 1)
            .filter(|unit| {
                !unit.is_trivial()
                    && !self.store.contains(scope, unit.index, 0)
                    && !self.store.is_fallback(scope, unit.index)
            })
            .count();
        if past_midpoint || unresolved < self.config.look_ahead {
            debug!(next, cursor, unresolved, "Preloading next chapter");
            self.chapters.next_loading = true;
            self.begin_load(next, LoadPurpose::Preload);
        }
    }

    pub(super) fn kick_prefetch(&mut self) {
        if !self.phase.is_active() {
            return;
        }
        if let (Some(chapter), Some(scope)) = (self.chapters.current.as_ref(), self.scope.as_ref())
        {
            if self.resolver.has_remote_voice() {
                self.pipeline.schedule(
                    scope,
                    chapter,
                    self.cursor.unit_index,
                    self.config.look_ahead,
                );
            }
        }
        self.maybe_preload_next();
        self.emit_preloaded();
    }

    /// Tell the reading surface which paragraphs have audio ready, when that changes.
    pub(super) fn emit_preloaded(&mut self) {
        let units = match self.chapters.current.as_ref() {
            Some(chapter) => self.store.cached_units(chapter.chapter_index),
            None => Vec::new(),
        };
        if units != self.preloaded {
            self.preloaded = units;
            self.observer
                .on_preloaded_set_changed(self.cursor.chapter_index, &self.preloaded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BookInfo, Command, PlaybackEngine};
    use super::*;
    use crate::capabilities::{AcceptAnyPayload, Collaborators, PassThroughCleaner};
    use crate::config::EngineConfig;
    use crate::interruption::InterruptionEvent;
    use crate::progress::ProgressRecord;
    use crate::test_support::{
        FakeKeepAlive, FakeLibrary, FakeLocalVoice, FakeOutput, FakeSynth, MemoryProgress,
        Observed, OverlapFlag, RecordingObserver, UtteranceControl,
    };
    use crossbeam_channel::{Receiver, unbounded};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig {
            look_ahead: 2,
            prefetch_workers: 1,
            retry_budget: 2,
            retry_delay_ms: 1,
            progress_debounce_ms: 5,
            ..EngineConfig::default()
        };
        config.voices.default_voice = Some("narrator".to_string());
        config
    }

    struct Setup<'a> {
        chapters: &'a [(&'a str, &'a str)],
        chapter_index: usize,
        config: EngineConfig,
        local_voice: bool,
        synth: FakeSynth,
        progress: MemoryProgress,
    }

    impl<'a> Setup<'a> {
        fn new(chapters: &'a [(&'a str, &'a str)]) -> Self {
            Self {
                chapters,
                chapter_index: 0,
                config: test_config(),
                local_voice: true,
                synth: FakeSynth::default(),
                progress: MemoryProgress::default(),
            }
        }

        fn collaborators(self) -> (Harness, Collaborators, BookInfo, EngineConfig) {
            let (_unused_tx, unused_rx) = unbounded();
            let synth = Arc::new(self.synth);
            let remote = UtteranceControl::default();
            let local = UtteranceControl::default();
            let overlap = OverlapFlag::default();
            let keepalive = FakeKeepAlive::default();
            let progress = Arc::new(self.progress);
            let observer = Arc::new(RecordingObserver::default());
            let collaborators = Collaborators {
                chapters: Arc::new(FakeLibrary::new(self.chapters)),
                cleaner: Arc::new(PassThroughCleaner),
                synthesizer: synth.clone(),
                probe: Arc::new(AcceptAnyPayload),
                output: Box::new(FakeOutput {
                    control: remote.clone(),
                    local: local.clone(),
                    overlap: overlap.clone(),
                }),
                local_voice: Box::new(FakeLocalVoice {
                    available: self.local_voice,
                    control: local.clone(),
                    remote: remote.clone(),
                    overlap: overlap.clone(),
                }),
                keepalive: Box::new(keepalive.clone()),
                progress: progress.clone(),
                observer: observer.clone(),
            };
            let book = BookInfo {
                book_id: "book".to_string(),
                chapter_count: self.chapters.len(),
                chapter_index: self.chapter_index,
            };
            let harness = Harness {
                core: None,
                events: unused_rx,
                synth,
                remote,
                local,
                overlap,
                keepalive,
                progress,
                observer,
            };
            (harness, collaborators, book, self.config)
        }

        fn build(self) -> Harness {
            let (mut harness, collaborators, book, config) = self.collaborators();
            let (tx, rx) = unbounded();
            harness.core = Some(SessionCore::new(book, config.sanitized(), collaborators, tx));
            harness.events = rx;
            harness
        }
    }

    struct Harness {
        core: Option<SessionCore>,
        events: Receiver<EngineEvent>,
        synth: Arc<FakeSynth>,
        remote: UtteranceControl,
        local: UtteranceControl,
        overlap: OverlapFlag,
        keepalive: FakeKeepAlive,
        progress: Arc<MemoryProgress>,
        observer: Arc<RecordingObserver>,
    }

    impl Harness {
        fn core(&self) -> &SessionCore {
            self.core.as_ref().expect("core built")
        }

        fn command(&mut self, command: Command) {
            self.core.as_mut().expect("core built").handle_command(command);
        }

        fn pump_until(&mut self, what: &str, done: impl Fn(&Harness) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done(self) {
                assert!(Instant::now() < deadline, "timed out waiting for {what}");
                if let Ok(event) = self.events.recv_timeout(Duration::from_millis(10)) {
                    self.core.as_mut().expect("core built").handle_event(event);
                }
            }
        }

        /// Handle everything that arrives within `window`.
        fn settle(&mut self, window: Duration) {
            let until = Instant::now() + window;
            while let Ok(event) = self.events.recv_deadline(until) {
                self.core.as_mut().expect("core built").handle_event(event);
            }
        }

        fn played(&self) -> Vec<String> {
            self.remote
                .log()
                .played
                .iter()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .collect()
        }

        fn spoken(&self) -> Vec<String> {
            self.local.log().spoken.clone()
        }

        fn wait_played(&mut self, count: usize) {
            self.pump_until("remote audio", |h| h.played().len() >= count);
        }

        fn finish_remote(&mut self) {
            assert!(self.remote.finish_current(), "nothing was playing");
        }

        fn phase(&self) -> Phase {
            self.core().phase
        }

        fn cursor(&self) -> (usize, usize, usize) {
            let cursor = self.core().cursor;
            (cursor.chapter_index, cursor.unit_index, cursor.char_offset)
        }
    }

    fn start() -> Command {
        Command::Start {
            unit_index: None,
            char_offset: None,
        }
    }

    fn start_at(unit_index: usize) -> Command {
        Command::Start {
            unit_index: Some(unit_index),
            char_offset: None,
        }
    }

    const SEVEN_UNITS: &str = "Unit zero.\nUnit one.\nUnit two.\nUnit three.\nUnit four.\nParagraph five resumes here.\nUnit six.";

    #[test]
    fn speaks_title_then_body_and_clears_progress_at_the_end() {
        let chapters = [("Opening", "Opening\nHello world.\nThis is a test.")];
        let mut h = Setup::new(&chapters).build();
        h.command(start());
        h.wait_played(1);
        assert_eq!(h.played(), ["Opening"]);
        assert_eq!(h.phase(), Phase::SpeakingTitle);

        h.finish_remote();
        h.wait_played(2);
        assert_eq!(h.phase(), Phase::SpeakingBody);

        h.finish_remote();
        h.wait_played(3);
        h.finish_remote();
        h.pump_until("end of book", |h| h.phase() == Phase::Stopped);

        assert_eq!(h.played(), ["Opening", "Hello world.", "This is a test."]);
        assert_eq!(h.progress.record("book", 0), None);
        assert!(h.progress.clears.lock().unwrap().contains(&0));
        assert_eq!(h.observer.states().last(), Some(&(false, false)));
    }

    #[test]
    fn chapter_transition_plays_preloaded_audio_without_a_gap() {
        let chapters = [
            ("", "C0."),
            ("", "C1."),
            ("", "C2 first.\nC2 last."),
            ("", "C3 first.\nC3 second."),
        ];
        let mut setup = Setup::new(&chapters);
        setup.chapter_index = 2;
        let mut h = setup.build();
        h.command(start_at(1));
        h.wait_played(1);
        assert_eq!(h.played(), ["C2 last."]);

        h.pump_until("next chapter audio", |h| {
            h.core().store.cached_units(3).contains(&0)
        });
        h.finish_remote();
        h.pump_until("next chapter playback", |h| h.played().len() == 2);

        assert_eq!(h.played(), ["C2 last.", "C3 first."]);
        assert_eq!(h.synth.calls_for("C3 first."), 1);
        assert_eq!(h.cursor(), (3, 0, 0));
        assert_eq!(h.observer.states(), vec![(true, false)]);
        let last = h.observer.cursors().last().copied().expect("cursor events");
        assert_eq!((last.chapter_index, last.unit_index), (3, 0));
        assert!(h.progress.clears.lock().unwrap().contains(&2));
    }

    #[test]
    fn seek_while_paused_resumes_mid_unit() {
        let chapters = [("", SEVEN_UNITS)];
        let mut h = Setup::new(&chapters).build();
        h.command(start());
        h.wait_played(1);

        h.command(Command::Pause);
        assert_eq!(h.phase(), Phase::Paused);
        assert!(h.remote.log().paused);

        h.command(Command::Seek {
            unit_index: 5,
            char_offset: 10,
        });
        assert_eq!(h.cursor(), (0, 5, 10));
        assert_eq!(h.phase(), Phase::Paused);

        h.command(Command::Resume);
        h.wait_played(2);
        assert_eq!(h.played()[1], "five resumes here.");
        assert_eq!(h.cursor(), (0, 5, 10));
        assert!(h
            .observer
            .cursors()
            .iter()
            .any(|c| c.unit_index == 5 && c.char_offset == 10));
    }

    #[test]
    fn cursor_moves_forward_through_a_chapter() {
        let chapters = [("", "One.\nTwo.\nThree.\nFour.\nFive.")];
        let mut h = Setup::new(&chapters).build();
        h.command(start());
        for count in 1..=5 {
            h.wait_played(count);
            h.finish_remote();
        }
        h.pump_until("end of book", |h| h.phase() == Phase::Stopped);
        let units: Vec<usize> = h.observer.cursors().iter().map(|c| c.unit_index).collect();
        assert_eq!(units, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn failed_unit_falls_back_to_local_voice_without_overlap() {
        let chapters = [("", "Alpha.\nBroken.\nGamma.")];
        let setup = Setup::new(&chapters);
        setup.synth.fail_always("Broken.");
        let mut h = setup.build();
        h.command(start());
        h.wait_played(1);
        assert_eq!(h.played(), ["Alpha."]);

        h.finish_remote();
        h.pump_until("local voice", |h| !h.spoken().is_empty());
        assert_eq!(h.spoken(), ["Broken."]);

        assert!(h.local.finish_current());
        h.wait_played(2);
        assert_eq!(h.played(), ["Alpha.", "Gamma."]);
        assert!(!h.overlap.overlapped());
        assert!(h.synth.calls_for("Broken.") <= 3);
        assert!(h.observer.errors().is_empty());
    }

    #[test]
    fn reaching_a_unit_that_already_failed_once_does_not_wait_for_retries() {
        let chapters = [("", "Alpha.\nBroken.\nGamma.")];
        let mut setup = Setup::new(&chapters);
        setup.config.retry_budget = 3;
        setup.config.retry_delay_ms = 10_000;
        setup.synth.fail_always("Broken.");
        let mut h = setup.build();
        h.command(start());
        h.wait_played(1);
        h.pump_until("first remote attempt", |h| h.synth.calls_for("Broken.") >= 1);
        h.settle(Duration::from_millis(50));

        let reached = Instant::now();
        h.finish_remote();
        h.pump_until("local voice", |h| !h.spoken().is_empty());
        assert!(reached.elapsed() < Duration::from_secs(2));
        assert_eq!(h.spoken(), ["Broken."]);
        assert_eq!(h.synth.calls_for("Broken."), 1);

        assert!(h.local.finish_current());
        h.wait_played(2);
        assert_eq!(h.played(), ["Alpha.", "Gamma."]);
        assert!(!h.overlap.overlapped());
    }

    #[test]
    fn failed_attempt_for_the_awaited_unit_switches_to_local_voice() {
        let chapters = [("", "Slow unit.\nNext unit.")];
        let setup = Setup::new(&chapters);
        setup.synth.set_delay(Duration::from_millis(200));
        let mut h = setup.build();
        h.command(start());
        h.pump_until("awaited fetch", |h| h.core().awaiting.is_some());

        let scope = h.core().scope.clone().expect("live scope");
        h.core
            .as_mut()
            .expect("core built")
            .handle_event(EngineEvent::PrefetchAttemptFailed {
                scope,
                unit_index: 0,
                error: FetchError::Network("connection reset".to_string()),
            });
        assert_eq!(h.spoken(), ["Slow unit."]);
        assert!(h.core().awaiting.is_none());

        // The late remote result is not played over the local voice.
        h.settle(Duration::from_millis(300));
        assert!(h.played().is_empty());
        assert!(!h.overlap.overlapped());
    }

    #[test]
    fn paused_reader_scroll_moves_cursor_without_fetching() {
        let chapters = [("", SEVEN_UNITS)];
        let mut h = Setup::new(&chapters).build();
        h.command(start());
        h.wait_played(1);
        h.command(Command::Pause);
        h.settle(Duration::from_millis(100));
        let calls = h.synth.call_count();

        h.command(Command::UiParagraphVisible(5));
        h.settle(Duration::from_millis(100));
        assert_eq!(h.cursor(), (0, 5, 0));
        assert_eq!(h.phase(), Phase::Paused);
        assert_eq!(h.synth.call_count(), calls);
        assert_eq!(h.synth.calls_for("Paragraph five resumes here."), 0);
        assert!(!h.remote.is_active());

        h.command(Command::Resume);
        h.wait_played(2);
        assert_eq!(h.played()[1], "Paragraph five resumes here.");
    }

    #[test]
    fn units_without_words_are_skipped() {
        let chapters = [("", "One.\n* * *\nThree.")];
        let mut h = Setup::new(&chapters).build();
        h.command(start());
        h.wait_played(1);
        h.finish_remote();
        h.wait_played(2);
        assert_eq!(h.played(), ["One.", "Three."]);
        assert_eq!(h.synth.calls_for("* * *"), 0);
        assert!(h.observer.cursors().iter().all(|c| c.unit_index != 1));
    }

    #[test]
    fn empty_chapter_refuses_to_start() {
        let chapters = [("", "  \n\n ")];
        let mut h = Setup::new(&chapters).build();
        h.command(start());
        h.pump_until("error", |h| !h.observer.errors().is_empty());
        assert_eq!(
            h.observer.errors(),
            vec![PlaybackError::EmptyChapterContent { chapter_index: 0 }]
        );
        assert_eq!(h.phase(), Phase::Idle);
        assert!(!h.core().loading_start);
    }

    #[test]
    fn missing_voices_refuse_to_start() {
        let chapters = [("", "Text.")];
        let mut setup = Setup::new(&chapters);
        setup.config.voices = Default::default();
        setup.local_voice = false;
        let mut h = setup.build();
        h.command(start());
        h.pump_until("error", |h| !h.observer.errors().is_empty());
        assert_eq!(h.observer.errors(), vec![PlaybackError::NoVoiceConfigured]);
        assert_eq!(h.phase(), Phase::Idle);
    }

    #[test]
    fn local_voice_alone_reads_the_chapter() {
        let chapters = [("", "First.\nSecond.")];
        let mut setup = Setup::new(&chapters);
        setup.config.voices = Default::default();
        let mut h = setup.build();
        h.command(start());
        h.pump_until("local voice", |h| h.spoken().len() == 1);
        assert!(h.local.finish_current());
        h.pump_until("second unit", |h| h.spoken().len() == 2);
        assert_eq!(h.spoken(), ["First.", "Second."]);
        assert_eq!(h.synth.call_count(), 0);
    }

    #[test]
    fn start_resumes_from_saved_progress() {
        let chapters = [("", "Zero.\nOne.\nTwo point five.")];
        let setup = Setup::new(&chapters);
        setup
            .progress
            .save(&ProgressRecord {
                book_id: "book".to_string(),
                chapter_index: 0,
                unit_index: 2,
                char_offset: 4,
            })
            .expect("save");
        let mut h = setup.build();
        h.command(start());
        h.wait_played(1);
        assert_eq!(h.played(), ["point five."]);
        assert_eq!(h.cursor(), (0, 2, 4));
    }

    #[test]
    fn reader_position_seeds_start_without_scrolling_back() {
        let chapters = [("", "Unit zero.\nUnit one.\nUnit two.\nUnit three.")];
        let mut h = Setup::new(&chapters).build();
        h.command(Command::UiParagraphVisible(2));
        h.command(start());
        h.wait_played(1);
        assert_eq!(h.played(), ["Unit two."]);

        h.finish_remote();
        h.wait_played(2);
        assert_eq!(h.observer.scrolls(), vec![3]);
    }

    #[test]
    fn interruption_pauses_and_resumes() {
        let chapters = [("", SEVEN_UNITS)];
        let mut h = Setup::new(&chapters).build();
        h.command(start());
        h.wait_played(1);

        h.command(Command::Interruption(InterruptionEvent::Began));
        assert_eq!(h.phase(), Phase::Paused);
        assert!(h.remote.log().paused);

        h.command(Command::Interruption(InterruptionEvent::Ended {
            should_resume: true,
        }));
        assert_eq!(h.phase(), Phase::SpeakingBody);
        assert!(!h.remote.log().paused);
        assert_eq!(h.played().len(), 1);
    }

    #[test]
    fn completion_from_a_cancelled_utterance_is_ignored() {
        let chapters = [("", "Zero.\nOne.\nTwo.\nThree.")];
        let mut h = Setup::new(&chapters).build();
        h.command(start());
        h.wait_played(1);
        let stale = h.remote.log().current.clone().expect("playing");

        h.command(Command::Seek {
            unit_index: 2,
            char_offset: 0,
        });
        h.wait_played(2);
        stale.finished();
        h.settle(Duration::from_millis(50));

        assert_eq!(h.cursor(), (0, 2, 0));
        assert_eq!(h.played(), ["Zero.", "Two."]);
    }

    #[test]
    fn refused_audio_moves_on_to_the_next_unit() {
        let chapters = [("", "First.\nSecond.")];
        let mut h = Setup::new(&chapters).build();
        h.remote.log().fail_next_play = true;
        h.command(start());
        h.wait_played(1);
        assert_eq!(h.played(), ["Second."]);
        assert_eq!(h.cursor(), (0, 1, 0));
        assert!(h.observer.errors().is_empty());
    }

    #[test]
    fn next_past_the_last_unit_enters_the_following_chapter() {
        let chapters = [("", "A one.\nA two."), ("", "B one.")];
        let mut h = Setup::new(&chapters).build();
        h.command(start());
        h.wait_played(1);
        h.command(Command::Next);
        h.wait_played(2);
        h.command(Command::Next);
        h.wait_played(3);
        assert_eq!(h.played(), ["A one.", "A two.", "B one."]);
        assert_eq!(h.cursor(), (1, 0, 0));

        h.command(Command::Previous);
        assert_eq!(h.cursor(), (1, 0, 0));
    }

    #[test]
    fn chapter_without_content_is_skipped_mid_book() {
        let chapters = [("", "Only."), ("", "   "), ("", "Third.")];
        let mut h = Setup::new(&chapters).build();
        h.command(start());
        h.wait_played(1);
        h.finish_remote();
        h.wait_played(2);
        assert_eq!(h.played(), ["Only.", "Third."]);
        assert_eq!(h.cursor(), (2, 0, 0));
    }

    #[test]
    fn selecting_a_chapter_restarts_there() {
        let chapters = [("", "A."), ("", "B one.\nB two.")];
        let mut h = Setup::new(&chapters).build();
        h.command(start());
        h.wait_played(1);
        h.command(Command::SelectChapter(1));
        h.wait_played(2);
        assert_eq!(h.played(), ["A.", "B one."]);
        assert_eq!(h.cursor(), (1, 0, 0));
        assert_eq!(
            h.observer.states(),
            vec![(true, false), (false, false), (true, false)]
        );

        h.command(Command::SelectChapter(9));
        assert_eq!(h.cursor(), (1, 0, 0));
    }

    #[test]
    fn pause_and_stop_persist_progress_immediately() {
        let chapters = [("", "Zero.\nOne.\nTwo.")];
        let mut setup = Setup::new(&chapters);
        setup.config.progress_debounce_ms = 60_000;
        let mut h = setup.build();
        h.command(start_at(1));
        h.wait_played(1);

        h.command(Command::Pause);
        let saved = h.progress.record("book", 0).expect("saved on pause");
        assert_eq!((saved.unit_index, saved.char_offset), (1, 0));

        h.command(Command::Stop);
        assert_eq!(h.phase(), Phase::Stopped);
        assert_eq!(h.observer.states().last(), Some(&(false, false)));
        let last_preloaded = h
            .observer
            .all()
            .into_iter()
            .filter_map(|event| match event {
                Observed::Preloaded(_, units) => Some(units),
                _ => None,
            })
            .last();
        assert!(last_preloaded.map(|units| units.is_empty()).unwrap_or(true));
        assert_eq!(h.progress.record("book", 0).map(|r| r.unit_index), Some(1));
    }

    #[test]
    fn background_keepalive_ends_when_audio_arrives() {
        let chapters = [("", "Slow unit.\nNext unit.")];
        let setup = Setup::new(&chapters);
        setup.synth.set_delay(Duration::from_millis(150));
        let mut h = setup.build();
        h.command(start());
        h.pump_until("awaited fetch", |h| h.core().awaiting.is_some());

        h.command(Command::Interruption(InterruptionEvent::EnteredBackground));
        assert!(h.keepalive.active.load(Ordering::SeqCst));

        h.wait_played(1);
        assert!(!h.keepalive.active.load(Ordering::SeqCst));
        assert_eq!(h.keepalive.begins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn engine_thread_plays_and_shuts_down() {
        let chapters = [("", "Engine one.\nEngine two.")];
        let (h, collaborators, book, config) = Setup::new(&chapters).collaborators();
        let engine = PlaybackEngine::spawn(book, config, collaborators).expect("spawn");
        let handle = engine.handle();
        handle.start(None, None).expect("start");

        let deadline = Instant::now() + Duration::from_secs(5);
        while h.played().is_empty() {
            assert!(Instant::now() < deadline, "engine never played");
            std::thread::sleep(Duration::from_millis(5));
        }
        engine.shutdown();

        assert_eq!(h.played(), ["Engine one."]);
        assert_eq!(handle.pause(), Err(PlaybackError::EngineStopped));
        assert_eq!(h.progress.record("book", 0).map(|r| r.unit_index), Some(0));
        assert_eq!(h.observer.states().last(), Some(&(false, false)));
    }
}
