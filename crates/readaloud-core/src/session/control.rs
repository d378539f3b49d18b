use super::state::{ActiveVoice, AwaitedUnit, ChapterSlots, Phase, PlaybackCursor, StopReason};
use super::{BookInfo, Command};
use crate::cache::{AudioStore, ChapterScope};
use crate::capabilities::{
    AudioOutput, ChapterSource, Collaborators, CursorEvent, KeepAlive, LocalVoice, ReaderObserver,
    TextCleaner,
};
use crate::config::EngineConfig;
use crate::error::PlaybackError;
use crate::events::{EngineEvent, LoadPurpose};
use crate::interruption::{
    InterruptionAction, InterruptionEvent, InterruptionHandler, SessionSnapshot,
};
use crate::prefetch::PrefetchPipeline;
use crate::progress::{ProgressRecord, ProgressStore};
use crate::resolver::AudioResolver;
use crate::segmenter::SpeakableUnit;
use crate::sync::{SyncAction, SyncCoordinator};
use crossbeam_channel::Sender;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Epoch, chapter, unit and offset of a one-off resolve in flight.
pub(super) type FetchKey = (u64, usize, usize, usize);

/// State owned by the control thread. Nothing here is shared.
pub(crate) struct SessionCore {
    pub(super) config: EngineConfig,
    pub(super) book: BookInfo,
    pub(super) source: Arc<dyn ChapterSource>,
    pub(super) cleaner: Arc<dyn TextCleaner>,
    pub(super) output: Box<dyn AudioOutput>,
    pub(super) local_voice: Box<dyn LocalVoice>,
    pub(super) keepalive: Box<dyn KeepAlive>,
    pub(super) observer: Arc<dyn ReaderObserver>,
    pub(super) store: AudioStore,
    pub(super) resolver: Arc<AudioResolver>,
    pub(super) pipeline: PrefetchPipeline,
    pub(super) progress: ProgressStore,
    pub(super) sync: SyncCoordinator,
    pub(super) interruption: InterruptionHandler,
    pub(super) events: Sender<EngineEvent>,

    pub(super) phase: Phase,
    pub(super) cursor: PlaybackCursor,
    pub(super) chapters: ChapterSlots,
    pub(super) scope: Option<ChapterScope>,
    /// Bumped on every session rebuild; chapter loads from older generations are dropped.
    pub(super) load_generation: u64,
    pub(super) loading_start: bool,
    /// Paragraph the reader scrolled to while nothing was playing.
    pub(super) reader_hint: Option<usize>,
    /// Identifies the current utterance; completions carrying another ticket are stale.
    pub(super) ticket: u64,
    pub(super) active: ActiveVoice,
    pub(super) awaiting: Option<AwaitedUnit>,
    pub(super) immediate_fetches: HashSet<FetchKey>,
    pub(super) preloaded: Vec<usize>,
}

impl SessionCore {
    pub(crate) fn new(
        book: BookInfo,
        config: EngineConfig,
        collaborators: Collaborators,
        events: Sender<EngineEvent>,
    ) -> Self {
        let store = AudioStore::new(book.book_id.as_str(), config.cache_capacity);
        let resolver = Arc::new(AudioResolver::new(
            store.clone(),
            collaborators.synthesizer,
            collaborators.probe,
            config.voices.clone(),
            config.speech_rate,
            config.fetch_timeout(),
        ));
        let pipeline = PrefetchPipeline::spawn(
            config.prefetch(),
            Arc::clone(&resolver),
            store.clone(),
            events.clone(),
        );
        let progress = ProgressStore::spawn(collaborators.progress, config.progress_debounce());
        let sync = SyncCoordinator::new(config.follow_enabled, config.follow_cooldown());
        let interruption = InterruptionHandler::new(config.keepalive_max_wait());
        let cursor = PlaybackCursor {
            chapter_index: book
                .chapter_index
                .min(book.chapter_count.saturating_sub(1)),
            unit_index: 0,
            char_offset: 0,
        };
        Self {
            config,
            book,
            source: collaborators.chapters,
            cleaner: collaborators.cleaner,
            output: collaborators.output,
            local_voice: collaborators.local_voice,
            keepalive: collaborators.keepalive,
            observer: collaborators.observer,
            store,
            resolver,
            pipeline,
            progress,
            sync,
            interruption,
            events,
            phase: Phase::Idle,
            cursor,
            chapters: ChapterSlots::default(),
            scope: None,
            load_generation: 0,
            loading_start: false,
            reader_hint: None,
            ticket: 0,
            active: ActiveVoice::None,
            awaiting: None,
            immediate_fetches: HashSet::new(),
            preloaded: Vec::new(),
        }
    }

    pub(crate) fn handle_command(&mut self, command: Command) {
        debug!(?command, phase = ?self.phase, "Handling command");
        match command {
            Command::Start {
                unit_index,
                char_offset,
            } => self.start(unit_index, char_offset),
            Command::Pause => {
                self.interruption.clear_interruption();
                self.pause();
            }
            Command::Resume => {
                self.interruption.clear_interruption();
                self.resume();
            }
            Command::Seek {
                unit_index,
                char_offset,
            } => self.seek(unit_index, char_offset),
            Command::Next => self.next(),
            Command::Previous => self.previous(),
            Command::Stop => self.stop(StopReason::User),
            Command::SelectChapter(chapter_index) => self.select_chapter(chapter_index),
            Command::SetFollowEnabled(enabled) => {
                info!(enabled, "Follow mode changed");
                self.sync.set_follow_enabled(enabled);
            }
            Command::UiParagraphVisible(unit_index) => self.ui_paragraph_visible(unit_index),
            Command::JumpToReader => self.jump_to_reader(),
            Command::Interruption(event) => self.interruption(event),
            Command::Shutdown => self.shutdown(),
        }
    }

    pub(crate) fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ChapterLoaded {
                generation,
                purpose,
                chapter_index,
                result,
            } => self.on_chapter_loaded(generation, purpose, chapter_index, result),
            EngineEvent::Resolved {
                scope,
                unit_index,
                char_offset,
                result,
            } => self.on_resolved(scope, unit_index, char_offset, result),
            EngineEvent::Prefetched {
                scope,
                unit_index,
                outcome,
            } => self.on_prefetched(scope, unit_index, outcome),
            EngineEvent::PrefetchAttemptFailed {
                scope,
                unit_index,
                error,
            } => self.on_prefetch_attempt_failed(scope, unit_index, error),
            EngineEvent::Voice {
                ticket,
                voice,
                progress,
            } => self.on_voice(ticket, voice, progress),
        }
    }

    pub(crate) fn on_tick(&mut self, now: Instant) {
        if let Some(action) = self.interruption.on_tick(now) {
            self.apply_interruption(action);
        }
    }

    pub(crate) fn shutdown(&mut self) {
        if self.phase.is_active() || self.loading_start {
            self.stop(StopReason::Terminating);
        } else {
            self.keepalive.end();
        }
        self.pipeline.shutdown();
    }

    fn start(&mut self, unit_index: Option<usize>, char_offset: Option<usize>) {
        match self.phase {
            Phase::SpeakingTitle | Phase::SpeakingBody => {
                if let Some(unit_index) = unit_index {
                    self.seek(unit_index, char_offset.unwrap_or(0));
                }
                return;
            }
            Phase::Paused => {
                if let Some(unit_index) = unit_index {
                    self.seek(unit_index, char_offset.unwrap_or(0));
                }
                self.resume();
                return;
            }
            Phase::Idle | Phase::Stopped => {}
        }
        if self.loading_start {
            debug!("Skipping duplicate start while the chapter is loading");
            return;
        }
        if self.book.chapter_count == 0 {
            self.report(PlaybackError::EmptyChapterContent {
                chapter_index: self.cursor.chapter_index,
            });
            return;
        }
        let target = unit_index
            .map(|unit| (unit, char_offset.unwrap_or(0)))
            .or(self.reader_hint.map(|unit| (unit, 0)));
        info!(
            chapter_index = self.cursor.chapter_index,
            ?target,
            "Starting playback"
        );
        self.loading_start = true;
        self.load_generation += 1;
        self.begin_load(self.cursor.chapter_index, LoadPurpose::Start { target });
    }

    fn pause(&mut self) {
        if !self.phase.is_speaking() {
            debug!(phase = ?self.phase, "Pause ignored");
            return;
        }
        match self.active {
            ActiveVoice::Remote => self.output.pause(),
            ActiveVoice::Local => self.local_voice.pause(),
            ActiveVoice::None => {}
        }
        self.phase = Phase::Paused;
        info!(
            chapter_index = self.cursor.chapter_index,
            unit_index = self.cursor.unit_index,
            "Playback paused"
        );
        self.notify_state();
        self.flush_progress();
    }

    pub(super) fn resume(&mut self) {
        if self.phase != Phase::Paused {
            debug!(phase = ?self.phase, "Resume ignored");
            return;
        }
        self.phase = self.speaking_phase();
        info!(
            chapter_index = self.cursor.chapter_index,
            unit_index = self.cursor.unit_index,
            "Playback resumed"
        );
        self.notify_state();
        match self.active {
            ActiveVoice::Remote => self.output.resume(),
            ActiveVoice::Local => self.local_voice.resume(),
            ActiveVoice::None if self.chapters.transition_pending => {
                debug!("Still waiting for the next chapter");
            }
            ActiveVoice::None => self.play_current(),
        }
    }

    fn seek(&mut self, unit_index: usize, char_offset: usize) {
        if !self.reposition(unit_index, char_offset) {
            return;
        }
        if self.phase.is_speaking() {
            self.play_current();
        } else {
            self.announce_cursor();
            self.warm_current();
            self.kick_prefetch();
        }
    }

    /// Move the cursor and silence the old utterance. Returns false outside a session.
    fn reposition(&mut self, unit_index: usize, char_offset: usize) -> bool {
        if !self.phase.is_active() {
            debug!(phase = ?self.phase, unit_index, "Seek ignored outside a session");
            return false;
        }
        let Some(chapter) = self.chapters.current.clone() else {
            return false;
        };
        let Some(last) = chapter.len().checked_sub(1) else {
            return false;
        };
        let unit_index = unit_index.min(last);
        let char_offset = chapter
            .get(unit_index)
            .map(|unit| char_offset.min(unit.len_utf16()))
            .unwrap_or(0);
        self.silence();
        self.chapters.transition_pending = false;
        self.cursor.unit_index = unit_index;
        self.cursor.char_offset = char_offset;
        info!(unit_index, char_offset, "Seek");
        true
    }

    fn next(&mut self) {
        if !self.phase.is_active() {
            return;
        }
        let Some(len) = self.chapters.current.as_ref().map(|c| c.len()) else {
            return;
        };
        let target = self.cursor.unit_index + 1;
        if target < len {
            self.seek(target, 0);
            return;
        }
        self.silence();
        self.cursor.unit_index = len;
        self.cursor.char_offset = 0;
        if self.phase.is_speaking() {
            self.finish_chapter();
        }
    }

    fn previous(&mut self) {
        if !self.phase.is_active() {
            return;
        }
        self.seek(self.cursor.unit_index.saturating_sub(1), 0);
    }

    pub(super) fn stop(&mut self, reason: StopReason) {
        self.silence();
        self.interruption.clear_interruption();
        if self.interruption.on_fetch_resolved().is_some() {
            self.keepalive.end();
        }
        match reason {
            StopReason::Finished => self
                .progress
                .reset(&self.book.book_id, self.cursor.chapter_index),
            StopReason::User | StopReason::Error | StopReason::Terminating => {
                self.flush_progress()
            }
        }
        self.pipeline.cancel_all();
        self.store.reset();
        self.immediate_fetches.clear();
        self.chapters.clear();
        self.scope = None;
        self.loading_start = false;
        self.load_generation += 1;
        if reason == StopReason::Finished {
            self.cursor.unit_index = 0;
            self.cursor.char_offset = 0;
        }
        self.phase = Phase::Stopped;
        info!(
            ?reason,
            chapter_index = self.cursor.chapter_index,
            unit_index = self.cursor.unit_index,
            "Playback stopped"
        );
        self.emit_preloaded();
        self.notify_state();
    }

    fn select_chapter(&mut self, chapter_index: usize) {
        if chapter_index >= self.book.chapter_count {
            warn!(
                chapter_index,
                chapter_count = self.book.chapter_count,
                "Ignoring selection of a chapter outside the book"
            );
            return;
        }
        let resume = self.phase.is_speaking() || self.loading_start;
        if self.phase.is_active() || self.loading_start {
            self.stop(StopReason::User);
        }
        self.cursor = PlaybackCursor {
            chapter_index,
            unit_index: 0,
            char_offset: 0,
        };
        self.reader_hint = None;
        self.sync.reset();
        info!(chapter_index, resume, "Chapter selected");
        if resume {
            self.start(None, None);
        }
    }

    fn ui_paragraph_visible(&mut self, unit_index: usize) {
        let action =
            self.sync
                .on_ui_paragraph_visible(unit_index, self.phase.is_speaking(), Instant::now());
        if let SyncAction::MoveCursor(unit_index) = action {
            if self.phase == Phase::Paused {
                // Audio for the new position is fetched when playback resumes.
                if self.reposition(unit_index, 0) {
                    self.announce_cursor();
                }
            } else {
                debug!(unit_index, "Reader position will be used on start");
                self.reader_hint = Some(unit_index);
                self.cursor.unit_index = unit_index;
                self.cursor.char_offset = 0;
            }
        }
    }

    fn jump_to_reader(&mut self) {
        let Some(unit_index) = self.sync.last_reader_index() else {
            debug!("No reader position to jump to");
            return;
        };
        if self.phase.is_active() {
            self.seek(unit_index, 0);
        } else {
            self.start(Some(unit_index), Some(0));
        }
    }

    fn interruption(&mut self, event: InterruptionEvent) {
        let snapshot = self.snapshot();
        if event == InterruptionEvent::Began && snapshot.is_speaking {
            warn!("{}", PlaybackError::InterruptedExternally);
        }
        for action in self.interruption.handle(event, snapshot, Instant::now()) {
            self.apply_interruption(action);
        }
    }

    pub(super) fn apply_interruption(&mut self, action: InterruptionAction) {
        debug!(?action, "Applying interruption action");
        match action {
            InterruptionAction::Pause => self.pause(),
            InterruptionAction::Resume => self.resume(),
            InterruptionAction::FlushProgress => self.flush_progress(),
            InterruptionAction::StartKeepAlive => self.keepalive.begin(),
            InterruptionAction::StopKeepAlive => self.keepalive.end(),
            InterruptionAction::Stop => self.stop(StopReason::Terminating),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let next_in_flight = self
            .scope
            .as_ref()
            .map(|scope| {
                self.pipeline
                    .is_in_flight(scope, self.cursor.unit_index + 1)
            })
            .unwrap_or(false);
        SessionSnapshot {
            is_speaking: self.phase.is_speaking(),
            fetch_in_flight: self.awaiting.is_some() || next_in_flight,
        }
    }

    /// The awaited audio showed up; a background keep-alive is no longer needed.
    pub(super) fn fetch_settled(&mut self) {
        if let Some(action) = self.interruption.on_fetch_resolved() {
            self.apply_interruption(action);
        }
    }

    pub(super) fn current_unit(&self) -> Option<&SpeakableUnit> {
        self.chapters.current.as_ref()?.get(self.cursor.unit_index)
    }

    pub(super) fn speaking_phase(&self) -> Phase {
        match self.current_unit() {
            Some(unit) if unit.is_title => Phase::SpeakingTitle,
            _ => Phase::SpeakingBody,
        }
    }

    pub(super) fn notify_state(&self) {
        self.observer
            .on_playback_state_changed(self.phase.is_speaking(), self.phase == Phase::Paused);
    }

    pub(super) fn report(&self, error: PlaybackError) {
        warn!("{error}");
        if error.is_user_visible() {
            self.observer.on_error(&error);
        }
    }

    /// Publish the cursor to the reading surface and queue a progress write.
    pub(super) fn announce_cursor(&mut self) {
        let event = CursorEvent {
            chapter_index: self.cursor.chapter_index,
            unit_index: self.cursor.unit_index,
            char_offset: self.cursor.char_offset,
            is_title: self.current_unit().map(|u| u.is_title).unwrap_or(false),
        };
        self.observer.on_cursor_changed(&event);
        let action = self.sync.on_playback_cursor_changed(
            self.cursor.unit_index,
            self.phase.is_speaking(),
            Instant::now(),
        );
        if let SyncAction::ScrollUi(unit_index) = action {
            self.observer.on_scroll_requested(unit_index);
        }
        self.record_progress();
    }

    pub(super) fn record_progress(&self) {
        let Some(chapter) = self.chapters.current.as_ref() else {
            return;
        };
        let Some(last) = chapter.len().checked_sub(1) else {
            return;
        };
        // A cursor parked past the last unit counts as the end of that unit.
        let (unit_index, char_offset) = if self.cursor.unit_index > last {
            let end = chapter.get(last).map(|u| u.len_utf16()).unwrap_or(0);
            (last, end)
        } else {
            (self.cursor.unit_index, self.cursor.char_offset)
        };
        let record = ProgressRecord {
            book_id: self.book.book_id.clone(),
            chapter_index: chapter.chapter_index,
            unit_index,
            char_offset,
        };
        self.progress
            .record(record, chapter.fraction_at(unit_index, char_offset));
    }

    pub(super) fn flush_progress(&self) {
        self.record_progress();
        self.progress.flush();
    }
}
