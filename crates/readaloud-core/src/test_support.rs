//! In-memory collaborators for unit tests.

use crate::capabilities::{
    AudioOutput, ChapterSource, CompletionSignal, CursorEvent, KeepAlive, LocalVoice,
    ProgressBackend, ReaderObserver, RemoteSynthesizer, SynthesisRequest, SynthesizedAudio,
};
use crate::error::PlaybackError;
use crate::progress::ProgressRecord;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct SynthState {
    content_type: Option<String>,
    payload: Option<Vec<u8>>,
    fail_always: HashSet<String>,
    fail_times: HashMap<String, usize>,
    requests: Vec<(String, String)>,
    delay: Option<Duration>,
}

/// Synthesizer whose payload is the requested text's bytes.
#[derive(Default)]
pub(crate) struct FakeSynth {
    state: Mutex<SynthState>,
}

impl FakeSynth {
    pub fn with_content_type(content_type: &str) -> Self {
        let synth = Self::default();
        synth.state.lock().unwrap().content_type = Some(content_type.to_string());
        synth
    }

    pub fn with_payload(payload: Vec<u8>) -> Self {
        let synth = Self::default();
        synth.state.lock().unwrap().payload = Some(payload);
        synth
    }

    pub fn fail_always(&self, text: &str) {
        self.state.lock().unwrap().fail_always.insert(text.to_string());
    }

    pub fn fail_times(&self, text: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .fail_times
            .insert(text.to_string(), times);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    /// `(voice_id, text)` of every request so far.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn calls_for(&self, text: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(_, requested)| requested == text)
            .count()
    }
}

impl RemoteSynthesizer for FakeSynth {
    fn synthesize(&self, request: &SynthesisRequest<'_>) -> anyhow::Result<SynthesizedAudio> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state
                .requests
                .push((request.voice_id.to_string(), request.text.to_string()));
            state.delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_always.contains(request.text) {
            anyhow::bail!("synthesis refused for {:?}", request.text);
        }
        if let Some(remaining) = state.fail_times.get_mut(request.text) {
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("transient failure for {:?}", request.text);
            }
        }
        Ok(SynthesizedAudio {
            bytes: state
                .payload
                .clone()
                .unwrap_or_else(|| request.text.as_bytes().to_vec()),
            content_type: state.content_type.clone(),
        })
    }
}

/// `(title, body)` per chapter.
pub(crate) struct FakeLibrary {
    pub chapters: Vec<(String, String)>,
}

impl FakeLibrary {
    pub fn new(chapters: &[(&str, &str)]) -> Self {
        Self {
            chapters: chapters
                .iter()
                .map(|(title, body)| (title.to_string(), body.to_string()))
                .collect(),
        }
    }
}

impl ChapterSource for FakeLibrary {
    fn chapter_text(&self, _book_id: &str, chapter_index: usize) -> anyhow::Result<String> {
        self.chapters
            .get(chapter_index)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| anyhow::anyhow!("no chapter {chapter_index}"))
    }

    fn chapter_title(&self, _book_id: &str, chapter_index: usize) -> String {
        self.chapters
            .get(chapter_index)
            .map(|(title, _)| title.clone())
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub(crate) struct UtteranceLog {
    pub played: Vec<Vec<u8>>,
    pub spoken: Vec<String>,
    pub current: Option<CompletionSignal>,
    pub paused: bool,
    pub stops: usize,
    pub fail_next_play: bool,
}

/// Test-side view of a fake voice: finish or fail the current utterance.
#[derive(Clone, Default)]
pub(crate) struct UtteranceControl {
    log: Arc<Mutex<UtteranceLog>>,
}

impl UtteranceControl {
    pub fn log(&self) -> std::sync::MutexGuard<'_, UtteranceLog> {
        self.log.lock().unwrap()
    }

    pub fn is_active(&self) -> bool {
        self.log().current.is_some()
    }

    pub fn finish_current(&self) -> bool {
        let signal = self.log().current.take();
        match signal {
            Some(signal) => {
                signal.finished();
                true
            }
            None => false,
        }
    }

    pub fn fail_current(&self, message: &str) -> bool {
        let signal = self.log().current.take();
        match signal {
            Some(signal) => {
                signal.failed(message);
                true
            }
            None => false,
        }
    }
}

/// Set when one fake voice starts while the other still has an utterance.
#[derive(Clone, Default)]
pub(crate) struct OverlapFlag(Arc<AtomicBool>);

impl OverlapFlag {
    fn check(&self, other: &UtteranceControl) {
        if other.is_active() {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    pub fn overlapped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeOutput {
    pub control: UtteranceControl,
    pub local: UtteranceControl,
    pub overlap: OverlapFlag,
}

impl AudioOutput for FakeOutput {
    fn play(&mut self, audio: Arc<[u8]>, signal: CompletionSignal) -> anyhow::Result<()> {
        self.overlap.check(&self.local);
        let mut log = self.control.log();
        if log.fail_next_play {
            log.fail_next_play = false;
            anyhow::bail!("device busy");
        }
        log.played.push(audio.to_vec());
        log.paused = false;
        signal.started();
        log.current = Some(signal);
        Ok(())
    }

    fn pause(&mut self) {
        self.control.log().paused = true;
    }

    fn resume(&mut self) {
        self.control.log().paused = false;
    }

    fn stop(&mut self) {
        let mut log = self.control.log();
        log.current = None;
        log.stops += 1;
    }
}

pub(crate) struct FakeLocalVoice {
    pub available: bool,
    pub control: UtteranceControl,
    pub remote: UtteranceControl,
    pub overlap: OverlapFlag,
}

impl LocalVoice for FakeLocalVoice {
    fn is_available(&self) -> bool {
        self.available
    }

    fn speak(
        &mut self,
        text: &str,
        _voice_id: Option<&str>,
        _rate: f32,
        signal: CompletionSignal,
    ) -> anyhow::Result<()> {
        if !self.available {
            anyhow::bail!("no local voice");
        }
        self.overlap.check(&self.remote);
        let mut log = self.control.log();
        log.spoken.push(text.to_string());
        log.paused = false;
        log.current = Some(signal);
        Ok(())
    }

    fn pause(&mut self) {
        self.control.log().paused = true;
    }

    fn resume(&mut self) {
        self.control.log().paused = false;
    }

    fn stop(&mut self) {
        let mut log = self.control.log();
        log.current = None;
        log.stops += 1;
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeKeepAlive {
    pub active: Arc<AtomicBool>,
    pub begins: Arc<AtomicUsize>,
}

impl KeepAlive for FakeKeepAlive {
    fn begin(&mut self) {
        self.begins.fetch_add(1, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
    }

    fn end(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct MemoryProgress {
    pub records: Mutex<HashMap<(String, usize), ProgressRecord>>,
    pub saves: AtomicUsize,
    pub clears: Mutex<Vec<usize>>,
    pub positions: Mutex<Vec<(usize, f64)>>,
}

impl MemoryProgress {
    pub fn record(&self, book_id: &str, chapter_index: usize) -> Option<ProgressRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&(book_id.to_string(), chapter_index))
            .cloned()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl ProgressBackend for MemoryProgress {
    fn load(&self, book_id: &str, chapter_index: usize) -> anyhow::Result<Option<ProgressRecord>> {
        Ok(self.record(book_id, chapter_index))
    }

    fn save(&self, record: &ProgressRecord) -> anyhow::Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.records.lock().unwrap().insert(
            (record.book_id.clone(), record.chapter_index),
            record.clone(),
        );
        Ok(())
    }

    fn clear(&self, book_id: &str, chapter_index: usize) -> anyhow::Result<()> {
        self.clears.lock().unwrap().push(chapter_index);
        self.records
            .lock()
            .unwrap()
            .remove(&(book_id.to_string(), chapter_index));
        Ok(())
    }

    fn report_position(
        &self,
        _book_id: &str,
        chapter_index: usize,
        fraction: f64,
    ) -> anyhow::Result<()> {
        self.positions.lock().unwrap().push((chapter_index, fraction));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Observed {
    Cursor(CursorEvent),
    Preloaded(usize, Vec<usize>),
    State { playing: bool, paused: bool },
    Scroll(usize),
    Error(PlaybackError),
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub events: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn all(&self) -> Vec<Observed> {
        self.events.lock().unwrap().clone()
    }

    pub fn cursors(&self) -> Vec<CursorEvent> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                Observed::Cursor(cursor) => Some(cursor),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<PlaybackError> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                Observed::Error(error) => Some(error),
                _ => None,
            })
            .collect()
    }

    pub fn scrolls(&self) -> Vec<usize> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                Observed::Scroll(unit) => Some(unit),
                _ => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<(bool, bool)> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                Observed::State { playing, paused } => Some((playing, paused)),
                _ => None,
            })
            .collect()
    }
}

impl ReaderObserver for RecordingObserver {
    fn on_cursor_changed(&self, event: &CursorEvent) {
        self.events.lock().unwrap().push(Observed::Cursor(*event));
    }

    fn on_preloaded_set_changed(&self, chapter_index: usize, unit_indices: &[usize]) {
        self.events
            .lock()
            .unwrap()
            .push(Observed::Preloaded(chapter_index, unit_indices.to_vec()));
    }

    fn on_playback_state_changed(&self, is_playing: bool, is_paused: bool) {
        self.events.lock().unwrap().push(Observed::State {
            playing: is_playing,
            paused: is_paused,
        });
    }

    fn on_scroll_requested(&self, unit_index: usize) {
        self.events.lock().unwrap().push(Observed::Scroll(unit_index));
    }

    fn on_error(&self, error: &PlaybackError) {
        self.events.lock().unwrap().push(Observed::Error(error.clone()));
    }
}
