use crate::segmenter::ChapterUnits;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    SpeakingTitle,
    SpeakingBody,
    Paused,
    Stopped,
}

impl Phase {
    pub fn is_speaking(self) -> bool {
        matches!(self, Phase::SpeakingTitle | Phase::SpeakingBody)
    }

    pub fn is_active(self) -> bool {
        self.is_speaking() || self == Phase::Paused
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackCursor {
    pub chapter_index: usize,
    pub unit_index: usize,
    /// UTF-16 code units into the unit's text.
    pub char_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    User,
    /// The last chapter of the book finished.
    Finished,
    Error,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ActiveVoice {
    None,
    Remote,
    Local,
}

/// Audio the cursor is waiting on before it can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct AwaitedUnit {
    pub(super) chapter_index: usize,
    pub(super) unit_index: usize,
    pub(super) char_offset: usize,
}

/// Everything tied to the chapter currently loaded for playback.
#[derive(Debug, Default)]
pub(super) struct ChapterSlots {
    pub(super) current: Option<ChapterUnits>,
    pub(super) next: Option<ChapterUnits>,
    pub(super) next_loading: bool,
    /// The current chapter ended and playback waits for its successor to load.
    pub(super) transition_pending: bool,
}

impl ChapterSlots {
    pub(super) fn clear(&mut self) {
        self.current = None;
        self.next = None;
        self.next_loading = false;
        self.transition_pending = false;
    }
}
