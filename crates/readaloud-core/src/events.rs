//! Messages reported back to the control thread by worker threads.

use crate::cache::ChapterScope;
use crate::capabilities::VoiceKind;
use crate::error::FetchError;
use crate::progress::ProgressRecord;
use crate::resolver::{FallbackReason, Resolution};
use crate::segmenter::ChapterUnits;

#[derive(Debug)]
pub(crate) enum EngineEvent {
    ChapterLoaded {
        generation: u64,
        purpose: LoadPurpose,
        chapter_index: usize,
        result: Result<LoadedChapter, String>,
    },
    /// A one-off resolve for the unit under the cursor finished.
    Resolved {
        scope: ChapterScope,
        unit_index: usize,
        char_offset: usize,
        result: Result<Resolution, FetchError>,
    },
    Prefetched {
        scope: ChapterScope,
        unit_index: usize,
        outcome: PrefetchOutcome,
    },
    /// A look-ahead attempt failed and the worker is backing off before retrying.
    PrefetchAttemptFailed {
        scope: ChapterScope,
        unit_index: usize,
        error: FetchError,
    },
    Voice {
        ticket: u64,
        voice: VoiceKind,
        progress: VoiceProgress,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadPurpose {
    /// Explicit start or chapter selection; `target` overrides saved progress.
    Start { target: Option<(usize, usize)> },
    /// The chapter after the current one, loaded ahead of the transition.
    Preload,
}

#[derive(Debug)]
pub(crate) struct LoadedChapter {
    pub units: ChapterUnits,
    pub saved: Option<ProgressRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PrefetchOutcome {
    Cached,
    Trivial,
    Fallback(FallbackReason),
    /// The session moved on before the result arrived.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VoiceProgress {
    Started,
    Finished,
    Failed(String),
}
