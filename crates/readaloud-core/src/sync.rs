//! Two-way cursor sync between playback and the reading surface.
//!
//! Each direction remembers the last index it sent so the other side's echo
//! of that same index is swallowed exactly once. A remembered index survives
//! reports of other indices until it is matched or overwritten.

use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    None,
    /// Move the playback cursor to this unit (reader scrolled while not speaking).
    MoveCursor(usize),
    /// Ask the reading surface to scroll to this unit (follow mode).
    ScrollUi(usize),
}

#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    last_pushed_to_ui: Option<usize>,
    last_reported_by_ui: Option<usize>,
    last_reader_index: Option<usize>,
    follow_enabled: bool,
    follow_cooldown: Duration,
    follow_suspended_until: Option<Instant>,
}

impl SyncCoordinator {
    pub fn new(follow_enabled: bool, follow_cooldown: Duration) -> Self {
        Self {
            last_pushed_to_ui: None,
            last_reported_by_ui: None,
            last_reader_index: None,
            follow_enabled,
            follow_cooldown,
            follow_suspended_until: None,
        }
    }

    pub fn follow_enabled(&self) -> bool {
        self.follow_enabled
    }

    pub fn set_follow_enabled(&mut self, enabled: bool) {
        self.follow_enabled = enabled;
        self.follow_suspended_until = None;
    }

    /// Paragraph the reader most recently scrolled to, for "jump to reader".
    pub fn last_reader_index(&self) -> Option<usize> {
        self.last_reader_index
    }

    /// Forget echo state when the unit indices change meaning (new chapter).
    pub fn reset(&mut self) {
        self.last_pushed_to_ui = None;
        self.last_reported_by_ui = None;
        self.last_reader_index = None;
        self.follow_suspended_until = None;
    }

    /// The reading surface reports `unit_index` as the visible paragraph.
    pub fn on_ui_paragraph_visible(
        &mut self,
        unit_index: usize,
        is_speaking: bool,
        now: Instant,
    ) -> SyncAction {
        if self.last_pushed_to_ui == Some(unit_index) {
            self.last_pushed_to_ui = None;
            debug!(unit_index, "Ignoring scroll echo of playback cursor");
            return SyncAction::None;
        }
        self.last_reader_index = Some(unit_index);
        self.last_reported_by_ui = Some(unit_index);
        if is_speaking {
            // Manual scroll while listening: stop following for a while.
            self.follow_suspended_until = Some(now + self.follow_cooldown);
            return SyncAction::None;
        }
        SyncAction::MoveCursor(unit_index)
    }

    /// Playback moved to `unit_index`.
    pub fn on_playback_cursor_changed(
        &mut self,
        unit_index: usize,
        is_speaking: bool,
        now: Instant,
    ) -> SyncAction {
        if self.last_reported_by_ui == Some(unit_index) {
            self.last_reported_by_ui = None;
            debug!(unit_index, "Cursor moved to reader position; not scrolling back");
            return SyncAction::None;
        }
        if !is_speaking || !self.follow_enabled {
            return SyncAction::None;
        }
        if let Some(until) = self.follow_suspended_until {
            if now < until {
                return SyncAction::None;
            }
            self.follow_suspended_until = None;
        }
        self.last_pushed_to_ui = Some(unit_index);
        SyncAction::ScrollUi(unit_index)
    }
}
