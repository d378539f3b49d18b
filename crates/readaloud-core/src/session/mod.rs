//! The playback session: one control thread owning cursor, phase and voices.
//!
//! Commands from the reading surface and events from worker threads are
//! multiplexed onto the control thread, which is the only place session state
//! changes. [`EngineHandle`] is the cloneable, thread-safe way in.

mod control;
mod playback;
mod state;

pub use self::state::{Phase, PlaybackCursor, StopReason};

pub(crate) use self::control::SessionCore;

use crate::capabilities::Collaborators;
use crate::config::EngineConfig;
use crate::error::{PlaybackError, Result};
use crate::events::EngineEvent;
use crate::interruption::InterruptionEvent;
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often the control thread wakes without input to check deadlines.
const TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookInfo {
    pub book_id: String,
    pub chapter_count: usize,
    /// Chapter the reader has open.
    pub chapter_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start {
        unit_index: Option<usize>,
        char_offset: Option<usize>,
    },
    Pause,
    Resume,
    Seek {
        unit_index: usize,
        char_offset: usize,
    },
    Next,
    Previous,
    Stop,
    SelectChapter(usize),
    SetFollowEnabled(bool),
    UiParagraphVisible(usize),
    JumpToReader,
    Interruption(InterruptionEvent),
    Shutdown,
}

/// Owns the control thread. Dropping it shuts playback down.
pub struct PlaybackEngine {
    handle: EngineHandle,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackEngine {
    pub fn spawn(
        book: BookInfo,
        config: EngineConfig,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        info!(
            book_id = %book.book_id,
            chapter_count = book.chapter_count,
            chapter_index = book.chapter_index,
            "Starting playback engine"
        );
        let core = SessionCore::new(book, config.sanitized(), collaborators, event_tx);
        let thread = std::thread::Builder::new()
            .name("playback-control".to_string())
            .spawn(move || run_control_loop(core, command_rx, event_rx))?;
        Ok(Self {
            handle: EngineHandle {
                commands: command_tx,
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stop playback, flush progress and join the control thread.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        let _ = self.handle.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Playback control thread panicked");
            }
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.join();
    }
}

#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: Sender<Command>,
}

impl EngineHandle {
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| PlaybackError::EngineStopped)
    }

    pub fn start(&self, unit_index: Option<usize>, char_offset: Option<usize>) -> Result<()> {
        self.send(Command::Start {
            unit_index,
            char_offset,
        })
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    pub fn seek(&self, unit_index: usize, char_offset: usize) -> Result<()> {
        self.send(Command::Seek {
            unit_index,
            char_offset,
        })
    }

    pub fn next(&self) -> Result<()> {
        self.send(Command::Next)
    }

    pub fn previous(&self) -> Result<()> {
        self.send(Command::Previous)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    pub fn select_chapter(&self, chapter_index: usize) -> Result<()> {
        self.send(Command::SelectChapter(chapter_index))
    }

    pub fn set_follow_enabled(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetFollowEnabled(enabled))
    }

    pub fn ui_paragraph_visible(&self, unit_index: usize) -> Result<()> {
        self.send(Command::UiParagraphVisible(unit_index))
    }

    pub fn jump_to_reader(&self) -> Result<()> {
        self.send(Command::JumpToReader)
    }

    pub fn interruption(&self, event: InterruptionEvent) -> Result<()> {
        self.send(Command::Interruption(event))
    }
}

fn run_control_loop(
    mut core: SessionCore,
    commands: Receiver<Command>,
    events: Receiver<EngineEvent>,
) {
    debug!("Playback control loop started");
    loop {
        let keep_running = select! {
            recv(commands) -> command => match command {
                Ok(Command::Shutdown) | Err(_) => false,
                Ok(command) => {
                    core.handle_command(command);
                    true
                }
            },
            recv(events) -> event => {
                if let Ok(event) = event {
                    core.handle_event(event);
                }
                true
            },
            default(TICK) => {
                core.on_tick(Instant::now());
                true
            },
        };
        if !keep_running {
            break;
        }
    }
    core.shutdown();
    debug!("Playback control loop stopped");
}
