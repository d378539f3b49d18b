//! Line-oriented control surface standing in for a reading UI.

use readaloud_core::{
    Command, CursorEvent, InterruptionEvent, PlaybackError, ReaderObserver, RouteChange,
};
use tracing::debug;

pub const HELP: &str = "\
commands:
  play [unit [offset]]   start or resume reading
  pause | resume | stop
  seek <unit> [offset]   move the cursor
  next | prev            skip by one unit
  chapter <n>            switch chapter
  follow on|off          auto-scroll with the voice
  scroll <unit>          report the paragraph the reader is looking at
  jump                   continue from the reader's position
  bg | fg                app moved to background / foreground
  interrupt begin|end [resume]
  unplug                 output device went away
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Engine(Command),
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<ConsoleInput, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();
    let input = match verb.to_ascii_lowercase().as_str() {
        "play" | "start" => ConsoleInput::Engine(Command::Start {
            unit_index: optional_index(&args, 0)?,
            char_offset: optional_index(&args, 1)?,
        }),
        "pause" => ConsoleInput::Engine(Command::Pause),
        "resume" => ConsoleInput::Engine(Command::Resume),
        "stop" => ConsoleInput::Engine(Command::Stop),
        "seek" => ConsoleInput::Engine(Command::Seek {
            unit_index: required_index(&args, 0, "seek needs a unit index")?,
            char_offset: optional_index(&args, 1)?.unwrap_or(0),
        }),
        "next" => ConsoleInput::Engine(Command::Next),
        "prev" | "previous" => ConsoleInput::Engine(Command::Previous),
        "chapter" => ConsoleInput::Engine(Command::SelectChapter(required_index(
            &args,
            0,
            "chapter needs an index",
        )?)),
        "follow" => match args.first().copied() {
            Some("on") => ConsoleInput::Engine(Command::SetFollowEnabled(true)),
            Some("off") => ConsoleInput::Engine(Command::SetFollowEnabled(false)),
            _ => return Err("follow takes on|off".to_string()),
        },
        "scroll" => ConsoleInput::Engine(Command::UiParagraphVisible(required_index(
            &args,
            0,
            "scroll needs a unit index",
        )?)),
        "jump" => ConsoleInput::Engine(Command::JumpToReader),
        "bg" => interruption(InterruptionEvent::EnteredBackground),
        "fg" => interruption(InterruptionEvent::EnteredForeground),
        "unplug" => interruption(InterruptionEvent::RouteChanged(
            RouteChange::OldDeviceUnavailable,
        )),
        "interrupt" => match args.as_slice() {
            ["begin"] => interruption(InterruptionEvent::Began),
            ["end"] => interruption(InterruptionEvent::Ended {
                should_resume: false,
            }),
            ["end", "resume"] => interruption(InterruptionEvent::Ended {
                should_resume: true,
            }),
            _ => return Err("interrupt takes begin|end [resume]".to_string()),
        },
        "help" | "?" => ConsoleInput::Help,
        "quit" | "exit" | "q" => ConsoleInput::Quit,
        other => return Err(format!("unknown command `{other}` (try `help`)")),
    };
    Ok(input)
}

fn interruption(event: InterruptionEvent) -> ConsoleInput {
    ConsoleInput::Engine(Command::Interruption(event))
}

fn optional_index(args: &[&str], position: usize) -> Result<Option<usize>, String> {
    args.get(position)
        .map(|raw| {
            raw.parse::<usize>()
                .map_err(|_| format!("`{raw}` is not a non-negative number"))
        })
        .transpose()
}

fn required_index(args: &[&str], position: usize, missing: &str) -> Result<usize, String> {
    optional_index(args, position)?.ok_or_else(|| missing.to_string())
}

/// Prints engine notifications for the terminal user.
#[derive(Debug, Default)]
pub struct ConsoleObserver;

impl ReaderObserver for ConsoleObserver {
    fn on_cursor_changed(&self, event: &CursorEvent) {
        let part = if event.is_title { "title" } else { "unit" };
        println!(
            "> chapter {} {part} {} (offset {})",
            event.chapter_index, event.unit_index, event.char_offset
        );
    }

    fn on_preloaded_set_changed(&self, chapter_index: usize, unit_indices: &[usize]) {
        debug!(chapter_index, ?unit_indices, "Preloaded set changed");
    }

    fn on_playback_state_changed(&self, is_playing: bool, is_paused: bool) {
        let state = match (is_playing, is_paused) {
            (true, _) => "playing",
            (false, true) => "paused",
            (false, false) => "stopped",
        };
        println!("> {state}");
    }

    fn on_scroll_requested(&self, unit_index: usize) {
        println!("> scroll to unit {unit_index}");
    }

    fn on_error(&self, error: &PlaybackError) {
        eprintln!("! {error}");
    }
}
