//! Terminal host for the read-aloud engine.
//!
//! - Parse command-line arguments.
//! - Load user configuration from `conf/config.toml` (`--print-config` dumps it).
//! - Wire the concrete collaborators and spawn the playback engine.
//! - Feed console commands to the engine until `quit`, EOF or Ctrl-C.

mod audio;
mod cache;
mod cleaner;
mod config;
mod console;
mod library;
mod local_voice;
mod remote;

use crate::cache::FileProgressBackend;
use crate::cleaner::MarkupCleaner;
use crate::config::{AppConfig, load_config, serialize_config};
use crate::console::{ConsoleInput, ConsoleObserver, HELP, parse_command};
use crate::library::DirectoryLibrary;
use crate::local_voice::EspeakVoice;
use crate::remote::{DisabledSynthesizer, HttpSynthesizer};
use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, bounded, select, unbounded};
use readaloud_core::{
    BookInfo, Collaborators, EngineHandle, InterruptionEvent, PlaybackEngine, RemoteSynthesizer,
};
use std::env;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn main() {
    let reload_handle = init_tracing();
    if let Err(err) = run(&reload_handle) {
        error!("{err:?}");
        std::process::exit(1);
    }
}

struct Args {
    book_dir: PathBuf,
    chapter: Option<usize>,
}

fn run(reload_handle: &ReloadHandle) -> Result<()> {
    let config = load_config(Path::new("conf/config.toml"));
    set_log_level(reload_handle, config.log_level.as_filter_str());
    if env::args().nth(1).as_deref() == Some("--print-config") {
        print!("{}", serialize_config(&config).context("Failed to serialize config")?);
        return Ok(());
    }
    let args = parse_args()?;

    let library = DirectoryLibrary::open(&args.book_dir)?;
    if library.chapter_count() == 0 {
        return Err(anyhow!(
            "No chapter files (.txt, .md, .html) in {}",
            args.book_dir.display()
        ));
    }
    let progress = Arc::new(FileProgressBackend::new(&config.cache_dir));
    let chapter_index = match args.chapter {
        Some(chapter) => chapter,
        None => match progress.last_position(library.book_id()) {
            Some((chapter, fraction)) => {
                info!(chapter, fraction, "Resuming from last reported position");
                chapter
            }
            None => 0,
        },
    }
    .min(library.chapter_count() - 1);

    info!(
        book = %args.book_dir.display(),
        chapter_index,
        level = %config.log_level,
        endpoint = config.tts_endpoint.as_deref().unwrap_or("none"),
        "Starting read-aloud host"
    );

    let book = BookInfo {
        book_id: library.book_id().to_string(),
        chapter_count: library.chapter_count(),
        chapter_index,
    };
    let collaborators = build_collaborators(&config, Arc::new(library), progress)?;
    let engine = PlaybackEngine::spawn(book, config.engine_config(), collaborators)
        .context("Failed to start the playback engine")?;
    let handle = engine.handle();

    let (quit_tx, quit_rx) = bounded::<()>(1);
    let ctrlc_handle = handle.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_handle.interruption(InterruptionEvent::Terminating);
        let _ = quit_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    println!("{HELP}");
    let lines = spawn_stdin_reader()?;
    command_loop(&handle, &lines, &quit_rx);

    engine.shutdown();
    info!("Read-aloud host stopped");
    Ok(())
}

fn build_collaborators(
    config: &AppConfig,
    library: Arc<DirectoryLibrary>,
    progress: Arc<FileProgressBackend>,
) -> Result<Collaborators> {
    let synthesizer: Arc<dyn RemoteSynthesizer> = match &config.tts_endpoint {
        Some(endpoint) => Arc::new(HttpSynthesizer::new(
            endpoint,
            &config.tts_api_key_env,
            config.tts_timeout(),
        )?),
        None => {
            warn!("No [tts] endpoint configured; reading with the local voice only");
            Arc::new(DisabledSynthesizer)
        }
    };
    let (output, keepalive) = audio::spawn_output()?;
    Ok(Collaborators {
        chapters: library,
        cleaner: Arc::new(MarkupCleaner::new(config)),
        synthesizer,
        probe: Arc::new(audio::RodioProbe),
        output: Box::new(output),
        local_voice: Box::new(EspeakVoice::new(&config.local_voice_program)),
        keepalive: Box::new(keepalive),
        progress,
        observer: Arc::new(ConsoleObserver),
    })
}

fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!("Failed to read console input: {err}");
                        return;
                    }
                }
            }
        })
        .context("Failed to spawn console reader")?;
    Ok(rx)
}

fn command_loop(handle: &EngineHandle, lines: &Receiver<String>, quit: &Receiver<()>) {
    loop {
        select! {
            recv(lines) -> line => {
                let Ok(line) = line else {
                    info!("Console input closed");
                    return;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(ConsoleInput::Engine(command)) => {
                        if let Err(err) = handle.send(command) {
                            eprintln!("! {err}");
                            return;
                        }
                    }
                    Ok(ConsoleInput::Help) => println!("{HELP}"),
                    Ok(ConsoleInput::Quit) => return,
                    Err(message) => eprintln!("? {message}"),
                }
            }
            recv(quit) -> _ => {
                info!("Interrupted; shutting down");
                return;
            }
        }
    }
}

fn parse_args() -> Result<Args> {
    let mut args = env::args().skip(1);
    let book_dir = args
        .next()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("Usage: readaloud <book-dir> [chapter] | --print-config"))?;
    if !book_dir.is_dir() {
        return Err(anyhow!("Not a directory: {}", book_dir.display()));
    }
    let chapter = args
        .next()
        .map(|raw| {
            raw.parse::<usize>()
                .with_context(|| format!("Invalid chapter index `{raw}`"))
        })
        .transpose()?;
    Ok(Args { book_dir, chapter })
}

fn init_tracing() -> ReloadHandle {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter_layer),
        )
        .init();
    warn!("Logging initialized; override level with config.log_level or RUST_LOG");
    handle
}

fn set_log_level(handle: &ReloadHandle, level: &str) {
    let parsed = EnvFilter::builder()
        .parse(level)
        .unwrap_or_else(|_| EnvFilter::new("debug"));
    if let Err(err) = handle.modify(|filter| *filter = parsed.clone()) {
        warn!(%level, "Failed to update log level from config: {err}");
    } else {
        info!(%level, "Applied log level from config");
    }
}
