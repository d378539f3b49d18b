//! Speaker output through rodio.
//!
//! `OutputStream` must stay on the thread that opened it, so a dedicated
//! audio thread owns the stream and every sink. The engine-facing handles
//! only send it commands.

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use readaloud_core::{AudioOutput, CompletionSignal, KeepAlive, PayloadProbe};
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(40);
const KEEPALIVE_SAMPLE_RATE: u32 = 8_000;

enum AudioMsg {
    Play(Arc<[u8]>, CompletionSignal),
    Pause,
    Resume,
    Stop,
    KeepAlive(bool),
    Shutdown,
}

pub struct RodioOutput {
    tx: Sender<AudioMsg>,
}

/// Loops a short silent clip on its own sink while the host is backgrounded.
pub struct SilentKeepAlive {
    tx: Sender<AudioMsg>,
}

/// Opens the default output device and starts the audio thread.
pub fn spawn_output() -> Result<(RodioOutput, SilentKeepAlive)> {
    let (tx, rx) = unbounded();
    let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
    std::thread::Builder::new()
        .name("audio-output".to_string())
        .spawn(move || {
            let (_stream, handle) = match OutputStream::try_default() {
                Ok(opened) => opened,
                Err(err) => {
                    let _ = ready_tx.send(Err(anyhow!("Opening audio output: {err}")));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            audio_loop(&handle, &rx);
        })
        .context("Spawning audio thread")?;
    ready_rx
        .recv()
        .map_err(|_| anyhow!("audio thread exited during startup"))??;
    info!("Audio output ready");
    Ok((RodioOutput { tx: tx.clone() }, SilentKeepAlive { tx }))
}

struct Utterance {
    sink: Sink,
    signal: CompletionSignal,
}

fn audio_loop(handle: &OutputStreamHandle, rx: &Receiver<AudioMsg>) {
    let mut current: Option<Utterance> = None;
    let mut paused = false;
    let mut keepalive: Option<Sink> = None;
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(AudioMsg::Play(audio, signal)) => {
                if let Some(previous) = current.take() {
                    previous.sink.stop();
                }
                paused = false;
                current = start_utterance(handle, audio, signal);
            }
            Ok(AudioMsg::Pause) => {
                paused = true;
                if let Some(utterance) = &current {
                    utterance.sink.pause();
                }
            }
            Ok(AudioMsg::Resume) => {
                paused = false;
                if let Some(utterance) = &current {
                    utterance.sink.play();
                }
            }
            Ok(AudioMsg::Stop) => {
                paused = false;
                if let Some(utterance) = current.take() {
                    utterance.sink.stop();
                }
            }
            Ok(AudioMsg::KeepAlive(true)) => {
                if keepalive.is_none() {
                    keepalive = start_keepalive(handle);
                }
            }
            Ok(AudioMsg::KeepAlive(false)) => {
                if let Some(sink) = keepalive.take() {
                    sink.stop();
                    debug!("Keep-alive loop stopped");
                }
            }
            Ok(AudioMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                debug!("Audio thread stopping");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let drained = current
            .as_ref()
            .map(|utterance| !paused && utterance.sink.empty())
            .unwrap_or(false);
        if drained {
            if let Some(utterance) = current.take() {
                utterance.signal.finished();
            }
        }
    }
}

fn start_utterance(
    handle: &OutputStreamHandle,
    audio: Arc<[u8]>,
    signal: CompletionSignal,
) -> Option<Utterance> {
    let source = match Decoder::new(Cursor::new(audio)) {
        Ok(source) => source,
        Err(err) => {
            warn!(ticket = signal.ticket(), "Audio payload could not be decoded: {err}");
            signal.failed(format!("decode failed: {err}"));
            return None;
        }
    };
    let sink = match Sink::try_new(handle) {
        Ok(sink) => sink,
        Err(err) => {
            warn!(ticket = signal.ticket(), "Failed to create sink: {err}");
            signal.failed(format!("sink unavailable: {err}"));
            return None;
        }
    };
    sink.append(source);
    signal.started();
    Some(Utterance { sink, signal })
}

fn start_keepalive(handle: &OutputStreamHandle) -> Option<Sink> {
    let clip = match silent_wav(KEEPALIVE_SAMPLE_RATE, Duration::from_millis(500)) {
        Ok(clip) => clip,
        Err(err) => {
            warn!("Failed to render keep-alive clip: {err:#}");
            return None;
        }
    };
    let source = match Decoder::new(Cursor::new(clip)) {
        Ok(source) => source,
        Err(err) => {
            warn!("Keep-alive clip could not be decoded: {err}");
            return None;
        }
    };
    match Sink::try_new(handle) {
        Ok(sink) => {
            sink.append(source.repeat_infinite());
            debug!("Keep-alive loop started");
            Some(sink)
        }
        Err(err) => {
            warn!("Failed to create keep-alive sink: {err}");
            None
        }
    }
}

/// Mono 16-bit silence encoded as a WAV payload.
fn silent_wav(sample_rate: u32, length: Duration) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let samples = (sample_rate as u128 * length.as_millis() / 1000) as usize;
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut buffer, spec)?;
        for _ in 0..samples {
            writer.write_sample(0i16)?;
        }
        writer.finalize()?;
    }
    Ok(buffer.into_inner())
}

impl AudioOutput for RodioOutput {
    fn play(&mut self, audio: Arc<[u8]>, signal: CompletionSignal) -> Result<()> {
        self.tx
            .send(AudioMsg::Play(audio, signal))
            .map_err(|_| anyhow!("audio thread is not running"))
    }

    fn pause(&mut self) {
        let _ = self.tx.send(AudioMsg::Pause);
    }

    fn resume(&mut self) {
        let _ = self.tx.send(AudioMsg::Resume);
    }

    fn stop(&mut self) {
        let _ = self.tx.send(AudioMsg::Stop);
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        let _ = self.tx.send(AudioMsg::Shutdown);
    }
}

impl KeepAlive for SilentKeepAlive {
    fn begin(&mut self) {
        let _ = self.tx.send(AudioMsg::KeepAlive(true));
    }

    fn end(&mut self) {
        let _ = self.tx.send(AudioMsg::KeepAlive(false));
    }
}

/// Accepts payloads rodio can decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct RodioProbe;

impl PayloadProbe for RodioProbe {
    fn accepts(&self, bytes: &[u8]) -> bool {
        !bytes.is_empty() && Decoder::new(Cursor::new(bytes.to_vec())).is_ok()
    }
}
