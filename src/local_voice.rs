//! On-device fallback voice driven through the `espeak-ng` command line.

use anyhow::{Context, Result};
use readaloud_core::{CompletionSignal, LocalVoice};
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

const BASE_WORDS_PER_MINUTE: f32 = 175.0;

pub struct EspeakVoice {
    program: String,
    available: bool,
    running: Option<Running>,
}

struct Running {
    pid: libc::pid_t,
    done: Arc<AtomicBool>,
}

impl Running {
    fn signal(&self, sig: libc::c_int) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        // The watcher owns the child; `done` guards against signalling a reaped pid.
        unsafe {
            libc::kill(self.pid, sig);
        }
    }
}

impl EspeakVoice {
    pub fn new(program: &str) -> Self {
        let available = Command::new(program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if available {
            info!(program, "Local voice available");
        } else {
            warn!(program, "Local voice not found; remote audio only");
        }
        Self {
            program: program.to_string(),
            available,
            running: None,
        }
    }

    /// Start the process and hand it the text. A child that cannot take the
    /// text is killed and reaped before the error is returned.
    fn spawn_child(&self, text: &str, voice_id: Option<&str>, rate: f32) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .arg("--stdin")
            .arg("-s")
            .arg(words_per_minute(rate).to_string());
        if let Some(voice) = voice_id {
            command.arg("-v").arg(voice);
        }
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program))?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(text.as_bytes()) {
                drop(stdin);
                if let Err(kill_err) = child.kill() {
                    debug!("Local voice already exited: {kill_err}");
                }
                let _ = child.wait();
                return Err(err).context("Failed to send text to local voice");
            }
        }
        Ok(child)
    }
}

fn words_per_minute(rate: f32) -> u32 {
    (BASE_WORDS_PER_MINUTE * rate).round().clamp(80.0, 450.0) as u32
}

impl LocalVoice for EspeakVoice {
    fn is_available(&self) -> bool {
        self.available
    }

    fn speak(
        &mut self,
        text: &str,
        voice_id: Option<&str>,
        rate: f32,
        signal: CompletionSignal,
    ) -> Result<()> {
        self.stop();
        let child = self.spawn_child(text, voice_id, rate)?;

        let done = Arc::new(AtomicBool::new(false));
        self.running = Some(Running {
            pid: child.id() as libc::pid_t,
            done: Arc::clone(&done),
        });
        signal.started();
        let ticket = signal.ticket();
        std::thread::Builder::new()
            .name("local-voice".to_string())
            .spawn(move || {
                let outcome = child.wait_with_output();
                done.store(true, Ordering::Release);
                match outcome {
                    Ok(output) if output.status.success() => {
                        debug!(ticket, "Local utterance finished");
                        signal.finished();
                    }
                    Ok(output) => {
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        signal.failed(format!("{}: {}", output.status, stderr.trim()));
                    }
                    Err(err) => signal.failed(err.to_string()),
                }
            })
            .context("Failed to spawn local voice watcher")?;
        Ok(())
    }

    fn pause(&mut self) {
        if let Some(running) = &self.running {
            running.signal(libc::SIGSTOP);
        }
    }

    fn resume(&mut self) {
        if let Some(running) = &self.running {
            running.signal(libc::SIGCONT);
        }
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.signal(libc::SIGKILL);
        }
    }
}

impl Drop for EspeakVoice {
    fn drop(&mut self) {
        self.stop();
    }
}
