//! Reactions to platform audio-session and lifecycle notifications.

use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChange {
    NewDeviceAvailable,
    /// Headphones unplugged or the output device went away.
    OldDeviceUnavailable,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionEvent {
    Began,
    Ended { should_resume: bool },
    RouteChanged(RouteChange),
    EnteredBackground,
    EnteredForeground,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionAction {
    Pause,
    Resume,
    FlushProgress,
    StartKeepAlive,
    StopKeepAlive,
    Stop,
}

/// Session facts the handler needs to decide.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionSnapshot {
    pub is_speaking: bool,
    /// A fetch for the current or next unit has not resolved yet.
    pub fetch_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct InterruptionHandler {
    paused_by_interruption: bool,
    in_background: bool,
    keepalive_until: Option<Instant>,
    keepalive_max_wait: Duration,
}

impl InterruptionHandler {
    pub fn new(keepalive_max_wait: Duration) -> Self {
        Self {
            paused_by_interruption: false,
            in_background: false,
            keepalive_until: None,
            keepalive_max_wait,
        }
    }

    pub fn in_background(&self) -> bool {
        self.in_background
    }

    pub fn keepalive_active(&self) -> bool {
        self.keepalive_until.is_some()
    }

    /// A user action (pause, resume, stop) supersedes an interruption pause.
    pub fn clear_interruption(&mut self) {
        self.paused_by_interruption = false;
    }

    pub fn handle(
        &mut self,
        event: InterruptionEvent,
        session: SessionSnapshot,
        now: Instant,
    ) -> Vec<InterruptionAction> {
        use InterruptionAction::*;
        match event {
            InterruptionEvent::Began => {
                if !session.is_speaking {
                    return Vec::new();
                }
                info!("Audio session interrupted; pausing");
                self.paused_by_interruption = true;
                vec![Pause, FlushProgress]
            }
            InterruptionEvent::Ended { should_resume } => {
                let caused_pause = std::mem::take(&mut self.paused_by_interruption);
                if caused_pause && should_resume {
                    info!("Interruption ended; resuming");
                    vec![Resume]
                } else {
                    debug!(caused_pause, should_resume, "Interruption ended without resume");
                    Vec::new()
                }
            }
            InterruptionEvent::RouteChanged(RouteChange::OldDeviceUnavailable) => {
                if !session.is_speaking {
                    return Vec::new();
                }
                info!("Audio route lost; pausing");
                vec![Pause, FlushProgress]
            }
            InterruptionEvent::RouteChanged(_) => Vec::new(),
            InterruptionEvent::EnteredBackground => {
                self.in_background = true;
                let mut actions = vec![FlushProgress];
                if session.is_speaking && session.fetch_in_flight && self.keepalive_until.is_none()
                {
                    debug!("Holding the audio session open while a fetch resolves");
                    self.keepalive_until = Some(now + self.keepalive_max_wait);
                    actions.push(StartKeepAlive);
                }
                actions
            }
            InterruptionEvent::EnteredForeground => {
                self.in_background = false;
                self.stop_keepalive().into_iter().collect()
            }
            InterruptionEvent::Terminating => {
                info!("Host terminating; stopping playback");
                let mut actions: Vec<_> = self.stop_keepalive().into_iter().collect();
                actions.extend([FlushProgress, Stop]);
                actions
            }
        }
    }

    /// The awaited fetch finished (audio arrived or fallback was chosen).
    pub fn on_fetch_resolved(&mut self) -> Option<InterruptionAction> {
        self.stop_keepalive()
    }

    pub fn on_tick(&mut self, now: Instant) -> Option<InterruptionAction> {
        match self.keepalive_until {
            Some(until) if now >= until => {
                debug!("Keep-alive deadline reached");
                self.stop_keepalive()
            }
            _ => None,
        }
    }

    fn stop_keepalive(&mut self) -> Option<InterruptionAction> {
        self.keepalive_until
            .take()
            .map(|_| InterruptionAction::StopKeepAlive)
    }
}
